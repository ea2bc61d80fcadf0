//! Core data model: bookings, offers and the provider projection the
//! dispatcher reads from (§3).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use rand::RngCore;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque identifier, formatted as lowercase hex. Used for bookings and
/// offers so that neither store needs to hand out sequential keys.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; 16]);

// Serialized as its hex string, not the raw byte array, so it round-trips
// through JSON bodies and URL path segments the same way `Display`/
// `FromStr` already present it on the wire.
impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HexVisitor;
        impl Visitor<'_> for HexVisitor {
            type Value = Id;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 32-character lowercase hex string")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Id, E> {
                v.parse().map_err(serde::de::Error::custom)
            }
        }
        deserializer.deserialize_str(HexVisitor)
    }
}

impl Id {
    pub fn new() -> Self {
        let mut buf = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut buf);
        Self(buf)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut buf = [0u8; 16];
        hex::decode_to_slice(s, &mut buf)?;
        Ok(Self(buf))
    }
}

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Id);

        impl $name {
            pub fn new() -> Self {
                Self(Id::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

opaque_id!(BookingId);
opaque_id!(OfferId);

/// Opaque identifier of a user account (customer, provider, or admin). The
/// core never issues these itself -- they come in verified on the bearer
/// token (§4.8) or as a foreign key on a store row.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Account role, as carried on the verified bearer token (§4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    ServiceProvider,
    PartsProvider,
    Admin,
}

impl Role {
    pub fn is_provider(&self) -> bool {
        matches!(self, Role::ServiceProvider | Role::PartsProvider)
    }
}

/// Customer-declared urgency. Declaration order is severity order: this is
/// relied on by `Ord` for the ranking key (§4.1) and for voice-notifier
/// urgency-threshold gating (§4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Urgency {
    fn default() -> Self {
        Urgency::Normal
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingKind {
    Instant,
    Scheduled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    ProviderSearch,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
    NoProvidersFound,
}

impl BookingStatus {
    /// Terminal statuses per §3's lifecycle invariant.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoProvidersFound
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMethod {
    Accepted,
    Timeout,
    Cancelled,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferState {
    Sent,
    Seen,
    Accepted,
    Declined,
    Expired,
    Cancelled,
}

impl OfferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OfferState::Accepted
                | OfferState::Declined
                | OfferState::Expired
                | OfferState::Cancelled
        )
    }

    /// True for the two "alive" states an offer passes through before a
    /// terminal transition (§4.3).
    pub fn is_live(&self) -> bool {
        matches!(self, OfferState::Sent | OfferState::Seen)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    /// Great-circle distance in kilometers (haversine, §4.1).
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;

        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();
        EARTH_RADIUS_KM * c
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RadiusExpansion {
    pub wave: u32,
    pub radius_km: f64,
    pub providers_found: usize,
    pub expanded_at: DateTime<Utc>,
}

/// A customer's request for a service (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub customer_id: UserId,
    pub service_kind: String,
    pub booking_kind: BookingKind,
    pub urgency: Urgency,
    pub location: GeoPoint,
    pub address: String,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub price: f64,
    pub payment_method: String,
    pub notes: String,

    pub status: BookingStatus,
    pub current_search_radius_km: f64,
    pub search_wave: u32,
    pub radius_expansion_history: Vec<RadiusExpansion>,
    pub matching_expires_at: Option<DateTime<Utc>>,
    pub pending_offer_count: u32,
    pub assigned_provider_id: Option<UserId>,
    pub assignment_method: Option<AssignmentMethod>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Providers that must be excluded from subsequent waves: anyone who
    /// already has, or has ever had, a non-terminal or declined offer for
    /// this booking (§4.5 "Radius expansion", §9 Open Question 2).
    pub fn excluded_providers<'a>(&self, offers: &'a [crate::types::Offer]) -> Vec<&'a UserId> {
        offers
            .iter()
            .filter(|o| o.booking_id == self.id)
            .filter(|o| !matches!(o.state, OfferState::Cancelled | OfferState::Expired))
            .map(|o| &o.provider_id)
            .collect()
    }
}

/// One invitation to one provider for one booking (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub booking_id: BookingId,
    pub provider_id: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: OfferState,
    pub priority: u8,
    pub distance_km: f64,
    pub estimated_travel_minutes: u32,
    pub decline_reason: Option<String>,
}

impl Offer {
    /// An offer in `sent`/`seen` whose wall-clock expiry has passed is
    /// treated as expired regardless of whether a writer persisted that
    /// transition yet (§3 invariant).
    pub fn is_wall_clock_expired(&self, now: DateTime<Utc>) -> bool {
        self.state.is_live() && now >= self.expires_at
    }
}

/// One provider-declared weekly availability window, `HH:MM-HH:MM` (§3).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl AvailabilityWindow {
    pub fn covers(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            t >= self.start && t <= self.end
        } else {
            // Wraps past midnight.
            t >= self.start || t <= self.end
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoicePreferences {
    pub calls_enabled: bool,
    /// Quiet hours window in the provider's local time; `None` means no
    /// quiet hours configured.
    pub quiet_hours: Option<AvailabilityWindow>,
    pub max_calls_per_hour: u32,
    pub min_urgency: Urgency,
}

impl Default for VoicePreferences {
    fn default() -> Self {
        Self {
            calls_enabled: true,
            quiet_hours: None,
            max_calls_per_hour: 6,
            min_urgency: Urgency::Low,
        }
    }
}

/// Read-only projection of a provider account, as the Geo/Eligibility Index
/// and the Voice Notifier Gateway see it (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub provider_id: UserId,
    pub service_kinds: Vec<String>,
    pub location: GeoPoint,
    pub location_updated_at: DateTime<Utc>,
    pub online: bool,
    pub active: bool,
    pub verified: bool,
    pub availability: std::collections::BTreeMap<Weekday, Vec<AvailabilityWindow>>,
    pub service_radius_km: f64,
    pub rating: f64,
    pub completion_count: u32,
    pub response_rate: f64,
    pub phone_number: String,
    pub language: String,
    pub voice_preferences: VoicePreferences,
}
