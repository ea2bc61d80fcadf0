//! Store contracts consumed by the core (§6.3). Each trait is the seam a
//! real persistent implementation would sit behind; this crate ships an
//! in-memory reference implementation of each so the rest of the core is
//! runnable and testable standalone (§SPEC_FULL.md B).

pub mod booking;
pub mod offer;
pub mod provider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::types::{Booking, BookingId, Offer, OfferId, ProviderProfile, UserId};

pub use booking::InMemoryBookingStore;
pub use offer::InMemoryOfferStore;
pub use provider::InMemoryProviderStore;

/// Result of `OfferStore::try_accept` (§4.2, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted,
    AlreadyAssigned,
    Expired,
    Unknown,
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn create(&self, booking: Booking) -> Result<(), CoreError>;
    async fn get(&self, id: BookingId) -> Result<Option<Booking>, CoreError>;

    /// Apply `patch` to the current row under the store's per-row lock and
    /// persist the result. `patch` validates its own transition and returns
    /// a `CoreError` to abort without writing.
    async fn update(
        &self,
        id: BookingId,
        patch: Box<dyn FnOnce(&mut Booking) -> Result<(), CoreError> + Send>,
    ) -> Result<Booking, CoreError>;

    /// Bookings whose dispatch state needs attention this tick (§4.5 step 2).
    async fn list_needing_attention(&self, now: DateTime<Utc>) -> Result<Vec<Booking>, CoreError>;

    async fn set_radius_and_wave(
        &self,
        id: BookingId,
        radius_km: f64,
        wave: u32,
        providers_found: usize,
        expanded_at: DateTime<Utc>,
    ) -> Result<Booking, CoreError>;
}

#[async_trait]
pub trait OfferStore: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn create(
        &self,
        booking_id: BookingId,
        provider_id: UserId,
        created_at: DateTime<Utc>,
        ttl: chrono::Duration,
        priority: u8,
        distance_km: f64,
        estimated_travel_minutes: u32,
    ) -> Result<OfferId, CoreError>;

    /// Transitions every `sent`/`seen` offer whose expiry has passed to
    /// `expired`, atomically, and returns the transitioned rows (§4.2).
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Offer>, CoreError>;

    async fn try_accept(
        &self,
        offer_id: OfferId,
        provider_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<AcceptOutcome, CoreError>;

    async fn decline(
        &self,
        offer_id: OfferId,
        provider_id: &UserId,
        reason: String,
    ) -> Result<Offer, CoreError>;

    async fn mark_seen(&self, offer_id: OfferId, provider_id: &UserId) -> Result<(), CoreError>;

    async fn cancel_for_booking(&self, booking_id: BookingId) -> Result<usize, CoreError>;

    async fn list_active(&self, booking_id: BookingId) -> Result<Vec<Offer>, CoreError>;

    /// Every offer ever created for this booking, any state. Backs
    /// cross-wave exclusion (§4.5 "Radius expansion"), which must see
    /// terminal `declined` rows that `list_active` deliberately omits.
    async fn list_by_booking(&self, booking_id: BookingId) -> Result<Vec<Offer>, CoreError>;

    async fn list_by_provider(
        &self,
        provider_id: &UserId,
        states: &[crate::types::OfferState],
    ) -> Result<Vec<Offer>, CoreError>;

    async fn get(&self, offer_id: OfferId) -> Result<Option<Offer>, CoreError>;
}

/// Query accepted by the Geo/Eligibility Index (§4.1).
#[derive(Debug, Clone)]
pub struct EligibilityCriteria {
    pub service_kind: String,
    pub center: crate::types::GeoPoint,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub radius_km: f64,
    pub max_results: usize,
    pub exclude_providers: Vec<UserId>,
    pub location_freshness: chrono::Duration,
}

#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn find_eligible(
        &self,
        criteria: &EligibilityCriteria,
    ) -> Result<Vec<ProviderProfile>, CoreError>;

    async fn get_for_dispatch(
        &self,
        provider_id: &UserId,
    ) -> Result<Option<ProviderProfile>, CoreError>;

    /// Applied when a provider pushes `provider.location` over the Push
    /// Bus (§6.1); refreshes the freshness clock the index filters on.
    async fn update_location(
        &self,
        provider_id: &UserId,
        location: crate::types::GeoPoint,
    ) -> Result<(), CoreError>;
}
