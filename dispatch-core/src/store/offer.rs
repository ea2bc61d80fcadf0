//! In-memory `OfferStore` reference implementation (§4.2).

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::types::{BookingId, Offer, OfferId, OfferState, UserId};

use super::{AcceptOutcome, OfferStore};

#[derive(Default)]
pub struct InMemoryOfferStore {
    rows: Mutex<BTreeMap<OfferId, Offer>>,
}

impl InMemoryOfferStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OfferStore for InMemoryOfferStore {
    async fn create(
        &self,
        booking_id: BookingId,
        provider_id: UserId,
        created_at: DateTime<Utc>,
        ttl: chrono::Duration,
        priority: u8,
        distance_km: f64,
        estimated_travel_minutes: u32,
    ) -> Result<OfferId, CoreError> {
        let mut rows = self.rows.lock().unwrap();
        let duplicate = rows.values().any(|o| {
            o.booking_id == booking_id && o.provider_id == provider_id && !o.state.is_terminal()
        });
        if duplicate {
            return Err(CoreError::Conflict("duplicate offer for provider"));
        }

        let id = OfferId::new();
        let offer = Offer {
            id,
            booking_id,
            provider_id,
            created_at,
            expires_at: created_at + ttl,
            state: OfferState::Sent,
            priority,
            distance_km,
            estimated_travel_minutes,
            decline_reason: None,
        };
        rows.insert(id, offer);
        Ok(id)
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Offer>, CoreError> {
        let mut rows = self.rows.lock().unwrap();
        let mut transitioned = Vec::new();
        for offer in rows.values_mut() {
            if offer.is_wall_clock_expired(now) {
                offer.state = OfferState::Expired;
                transitioned.push(offer.clone());
            }
        }
        Ok(transitioned)
    }

    async fn try_accept(
        &self,
        offer_id: OfferId,
        provider_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<AcceptOutcome, CoreError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(offer) = rows.get_mut(&offer_id) else {
            return Ok(AcceptOutcome::Unknown);
        };
        if &offer.provider_id != provider_id {
            return Ok(AcceptOutcome::Unknown);
        }

        match offer.state {
            OfferState::Sent | OfferState::Seen => {
                if now >= offer.expires_at {
                    offer.state = OfferState::Expired;
                    Ok(AcceptOutcome::Expired)
                } else {
                    offer.state = OfferState::Accepted;
                    Ok(AcceptOutcome::Accepted)
                }
            }
            // A retried accept from the same provider on an offer this
            // provider already won replays the original outcome (§8).
            OfferState::Accepted => Ok(AcceptOutcome::Accepted),
            OfferState::Declined | OfferState::Cancelled => Ok(AcceptOutcome::AlreadyAssigned),
            OfferState::Expired => Ok(AcceptOutcome::Expired),
        }
    }

    async fn decline(
        &self,
        offer_id: OfferId,
        provider_id: &UserId,
        reason: String,
    ) -> Result<Offer, CoreError> {
        let mut rows = self.rows.lock().unwrap();
        let offer = rows.get_mut(&offer_id).ok_or(CoreError::NotFound)?;
        if &offer.provider_id != provider_id {
            return Err(CoreError::Forbidden);
        }
        match offer.state {
            OfferState::Sent | OfferState::Seen => {
                offer.state = OfferState::Declined;
                offer.decline_reason = Some(reason);
                Ok(offer.clone())
            }
            OfferState::Declined => Ok(offer.clone()),
            OfferState::Accepted | OfferState::Expired | OfferState::Cancelled => {
                Err(CoreError::Expired)
            }
        }
    }

    async fn mark_seen(&self, offer_id: OfferId, provider_id: &UserId) -> Result<(), CoreError> {
        let mut rows = self.rows.lock().unwrap();
        let offer = rows.get_mut(&offer_id).ok_or(CoreError::NotFound)?;
        if &offer.provider_id != provider_id {
            return Err(CoreError::Forbidden);
        }
        if offer.state == OfferState::Sent {
            offer.state = OfferState::Seen;
        }
        Ok(())
    }

    async fn cancel_for_booking(&self, booking_id: BookingId) -> Result<usize, CoreError> {
        let mut rows = self.rows.lock().unwrap();
        let mut count = 0;
        for offer in rows.values_mut() {
            if offer.booking_id == booking_id
                && matches!(
                    offer.state,
                    OfferState::Sent | OfferState::Seen | OfferState::Declined
                )
            {
                offer.state = OfferState::Cancelled;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_active(&self, booking_id: BookingId) -> Result<Vec<Offer>, CoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .filter(|o| o.booking_id == booking_id && o.state.is_live())
            .cloned()
            .collect())
    }

    async fn list_by_booking(&self, booking_id: BookingId) -> Result<Vec<Offer>, CoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .filter(|o| o.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn list_by_provider(
        &self,
        provider_id: &UserId,
        states: &[OfferState],
    ) -> Result<Vec<Offer>, CoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .filter(|o| &o.provider_id == provider_id && states.contains(&o.state))
            .cloned()
            .collect())
    }

    async fn get(&self, offer_id: OfferId) -> Result<Option<Offer>, CoreError> {
        Ok(self.rows.lock().unwrap().get(&offer_id).cloned())
    }
}
