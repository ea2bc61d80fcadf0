//! In-memory `BookingStore` reference implementation.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::types::{Booking, BookingId, BookingKind, BookingStatus, RadiusExpansion};

use super::BookingStore;

/// Keyed on `BookingId` the same way the teacher's `Manager` keys its
/// instance table on `InstanceId` behind a single `Mutex`.
#[derive(Default)]
pub struct InMemoryBookingStore {
    rows: Mutex<BTreeMap<BookingId, Booking>>,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn create(&self, booking: Booking) -> Result<(), CoreError> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&booking.id) {
            return Err(CoreError::Conflict("booking already exists"));
        }
        rows.insert(booking.id, booking);
        Ok(())
    }

    async fn get(&self, id: BookingId) -> Result<Option<Booking>, CoreError> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn update(
        &self,
        id: BookingId,
        patch: Box<dyn FnOnce(&mut Booking) -> Result<(), CoreError> + Send>,
    ) -> Result<Booking, CoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).ok_or(CoreError::NotFound)?;
        patch(row)?;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn list_needing_attention(&self, now: DateTime<Utc>) -> Result<Vec<Booking>, CoreError> {
        let rows = self.rows.lock().unwrap();
        let due = rows
            .values()
            .filter(|b| matches!(b.status, BookingStatus::Pending | BookingStatus::ProviderSearch))
            .filter(|b| booking_due(b, now))
            .cloned()
            .collect();
        Ok(due)
    }

    async fn set_radius_and_wave(
        &self,
        id: BookingId,
        radius_km: f64,
        wave: u32,
        providers_found: usize,
        expanded_at: DateTime<Utc>,
    ) -> Result<Booking, CoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).ok_or(CoreError::NotFound)?;
        row.current_search_radius_km = radius_km;
        row.search_wave = wave;
        row.radius_expansion_history.push(RadiusExpansion {
            wave,
            radius_km,
            providers_found,
            expanded_at,
        });
        row.updated_at = expanded_at;
        Ok(row.clone())
    }
}

/// Whether a booking needs a dispatcher look this tick, per §4.5 step 2.
/// `pending-offer-count > 0` with an expired offer is handled by the reap
/// step, not here.
fn booking_due(b: &Booking, now: DateTime<Utc>) -> bool {
    match b.status {
        BookingStatus::Pending => match b.booking_kind {
            BookingKind::Instant => true,
            BookingKind::Scheduled => {
                // Lead-time gating is applied by the caller, which knows
                // `LEAD_TIME`; here we simply surface pending rows and let
                // the dispatcher filter scheduled ones that aren't due yet.
                b.scheduled_for.is_some()
            }
        },
        BookingStatus::ProviderSearch => {
            b.matching_expires_at.map(|t| t <= now).unwrap_or(false)
                || (b.pending_offer_count == 0)
        }
        _ => false,
    }
}
