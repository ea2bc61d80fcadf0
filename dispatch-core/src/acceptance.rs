//! Acceptance Resolver (component F, §4.4). The critical section: handles
//! provider accept/decline and performs exactly-once assignment under
//! contention.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use slog::Logger;

use crate::config::Config;
use crate::error::CoreError;
use crate::locks::BookingLocks;
use crate::pushbus::protocol::ServerEvent;
use crate::pushbus::PushHub;
use crate::store::{AcceptOutcome, BookingStore, OfferStore};
use crate::types::{AssignmentMethod, Booking, BookingStatus, OfferId, UserId};
use crate::voice::VoiceNotifier;

pub struct AcceptanceResolver {
    bookings: Arc<dyn BookingStore>,
    offers: Arc<dyn OfferStore>,
    voice: Arc<dyn VoiceNotifier>,
    hub: Arc<PushHub>,
    locks: Arc<BookingLocks>,
    config: Arc<Config>,
    logger: Logger,
}

impl AcceptanceResolver {
    pub fn new(
        bookings: Arc<dyn BookingStore>,
        offers: Arc<dyn OfferStore>,
        voice: Arc<dyn VoiceNotifier>,
        hub: Arc<PushHub>,
        locks: Arc<BookingLocks>,
        config: Arc<Config>,
        logger: Logger,
    ) -> Self {
        Self {
            bookings,
            offers,
            voice,
            hub,
            locks,
            config,
            logger,
        }
    }

    pub async fn accept(
        &self,
        offer_id: OfferId,
        provider_id: UserId,
    ) -> Result<AcceptOutcome, CoreError> {
        let offer = self.offers.get(offer_id).await?.ok_or(CoreError::NotFound)?;
        if offer.provider_id != provider_id {
            return Err(CoreError::Forbidden);
        }
        let booking_id = offer.booking_id;

        let lock = self.locks.for_booking(booking_id);
        let _guard = lock.lock().await;

        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(20))
            .with_max_interval(Duration::from_millis(200))
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_accept_once(booking_id, offer_id, &provider_id).await {
                Ok(outcome) => return Ok(outcome),
                Err(CoreError::Unavailable) if attempt < self.config.accept_retry_max => {
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_millis(200));
                    slog::warn!(self.logger, "acceptance store conflict, retrying";
                        "offer_id" => %offer_id, "attempt" => attempt);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_accept_once(
        &self,
        booking_id: crate::types::BookingId,
        offer_id: OfferId,
        provider_id: &UserId,
    ) -> Result<AcceptOutcome, CoreError> {
        let now = Utc::now();
        let outcome = self.offers.try_accept(offer_id, provider_id, now).await?;

        let (outcome, newly_assigned, booking) = match outcome {
            AcceptOutcome::Accepted => {
                let newly = Arc::new(AtomicBool::new(false));
                let newly_clone = newly.clone();
                let winner = provider_id.clone();
                let booking = self
                    .bookings
                    .update(
                        booking_id,
                        Box::new(move |b: &mut Booking| {
                            if matches!(b.status, BookingStatus::Assigned)
                                && b.assigned_provider_id.as_ref() == Some(&winner)
                            {
                                // Idempotent replay of an already-applied accept.
                                return Ok(());
                            }
                            if !matches!(b.status, BookingStatus::ProviderSearch)
                                || b.assigned_provider_id.is_some()
                            {
                                return Err(CoreError::already_assigned());
                            }
                            b.assigned_provider_id = Some(winner.clone());
                            b.status = BookingStatus::Assigned;
                            b.assignment_method = Some(AssignmentMethod::Accepted);
                            b.matching_expires_at = None;
                            b.pending_offer_count = 0;
                            newly_clone.store(true, Ordering::SeqCst);
                            Ok(())
                        }),
                    )
                    .await?;
                (AcceptOutcome::Accepted, newly.load(Ordering::SeqCst), Some(booking))
            }
            other => (other, false, None),
        };

        if newly_assigned {
            let booking = booking.expect("newly_assigned implies a committed booking row");
            // Losing offers are still `sent`/`seen` here: the winner's
            // offer already moved to `accepted` and is no longer "active".
            let losers = self.offers.list_active(booking_id).await?;
            self.offers.cancel_for_booking(booking_id).await?;
            self.post_commit_assigned(&booking, offer_id, provider_id, &losers)
                .await;
        }

        match outcome {
            AcceptOutcome::Accepted => Ok(AcceptOutcome::Accepted),
            AcceptOutcome::AlreadyAssigned => Err(CoreError::already_assigned()),
            AcceptOutcome::Expired => Err(CoreError::Expired),
            AcceptOutcome::Unknown => Err(CoreError::NotFound),
        }
    }

    async fn post_commit_assigned(
        &self,
        booking: &Booking,
        winning_offer: OfferId,
        winner: &UserId,
        losers: &[crate::types::Offer],
    ) {
        slog::info!(self.logger, "booking assigned";
            "booking_id" => %booking.id, "offer_id" => %winning_offer, "provider_id" => %winner);

        self.hub.send_to_user(
            &booking.customer_id,
            &ServerEvent::new(
                "booking.assigned",
                serde_json::json!({
                    "bookingId": booking.id.to_string(),
                    "providerId": winner.to_string(),
                }),
            ),
        );
        self.hub.send_to_room(
            &format!("order:{}", booking.id),
            &ServerEvent::new(
                "booking.assigned",
                serde_json::json!({
                    "bookingId": booking.id.to_string(),
                    "providerId": winner.to_string(),
                }),
            ),
        );

        for loser in losers {
            self.hub.send_to_user(
                &loser.provider_id,
                &ServerEvent::new(
                    "offer.expired",
                    serde_json::json!({
                        "offerId": loser.id.to_string(),
                        "bookingId": booking.id.to_string(),
                        "reason": "cancelled",
                    }),
                ),
            );
        }

        self.voice.cancel_for_booking(booking.id).await;
    }

    pub async fn decline(
        &self,
        offer_id: OfferId,
        provider_id: UserId,
        reason: String,
    ) -> Result<(), CoreError> {
        let offer = self.offers.get(offer_id).await?.ok_or(CoreError::NotFound)?;
        let booking_id = offer.booking_id;
        let lock = self.locks.for_booking(booking_id);
        let _guard = lock.lock().await;

        self.offers.decline(offer_id, &provider_id, reason).await?;
        self.bookings
            .update(
                booking_id,
                Box::new(|b: &mut Booking| {
                    b.pending_offer_count = b.pending_offer_count.saturating_sub(1);
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }
}
