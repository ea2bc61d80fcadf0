//! Dispatcher Loop (component E, §4.5). The single logical periodic
//! scanner that advances bookings through states, emits offers, expands
//! radius, and enforces TTLs. Grounded on the teacher's `Manager::run`
//! tick loop: sleep, then a fixed sequence of phases, then fan out
//! per-item work into a bounded pool via `JoinSet`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use slog::Logger;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::CoreError;
use crate::geo::EligibilityIndex;
use crate::locks::BookingLocks;
use crate::pushbus::protocol::ServerEvent;
use crate::pushbus::PushHub;
use crate::store::{BookingStore, EligibilityCriteria, OfferStore};
use crate::types::{
    AssignmentMethod, Booking, BookingId, BookingKind, BookingStatus,
};
use crate::voice::{VoiceCallRequest, VoiceNotifier};

const RADIUS_EPS_KM: f64 = 1e-9;

pub struct Dispatcher {
    bookings: Arc<dyn BookingStore>,
    offers: Arc<dyn OfferStore>,
    geo: EligibilityIndex,
    voice: Arc<dyn VoiceNotifier>,
    hub: Arc<PushHub>,
    locks: Arc<BookingLocks>,
    config: Arc<Config>,
    logger: Logger,
}

impl Dispatcher {
    pub fn new(
        bookings: Arc<dyn BookingStore>,
        offers: Arc<dyn OfferStore>,
        geo: EligibilityIndex,
        voice: Arc<dyn VoiceNotifier>,
        hub: Arc<PushHub>,
        locks: Arc<BookingLocks>,
        config: Arc<Config>,
        logger: Logger,
    ) -> Self {
        Self {
            bookings,
            offers,
            geo,
            voice,
            hub,
            locks,
            config,
            logger,
        }
    }

    /// Runs forever, ticking every `DISPATCH_TICK`. Intended to be spawned
    /// once at startup and to outlive the process (§9: clean teardown is
    /// the caller's job, not this loop's).
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.dispatch_tick);
        loop {
            interval.tick().await;
            if let Err(err) = self.tick().await {
                slog::error!(self.logger, "dispatcher tick failed"; "error" => %err);
            }
        }
    }

    async fn tick(&self) -> Result<(), CoreError> {
        let now = Utc::now();
        let reaped = self.reap_expired_offers(now).await?;

        let due = self.bookings.list_needing_attention(now).await?;
        let actionable: Vec<Booking> = due
            .into_iter()
            .filter(|b| self.is_actionable(b, now))
            .collect();

        slog::info!(self.logger, "dispatch tick";
            "reaped_offers" => reaped, "bookings_due" => actionable.len());

        let semaphore = Arc::new(Semaphore::new(self.config.dispatch_parallelism));
        let mut tasks = JoinSet::new();
        for booking in actionable {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let booking_id = booking.id;
            let this = self.snapshot();
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(err) = this.process_booking(booking_id, now).await {
                    slog::warn!(this.logger, "dispatch action failed";
                        "booking_id" => %booking_id, "error" => %err);
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Cheap `Arc`-cloned handle usable inside a spawned task.
    fn snapshot(&self) -> Arc<DispatcherHandle> {
        Arc::new(DispatcherHandle {
            bookings: self.bookings.clone(),
            offers: self.offers.clone(),
            geo: self.geo.clone(),
            voice: self.voice.clone(),
            hub: self.hub.clone(),
            locks: self.locks.clone(),
            config: self.config.clone(),
            logger: self.logger.clone(),
        })
    }

    async fn reap_expired_offers(&self, now: DateTime<Utc>) -> Result<usize, CoreError> {
        let expired = self.offers.expire_due(now).await?;
        for offer in &expired {
            self.hub.send_to_user(
                &offer.provider_id,
                &ServerEvent::new(
                    "offer.expired",
                    serde_json::json!({
                        "offerId": offer.id.to_string(),
                        "bookingId": offer.booking_id.to_string(),
                        "reason": "expired",
                    }),
                ),
            );
            let _ = self
                .bookings
                .update(
                    offer.booking_id,
                    Box::new(|b: &mut Booking| {
                        b.pending_offer_count = b.pending_offer_count.saturating_sub(1);
                        Ok(())
                    }),
                )
                .await;
        }
        Ok(expired.len())
    }

    fn is_actionable(&self, b: &Booking, now: DateTime<Utc>) -> bool {
        match b.status {
            BookingStatus::Pending => match b.booking_kind {
                BookingKind::Instant => true,
                BookingKind::Scheduled => b
                    .scheduled_for
                    .map(|t| now >= t - self.config.lead_time)
                    .unwrap_or(false),
            },
            BookingStatus::ProviderSearch => true,
            _ => false,
        }
    }
}

/// The work a spawned per-booking task actually does; split out of
/// `Dispatcher` so each task only clones the `Arc`s it needs rather than
/// the whole loop.
struct DispatcherHandle {
    bookings: Arc<dyn BookingStore>,
    offers: Arc<dyn OfferStore>,
    geo: EligibilityIndex,
    voice: Arc<dyn VoiceNotifier>,
    hub: Arc<PushHub>,
    locks: Arc<BookingLocks>,
    config: Arc<Config>,
    logger: Logger,
}

impl DispatcherHandle {
    async fn process_booking(&self, booking_id: BookingId, now: DateTime<Utc>) -> Result<(), CoreError> {
        let lock = self.locks.for_booking(booking_id);
        let _guard = lock.lock().await;

        let booking = self.bookings.get(booking_id).await?.ok_or(CoreError::NotFound)?;
        match booking.status {
            BookingStatus::Pending => self.initial_matching(booking, now).await,
            BookingStatus::ProviderSearch => {
                if booking.matching_expires_at.map(|t| t <= now).unwrap_or(false) {
                    self.global_timeout(booking, now).await
                } else if booking.pending_offer_count == 0
                    && booking.current_search_radius_km + RADIUS_EPS_KM < self.config.max_radius_km
                {
                    self.radius_expansion(booking, now).await
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    async fn initial_matching(&self, booking: Booking, now: DateTime<Utc>) -> Result<(), CoreError> {
        let deadline = now + chrono::Duration::from_std(self.config.global_deadline).unwrap();
        self.bookings
            .update(
                booking.id,
                Box::new(move |b: &mut Booking| {
                    b.status = BookingStatus::ProviderSearch;
                    b.matching_expires_at = Some(deadline);
                    Ok(())
                }),
            )
            .await?;

        let criteria = EligibilityCriteria {
            service_kind: booking.service_kind.clone(),
            center: booking.location,
            scheduled_for: booking.scheduled_for,
            radius_km: self.config.initial_radius_km,
            max_results: self.config.max_providers_per_wave,
            exclude_providers: Vec::new(),
            location_freshness: chrono::Duration::from_std(self.config.location_freshness).unwrap(),
        };
        let eligible = self.geo.query(&criteria).await;

        let updated = self
            .bookings
            .set_radius_and_wave(booking.id, self.config.initial_radius_km, 1, eligible.len(), now)
            .await?;

        self.hub.send_to_user(
            &booking.customer_id,
            &ServerEvent::new(
                "matching.started",
                serde_json::json!({
                    "bookingId": booking.id.to_string(),
                    "providerCount": eligible.len(),
                    "radiusKm": self.config.initial_radius_km,
                    "wave": 1,
                    "deadlineAt": deadline.to_rfc3339(),
                }),
            ),
        );

        self.create_wave_offers(&updated, &eligible, now, deadline).await
    }

    async fn radius_expansion(&self, booking: Booking, now: DateTime<Utc>) -> Result<(), CoreError> {
        let next_radius = (booking.current_search_radius_km * self.config.radius_growth)
            .min(self.config.max_radius_km);
        let wave = booking.search_wave + 1;

        let history = self.offers.list_by_booking(booking.id).await?;
        let excluded: Vec<_> = booking
            .excluded_providers(&history)
            .into_iter()
            .cloned()
            .collect();

        let criteria = EligibilityCriteria {
            service_kind: booking.service_kind.clone(),
            center: booking.location,
            scheduled_for: booking.scheduled_for,
            radius_km: next_radius,
            max_results: self.config.max_providers_per_wave,
            exclude_providers: excluded,
            location_freshness: chrono::Duration::from_std(self.config.location_freshness).unwrap(),
        };
        let eligible = self.geo.query(&criteria).await;

        let updated = self
            .bookings
            .set_radius_and_wave(booking.id, next_radius, wave, eligible.len(), now)
            .await?;

        if eligible.is_empty() && next_radius + RADIUS_EPS_KM >= self.config.max_radius_km {
            return self.no_providers_found(updated, "deadline-radius-exhausted").await;
        }

        self.hub.send_to_user(
            &booking.customer_id,
            &ServerEvent::new(
                "matching.radius_expanded",
                serde_json::json!({
                    "bookingId": booking.id.to_string(),
                    "newRadiusKm": next_radius,
                    "wave": wave,
                }),
            ),
        );

        let deadline = updated
            .matching_expires_at
            .unwrap_or(now + chrono::Duration::from_std(self.config.offer_ttl).unwrap());
        self.create_wave_offers(&updated, &eligible, now, deadline).await
    }

    async fn create_wave_offers(
        &self,
        booking: &Booking,
        eligible: &[crate::types::ProviderProfile],
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let ttl = chrono::Duration::from_std(self.config.offer_ttl)
            .unwrap()
            .min(deadline - now);
        let ttl = if ttl > chrono::Duration::zero() { ttl } else { chrono::Duration::seconds(1) };

        for provider in eligible {
            let distance_km = booking.location.distance_km(&provider.location);
            let priority = priority_from_urgency(booking.urgency);
            let travel_min = (distance_km / 30.0 * 60.0).round().max(1.0) as u32;

            let offer_id = self
                .offers
                .create(
                    booking.id,
                    provider.provider_id.clone(),
                    now,
                    ttl,
                    priority,
                    distance_km,
                    travel_min,
                )
                .await?;

            self.hub.send_to_user(
                &provider.provider_id,
                &ServerEvent::new(
                    "offer.new",
                    serde_json::json!({
                        "offerId": offer_id.to_string(),
                        "bookingId": booking.id.to_string(),
                        "serviceKind": booking.service_kind,
                        "price": booking.price,
                        "urgency": booking.urgency,
                        "expiresAt": (now + ttl).to_rfc3339(),
                        "distanceKm": distance_km,
                        "travelMin": travel_min,
                    }),
                ),
            );

            // A failed voice submission never aborts the wave: the offer
            // already exists and is valid on its own, and retrying the
            // call is the notifier's concern, not ours (§4.9).
            if let Err(err) = self
                .voice
                .submit(
                    VoiceCallRequest {
                        booking_id: booking.id,
                        offer_id,
                        provider_id: provider.provider_id.clone(),
                        phone_number: provider.phone_number.clone(),
                        urgency: booking.urgency,
                        customer_name: booking.customer_id.to_string(),
                        service_kind: booking.service_kind.clone(),
                        estimated_price: booking.price,
                        expires_at: now + ttl,
                        language: provider.language.clone(),
                    },
                    provider,
                )
                .await
            {
                slog::warn!(self.logger, "voice submission failed";
                    "booking_id" => %booking.id, "offer_id" => %offer_id, "error" => %err);
            }
        }

        self.bookings
            .update(
                booking.id,
                Box::new({
                    let count = eligible.len() as u32;
                    move |b: &mut Booking| {
                        b.pending_offer_count = count;
                        Ok(())
                    }
                }),
            )
            .await?;

        Ok(())
    }

    async fn global_timeout(&self, booking: Booking, _now: DateTime<Utc>) -> Result<(), CoreError> {
        let active = self.offers.list_active(booking.id).await?;
        self.offers.cancel_for_booking(booking.id).await?;

        let updated = self
            .bookings
            .update(
                booking.id,
                Box::new(|b: &mut Booking| {
                    b.status = BookingStatus::NoProvidersFound;
                    b.assignment_method = Some(AssignmentMethod::Timeout);
                    b.matching_expires_at = None;
                    b.pending_offer_count = 0;
                    Ok(())
                }),
            )
            .await?;

        self.hub.send_to_user(
            &updated.customer_id,
            &ServerEvent::new(
                "matching.expired",
                serde_json::json!({
                    "bookingId": updated.id.to_string(),
                    "reason": "deadline",
                    "nextSteps": Vec::<String>::new(),
                }),
            ),
        );
        for offer in active {
            self.hub.send_to_user(
                &offer.provider_id,
                &ServerEvent::new(
                    "offer.expired",
                    serde_json::json!({
                        "offerId": offer.id.to_string(),
                        "bookingId": updated.id.to_string(),
                        "reason": "expired",
                    }),
                ),
            );
        }
        Ok(())
    }

    async fn no_providers_found(&self, booking: Booking, reason: &'static str) -> Result<(), CoreError> {
        self.offers.cancel_for_booking(booking.id).await?;
        let updated = self
            .bookings
            .update(
                booking.id,
                Box::new(|b: &mut Booking| {
                    b.status = BookingStatus::NoProvidersFound;
                    b.matching_expires_at = None;
                    b.pending_offer_count = 0;
                    Ok(())
                }),
            )
            .await?;

        self.hub.send_to_user(
            &updated.customer_id,
            &ServerEvent::new(
                "matching.expired",
                serde_json::json!({
                    "bookingId": updated.id.to_string(),
                    "reason": reason,
                    "nextSteps": Vec::<String>::new(),
                }),
            ),
        );
        Ok(())
    }
}

fn priority_from_urgency(urgency: crate::types::Urgency) -> u8 {
    match urgency {
        crate::types::Urgency::Low => 0,
        crate::types::Urgency::Normal => 1,
        crate::types::Urgency::High => 2,
        crate::types::Urgency::Urgent => 3,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{InMemoryBookingStore, InMemoryOfferStore, InMemoryProviderStore};
    use crate::types::{BookingKind, GeoPoint, OfferState, Urgency, UserId, VoicePreferences};
    use crate::voice::StubVoiceNotifier;

    fn test_logger() -> Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            dispatch_tick: std::time::Duration::from_secs(2),
            offer_ttl: std::time::Duration::from_secs(300),
            global_deadline: std::time::Duration::from_secs(300),
            initial_radius_km: 15.0,
            max_radius_km: 50.0,
            radius_growth: 1.5,
            max_providers_per_wave: 5,
            dispatch_parallelism: 4,
            accept_retry_max: 3,
            location_freshness: std::time::Duration::from_secs(600),
            lead_time: std::time::Duration::from_secs(1800),
            max_msg_per_min: 60,
            max_frame_bytes: 16384,
            max_conn_per_ip: 4,
            auth_timeout: std::time::Duration::from_secs(10),
            jwt_secret: "test".into(),
            bind_addr: "0.0.0.0:0".into(),
        })
    }

    fn bangalore() -> GeoPoint {
        GeoPoint { lat: 12.9716, lon: 77.5946 }
    }

    /// A point roughly `distance_km` north of Bangalore.
    fn near(distance_km: f64) -> GeoPoint {
        GeoPoint { lat: 12.9716 + distance_km / 111.0, lon: 77.5946 }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        bookings: Arc<InMemoryBookingStore>,
        offers: Arc<InMemoryOfferStore>,
        providers: Arc<InMemoryProviderStore>,
    }

    fn fixture() -> Fixture {
        let bookings = Arc::new(InMemoryBookingStore::new());
        let offers = Arc::new(InMemoryOfferStore::new());
        let providers = Arc::new(InMemoryProviderStore::new());
        let geo = EligibilityIndex::new(providers.clone());
        let voice = Arc::new(StubVoiceNotifier::new(test_logger()));
        let hub = Arc::new(PushHub::new());
        let locks = Arc::new(BookingLocks::new());

        let dispatcher = Dispatcher::new(
            bookings.clone(),
            offers.clone(),
            geo,
            voice,
            hub,
            locks,
            test_config(),
            test_logger(),
        );

        Fixture { dispatcher, bookings, offers, providers }
    }

    fn provider(id: &str, location: GeoPoint) -> crate::types::ProviderProfile {
        crate::types::ProviderProfile {
            provider_id: UserId(id.into()),
            service_kinds: vec!["electrician".into()],
            location,
            location_updated_at: Utc::now(),
            online: true,
            active: true,
            verified: true,
            availability: std::collections::BTreeMap::new(),
            service_radius_km: 50.0,
            rating: 4.5,
            completion_count: 20,
            response_rate: 0.9,
            phone_number: "+10000000".into(),
            language: "en".into(),
            voice_preferences: VoicePreferences::default(),
        }
    }

    fn instant_booking(customer: &str) -> Booking {
        let now = Utc::now();
        Booking {
            id: BookingId::new(),
            customer_id: UserId(customer.into()),
            service_kind: "electrician".into(),
            booking_kind: BookingKind::Instant,
            urgency: Urgency::Normal,
            location: bangalore(),
            address: "12 MG Road".into(),
            scheduled_for: None,
            price: 500.0,
            payment_method: "card".into(),
            notes: String::new(),
            status: BookingStatus::Pending,
            current_search_radius_km: 0.0,
            search_wave: 0,
            radius_expansion_history: Vec::new(),
            matching_expires_at: None,
            pending_offer_count: 0,
            assigned_provider_id: None,
            assignment_method: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Scenario 1 (happy path): three eligible providers, one tick, three
    /// offers created and the booking recorded as wave 1.
    #[tokio::test]
    async fn happy_path_creates_one_offer_per_eligible_provider() {
        let f = fixture();
        f.providers.upsert(provider("p1", near(1.2)));
        f.providers.upsert(provider("p2", near(3.0)));
        f.providers.upsert(provider("p3", near(4.5)));

        let booking = instant_booking("c1");
        let booking_id = booking.id;
        f.bookings.create(booking).await.unwrap();

        f.dispatcher.tick().await.unwrap();

        let updated = f.bookings.get(booking_id).await.unwrap().unwrap();
        assert!(matches!(updated.status, BookingStatus::ProviderSearch));
        assert_eq!(updated.search_wave, 1);
        assert_eq!(updated.pending_offer_count, 3);

        let offers = f.offers.list_active(booking_id).await.unwrap();
        assert_eq!(offers.len(), 3);
    }

    /// Property 6: a second tick with no external input changes nothing.
    #[tokio::test]
    async fn second_tick_with_no_input_is_a_no_op() {
        let f = fixture();
        f.providers.upsert(provider("p1", near(1.2)));

        let booking = instant_booking("c1");
        let booking_id = booking.id;
        f.bookings.create(booking).await.unwrap();

        f.dispatcher.tick().await.unwrap();
        let after_first = f.bookings.get(booking_id).await.unwrap().unwrap();
        let offers_after_first = f.offers.list_active(booking_id).await.unwrap().len();

        f.dispatcher.tick().await.unwrap();
        let after_second = f.bookings.get(booking_id).await.unwrap().unwrap();
        let offers_after_second = f.offers.list_active(booking_id).await.unwrap().len();

        assert_eq!(after_first.search_wave, after_second.search_wave);
        assert_eq!(after_first.pending_offer_count, after_second.pending_offer_count);
        assert_eq!(offers_after_first, offers_after_second);
    }

    /// Scenario 3 (TTL expiry then wave): nothing within the initial
    /// radius, two candidates only once the radius grows.
    #[tokio::test]
    async fn radius_expands_when_a_wave_finds_no_candidates() {
        let f = fixture();
        f.providers.upsert(provider("far1", near(20.0)));
        f.providers.upsert(provider("far2", near(20.0)));

        let booking = instant_booking("c1");
        let booking_id = booking.id;
        f.bookings.create(booking).await.unwrap();

        f.dispatcher.tick().await.unwrap();
        let wave1 = f.bookings.get(booking_id).await.unwrap().unwrap();
        assert_eq!(wave1.search_wave, 1);
        assert_eq!(wave1.pending_offer_count, 0);
        assert!((wave1.current_search_radius_km - 15.0).abs() < 1e-9);

        f.dispatcher.tick().await.unwrap();
        let wave2 = f.bookings.get(booking_id).await.unwrap().unwrap();
        assert_eq!(wave2.search_wave, 2);
        assert_eq!(wave2.pending_offer_count, 2);
        assert!((wave2.current_search_radius_km - 22.5).abs() < 1e-6);
    }

    /// Scenario 4 (global deadline): an offer outstanding past
    /// `matching-expires-at` forces the booking to `no_providers_found`.
    #[tokio::test]
    async fn global_deadline_past_due_times_out_the_booking() {
        let f = fixture();
        let provider_id = UserId("p1".into());
        f.providers.upsert(provider("p1", near(1.0)));

        let now = Utc::now();
        let mut booking = instant_booking("c1");
        booking.status = BookingStatus::ProviderSearch;
        booking.current_search_radius_km = 15.0;
        booking.search_wave = 1;
        booking.matching_expires_at = Some(now - chrono::Duration::seconds(1));
        booking.pending_offer_count = 1;
        let booking_id = booking.id;
        f.bookings.create(booking).await.unwrap();

        let offer_id = f
            .offers
            .create(booking_id, provider_id, now - chrono::Duration::seconds(10), chrono::Duration::seconds(300), 1, 1.0, 5)
            .await
            .unwrap();

        f.dispatcher.tick().await.unwrap();

        let updated = f.bookings.get(booking_id).await.unwrap().unwrap();
        assert!(matches!(updated.status, BookingStatus::NoProvidersFound));
        let offer = f.offers.get(offer_id).await.unwrap().unwrap();
        assert_eq!(offer.state, OfferState::Cancelled);
    }
}

