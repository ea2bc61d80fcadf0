//! Booking intake, cancellation, and status lookup.

use axum::extract::{Path, State};
use axum::response::Json;
use chrono::Utc;

use crate::auth::Claims;
use crate::error::CoreError;
use crate::pushbus::protocol::ServerEvent;
use crate::store::{BookingStore, OfferStore};
use crate::types::{Booking, BookingId, BookingKind, BookingStatus, GeoPoint, Role, Urgency};
use crate::voice::VoiceNotifier;

use super::AppState;

#[derive(Debug, serde::Deserialize)]
pub struct CreateBookingRequest {
    pub service_kind: String,
    pub booking_kind: BookingKind,
    #[serde(default)]
    pub urgency: Urgency,
    pub location: GeoPoint,
    pub address: String,
    pub scheduled_for: Option<chrono::DateTime<Utc>>,
    pub price: f64,
    pub payment_method: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, serde::Serialize)]
pub struct CreateBookingResponse {
    pub booking_id: String,
    pub status: BookingStatus,
}

fn validate(req: &CreateBookingRequest) -> Result<(), CoreError> {
    if req.service_kind.trim().is_empty() {
        return Err(CoreError::InvalidInput("service_kind must not be empty".into()));
    }
    if !(-90.0..=90.0).contains(&req.location.lat) {
        return Err(CoreError::InvalidInput("location.lat out of range".into()));
    }
    if !(-180.0..=180.0).contains(&req.location.lon) {
        return Err(CoreError::InvalidInput("location.lon out of range".into()));
    }
    if req.price <= 0.0 {
        return Err(CoreError::InvalidInput("price must be positive".into()));
    }
    if matches!(req.booking_kind, BookingKind::Scheduled) && req.scheduled_for.is_none() {
        return Err(CoreError::InvalidInput(
            "scheduled_for is required for scheduled bookings".into(),
        ));
    }
    Ok(())
}

pub async fn create(
    claims: Claims,
    State(state): State<AppState>,
    Json(req): Json<CreateBookingRequest>,
) -> Result<Json<CreateBookingResponse>, CoreError> {
    claims.require_role(&[Role::Customer])?;
    validate(&req)?;

    let now = Utc::now();
    let booking = Booking {
        id: BookingId::new(),
        customer_id: claims.user_id(),
        service_kind: req.service_kind,
        booking_kind: req.booking_kind,
        urgency: req.urgency,
        location: req.location,
        address: req.address,
        scheduled_for: req.scheduled_for,
        price: req.price,
        payment_method: req.payment_method,
        notes: req.notes,
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
    };
    let booking_id = booking.id;
    let status = booking.status;
    state.bookings.create(booking).await?;

    slog::info!(state.logger, "booking created"; "booking_id" => %booking_id, "customer_id" => %claims.sub);

    Ok(Json(CreateBookingResponse {
        booking_id: booking_id.to_string(),
        status,
    }))
}

#[derive(Debug, serde::Serialize)]
pub struct BookingStatusResponse {
    pub booking_id: String,
    pub status: BookingStatus,
    pub search_wave: u32,
    pub current_search_radius_km: f64,
    pub assigned_provider_id: Option<String>,
}

pub async fn get_status(
    claims: Claims,
    State(state): State<AppState>,
    Path(id): Path<BookingId>,
) -> Result<Json<BookingStatusResponse>, CoreError> {
    let booking = state.bookings.get(id).await?.ok_or(CoreError::NotFound)?;
    let is_owner = booking.customer_id == claims.user_id();
    let is_assigned_provider = booking.assigned_provider_id.as_ref() == Some(&claims.user_id());
    if !is_owner && !is_assigned_provider && !matches!(claims.role, Role::Admin) {
        return Err(CoreError::Forbidden);
    }

    Ok(Json(BookingStatusResponse {
        booking_id: booking.id.to_string(),
        status: booking.status,
        search_wave: booking.search_wave,
        current_search_radius_km: booking.current_search_radius_km,
        assigned_provider_id: booking.assigned_provider_id.map(|p| p.0),
    }))
}

/// Cancels a booking (§5 "Cancellation"): only the owning customer or an
/// admin may cancel, and only before the booking reaches a terminal state.
/// Cancels every live offer and any pending voice call in the same sweep.
pub async fn cancel(
    claims: Claims,
    State(state): State<AppState>,
    Path(id): Path<BookingId>,
) -> Result<Json<serde_json::Value>, CoreError> {
    let lock = state.locks.for_booking(id);
    let _guard = lock.lock().await;

    let booking = state.bookings.get(id).await?.ok_or(CoreError::NotFound)?;
    if booking.customer_id != claims.user_id() && !matches!(claims.role, Role::Admin) {
        return Err(CoreError::Forbidden);
    }
    if booking.status.is_terminal() {
        return Err(CoreError::Conflict("booking already in a terminal state"));
    }

    let updated = state
        .bookings
        .update(
            id,
            Box::new(|b: &mut Booking| {
                b.status = BookingStatus::Cancelled;
                b.assignment_method = Some(crate::types::AssignmentMethod::Cancelled);
                b.matching_expires_at = None;
                b.pending_offer_count = 0;
                Ok(())
            }),
        )
        .await?;

    let cancelled_offers = state.offers.list_active(id).await?;
    state.offers.cancel_for_booking(id).await?;
    state.voice.cancel_for_booking(id).await;

    for offer in &cancelled_offers {
        state.hub.send_to_user(
            &offer.provider_id,
            &ServerEvent::new(
                "offer.expired",
                serde_json::json!({
                    "offerId": offer.id.to_string(),
                    "bookingId": id.to_string(),
                    "reason": "cancelled",
                }),
            ),
        );
    }
    state.hub.send_to_room(
        &format!("order:{id}"),
        &ServerEvent::new(
            "booking.cancelled",
            serde_json::json!({"bookingId": id.to_string()}),
        ),
    );

    slog::info!(state.logger, "booking cancelled"; "booking_id" => %id, "offers_cancelled" => cancelled_offers.len());

    Ok(Json(serde_json::json!({
        "bookingId": updated.id.to_string(),
        "status": updated.status,
    })))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acceptance::AcceptanceResolver;
    use crate::config::Config;
    use crate::locks::BookingLocks;
    use crate::store::{InMemoryBookingStore, InMemoryOfferStore};
    use crate::voice::StubVoiceNotifier;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            dispatch_tick: Duration::from_secs(2),
            offer_ttl: Duration::from_secs(300),
            global_deadline: Duration::from_secs(300),
            initial_radius_km: 15.0,
            max_radius_km: 50.0,
            radius_growth: 1.5,
            max_providers_per_wave: 5,
            dispatch_parallelism: 4,
            accept_retry_max: 3,
            location_freshness: Duration::from_secs(600),
            lead_time: Duration::from_secs(1800),
            max_msg_per_min: 60,
            max_frame_bytes: 16384,
            max_conn_per_ip: 4,
            auth_timeout: Duration::from_secs(10),
            jwt_secret: "test".into(),
            bind_addr: "0.0.0.0:0".into(),
        })
    }

    fn state() -> AppState {
        let bookings: Arc<dyn crate::store::BookingStore> = Arc::new(InMemoryBookingStore::new());
        let offers: Arc<dyn crate::store::OfferStore> = Arc::new(InMemoryOfferStore::new());
        let voice: Arc<dyn crate::voice::VoiceNotifier> = Arc::new(StubVoiceNotifier::new(test_logger()));
        let hub = Arc::new(crate::pushbus::PushHub::new());
        let locks = Arc::new(BookingLocks::new());
        let config = test_config();
        let acceptance = Arc::new(AcceptanceResolver::new(
            bookings.clone(),
            offers.clone(),
            voice.clone(),
            hub.clone(),
            locks.clone(),
            config.clone(),
            test_logger(),
        ));
        AppState {
            config,
            keys: Arc::new(crate::auth::Keys::from_secret("test")),
            bookings,
            offers,
            voice,
            acceptance,
            hub,
            locks,
            logger: test_logger(),
        }
    }

    fn customer(sub: &str) -> Claims {
        Claims {
            sub: sub.into(),
            role: Role::Customer,
            exp: (Utc::now().timestamp() + 3600) as u64,
            active: true,
        }
    }

    fn valid_request() -> CreateBookingRequest {
        CreateBookingRequest {
            service_kind: "electrician".into(),
            booking_kind: BookingKind::Instant,
            urgency: Urgency::Normal,
            location: GeoPoint { lat: 12.9716, lon: 77.5946 },
            address: "12 MG Road".into(),
            scheduled_for: None,
            price: 500.0,
            payment_method: "card".into(),
            notes: String::new(),
        }
    }

    #[tokio::test]
    async fn create_rejects_out_of_range_coordinates() {
        let s = state();
        let mut req = valid_request();
        req.location.lat = 200.0;
        let result = create(customer("c1"), State(s), axum::Json(req)).await;
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn create_rejects_non_positive_price() {
        let s = state();
        let mut req = valid_request();
        req.price = 0.0;
        let result = create(customer("c1"), State(s), axum::Json(req)).await;
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn create_then_get_status_round_trips() {
        let s = state();
        let created = create(customer("c1"), State(s.clone()), axum::Json(valid_request()))
            .await
            .unwrap();
        let id: BookingId = created.0.booking_id.parse().unwrap();

        let status = get_status(customer("c1"), State(s), Path(id)).await.unwrap();
        assert!(matches!(status.0.status, BookingStatus::Pending));
    }

    /// Scenario 5: cancelling while offers are live cascades to every
    /// offer and to the voice notifier, and a second cancel is rejected.
    #[tokio::test]
    async fn cancel_cascades_to_live_offers_and_is_not_repeatable() {
        let s = state();
        let created = create(customer("c1"), State(s.clone()), axum::Json(valid_request()))
            .await
            .unwrap();
        let id: BookingId = created.0.booking_id.parse().unwrap();

        let now = Utc::now();
        let offer_id = s
            .offers
            .create(id, crate::types::UserId("p1".into()), now, chrono::Duration::seconds(300), 1, 1.0, 5)
            .await
            .unwrap();

        cancel(customer("c1"), State(s.clone()), Path(id)).await.unwrap();

        let booking = s.bookings.get(id).await.unwrap().unwrap();
        assert!(matches!(booking.status, BookingStatus::Cancelled));
        let offer = s.offers.get(offer_id).await.unwrap().unwrap();
        assert_eq!(offer.state, crate::types::OfferState::Cancelled);

        let second = cancel(customer("c1"), State(s), Path(id)).await;
        assert!(matches!(second, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn other_customers_cannot_view_a_booking_they_do_not_own() {
        let s = state();
        let created = create(customer("c1"), State(s.clone()), axum::Json(valid_request()))
            .await
            .unwrap();
        let id: BookingId = created.0.booking_id.parse().unwrap();

        let result = get_status(customer("stranger"), State(s), Path(id)).await;
        assert!(matches!(result, Err(CoreError::Forbidden)));
    }
}
