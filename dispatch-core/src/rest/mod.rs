//! REST control surface (§SPEC_FULL.md B): booking intake, cancellation,
//! and status lookup. The Push Bus carries live state; these are the
//! plain request/response operations a customer-facing app also needs.

pub mod bookings;

use std::sync::Arc;

use axum::extract::FromRef;
use axum::routing::{get, post};
use axum::Router;
use slog::Logger;

use crate::acceptance::AcceptanceResolver;
use crate::auth::Keys;
use crate::config::Config;
use crate::locks::BookingLocks;
use crate::pushbus::PushHub;
use crate::store::{BookingStore, OfferStore};
use crate::voice::VoiceNotifier;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub keys: Arc<Keys>,
    pub bookings: Arc<dyn BookingStore>,
    pub offers: Arc<dyn OfferStore>,
    pub voice: Arc<dyn VoiceNotifier>,
    pub acceptance: Arc<AcceptanceResolver>,
    pub hub: Arc<PushHub>,
    pub locks: Arc<BookingLocks>,
    pub logger: Logger,
}

impl FromRef<AppState> for Arc<Keys> {
    fn from_ref(state: &AppState) -> Self {
        state.keys.clone()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/bookings", post(bookings::create))
        .route("/v1/bookings/{id}", get(bookings::get_status))
        .route("/v1/bookings/{id}/cancel", post(bookings::cancel))
        .with_state(state)
}
