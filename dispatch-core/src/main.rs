//! Process entrypoint: wires the stores, the Geo/Eligibility Index, the
//! Voice Notifier Gateway, the Push Bus, the Acceptance Resolver and the
//! Dispatcher Loop together, then serves the REST and Push Bus routers on
//! one listener.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http;
use slog::Drain;
use tower::ServiceBuilder;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use dispatch_core::acceptance::AcceptanceResolver;
use dispatch_core::auth::Keys;
use dispatch_core::config::Config;
use dispatch_core::dispatcher::Dispatcher;
use dispatch_core::geo::EligibilityIndex;
use dispatch_core::locks::BookingLocks;
use dispatch_core::pushbus::server::PushBusState;
use dispatch_core::pushbus::PushHub;
use dispatch_core::ratelimit::ConnPerIpLimiter;
use dispatch_core::rest::{self, AppState};
use dispatch_core::store::{InMemoryBookingStore, InMemoryOfferStore, InMemoryProviderStore};
use dispatch_core::voice::StubVoiceNotifier;

fn root_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!("component" => "dispatch-core"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let logger = root_logger();
    let config = Arc::new(Config::from_env().context("loading configuration")?);
    let keys = Arc::new(Keys::from_secret(&config.jwt_secret));

    let bookings: Arc<dyn dispatch_core::store::BookingStore> = Arc::new(InMemoryBookingStore::new());
    let offers: Arc<dyn dispatch_core::store::OfferStore> = Arc::new(InMemoryOfferStore::new());
    let providers: Arc<dyn dispatch_core::store::ProviderStore> = Arc::new(InMemoryProviderStore::new());
    let geo = EligibilityIndex::new(providers.clone());
    let voice: Arc<dyn dispatch_core::voice::VoiceNotifier> =
        Arc::new(StubVoiceNotifier::new(logger.new(slog::o!("module" => "voice"))));
    let hub = Arc::new(PushHub::new());
    let locks = Arc::new(BookingLocks::new());

    let acceptance = Arc::new(AcceptanceResolver::new(
        bookings.clone(),
        offers.clone(),
        voice.clone(),
        hub.clone(),
        locks.clone(),
        config.clone(),
        logger.new(slog::o!("module" => "acceptance")),
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        bookings.clone(),
        offers.clone(),
        geo,
        voice.clone(),
        hub.clone(),
        locks.clone(),
        config.clone(),
        logger.new(slog::o!("module" => "dispatcher")),
    ));
    tokio::spawn(dispatcher.run());

    let conn_limiter = Arc::new(ConnPerIpLimiter::new(config.max_conn_per_ip));

    let push_state = PushBusState {
        config: config.clone(),
        keys: keys.clone(),
        hub: hub.clone(),
        bookings: bookings.clone(),
        offers: offers.clone(),
        providers: providers.clone(),
        acceptance: acceptance.clone(),
        conn_limiter,
        logger: logger.new(slog::o!("module" => "pushbus")),
    };

    let rest_state = AppState {
        config: config.clone(),
        keys,
        bookings,
        offers,
        voice,
        acceptance,
        hub,
        locks,
        logger: logger.new(slog::o!("module" => "rest")),
    };

    let cors = cors::CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST])
        .allow_origin(cors::Any)
        .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION]);

    let app = dispatch_core::pushbus::server::router(push_state)
        .merge(rest::router(rest_state))
        .layer(ServiceBuilder::new().layer(cors).layer(TraceLayer::new_for_http()));

    let addr: std::net::SocketAddr = config.bind_addr.parse().context("bad bind address")?;
    slog::info!(logger, "listening"; "addr" => %addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("binding listener")?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("serving")?;

    Ok(())
}
