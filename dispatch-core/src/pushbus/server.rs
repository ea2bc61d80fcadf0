//! Push Bus connection handling (§4.6): the websocket handshake, the
//! per-connection reader/writer tasks, heartbeat, and rate limiting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use slog::Logger;
use tokio::sync::{mpsc, Notify};

use crate::acceptance::AcceptanceResolver;
use crate::auth::{self, Claims, Keys};
use crate::config::Config;
use crate::pushbus::protocol::{ClientMessage, ServerEvent};
use crate::pushbus::rooms;
use crate::pushbus::PushHub;
use crate::ratelimit::{ConnPerIpLimiter, MsgRateLimiter};
use crate::store::{BookingStore, OfferStore, ProviderStore};
use crate::types::Role;

#[derive(Clone)]
pub struct PushBusState {
    pub config: Arc<Config>,
    pub keys: Arc<Keys>,
    pub hub: Arc<PushHub>,
    pub bookings: Arc<dyn BookingStore>,
    pub offers: Arc<dyn OfferStore>,
    pub providers: Arc<dyn ProviderStore>,
    pub acceptance: Arc<AcceptanceResolver>,
    pub conn_limiter: Arc<ConnPerIpLimiter>,
    pub logger: Logger,
}

pub fn router(state: PushBusState) -> Router {
    Router::new().route("/v1/push", get(handshake)).with_state(state)
}

async fn handshake(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<PushBusState>,
) -> impl IntoResponse {
    if !state.conn_limiter.try_acquire(addr.ip()) {
        return axum::http::StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        handle_connection(socket, addr, state.clone()).await;
        state.conn_limiter.release(addr.ip());
    })
    .into_response()
}

async fn handle_connection(socket: WebSocket, addr: SocketAddr, state: PushBusState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let hello = ServerEvent::new(
        "hello",
        serde_json::json!({
            "authRequired": true,
            "authTimeoutMs": state.config.auth_timeout.as_millis() as u64,
        }),
    );
    if ws_tx.send(Message::Text(hello.envelope().into())).await.is_err() {
        return;
    }

    let claims = match authenticate(&mut ws_rx, &out_tx, &state).await {
        Some(claims) => claims,
        None => {
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };
    let user = claims.user_id();

    let displaced = Arc::new(Notify::new());
    let generation = state.hub.register(user.clone(), out_tx.clone(), displaced.clone());
    state.hub.rooms.join(&format!("user:{}", user.0), user.clone());
    if claims.role.is_provider() {
        state.hub.rooms.join("providers", user.clone());
    }
    if matches!(claims.role, Role::Admin) {
        state.hub.rooms.join("admin", user.clone());
    }

    let limiter = MsgRateLimiter::new(state.config.max_msg_per_min);
    let mut over_limit_strikes = 0u32;

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            next = tokio::time::timeout(Duration::from_secs(60), ws_rx.next()) => {
                let Ok(Some(Ok(msg))) = next else {
                    break;
                };
                msg
            }
            // Woken as soon as a newer connection displaces this one, so
            // this socket closes immediately instead of lingering for up
            // to 60s before `unregister` would find it already evicted.
            _ = displaced.notified() => break,
        };
        match msg {
            Message::Text(text) => {
                if text.len() > state.config.max_frame_bytes {
                    let _ = out_tx.send(
                        ServerEvent::new("error", serde_json::json!({"message": "frame too large", "code": "tooLarge"}))
                            .envelope(),
                    );
                    continue;
                }
                if !limiter.check() {
                    over_limit_strikes += 1;
                    let _ = out_tx.send(
                        ServerEvent::new("error", serde_json::json!({"message": "rate limited", "code": "rateLimited"}))
                            .envelope(),
                    );
                    if over_limit_strikes >= state.config.max_msg_per_min {
                        break;
                    }
                    continue;
                }
                handle_inbound(&text, &claims, &out_tx, &state).await;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
            Message::Binary(_) => {
                let _ = out_tx.send(
                    ServerEvent::new("error", serde_json::json!({"message": "unsupported frame", "code": "unknownType"}))
                        .envelope(),
                );
            }
        }
    }

    writer.abort();
    state.hub.unregister(&user, generation);
    slog::info!(state.logger, "push connection closed"; "user_id" => %user, "addr" => %addr);
}

async fn authenticate(
    ws_rx: &mut futures_util::stream::SplitStream<WebSocket>,
    out_tx: &mpsc::UnboundedSender<String>,
    state: &PushBusState,
) -> Option<Claims> {
    let first = tokio::time::timeout(state.config.auth_timeout, ws_rx.next()).await;
    let Ok(Some(Ok(Message::Text(text)))) = first else {
        return None;
    };
    let Ok(ClientMessage::Auth { token }) = serde_json::from_str::<ClientMessage>(&text) else {
        let _ = out_tx.send(
            ServerEvent::new("auth.failed", serde_json::json!({"message": "expected auth message"})).envelope(),
        );
        return None;
    };

    match auth::verify_token(&token, &state.keys) {
        Ok(claims) => {
            let _ = out_tx.send(
                ServerEvent::new(
                    "auth.ok",
                    serde_json::json!({"userId": claims.sub, "role": claims.role}),
                )
                .envelope(),
            );
            Some(claims)
        }
        Err(_) => {
            let _ = out_tx.send(
                ServerEvent::new("auth.failed", serde_json::json!({"message": "invalid token"})).envelope(),
            );
            None
        }
    }
}

async fn handle_inbound(
    text: &str,
    claims: &Claims,
    out_tx: &mpsc::UnboundedSender<String>,
    state: &PushBusState,
) {
    let user = claims.user_id();
    let Ok(msg) = serde_json::from_str::<ClientMessage>(text) else {
        let _ = out_tx.send(
            ServerEvent::new("error", serde_json::json!({"message": "unknown message type", "code": "unknownType"}))
                .envelope(),
        );
        return;
    };

    match msg {
        ClientMessage::Ping {} => {
            let _ = out_tx.send(ServerEvent::new("pong", serde_json::json!({})).envelope());
        }
        ClientMessage::JoinRoom { room_id } => {
            match rooms::authorize(&room_id, claims, state.bookings.as_ref(), state.offers.as_ref()).await {
                Ok(()) => {
                    state.hub.rooms.join(&room_id, user.clone());
                    let _ = out_tx.send(
                        ServerEvent::new("room.joined", serde_json::json!({"roomId": room_id})).envelope(),
                    );
                }
                Err(_) => {
                    let _ = out_tx.send(
                        ServerEvent::new(
                            "room.access_denied",
                            serde_json::json!({"roomId": room_id, "message": "access denied"}),
                        )
                        .envelope(),
                    );
                }
            }
        }
        ClientMessage::LeaveRoom { room_id } => {
            state.hub.rooms.leave(&room_id, &user);
        }
        ClientMessage::OrderSubscribe { order_id } => {
            let room_id = format!("order:{order_id}");
            if rooms::authorize(&room_id, claims, state.bookings.as_ref(), state.offers.as_ref())
                .await
                .is_ok()
            {
                state.hub.rooms.join(&room_id, user.clone());
            }
        }
        ClientMessage::OrderUnsubscribe { order_id } => {
            state.hub.rooms.leave(&format!("order:{order_id}"), &user);
        }
        ClientMessage::OfferAck { offer_id } => {
            let _ = state.offers.mark_seen(offer_id, &user).await;
        }
        ClientMessage::OfferAccept { offer_id } => {
            let _ = state.acceptance.accept(offer_id, user.clone()).await;
        }
        ClientMessage::OfferDecline { offer_id, reason } => {
            let _ = state.acceptance.decline(offer_id, user.clone(), reason).await;
        }
        ClientMessage::ProviderLocation { order_id, lat, lon, .. } => {
            let room_id = format!("order:{order_id}");
            if rooms::authorize(&room_id, claims, state.bookings.as_ref(), state.offers.as_ref())
                .await
                .is_ok()
            {
                let _ = state
                    .providers
                    .update_location(&user, crate::types::GeoPoint { lat, lon })
                    .await;
                state.hub.send_to_room(
                    &room_id,
                    &ServerEvent::new(
                        "provider.location",
                        serde_json::json!({"bookingId": order_id.to_string(), "providerId": user.0, "lat": lat, "lon": lon}),
                    ),
                );
            }
        }
        ClientMessage::Auth { .. } => {
            let _ = out_tx.send(
                ServerEvent::new("error", serde_json::json!({"message": "already authenticated"})).envelope(),
            );
        }
    }
}
