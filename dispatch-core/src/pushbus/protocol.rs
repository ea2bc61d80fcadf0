//! Push Bus wire schema (§6.1). Every frame on the wire is a single text
//! payload; inbound frames are tagged on `type` with a `data` payload,
//! outbound frames additionally carry `timestamp` and `messageId`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{BookingId, OfferId};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "auth")]
    Auth { token: String },
    #[serde(rename = "join_room")]
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "leave_room")]
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "order.subscribe")]
    OrderSubscribe {
        #[serde(rename = "orderId")]
        order_id: BookingId,
    },
    #[serde(rename = "order.unsubscribe")]
    OrderUnsubscribe {
        #[serde(rename = "orderId")]
        order_id: BookingId,
    },
    #[serde(rename = "offer.ack")]
    OfferAck {
        #[serde(rename = "offerId")]
        offer_id: OfferId,
    },
    #[serde(rename = "offer.accept")]
    OfferAccept {
        #[serde(rename = "offerId")]
        offer_id: OfferId,
    },
    #[serde(rename = "offer.decline")]
    OfferDecline {
        #[serde(rename = "offerId")]
        offer_id: OfferId,
        reason: String,
    },
    #[serde(rename = "provider.location")]
    ProviderLocation {
        #[serde(rename = "orderId")]
        order_id: BookingId,
        lat: f64,
        lon: f64,
        accuracy: Option<f64>,
    },
    #[serde(rename = "ping")]
    Ping {},
}

/// A server-initiated event, pre-serialization. `kind` and `data` populate
/// the wire envelope; `messageId` is minted fresh per call to `envelope`,
/// never reused across recipients (§6.1).
pub struct ServerEvent {
    pub kind: &'static str,
    pub data: Value,
}

impl ServerEvent {
    pub fn new(kind: &'static str, data: Value) -> Self {
        Self { kind, data }
    }

    pub fn envelope(&self) -> String {
        let envelope = serde_json::json!({
            "type": self.kind,
            "data": self.data,
            "timestamp": Utc::now().timestamp_millis(),
            "messageId": crate::types::Id::new().to_string(),
        });
        envelope.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn client_message_parses_offer_decline() {
        let raw = r#"{"type":"offer.decline","data":{"offerId":"0123456789abcdef0123456789abcdef","reason":"busy"}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::OfferDecline { reason, .. } => assert_eq!(reason, "busy"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"type":"not.a.real.type","data":{}}"#;
        let result: Result<ClientMessage, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn each_envelope_gets_a_fresh_message_id() {
        let event = ServerEvent::new("pong", serde_json::json!({}));
        let a = event.envelope();
        let b = event.envelope();
        assert_ne!(a, b);
    }
}
