//! Room membership table and access policy (§6.2). Membership is
//! process-wide and not persisted across restarts, matching the Push
//! session's lifetime (§3).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::auth::Claims;
use crate::error::CoreError;
use crate::store::{BookingStore, OfferStore};
use crate::types::{BookingId, Role, UserId};

/// A parsed room name. `order:<id>` and `user:<id>` carry the id they
/// reference; unparseable names are rejected before any store lookup.
pub enum RoomRef {
    User(UserId),
    Providers,
    Admin,
    Order(BookingId),
}

impl RoomRef {
    pub fn parse(room_id: &str) -> Option<Self> {
        if let Some(rest) = room_id.strip_prefix("user:") {
            return Some(Self::User(UserId(rest.to_string())));
        }
        if let Some(rest) = room_id.strip_prefix("order:") {
            return Some(Self::Order(rest.parse().ok()?));
        }
        match room_id {
            "providers" => Some(Self::Providers),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// Re-validated on every join and every order-scoped action, never cached
/// past a single check (§6.2).
pub async fn authorize(
    room_id: &str,
    claims: &Claims,
    bookings: &dyn BookingStore,
    offers: &dyn OfferStore,
) -> Result<(), CoreError> {
    let Some(room) = RoomRef::parse(room_id) else {
        return Err(CoreError::NotFound);
    };
    match room {
        RoomRef::User(id) => {
            if id == claims.user_id() {
                Ok(())
            } else {
                Err(CoreError::Forbidden)
            }
        }
        RoomRef::Providers => {
            if claims.role.is_provider() {
                Ok(())
            } else {
                Err(CoreError::Forbidden)
            }
        }
        RoomRef::Admin => {
            if matches!(claims.role, Role::Admin) {
                Ok(())
            } else {
                Err(CoreError::Forbidden)
            }
        }
        RoomRef::Order(booking_id) => {
            if matches!(claims.role, Role::Admin) {
                return Ok(());
            }
            let booking = bookings.get(booking_id).await?.ok_or(CoreError::NotFound)?;
            let me = claims.user_id();
            if booking.customer_id == me {
                return Ok(());
            }
            if booking.assigned_provider_id.as_ref() == Some(&me) {
                return Ok(());
            }
            let offered = offers
                .list_active(booking_id)
                .await?
                .iter()
                .any(|o| o.provider_id == me);
            if offered {
                return Ok(());
            }
            Err(CoreError::Forbidden)
        }
    }
}

#[derive(Default)]
pub struct RoomTable {
    memberships: Mutex<HashMap<String, HashSet<UserId>>>,
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, room_id: &str, user: UserId) {
        self.memberships
            .lock()
            .unwrap()
            .entry(room_id.to_string())
            .or_default()
            .insert(user);
    }

    pub fn leave(&self, room_id: &str, user: &UserId) {
        if let Some(members) = self.memberships.lock().unwrap().get_mut(room_id) {
            members.remove(user);
        }
    }

    pub fn leave_all(&self, user: &UserId) {
        let mut rooms = self.memberships.lock().unwrap();
        for members in rooms.values_mut() {
            members.remove(user);
        }
    }

    pub fn members(&self, room_id: &str) -> Vec<UserId> {
        self.memberships
            .lock()
            .unwrap()
            .get(room_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn room_ref_parses_known_shapes() {
        assert!(matches!(RoomRef::parse("providers"), Some(RoomRef::Providers)));
        assert!(matches!(RoomRef::parse("admin"), Some(RoomRef::Admin)));
        assert!(matches!(RoomRef::parse("user:abc"), Some(RoomRef::User(_))));
        assert!(RoomRef::parse("nonsense").is_none());
    }

    #[test]
    fn room_table_join_is_idempotent() {
        let table = RoomTable::new();
        let user = UserId("u1".into());
        table.join("providers", user.clone());
        table.join("providers", user.clone());
        assert_eq!(table.members("providers").len(), 1);
    }

    #[test]
    fn leave_all_clears_every_room() {
        let table = RoomTable::new();
        let user = UserId("u1".into());
        table.join("providers", user.clone());
        table.join("admin", user.clone());
        table.leave_all(&user);
        assert!(table.members("providers").is_empty());
        assert!(table.members("admin").is_empty());
    }
}
