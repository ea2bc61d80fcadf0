pub mod protocol;
pub mod rooms;
pub mod server;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

use crate::types::UserId;
use protocol::ServerEvent;
use rooms::RoomTable;

/// A connection's registration generation. Lets a stale connection's own
/// cleanup tell whether it's still the one registered for its user id
/// before removing it, so a slow-to-notice displaced connection can't
/// evict the connection that replaced it.
type Generation = u64;

/// Process-wide fan-out hub: the room table plus the live connection
/// registry. Shared as `Arc<PushHub>` by the Dispatcher Loop, the
/// Acceptance Resolver, the REST surface, and every websocket connection
/// task (§5 "shared resources").
pub struct PushHub {
    pub rooms: RoomTable,
    connections: Mutex<HashMap<UserId, (Generation, mpsc::UnboundedSender<String>, Arc<Notify>)>>,
    next_generation: AtomicU64,
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new()
    }
}

impl PushHub {
    pub fn new() -> Self {
        Self {
            rooms: RoomTable::new(),
            connections: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Registers a connection for `user`, displacing any prior one for the
    /// same user (§4.6: "new connection displaces any prior one... with
    /// close-reason `replaced`"). If a prior connection existed, its
    /// `Notify` is woken so its reader loop can close its socket and exit
    /// immediately instead of lingering until its own idle timeout. The
    /// returned generation must be passed back to [`PushHub::unregister`]
    /// so a connection can only remove its own registration, not one that
    /// has since displaced it.
    pub fn register(
        &self,
        user: UserId,
        sender: mpsc::UnboundedSender<String>,
        notify: Arc<Notify>,
    ) -> Generation {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .connections
            .lock()
            .unwrap()
            .insert(user, (generation, sender, notify));
        if let Some((_, previous_sender, previous_notify)) = previous {
            let _ = previous_sender.send(
                ServerEvent::new("error", serde_json::json!({"message": "replaced", "code": "replaced"}))
                    .envelope(),
            );
            previous_notify.notify_one();
        }
        generation
    }

    /// Removes `user`'s registration only if it still matches `generation`,
    /// i.e. no newer connection has displaced it in the meantime.
    pub fn unregister(&self, user: &UserId, generation: Generation) {
        let removed = {
            let mut connections = self.connections.lock().unwrap();
            match connections.entry(user.clone()) {
                std::collections::hash_map::Entry::Occupied(entry) if entry.get().0 == generation => {
                    entry.remove();
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.rooms.leave_all(user);
        }
    }

    /// Failure to reach a single recipient is recorded, not propagated --
    /// the store is the source of truth and clients reconcile on
    /// reconnect (§4.9).
    pub fn send_to_user(&self, user: &UserId, event: &ServerEvent) {
        let frame = event.envelope();
        let sender = self
            .connections
            .lock()
            .unwrap()
            .get(user)
            .map(|(_, sender, _)| sender.clone());
        if let Some(sender) = sender {
            let _ = sender.send(frame);
        }
    }

    pub fn send_to_room(&self, room_id: &str, event: &ServerEvent) {
        let frame = event.envelope();
        let members = self.rooms.members(room_id);
        let connections = self.connections.lock().unwrap();
        for member in members {
            if let Some((_, sender, _)) = connections.get(&member) {
                let _ = sender.send(frame.clone());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn registering_same_user_twice_displaces_prior_sender() {
        let hub = PushHub::new();
        let user = UserId("u1".into());
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let gen1 = hub.register(user.clone(), tx1, Arc::new(Notify::new()));
        let gen2 = hub.register(user.clone(), tx2, Arc::new(Notify::new()));
        assert_ne!(gen1, gen2);
        // The displaced connection gets a "replaced" frame on its old sender.
        assert!(rx1.try_recv().is_ok());
    }

    #[tokio::test]
    async fn displacing_a_connection_wakes_its_notify() {
        let hub = PushHub::new();
        let user = UserId("u1".into());
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let notify1 = Arc::new(Notify::new());
        hub.register(user.clone(), tx1, notify1.clone());
        hub.register(user.clone(), tx2, Arc::new(Notify::new()));

        tokio::time::timeout(std::time::Duration::from_millis(50), notify1.notified())
            .await
            .expect("displaced connection's notify should fire immediately");
    }

    #[tokio::test]
    async fn a_displaced_connections_unregister_cannot_evict_the_new_one() {
        let hub = PushHub::new();
        let user = UserId("u1".into());
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let stale_generation = hub.register(user.clone(), tx1, Arc::new(Notify::new()));
        hub.register(user.clone(), tx2, Arc::new(Notify::new()));

        // The stale connection's own cleanup runs after it's been displaced.
        hub.unregister(&user, stale_generation);

        hub.send_to_user(&user, &ServerEvent::new("pong", serde_json::json!({})));
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_to_room_reaches_only_members() {
        let hub = PushHub::new();
        let member = UserId("member".into());
        let stranger = UserId("stranger".into());
        let (tx_member, mut rx_member) = mpsc::unbounded_channel();
        let (tx_stranger, mut rx_stranger) = mpsc::unbounded_channel();
        hub.register(member.clone(), tx_member, Arc::new(Notify::new()));
        hub.register(stranger, tx_stranger, Arc::new(Notify::new()));
        hub.rooms.join("providers", member);

        hub.send_to_room("providers", &ServerEvent::new("pong", serde_json::json!({})));

        assert!(rx_member.try_recv().is_ok());
        assert!(rx_stranger.try_recv().is_err());
    }
}
