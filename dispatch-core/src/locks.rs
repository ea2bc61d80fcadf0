//! Per-booking serialization (§5): every state-changing operation on a
//! given booking id -- dispatcher actions, acceptance, decline,
//! cancellation -- is funneled through the same async lock so the booking
//! row has one logical writer at a time, independent of whatever isolation
//! the store itself provides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use crate::types::BookingId;

#[derive(Default)]
pub struct BookingLocks {
    table: Mutex<HashMap<BookingId, Arc<AsyncMutex<()>>>>,
}

impl BookingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_booking(&self, id: BookingId) -> Arc<AsyncMutex<()>> {
        self.table
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}
