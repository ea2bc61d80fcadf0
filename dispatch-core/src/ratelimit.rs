//! Push Bus rate limiting (§4.6): per-connection inbound message rate and
//! per-IP concurrent connection cap. The message limiter is built on
//! `governor`, the keyed/direct limiter crate this corpus reaches for
//! elsewhere for exactly this job.

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Mutex;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};

/// Caps inbound messages on a single connection to `MAX_MSG_PER_MIN`.
/// Twice that rate (checked by the caller) closes the connection outright
/// rather than just rejecting the frame.
pub struct MsgRateLimiter {
    inner: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl MsgRateLimiter {
    pub fn new(max_per_min: u32) -> Self {
        let per_min = NonZeroU32::new(max_per_min.max(1)).unwrap();
        Self {
            inner: GovernorLimiter::direct(Quota::per_minute(per_min)),
        }
    }

    pub fn check(&self) -> bool {
        self.inner.check().is_ok()
    }
}

/// Caps concurrent connections from a single peer address to
/// `MAX_CONN_PER_IP`. Excess connections are rejected at accept.
#[derive(Default)]
pub struct ConnPerIpLimiter {
    counts: Mutex<HashMap<IpAddr, u32>>,
    max: u32,
}

impl ConnPerIpLimiter {
    pub fn new(max: u32) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            max,
        }
    }

    /// Returns whether the connection is admitted; if so, the caller must
    /// call [`Self::release`] exactly once on disconnect.
    pub fn try_acquire(&self, addr: IpAddr) -> bool {
        let mut counts = self.counts.lock().unwrap();
        let entry = counts.entry(addr).or_insert(0);
        if *entry >= self.max {
            false
        } else {
            *entry += 1;
            true
        }
    }

    pub fn release(&self, addr: IpAddr) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(entry) = counts.get_mut(&addr) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                counts.remove(&addr);
            }
        }
    }
}
