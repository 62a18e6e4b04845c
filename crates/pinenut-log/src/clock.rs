//! Wall clock and thread identity.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// Current wall-clock time.
#[inline]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// A process-local identifier of the calling thread, stable for the thread's
/// lifetime and cheap to read after the first call.
pub fn thread_id() -> u64 {
    THREAD_ID.with(|id| {
        let current = id.get();
        if current != 0 {
            return current;
        }
        let assigned = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        id.set(assigned);
        assigned
    })
}
