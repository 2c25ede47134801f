//! A per-thread pool recycling [`Record`] allocations across load calls.
//!
//! Decoding materializes a short-lived record for every marshalled domain
//! value, hands it to the converter and throws it away. The pool keeps those
//! carcasses around per thread so their map capacity is reused. It is purely
//! an allocation optimization: every acquired record is empty, and releasing
//! never leaks contents.

use std::cell::RefCell;

use crate::record::Record;

/// Pool growth stops here; anything released beyond this is simply dropped.
const MAX_POOLED: usize = 64;

thread_local! {
    static POOL: RefCell<Vec<Record>> = const { RefCell::new(Vec::new()) };
}

/// Takes a cleared record from the current thread's pool, or allocates one.
pub(crate) fn acquire() -> Record {
    POOL.with(|pool| pool.borrow_mut().pop()).unwrap_or_default()
}

/// Clears `record` and retains it for the next [`acquire`] on this thread.
pub(crate) fn release(mut record: Record) {
    record.clear();
    POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        if pool.len() < MAX_POOLED {
            pool.push(record);
        }
    });
}
