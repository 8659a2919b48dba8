//! Runtime metrics are update-only by contract.
//! Counters describe propagation work actually performed, not work
//! requested; errors still increment the call counters.

use serde::{Deserialize, Serialize};
use std::{cell::RefCell, collections::BTreeMap};

///
/// EventState
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EventState {
    pub ops: EventOps,
    pub perf: EventPerf,
    pub groups: BTreeMap<String, GroupCounters>,
}

///
/// EventOps
///

/// Call counters are execution attempts; element counters reflect elements
/// touched after execution.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EventOps {
    // Query-calc entrypoints
    pub add_calls: u64,
    pub remove_calls: u64,
    pub refresh_runs: u64,

    // Propagation work
    pub matches_raised: u64,
    pub full_match_adds: u64,
    pub full_match_removes: u64,
    pub proj_adds: u64,
    pub proj_removes: u64,
    pub nodes_suspended: u64,
    pub match_points_added: u64,
    pub match_points_removed: u64,

    // Merge pipelines
    pub merge_add_calls: u64,
    pub merge_remove_calls: u64,
    pub nodes_mapped: u64,
    pub nodes_unmapped: u64,
    pub promotions: u64,
    pub identity_updates: u64,

    // Tracing surface
    pub path_activations: u64,
    pub path_deactivations: u64,
    pub monitors_registered: u64,
    pub monitors_released: u64,
}

///
/// GroupCounters
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GroupCounters {
    pub nodes_mapped: u64,
    pub nodes_unmapped: u64,
    pub promotions: u64,
}

///
/// EventPerf
///

/// Nanosecond deltas are pressure indicators (bookkeeping + propagation),
/// not end-to-end latency measurements.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EventPerf {
    pub add_nanos_total: u128,
    pub remove_nanos_total: u128,
    pub refresh_nanos_total: u128,
    pub merge_nanos_total: u128,

    pub add_nanos_max: u64,
    pub remove_nanos_max: u64,
    pub refresh_nanos_max: u64,
    pub merge_nanos_max: u64,
}

thread_local! {
    static EVENT_STATE: RefCell<EventState> = RefCell::new(EventState::default());
}

/// Borrow metrics immutably.
pub(crate) fn with_state<R>(f: impl FnOnce(&EventState) -> R) -> R {
    EVENT_STATE.with(|m| f(&m.borrow()))
}

/// Borrow metrics mutably.
pub(crate) fn with_state_mut<R>(f: impl FnOnce(&mut EventState) -> R) -> R {
    EVENT_STATE.with(|m| f(&mut m.borrow_mut()))
}

/// Reset all counters (useful in tests).
pub fn reset() {
    with_state_mut(|m| *m = EventState::default());
}

/// Accumulate a duration delta and track its maximum.
#[allow(clippy::missing_const_for_fn)]
pub fn add_nanos(total: &mut u128, max: &mut u64, delta: u64) {
    *total = total.saturating_add(u128::from(delta));
    if delta > *max {
        *max = delta;
    }
}

///
/// EventReport
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EventReport {
    pub counters: EventState,
}

/// Snapshot the current metrics state for endpoint/test plumbing.
#[must_use]
pub fn report() -> EventReport {
    EventReport {
        counters: with_state(Clone::clone),
    }
}
