//! Metrics sink boundary.
//!
//! Core engine logic MUST NOT depend on obs::metrics directly.
//! All instrumentation flows through MetricsEvent and MetricsSink.
//!
//! This module is the only allowed bridge between propagation logic
//! and the global metrics state.

use crate::obs::metrics;
use std::{cell::RefCell, time::Instant};

thread_local! {
    static SINK_OVERRIDE: RefCell<Option<*const dyn MetricsSink>> = const { RefCell::new(None) };
}

///
/// ExecKind
///

#[derive(Clone, Copy, Debug)]
pub enum ExecKind {
    MatchAdd,
    MatchRemove,
    Refresh,
    MergeAdd,
    MergeRemove,
}

///
/// MetricsEvent
///

#[derive(Clone, Debug)]
pub enum MetricsEvent {
    ExecStart {
        kind: ExecKind,
    },
    ExecFinish {
        kind: ExecKind,
        elements_touched: u64,
        nanos_delta: u64,
    },
    MatchesRaised {
        count: u64,
    },
    FullMatches {
        added: u64,
        removed: u64,
    },
    ProjMatches {
        added: u64,
        removed: u64,
    },
    NodeSuspended,
    MatchPointChange {
        added: bool,
    },
    NodesMapped {
        group: String,
        count: u64,
    },
    NodesUnmapped {
        group: String,
        count: u64,
    },
    Promotions {
        group: String,
        count: u64,
    },
    IdentityUpdate,
    PathTracing {
        activated: bool,
    },
    MonitorChange {
        registered: bool,
    },
}

///
/// MetricsSink
///

pub trait MetricsSink {
    fn record(&self, event: MetricsEvent);
}

///
/// NoopMetricsSink
///

pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record(&self, _: MetricsEvent) {}
}

///
/// GlobalMetricsSink
///

pub struct GlobalMetricsSink;

impl MetricsSink for GlobalMetricsSink {
    fn record(&self, event: MetricsEvent) {
        match event {
            MetricsEvent::ExecStart { kind } => {
                metrics::with_state_mut(|m| match kind {
                    ExecKind::MatchAdd => m.ops.add_calls = m.ops.add_calls.saturating_add(1),
                    ExecKind::MatchRemove => {
                        m.ops.remove_calls = m.ops.remove_calls.saturating_add(1);
                    }
                    ExecKind::Refresh => m.ops.refresh_runs = m.ops.refresh_runs.saturating_add(1),
                    ExecKind::MergeAdd => {
                        m.ops.merge_add_calls = m.ops.merge_add_calls.saturating_add(1);
                    }
                    ExecKind::MergeRemove => {
                        m.ops.merge_remove_calls = m.ops.merge_remove_calls.saturating_add(1);
                    }
                });
            }

            MetricsEvent::ExecFinish {
                kind, nanos_delta, ..
            } => {
                metrics::with_state_mut(|m| match kind {
                    ExecKind::MatchAdd => metrics::add_nanos(
                        &mut m.perf.add_nanos_total,
                        &mut m.perf.add_nanos_max,
                        nanos_delta,
                    ),
                    ExecKind::MatchRemove => metrics::add_nanos(
                        &mut m.perf.remove_nanos_total,
                        &mut m.perf.remove_nanos_max,
                        nanos_delta,
                    ),
                    ExecKind::Refresh => metrics::add_nanos(
                        &mut m.perf.refresh_nanos_total,
                        &mut m.perf.refresh_nanos_max,
                        nanos_delta,
                    ),
                    ExecKind::MergeAdd | ExecKind::MergeRemove => metrics::add_nanos(
                        &mut m.perf.merge_nanos_total,
                        &mut m.perf.merge_nanos_max,
                        nanos_delta,
                    ),
                });
            }

            MetricsEvent::MatchesRaised { count } => {
                metrics::with_state_mut(|m| {
                    m.ops.matches_raised = m.ops.matches_raised.saturating_add(count);
                });
            }

            MetricsEvent::FullMatches { added, removed } => {
                metrics::with_state_mut(|m| {
                    m.ops.full_match_adds = m.ops.full_match_adds.saturating_add(added);
                    m.ops.full_match_removes = m.ops.full_match_removes.saturating_add(removed);
                });
            }

            MetricsEvent::ProjMatches { added, removed } => {
                metrics::with_state_mut(|m| {
                    m.ops.proj_adds = m.ops.proj_adds.saturating_add(added);
                    m.ops.proj_removes = m.ops.proj_removes.saturating_add(removed);
                });
            }

            MetricsEvent::NodeSuspended => {
                metrics::with_state_mut(|m| {
                    m.ops.nodes_suspended = m.ops.nodes_suspended.saturating_add(1);
                });
            }

            MetricsEvent::MatchPointChange { added } => {
                metrics::with_state_mut(|m| {
                    if added {
                        m.ops.match_points_added = m.ops.match_points_added.saturating_add(1);
                    } else {
                        m.ops.match_points_removed = m.ops.match_points_removed.saturating_add(1);
                    }
                });
            }

            MetricsEvent::NodesMapped { group, count } => {
                metrics::with_state_mut(|m| {
                    m.ops.nodes_mapped = m.ops.nodes_mapped.saturating_add(count);
                    let entry = m.groups.entry(group).or_default();
                    entry.nodes_mapped = entry.nodes_mapped.saturating_add(count);
                });
            }

            MetricsEvent::NodesUnmapped { group, count } => {
                metrics::with_state_mut(|m| {
                    m.ops.nodes_unmapped = m.ops.nodes_unmapped.saturating_add(count);
                    let entry = m.groups.entry(group).or_default();
                    entry.nodes_unmapped = entry.nodes_unmapped.saturating_add(count);
                });
            }

            MetricsEvent::Promotions { group, count } => {
                metrics::with_state_mut(|m| {
                    m.ops.promotions = m.ops.promotions.saturating_add(count);
                    let entry = m.groups.entry(group).or_default();
                    entry.promotions = entry.promotions.saturating_add(count);
                });
            }

            MetricsEvent::IdentityUpdate => {
                metrics::with_state_mut(|m| {
                    m.ops.identity_updates = m.ops.identity_updates.saturating_add(1);
                });
            }

            MetricsEvent::PathTracing { activated } => {
                metrics::with_state_mut(|m| {
                    if activated {
                        m.ops.path_activations = m.ops.path_activations.saturating_add(1);
                    } else {
                        m.ops.path_deactivations = m.ops.path_deactivations.saturating_add(1);
                    }
                });
            }

            MetricsEvent::MonitorChange { registered } => {
                metrics::with_state_mut(|m| {
                    if registered {
                        m.ops.monitors_registered = m.ops.monitors_registered.saturating_add(1);
                    } else {
                        m.ops.monitors_released = m.ops.monitors_released.saturating_add(1);
                    }
                });
            }
        }
    }
}

pub const GLOBAL_METRICS_SINK: GlobalMetricsSink = GlobalMetricsSink;

pub fn record(event: MetricsEvent) {
    let override_ptr = SINK_OVERRIDE.with(|cell| *cell.borrow());
    if let Some(ptr) = override_ptr {
        // SAFETY: override is scoped by with_metrics_sink and only used synchronously.
        unsafe { (*ptr).record(event) };
    } else {
        GLOBAL_METRICS_SINK.record(event);
    }
}

/// Snapshot the current metrics state for endpoint/test plumbing.
#[must_use]
pub fn metrics_report() -> metrics::EventReport {
    metrics::report()
}

/// Reset ephemeral metrics counters.
pub fn metrics_reset() {
    metrics::reset();
}

/// Run a closure with a temporary metrics sink override.
pub fn with_metrics_sink<T>(sink: &dyn MetricsSink, f: impl FnOnce() -> T) -> T {
    struct Guard(Option<*const dyn MetricsSink>);

    impl Drop for Guard {
        fn drop(&mut self) {
            SINK_OVERRIDE.with(|cell| {
                *cell.borrow_mut() = self.0;
            });
        }
    }

    // SAFETY: we erase the reference lifetime for scoped storage in TLS and
    // restore the previous value on scope exit via Guard.
    let sink_ptr = unsafe { std::mem::transmute::<&dyn MetricsSink, *const dyn MetricsSink>(sink) };
    let prev = SINK_OVERRIDE.with(|cell| {
        let mut slot = cell.borrow_mut();
        slot.replace(sink_ptr)
    });
    let _guard = Guard(prev);

    f()
}

///
/// Span
/// RAII guard to simplify metrics instrumentation
///

pub(crate) struct Span {
    kind: ExecKind,
    start: Instant,
    elements: u64,
    finished: bool,
}

impl Span {
    #[must_use]
    /// Start a metrics span for one engine entrypoint.
    pub(crate) fn new(kind: ExecKind) -> Self {
        record(MetricsEvent::ExecStart { kind });

        Self {
            kind,
            start: Instant::now(),
            elements: 0,
            finished: false,
        }
    }

    pub(crate) const fn set_elements(&mut self, elements: u64) {
        self.elements = elements;
    }

    fn finish_inner(&self) {
        let delta = u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX);

        record(MetricsEvent::ExecFinish {
            kind: self.kind,
            elements_touched: self.elements,
            nanos_delta: delta,
        });
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if !self.finished {
            self.finish_inner();
            self.finished = true;
        }
    }
}
