//! Debounced refresh scheduling.
//!
//! Each view owns one [`RefreshTrigger`]. UI-side callers record what became
//! stale (everything, one page, one subtree) and the engine drains the
//! accumulated work after a settle window, so a burst of scrolling or
//! keystrokes collapses into a single remote query pass. With no requests at
//! all the trigger wakes the engine on the poll interval for a silent full
//! refresh.
//!
//! A full-refresh request supersedes whatever the engine is doing: it bumps
//! the generation counter and aborts the registered in-flight command, and
//! the engine discards partial results whose generation no longer matches.
//! Page and subtree requests only queue; they never cancel running work.

use std::collections::BTreeSet;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::client::CommandHandle;
use crate::types::NodeId;

/// Timing knobs for one trigger instance.
#[derive(Debug, Clone)]
pub struct TriggerTuning {
    /// Quiet period after the last request before the engine runs.
    pub settle: Duration,
    /// Idle interval between silent background refreshes.
    pub poll: Duration,
    /// Page granularity for rounding page-refresh offsets.
    pub page_size: u64,
}

struct Pending<F> {
    full_generation: u64,
    full: bool,
    offsets: BTreeSet<u64>,
    subtrees: BTreeSet<NodeId>,
    indicator: bool,
    filter: F,
    closed: bool,
}

/// One batch of drained work, handed to the engine per pass.
#[derive(Debug)]
pub struct Drained<F> {
    /// Generation the pass belongs to; checked against [`TriggerPort::is_superseded`].
    pub generation: u64,
    /// Re-query counts and every populated page (or the visible tree).
    pub full: bool,
    /// Page offsets to re-query, already rounded to page boundaries.
    pub offsets: BTreeSet<u64>,
    /// Collapsed-then-expanded nodes whose children need one query.
    pub subtrees: BTreeSet<NodeId>,
    /// Whether the pass should surface the busy indicator.
    pub indicator: bool,
    /// Filter snapshot the pass must query with.
    pub filter: F,
    /// The trigger was closed; the engine loop must exit.
    pub shutdown: bool,
}

/// Coalescing refresh trigger for one view.
pub struct RefreshTrigger<F> {
    tuning: TriggerTuning,
    state: Mutex<Pending<F>>,
    inflight: Mutex<Option<CommandHandle>>,
    notify: Notify,
}

impl<F: Clone + PartialEq + Send> RefreshTrigger<F> {
    pub fn new(tuning: TriggerTuning) -> RefreshTrigger<F>
    where
        F: Default,
    {
        RefreshTrigger {
            tuning,
            state: Mutex::new(Pending {
                full_generation: 0,
                full: false,
                offsets: BTreeSet::new(),
                subtrees: BTreeSet::new(),
                indicator: false,
                filter: F::default(),
                closed: false,
            }),
            inflight: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Request a full refresh under `filter`. Re-submitting the currently
    /// active filter is a no-op unless `force` is set.
    pub fn request_full_refresh(&self, filter: F, force: bool) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if !force && state.filter == filter {
            trace!("unchanged filter, refresh skipped");
            return;
        }
        state.filter = filter;
        self.supersede(&mut state);
        debug!(generation = state.full_generation, force, "full refresh queued");
        self.notify.notify_one();
    }

    fn supersede(&self, state: &mut Pending<F>) {
        state.full_generation += 1;
        state.full = true;
        state.indicator = true;
        if let Some(handle) = self.inflight.lock().take() {
            handle.abort();
        }
    }

    /// The filter the engine is currently expected to query with.
    pub fn current_filter(&self) -> F {
        self.state.lock().filter.clone()
    }

    /// Wait for the next batch of work. Returns after the settle window of
    /// the first request, or after the poll interval with a silent full
    /// refresh when nothing was requested.
    pub async fn wait_and_drain(&self) -> Drained<F> {
        loop {
            let woken = tokio::select! {
                _ = self.notify.notified() => true,
                _ = sleep(self.tuning.poll) => false,
            };
            if woken {
                if self.state.lock().closed {
                    return self.drain(false);
                }
                sleep(self.tuning.settle).await;
            }

            let drained = self.drain(woken);
            if drained.shutdown {
                return drained;
            }
            let empty =
                !drained.full && drained.offsets.is_empty() && drained.subtrees.is_empty();
            if empty {
                // A stored notify permit can outlive the request it announced
                // when the previous drain already consumed the work.
                continue;
            }
            trace!(
                generation = drained.generation,
                full = drained.full,
                pages = drained.offsets.len(),
                subtrees = drained.subtrees.len(),
                "drained refresh batch"
            );
            return drained;
        }
    }

    fn drain(&self, woken: bool) -> Drained<F> {
        let mut state = self.state.lock();
        let full = state.full || !woken;
        let indicator = if woken { state.indicator } else { false };
        state.full = false;
        state.indicator = false;
        Drained {
            generation: state.full_generation,
            full,
            offsets: std::mem::take(&mut state.offsets),
            subtrees: std::mem::take(&mut state.subtrees),
            indicator,
            filter: state.filter.clone(),
            shutdown: state.closed,
        }
    }
}

/// Object-safe face of [`RefreshTrigger`] for callers that do not know the
/// filter type, such as the display model and bulk operations.
pub trait TriggerPort: Send + Sync {
    /// Queue a re-query of the page containing `offset`.
    fn request_page_refresh(&self, offset: u64);
    /// Queue a children query for a newly expanded node.
    fn request_subtree(&self, id: NodeId);
    /// Full refresh with the current filter, superseding in-flight work.
    fn request_immediate_refresh(&self);
    /// Whether work captured at `generation` has been invalidated.
    fn is_superseded(&self, generation: u64) -> bool;
    /// Make `handle` the abort target for supersession.
    fn register_inflight(&self, handle: CommandHandle);
    fn clear_inflight(&self);
    /// Shut the trigger down; the next drain reports shutdown.
    fn close(&self);
}

impl<F: Clone + PartialEq + Send> TriggerPort for RefreshTrigger<F> {
    fn request_page_refresh(&self, offset: u64) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let page = offset - offset % self.tuning.page_size;
        state.offsets.insert(page);
        trace!(offset, page, "page refresh queued");
        self.notify.notify_one();
    }

    fn request_subtree(&self, id: NodeId) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.subtrees.insert(id);
        trace!(%id, "subtree refresh queued");
        self.notify.notify_one();
    }

    fn request_immediate_refresh(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        self.supersede(&mut state);
        debug!(generation = state.full_generation, "immediate refresh queued");
        self.notify.notify_one();
    }

    fn is_superseded(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.closed || state.full_generation != generation
    }

    fn register_inflight(&self, handle: CommandHandle) {
        if let Some(previous) = self.inflight.lock().replace(handle) {
            previous.abort();
        }
    }

    fn clear_inflight(&self) {
        *self.inflight.lock() = None;
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.full_generation += 1;
        if let Some(handle) = self.inflight.lock().take() {
            handle.abort();
        }
        debug!("trigger closed");
        self.notify.notify_one();
    }
}
