//! Background synchronization engines.
//!
//! One engine task per view. Each loops on its trigger: drain a batch of
//! refresh work, snapshot the sort settings, run the remote queries, and
//! push [`ViewEvent`]s to the display model. The loop itself never dies;
//! transport errors keep the last good view, protocol violations are logged
//! and the pass abandoned, and superseded passes end quietly partway
//! through with their partial results discarded.
//!
//! Engines remember which page offsets they have served for the active
//! filter, so a full refresh re-queries exactly the populated pages plus
//! page zero and skips offsets the shrunken count no longer covers.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::client::QueryClient;
use crate::config::PortholeConfig;
use crate::error::{ProtocolError, SyncError};
use crate::filter::{EntryFilter, StorageFilter};
use crate::model::{ViewEvent, ViewState, ViewStateHandle};
use crate::node::{EntityRow, EntryRow, IndexRow, StorageRow, UuidRow};
use crate::protocol::{commands, Command, Row};
use crate::trigger::{Drained, RefreshTrigger, TriggerPort};
use crate::types::{NodeId, NodeKind, ViewKind};

/// Query-shaping knobs shared by both engines.
#[derive(Debug, Clone)]
pub struct EngineTuning {
    pub page_size: u64,
    pub display_cap: u64,
    pub min_pattern_len: usize,
}

impl EngineTuning {
    pub fn from_config(config: &PortholeConfig) -> EngineTuning {
        EngineTuning {
            page_size: config.page_size,
            display_cap: config.display_cap,
            min_pattern_len: config.min_pattern_len,
        }
    }
}

/// Running engine: the event stream plus the trigger that controls it.
pub struct EngineHandle {
    events: mpsc::UnboundedReceiver<ViewEvent>,
    sender: mpsc::UnboundedSender<ViewEvent>,
    trigger: Arc<dyn TriggerPort>,
    join: JoinHandle<()>,
}

impl EngineHandle {
    pub async fn next_event(&mut self) -> Option<ViewEvent> {
        self.events.recv().await
    }

    pub fn try_event(&mut self) -> Option<ViewEvent> {
        self.events.try_recv().ok()
    }

    /// Sender for out-of-band events, used by bulk operations to inject
    /// optimistic state hints into the same stream.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<ViewEvent> {
        self.sender.clone()
    }

    pub fn trigger(&self) -> Arc<dyn TriggerPort> {
        Arc::clone(&self.trigger)
    }

    /// Close the trigger and wait for the engine task to finish.
    pub async fn shutdown(self) {
        self.trigger.close();
        let _ = self.join.await;
    }
}

/// Spawn the storages-view engine.
pub fn spawn_storages(
    client: Arc<dyn QueryClient>,
    trigger: Arc<RefreshTrigger<StorageFilter>>,
    view: ViewStateHandle,
    tuning: EngineTuning,
) -> EngineHandle {
    let (sender, events) = mpsc::unbounded_channel();
    let engine = StoragesEngine {
        client,
        trigger: Arc::clone(&trigger),
        view,
        tuning,
        events: sender.clone(),
        last_total: 0,
        served_offsets: BTreeSet::new(),
        served_filter: None,
    };
    let join = tokio::spawn(engine.run());
    EngineHandle {
        events,
        sender,
        trigger,
        join,
    }
}

/// Spawn the entries-view engine.
pub fn spawn_entries(
    client: Arc<dyn QueryClient>,
    trigger: Arc<RefreshTrigger<EntryFilter>>,
    view: ViewStateHandle,
    tuning: EngineTuning,
) -> EngineHandle {
    let (sender, events) = mpsc::unbounded_channel();
    let engine = EntriesEngine {
        client,
        trigger: Arc::clone(&trigger),
        view,
        tuning,
        events: sender.clone(),
        last_total: 0,
        served_offsets: BTreeSet::new(),
        served_filter: None,
    };
    let join = tokio::spawn(engine.run());
    EngineHandle {
        events,
        sender,
        trigger,
        join,
    }
}

struct StoragesEngine {
    client: Arc<dyn QueryClient>,
    trigger: Arc<RefreshTrigger<StorageFilter>>,
    view: ViewStateHandle,
    tuning: EngineTuning,
    events: mpsc::UnboundedSender<ViewEvent>,
    last_total: u64,
    served_offsets: BTreeSet<u64>,
    served_filter: Option<StorageFilter>,
}

impl StoragesEngine {
    async fn run(mut self) {
        info!(view = ViewKind::Storages.as_str(), "sync engine started");
        loop {
            let drained = self.trigger.wait_and_drain().await;
            if drained.shutdown {
                break;
            }
            if self.events.is_closed() {
                break;
            }
            let guard = drained
                .indicator
                .then(|| BusyGuard::engage(self.events.clone()));
            let result = self.pass(drained).await;
            drop(guard);
            log_pass_outcome(self.client.as_ref(), result).await;
        }
        info!(view = ViewKind::Storages.as_str(), "sync engine stopped");
    }

    async fn pass(&mut self, drained: Drained<StorageFilter>) -> Result<(), SyncError> {
        let snapshot = self.view.snapshot();
        self.refresh_served_filter(&drained.filter);

        if drained.full {
            let command = commands::storage_count(&drained.filter, self.tuning.min_pattern_len);
            let (total, total_size) = degraded_count(
                fetch_count(
                    self.client.as_ref(),
                    self.trigger.as_ref(),
                    drained.generation,
                    command,
                )
                .await,
            )?;
            self.last_total = total.min(self.tuning.display_cap);
            send(&self.events, ViewEvent::Count { total, total_size })?;
        }

        if snapshot.tree_mode {
            self.tree_pass(&drained, &snapshot).await
        } else {
            self.page_pass(&drained, &snapshot).await
        }
    }

    fn refresh_served_filter(&mut self, filter: &StorageFilter) {
        if self.served_filter.as_ref() != Some(filter) {
            self.served_offsets.clear();
            self.served_filter = Some(filter.clone());
        }
    }

    async fn page_pass(
        &mut self,
        drained: &Drained<StorageFilter>,
        snapshot: &ViewState,
    ) -> Result<(), SyncError> {
        let mut offsets = drained.offsets.clone();
        if drained.full {
            offsets.insert(0);
            offsets.extend(self.served_offsets.iter().copied());
        }
        self.served_offsets.retain(|&offset| offset < self.last_total);

        for offset in offsets {
            if offset >= self.last_total {
                trace!(offset, total = self.last_total, "stale page offset skipped");
                continue;
            }
            if self.trigger.is_superseded(drained.generation) {
                return Err(SyncError::Aborted);
            }
            let command = commands::storage_page(
                &drained.filter,
                self.tuning.min_pattern_len,
                snapshot.sort_key,
                snapshot.sort_order,
                offset,
                self.tuning.page_size,
            );
            let rows = query_rows(
                self.client.as_ref(),
                self.trigger.as_ref(),
                drained.generation,
                command,
                Some(self.tuning.page_size),
                |row| StorageRow::from_row(row).map(IndexRow::Storage),
            )
            .await?;
            self.served_offsets.insert(offset);
            send(&self.events, ViewEvent::Page { offset, rows })?;
        }
        Ok(())
    }

    async fn tree_pass(
        &mut self,
        drained: &Drained<StorageFilter>,
        snapshot: &ViewState,
    ) -> Result<(), SyncError> {
        if drained.full {
            let command = commands::uuid_list(
                &drained.filter,
                self.tuning.min_pattern_len,
                snapshot.sort_key,
                snapshot.sort_order,
            );
            let rows = query_rows(
                self.client.as_ref(),
                self.trigger.as_ref(),
                drained.generation,
                command,
                None,
                |row| UuidRow::from_row(row).map(IndexRow::Uuid),
            )
            .await?;
            send(&self.events, ViewEvent::Children { parent: None, rows })?;

            // Visible descent, parents before their expanded children.
            let mut expanded: Vec<NodeId> = snapshot.expanded.iter().copied().collect();
            expanded.sort_by_key(|id| (descent_rank(*id), id.raw()));
            for id in expanded {
                self.child_query(id, drained, snapshot).await?;
            }
        } else {
            for id in &drained.subtrees {
                if !snapshot.expanded.contains(id) {
                    trace!(id = %id, "subtree collapsed again before its query ran");
                    continue;
                }
                self.child_query(*id, drained, snapshot).await?;
            }
        }
        Ok(())
    }

    async fn child_query(
        &self,
        parent: NodeId,
        drained: &Drained<StorageFilter>,
        snapshot: &ViewState,
    ) -> Result<(), SyncError> {
        if self.trigger.is_superseded(drained.generation) {
            return Err(SyncError::Aborted);
        }
        let min = self.tuning.min_pattern_len;
        let rows = match parent.kind() {
            // The synthetic "no job" row has no kind tag but lists entities
            // like any job.
            Some(NodeKind::Uuid) | None => {
                let command = commands::entity_list(
                    parent,
                    &drained.filter,
                    min,
                    snapshot.sort_key,
                    snapshot.sort_order,
                );
                query_rows(
                    self.client.as_ref(),
                    self.trigger.as_ref(),
                    drained.generation,
                    command,
                    None,
                    |row| EntityRow::from_row(row).map(IndexRow::Entity),
                )
                .await?
            }
            Some(NodeKind::Entity) => {
                let command = commands::storage_children(
                    parent,
                    &drained.filter,
                    min,
                    snapshot.sort_key,
                    snapshot.sort_order,
                );
                query_rows(
                    self.client.as_ref(),
                    self.trigger.as_ref(),
                    drained.generation,
                    command,
                    None,
                    |row| StorageRow::from_row(row).map(IndexRow::Storage),
                )
                .await?
            }
            _ => return Ok(()),
        };
        send(
            &self.events,
            ViewEvent::Children {
                parent: Some(parent),
                rows,
            },
        )
    }
}

struct EntriesEngine {
    client: Arc<dyn QueryClient>,
    trigger: Arc<RefreshTrigger<EntryFilter>>,
    view: ViewStateHandle,
    tuning: EngineTuning,
    events: mpsc::UnboundedSender<ViewEvent>,
    last_total: u64,
    served_offsets: BTreeSet<u64>,
    served_filter: Option<EntryFilter>,
}

impl EntriesEngine {
    async fn run(mut self) {
        info!(view = ViewKind::Entries.as_str(), "sync engine started");
        loop {
            let drained = self.trigger.wait_and_drain().await;
            if drained.shutdown {
                break;
            }
            if self.events.is_closed() {
                break;
            }
            let guard = drained
                .indicator
                .then(|| BusyGuard::engage(self.events.clone()));
            let result = self.pass(drained).await;
            drop(guard);
            log_pass_outcome(self.client.as_ref(), result).await;
        }
        info!(view = ViewKind::Entries.as_str(), "sync engine stopped");
    }

    async fn pass(&mut self, drained: Drained<EntryFilter>) -> Result<(), SyncError> {
        let snapshot = self.view.snapshot();
        if self.served_filter.as_ref() != Some(&drained.filter) {
            self.served_offsets.clear();
            self.served_filter = Some(drained.filter.clone());
        }

        if drained.full {
            let command = commands::entry_count(&drained.filter, self.tuning.min_pattern_len);
            let (total, total_size) = degraded_count(
                fetch_count(
                    self.client.as_ref(),
                    self.trigger.as_ref(),
                    drained.generation,
                    command,
                )
                .await,
            )?;
            self.last_total = total.min(self.tuning.display_cap);
            send(&self.events, ViewEvent::Count { total, total_size })?;
        }

        let mut offsets = drained.offsets.clone();
        if drained.full {
            offsets.insert(0);
            offsets.extend(self.served_offsets.iter().copied());
        }
        self.served_offsets.retain(|&offset| offset < self.last_total);

        for offset in offsets {
            if offset >= self.last_total {
                trace!(offset, total = self.last_total, "stale page offset skipped");
                continue;
            }
            if self.trigger.is_superseded(drained.generation) {
                return Err(SyncError::Aborted);
            }
            let command = commands::entry_page(
                &drained.filter,
                self.tuning.min_pattern_len,
                snapshot.sort_key,
                snapshot.sort_order,
                offset,
                self.tuning.page_size,
            );
            let rows = query_rows(
                self.client.as_ref(),
                self.trigger.as_ref(),
                drained.generation,
                command,
                Some(self.tuning.page_size),
                |row| EntryRow::from_row(row).map(IndexRow::Entry),
            )
            .await?;
            self.served_offsets.insert(offset);
            send(&self.events, ViewEvent::Page { offset, rows })?;
        }
        Ok(())
    }
}

/// Emits `Busy(true)` on engage and `Busy(false)` on drop, so the indicator
/// clears on every pass exit path.
struct BusyGuard {
    events: mpsc::UnboundedSender<ViewEvent>,
}

impl BusyGuard {
    fn engage(events: mpsc::UnboundedSender<ViewEvent>) -> BusyGuard {
        let _ = events.send(ViewEvent::Busy(true));
        BusyGuard { events }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let _ = self.events.send(ViewEvent::Busy(false));
    }
}

fn send(events: &mpsc::UnboundedSender<ViewEvent>, event: ViewEvent) -> Result<(), SyncError> {
    events.send(event).map_err(|_| SyncError::Aborted)
}

fn descent_rank(id: NodeId) -> u8 {
    match id.kind() {
        None | Some(NodeKind::Uuid) => 0,
        Some(NodeKind::Entity) => 1,
        _ => 2,
    }
}

async fn log_pass_outcome(client: &dyn QueryClient, result: Result<(), SyncError>) {
    match result {
        Ok(()) => {}
        Err(SyncError::Aborted) => trace!("pass superseded"),
        Err(SyncError::Transport(e)) => {
            debug!(error = %e, "transport failure, keeping last good view");
        }
        Err(e) => {
            error!(error = %e, "protocol violation, pass abandoned");
            if cfg!(debug_assertions) {
                client.reset().await;
            }
        }
    }
}

/// Count failures other than supersession degrade to an empty view instead
/// of killing the pass.
fn degraded_count(result: Result<(u64, u64), SyncError>) -> Result<(u64, u64), SyncError> {
    match result {
        Ok(counts) => Ok(counts),
        Err(SyncError::Aborted) => Err(SyncError::Aborted),
        Err(e) => {
            warn!(error = %e, "count query failed, reporting zero");
            Ok((0, 0))
        }
    }
}

async fn fetch_count(
    client: &dyn QueryClient,
    trigger: &dyn TriggerPort,
    generation: u64,
    command: Command,
) -> Result<(u64, u64), SyncError> {
    let rows = query_rows(client, trigger, generation, command, None, |row| {
        Ok((row.get_u64("count")?, row.get_u64("size")?))
    })
    .await?;
    rows.into_iter()
        .next()
        .ok_or(SyncError::Protocol(ProtocolError::EmptyResult))
}

/// Stream one command's rows, bounded and supersession-checked. Registers
/// the stream as the abortable in-flight command for its duration. Any
/// failure aborts the stream so the backend stops producing.
async fn query_rows<T>(
    client: &dyn QueryClient,
    trigger: &dyn TriggerPort,
    generation: u64,
    command: Command,
    limit: Option<u64>,
    parse: impl Fn(&Row) -> Result<T, ProtocolError>,
) -> Result<Vec<T>, SyncError> {
    let mut stream = client.submit(command);
    trigger.register_inflight(stream.handle.clone());

    let result = async {
        let mut out = Vec::new();
        while let Some(item) = stream.next_row().await {
            let row = item?;
            if trigger.is_superseded(generation) {
                return Err(SyncError::Aborted);
            }
            if let Some(limit) = limit {
                if out.len() as u64 >= limit {
                    return Err(ProtocolError::RowOverrun { limit }.into());
                }
            }
            out.push(parse(&row)?);
        }
        if stream.handle.is_aborted() {
            return Err(SyncError::Aborted);
        }
        Ok(out)
    }
    .await;

    trigger.clear_inflight();
    if result.is_err() {
        stream.handle.abort();
    }
    result
}
