//! Display-side state for one synchronized view.
//!
//! The engine pushes [`ViewEvent`]s over a channel; [`DisplayModel`] applies
//! them to its page table or tree arena and notifies the embedding UI
//! through the [`ViewSink`] seam. User interactions flow the other way:
//! scrolling, expanding and sort changes become trigger requests, and the
//! engine answers with fresh events. The model never talks to the remote
//! service directly.

pub mod pages;
pub mod tree;

use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::checkset::CheckSet;
use crate::node::IndexRow;
use crate::trigger::TriggerPort;
use crate::types::{IndexState, NodeId, SortKey, SortOrder, ViewKind};

use pages::PageTable;
use tree::{TreeArena, VisibleRow};

/// Sort and mode settings shared between the model and its engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewState {
    pub sort_key: SortKey,
    pub sort_order: SortOrder,
    pub tree_mode: bool,
    pub expanded: BTreeSet<NodeId>,
}

impl ViewState {
    /// Initial state per view: storages open hierarchical, entries are a
    /// flat table only.
    pub fn for_view(view: ViewKind) -> ViewState {
        ViewState {
            sort_key: SortKey::Name,
            sort_order: SortOrder::Ascending,
            tree_mode: view == ViewKind::Storages,
            expanded: BTreeSet::new(),
        }
    }
}

/// Shared handle; the model writes, the engine snapshots per pass.
#[derive(Clone)]
pub struct ViewStateHandle(Arc<RwLock<ViewState>>);

impl ViewStateHandle {
    pub fn new(state: ViewState) -> ViewStateHandle {
        ViewStateHandle(Arc::new(RwLock::new(state)))
    }

    pub fn snapshot(&self) -> ViewState {
        self.0.read().clone()
    }

    pub fn set_sort(&self, key: SortKey, order: SortOrder) {
        let mut state = self.0.write();
        state.sort_key = key;
        state.sort_order = order;
    }

    pub fn set_tree_mode(&self, on: bool) {
        self.0.write().tree_mode = on;
    }

    fn mark_expanded(&self, id: NodeId, expanded: bool) {
        let mut state = self.0.write();
        if expanded {
            state.expanded.insert(id);
        } else {
            state.expanded.remove(&id);
        }
    }
}

/// One engine-to-model message.
#[derive(Debug)]
pub enum ViewEvent {
    /// Surface or clear the busy indicator.
    Busy(bool),
    /// Fresh aggregate count and byte size for the active filter.
    Count { total: u64, total_size: u64 },
    /// One page of flat rows.
    Page { offset: u64, rows: Vec<IndexRow> },
    /// Fresh child list for a tree level. `None` means the root level.
    Children {
        parent: Option<NodeId>,
        rows: Vec<IndexRow>,
    },
    /// Optimistic state change for rows awaiting remote confirmation.
    StateHint { ids: Vec<NodeId>, state: IndexState },
}

/// Change notifications to the embedding UI. Implementations redraw lazily;
/// all methods default to no-ops so a sink overrides only what it renders.
pub trait ViewSink: Send {
    fn count_changed(&mut self, _total: u64, _total_size: u64) {}
    fn rows_changed(&mut self, _range: Range<u64>) {}
    fn busy_changed(&mut self, _busy: bool) {}
    fn truncated(&mut self, _total: u64, _cap: u64) {}
}

/// Sink for embeddings that poll the model instead of reacting.
pub struct NullSink;

impl ViewSink for NullSink {}

/// A checkbox change with the lineage rows it displaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageChange {
    pub target: NodeId,
    pub checked: bool,
    pub displaced: Vec<NodeId>,
}

pub struct DisplayModel {
    view: ViewKind,
    state: ViewStateHandle,
    pages: PageTable,
    tree: TreeArena,
    trigger: Arc<dyn TriggerPort>,
    checked: Arc<CheckSet>,
    sink: Box<dyn ViewSink>,
    total_size: u64,
}

impl DisplayModel {
    pub fn new(
        view: ViewKind,
        page_size: u64,
        display_cap: u64,
        state: ViewStateHandle,
        trigger: Arc<dyn TriggerPort>,
        checked: Arc<CheckSet>,
        sink: Box<dyn ViewSink>,
    ) -> DisplayModel {
        DisplayModel {
            view,
            state,
            pages: PageTable::new(page_size, display_cap),
            tree: TreeArena::new(),
            trigger,
            checked,
            sink,
            total_size: 0,
        }
    }

    pub fn view(&self) -> ViewKind {
        self.view
    }

    /// Apply one engine event.
    pub fn apply(&mut self, event: ViewEvent) {
        match event {
            ViewEvent::Busy(busy) => self.sink.busy_changed(busy),
            ViewEvent::Count { total, total_size } => {
                self.total_size = total_size;
                let truncated = self.pages.set_total(total);
                if truncated {
                    self.sink.truncated(total, self.pages.display_len());
                }
                self.sink.count_changed(total, total_size);
            }
            ViewEvent::Page { offset, rows } => {
                let range = self.pages.overwrite(offset, rows);
                if !range.is_empty() {
                    self.sink.rows_changed(range);
                }
            }
            ViewEvent::Children { parent, rows } => {
                if let Some(p) = parent {
                    if !self.tree.contains(p) {
                        debug!(parent = %p, "children for a collapsed or removed parent dropped");
                        return;
                    }
                }
                let snapshot = self.state.snapshot();
                let delta = self.tree.reconcile_children(
                    parent,
                    rows,
                    snapshot.sort_key,
                    snapshot.sort_order,
                );
                if !delta.removed.is_empty() {
                    self.checked.discard_local(&delta.removed);
                }
                self.sink.rows_changed(0..self.tree.len() as u64);
            }
            ViewEvent::StateHint { ids, state } => {
                self.pages.set_state(&ids, state);
                self.tree.set_state(&ids, state);
                self.sink.rows_changed(0..self.pages.display_len());
            }
        }
    }

    /// Remote row count, uncapped.
    pub fn total(&self) -> u64 {
        self.pages.total()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn display_len(&self) -> u64 {
        self.pages.display_len()
    }

    /// Flat rows in `range` that are already materialized. Missing pages in
    /// the range are queued for fetch and arrive as later `Page` events.
    pub fn rows_in(&self, range: Range<u64>) -> Vec<&IndexRow> {
        let page = self.pages.page_size();
        let end = range.end.min(self.pages.display_len());
        let mut offset = range.start - range.start % page;
        while offset < end {
            if self.pages.page_missing(offset) {
                self.trigger.request_page_refresh(offset);
            }
            offset += page;
        }
        self.pages.rows_in(range)
    }

    pub fn row_at(&self, index: u64) -> Option<&IndexRow> {
        self.pages.row(index)
    }

    /// Visible tree rows in display order.
    pub fn tree_rows(&self) -> Vec<VisibleRow<'_>> {
        self.tree.visible()
    }

    pub fn tree_row(&self, id: NodeId) -> Option<&IndexRow> {
        self.tree.row(id)
    }

    /// Expand a node and queue the children query. Returns false for ids
    /// the tree does not currently show.
    pub fn expand(&mut self, id: NodeId) -> bool {
        if !self.tree.expand(id) {
            return false;
        }
        self.state.mark_expanded(id, true);
        self.trigger.request_subtree(id);
        true
    }

    /// Collapse a node, discarding loaded children. Checked descendants
    /// stay selected.
    pub fn collapse(&mut self, id: NodeId) {
        self.tree.collapse(id);
        self.state.mark_expanded(id, false);
    }

    pub fn set_sort(&mut self, key: SortKey, order: SortOrder) {
        self.state.set_sort(key, order);
        self.trigger.request_immediate_refresh();
    }

    pub fn set_tree_mode(&mut self, on: bool) {
        self.state.set_tree_mode(on);
        if !on {
            self.tree.clear();
        }
        self.trigger.request_immediate_refresh();
    }

    /// Compute the lineage displaced by checking `id`: checked ancestors
    /// and checked descendants, which cannot coexist with it.
    pub fn lineage_for_check(&self, id: NodeId, checked: bool) -> LineageChange {
        let mut displaced = Vec::new();
        if checked {
            let mut current = self.tree.node(id).and_then(|n| n.parent);
            while let Some(ancestor) = current {
                if self.checked.is_checked(ancestor) {
                    displaced.push(ancestor);
                }
                current = self.tree.node(ancestor).and_then(|n| n.parent);
            }
            let mut stack: Vec<NodeId> = self
                .tree
                .node(id)
                .map(|n| n.children().to_vec())
                .unwrap_or_default();
            while let Some(descendant) = stack.pop() {
                if self.checked.is_checked(descendant) {
                    displaced.push(descendant);
                }
                if let Some(node) = self.tree.node(descendant) {
                    stack.extend(node.children());
                }
            }
        }
        LineageChange {
            target: id,
            checked,
            displaced,
        }
    }

    pub fn checked(&self) -> &Arc<CheckSet> {
        &self.checked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::{MemoryIndex, MemoryQueryClient};
    use crate::node::{StorageRow, UuidRow};
    use crate::trigger::{RefreshTrigger, TriggerTuning};
    use crate::types::NodeKind;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl ViewSink for Recorder {
        fn count_changed(&mut self, total: u64, _total_size: u64) {
            self.0.lock().push(format!("count:{}", total));
        }
        fn rows_changed(&mut self, range: Range<u64>) {
            self.0.lock().push(format!("rows:{}..{}", range.start, range.end));
        }
        fn busy_changed(&mut self, busy: bool) {
            self.0.lock().push(format!("busy:{}", busy));
        }
        fn truncated(&mut self, total: u64, cap: u64) {
            self.0.lock().push(format!("truncated:{}:{}", total, cap));
        }
    }

    fn storage_row(seq: i64, name: &str) -> IndexRow {
        IndexRow::Storage(StorageRow {
            id: NodeId::compose(NodeKind::Storage, seq),
            entity: NodeId::compose(NodeKind::Entity, 1),
            name: name.to_string(),
            created: None,
            total_size: 0,
            total_entry_count: 0,
            total_entry_size: 0,
            state: IndexState::Ok,
        })
    }

    fn uuid_row(seq: i64, name: &str) -> IndexRow {
        IndexRow::Uuid(UuidRow {
            id: NodeId::compose(NodeKind::Uuid, seq),
            name: name.to_string(),
            created: None,
            total_size: 0,
            total_entry_count: 0,
            total_entry_size: 0,
            state: IndexState::Ok,
        })
    }

    fn model_with(
        view: ViewKind,
        cap: u64,
    ) -> (DisplayModel, Arc<RefreshTrigger<crate::filter::StorageFilter>>, Arc<Mutex<Vec<String>>>, Arc<CheckSet>) {
        let client = Arc::new(MemoryQueryClient::new(MemoryIndex::default()));
        let checked = Arc::new(CheckSet::new(client, 1024));
        let trigger = Arc::new(RefreshTrigger::new(TriggerTuning {
            settle: Duration::from_millis(10),
            poll: Duration::from_secs(600),
            page_size: 4,
        }));
        let log = Arc::new(Mutex::new(Vec::new()));
        let model = DisplayModel::new(
            view,
            4,
            cap,
            ViewStateHandle::new(ViewState::for_view(view)),
            trigger.clone(),
            checked.clone(),
            Box::new(Recorder(log.clone())),
        );
        (model, trigger, log, checked)
    }

    #[test]
    fn count_event_resizes_and_notifies() {
        let (mut model, _trigger, log, _) = model_with(ViewKind::Entries, 100);
        model.apply(ViewEvent::Count { total: 10, total_size: 4096 });
        assert_eq!(model.total(), 10);
        assert_eq!(model.total_size(), 4096);
        assert_eq!(log.lock().last().unwrap(), "count:10");
    }

    #[test]
    fn truncation_is_reported_through_the_sink() {
        let (mut model, _trigger, log, _) = model_with(ViewKind::Entries, 100);
        model.apply(ViewEvent::Count { total: 150, total_size: 0 });
        let events = log.lock();
        assert!(events.contains(&"truncated:150:100".to_string()));
        assert_eq!(model.display_len(), 100);
    }

    #[test]
    fn page_event_materializes_rows() {
        let (mut model, _trigger, log, _) = model_with(ViewKind::Entries, 100);
        model.apply(ViewEvent::Count { total: 6, total_size: 0 });
        model.apply(ViewEvent::Page {
            offset: 4,
            rows: vec![storage_row(5, "e"), storage_row(6, "f")],
        });
        assert!(model.row_at(5).is_some());
        assert_eq!(log.lock().last().unwrap(), "rows:4..6");
    }

    #[tokio::test]
    async fn reading_a_missing_page_queues_a_fetch() {
        let (mut model, trigger, _log, _) = model_with(ViewKind::Entries, 100);
        model.apply(ViewEvent::Count { total: 12, total_size: 0 });
        let rows = model.rows_in(0..8);
        assert!(rows.is_empty());
        let drained = trigger.wait_and_drain().await;
        assert_eq!(drained.offsets, BTreeSet::from([0, 4]));
    }

    #[test]
    fn children_for_an_unknown_parent_are_dropped() {
        let (mut model, _trigger, _log, _) = model_with(ViewKind::Storages, 100);
        let ghost = NodeId::compose(NodeKind::Uuid, 40);
        model.apply(ViewEvent::Children {
            parent: Some(ghost),
            rows: vec![storage_row(1, "a")],
        });
        assert!(model.tree_rows().is_empty());
    }

    #[tokio::test]
    async fn removed_rows_are_discarded_from_the_checkset_locally() {
        let (mut model, _trigger, _log, checked) = model_with(ViewKind::Storages, 100);
        model.apply(ViewEvent::Children {
            parent: None,
            rows: vec![uuid_row(1, "alpha")],
        });
        let job = NodeId::compose(NodeKind::Uuid, 1);
        checked.set(job, true).await.unwrap();

        model.apply(ViewEvent::Children { parent: None, rows: Vec::new() });
        assert!(!checked.is_checked(job));
    }

    #[tokio::test]
    async fn expand_marks_state_and_requests_the_subtree() {
        let (mut model, trigger, _log, _) = model_with(ViewKind::Storages, 100);
        model.apply(ViewEvent::Children {
            parent: None,
            rows: vec![uuid_row(1, "alpha")],
        });
        let job = NodeId::compose(NodeKind::Uuid, 1);
        assert!(model.expand(job));
        let drained = trigger.wait_and_drain().await;
        assert_eq!(drained.subtrees, BTreeSet::from([job]));

        let ghost = NodeId::compose(NodeKind::Uuid, 99);
        assert!(!model.expand(ghost));
    }

    #[tokio::test]
    async fn sort_change_forces_an_immediate_refresh() {
        let (mut model, trigger, _log, _) = model_with(ViewKind::Entries, 100);
        model.set_sort(SortKey::Size, SortOrder::Descending);
        let drained = trigger.wait_and_drain().await;
        assert!(drained.full && drained.indicator);
    }

    #[tokio::test]
    async fn lineage_lists_checked_ancestors_and_descendants() {
        let (mut model, _trigger, _log, checked) = model_with(ViewKind::Storages, 100);
        model.apply(ViewEvent::Children {
            parent: None,
            rows: vec![uuid_row(1, "alpha")],
        });
        let job = NodeId::compose(NodeKind::Uuid, 1);
        model.expand(job);
        model.apply(ViewEvent::Children {
            parent: Some(job),
            rows: vec![IndexRow::Entity(crate::node::EntityRow {
                id: NodeId::compose(NodeKind::Entity, 2),
                job,
                name: "run".to_string(),
                created: None,
                total_size: 0,
                total_entry_count: 0,
                total_entry_size: 0,
                state: IndexState::Ok,
            })],
        });
        let run = NodeId::compose(NodeKind::Entity, 2);
        checked.set(job, true).await.unwrap();

        let change = model.lineage_for_check(run, true);
        assert_eq!(change.displaced, vec![job]);

        // Unchecking never displaces anything.
        let change = model.lineage_for_check(run, false);
        assert!(change.displaced.is_empty());
    }

    #[test]
    fn state_hints_touch_flat_and_tree_rows() {
        let (mut model, _trigger, _log, _) = model_with(ViewKind::Storages, 100);
        model.apply(ViewEvent::Count { total: 1, total_size: 0 });
        model.apply(ViewEvent::Page { offset: 0, rows: vec![storage_row(1, "a")] });
        let id = NodeId::compose(NodeKind::Storage, 1);
        model.apply(ViewEvent::StateHint {
            ids: vec![id],
            state: IndexState::UpdateRequested,
        });
        assert_eq!(
            model.row_at(0).unwrap().state(),
            Some(IndexState::UpdateRequested)
        );
    }
}
