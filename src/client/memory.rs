//! In-memory query backend.
//!
//! A complete index service implementation backed by process-local state,
//! used by the integration tests and the demo binary. It executes every verb
//! the synchronizer issues: filtered, sorted, paged listing; aggregate
//! counts; the server-side selection set; and the assign/refresh/delete/
//! restore operations.
//!
//! Test instrumentation: a per-row latency knob to hold streams open, an
//! inspectable command log, one-shot failure injection per verb, and a
//! row-overrun mode that violates the page limit on purpose.
//!
//! `newestOnly` semantics: for storages, only the most recently created
//! archive of each job is listed; for entries, only the most recent version
//! of each distinct name.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::client::{CommandHandle, QueryClient, QueryStream};
use crate::error::SyncError;
use crate::filter::{EntryTypeFilter, StateFilter};
use crate::node::{self, EntityRow, EntryRow, IndexRow, StorageRow, UuidRow};
use crate::protocol::{Command, Row};
use crate::types::{EntryType, IndexState, NodeId, NodeKind, SortKey, SortOrder};

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: NodeId,
    pub name: String,
    pub state: IndexState,
}

#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub id: NodeId,
    pub job: NodeId,
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub state: IndexState,
}

#[derive(Debug, Clone)]
pub struct StorageRecord {
    pub id: NodeId,
    pub entity: NodeId,
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub total_size: u64,
    pub total_entry_count: u64,
    pub total_entry_size: u64,
    pub state: IndexState,
}

#[derive(Debug, Clone)]
pub struct EntryRecord {
    pub id: NodeId,
    pub storage: NodeId,
    pub name: String,
    pub entry_type: EntryType,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub fragments: u64,
}

/// The whole server-side dataset. Public so tests can mutate it through
/// [`MemoryQueryClient::alter`] to simulate external index changes.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    pub jobs: Vec<JobRecord>,
    pub entities: Vec<EntityRecord>,
    pub storages: Vec<StorageRecord>,
    pub entries: Vec<EntryRecord>,
    pub selection: HashSet<NodeId>,
}

impl MemoryIndex {
    fn job_of_entity(&self, entity: NodeId) -> Option<NodeId> {
        self.entities.iter().find(|e| e.id == entity).map(|e| e.job)
    }

    fn entity_totals(&self, entity: NodeId) -> (u64, u64, u64) {
        self.storages
            .iter()
            .filter(|s| s.entity == entity)
            .fold((0, 0, 0), |acc, s| {
                (
                    acc.0 + s.total_size,
                    acc.1 + s.total_entry_count,
                    acc.2 + s.total_entry_size,
                )
            })
    }

    fn job_totals(&self, job: NodeId) -> (u64, u64, u64) {
        self.entities
            .iter()
            .filter(|e| e.job == job)
            .fold((0, 0, 0), |acc, e| {
                let (size, count, esize) = self.entity_totals(e.id);
                (acc.0 + size, acc.1 + count, acc.2 + esize)
            })
    }

    fn job_latest_created(&self, job: NodeId) -> Option<DateTime<Utc>> {
        self.entities
            .iter()
            .filter(|e| e.job == job)
            .filter_map(|e| e.created)
            .max()
    }

    fn uuid_row(&self, job: &JobRecord) -> IndexRow {
        let (size, count, esize) = self.job_totals(job.id);
        IndexRow::Uuid(UuidRow {
            id: job.id,
            name: job.name.clone(),
            created: self.job_latest_created(job.id),
            total_size: size,
            total_entry_count: count,
            total_entry_size: esize,
            state: job.state,
        })
    }

    fn entity_row(&self, entity: &EntityRecord) -> IndexRow {
        let (size, count, esize) = self.entity_totals(entity.id);
        IndexRow::Entity(EntityRow {
            id: entity.id,
            job: entity.job,
            name: entity.name.clone(),
            created: entity.created,
            total_size: size,
            total_entry_count: count,
            total_entry_size: esize,
            state: entity.state,
        })
    }

    fn storage_row(&self, storage: &StorageRecord) -> IndexRow {
        IndexRow::Storage(StorageRow {
            id: storage.id,
            entity: storage.entity,
            name: storage.name.clone(),
            created: storage.created,
            total_size: storage.total_size,
            total_entry_count: storage.total_entry_count,
            total_entry_size: storage.total_entry_size,
            state: storage.state,
        })
    }

    fn entry_row(&self, entry: &EntryRecord) -> IndexRow {
        IndexRow::Entry(EntryRow {
            id: entry.id,
            storage: entry.storage,
            name: entry.name.clone(),
            entry_type: entry.entry_type,
            size: entry.size,
            created: entry.created,
            fragment_count: None,
        })
    }
}

struct Inner {
    index: Mutex<MemoryIndex>,
    row_delay: Mutex<Duration>,
    log: Mutex<Vec<String>>,
    fail_once: Mutex<HashMap<String, u32>>,
    overrun_verbs: Mutex<HashSet<String>>,
    aborted: AtomicUsize,
    resets: AtomicUsize,
}

/// In-memory [`QueryClient`].
#[derive(Clone)]
pub struct MemoryQueryClient {
    inner: Arc<Inner>,
}

impl MemoryQueryClient {
    pub fn new(index: MemoryIndex) -> MemoryQueryClient {
        MemoryQueryClient {
            inner: Arc::new(Inner {
                index: Mutex::new(index),
                row_delay: Mutex::new(Duration::ZERO),
                log: Mutex::new(Vec::new()),
                fail_once: Mutex::new(HashMap::new()),
                overrun_verbs: Mutex::new(HashSet::new()),
                aborted: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
            }),
        }
    }

    /// Delay inserted before each row is sent. Lets tests hold a stream open
    /// long enough to abort it mid-flight.
    pub fn set_row_delay(&self, delay: Duration) {
        *self.inner.row_delay.lock() = delay;
    }

    /// Fail the next `count` submissions of `verb` with a transport error.
    pub fn fail_once(&self, verb: &str, count: u32) {
        self.inner.fail_once.lock().insert(verb.to_string(), count);
    }

    /// Make listing commands for `verb` ignore their `limit` argument and
    /// send extra rows, for exercising the overrun guard.
    pub fn force_overrun(&self, verb: &str) {
        self.inner.overrun_verbs.lock().insert(verb.to_string());
    }

    /// Mutate the dataset in place, simulating a server-side change.
    pub fn alter(&self, f: impl FnOnce(&mut MemoryIndex)) {
        f(&mut self.inner.index.lock());
    }

    /// Every command rendered to wire form, in submission order.
    pub fn command_log(&self) -> Vec<String> {
        self.inner.log.lock().clone()
    }

    /// Commands whose rendered form starts with `prefix`.
    pub fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Streams observed as aborted by their producers.
    pub fn aborted_count(&self) -> usize {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> usize {
        self.inner.resets.load(Ordering::SeqCst)
    }

    pub fn selection_snapshot(&self) -> HashSet<NodeId> {
        self.inner.index.lock().selection.clone()
    }

    fn take_injected_failure(&self, verb: &str) -> bool {
        let mut failures = self.inner.fail_once.lock();
        if let Some(remaining) = failures.get_mut(verb) {
            if *remaining > 0 {
                *remaining -= 1;
                return true;
            }
        }
        false
    }

    fn execute(&self, cmd: &Command) -> Result<Vec<Row>, SyncError> {
        let mut index = self.inner.index.lock();
        let overrun = self.inner.overrun_verbs.lock().contains(cmd.verb());
        match cmd.verb() {
            "INDEX_UUID_LIST" => Ok(list_uuids(&index, cmd)),
            "INDEX_ENTITY_LIST" => list_entities(&index, cmd),
            "INDEX_STORAGE_LIST" => Ok(list_storages(&index, cmd, overrun)),
            "INDEX_STORAGE_COUNT" => Ok(count_storages(&index, cmd)),
            "INDEX_ENTRY_LIST" => Ok(list_entries(&index, cmd, overrun)),
            "INDEX_ENTRY_COUNT" => Ok(count_entries(&index, cmd)),
            "INDEX_ENTRY_FRAGMENTS" => entry_fragments(&index, cmd),
            "SELECTION_ADD" => selection_update(&mut index, cmd, true),
            "SELECTION_REMOVE" => selection_update(&mut index, cmd, false),
            "SELECTION_CLEAR" => {
                index.selection.clear();
                Ok(Vec::new())
            }
            "SELECTION_LIST" => {
                let mut ids: Vec<i64> = index.selection.iter().map(|id| id.raw()).collect();
                ids.sort_unstable();
                Ok(ids
                    .into_iter()
                    .map(|id| Row::new().field("id", id))
                    .collect())
            }
            "INDEX_ASSIGN" => assign_storage(&mut index, cmd),
            "INDEX_REFRESH" => refresh_storage(&mut index, cmd),
            "STORAGE_DELETE" => delete_storage(&mut index, cmd),
            "ENTRY_RESTORE" => restore_entry(&index, cmd),
            other => Err(SyncError::Transport(format!("unknown command '{}'", other))),
        }
    }
}

#[async_trait]
impl QueryClient for MemoryQueryClient {
    fn submit(&self, command: Command) -> QueryStream {
        self.inner.log.lock().push(command.render());

        let handle = CommandHandle::new();
        let (tx, rx) = mpsc::channel(64);
        let delay = *self.inner.row_delay.lock();

        let outcome = if self.take_injected_failure(command.verb()) {
            Err(SyncError::Transport(format!(
                "injected failure for {}",
                command.verb()
            )))
        } else {
            self.execute(&command)
        };

        let producer_handle = handle.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match outcome {
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
                Ok(rows) => {
                    for row in rows {
                        if producer_handle.is_aborted() {
                            inner.aborted.fetch_add(1, Ordering::SeqCst);
                            return;
                        }
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                        if producer_handle.is_aborted() {
                            inner.aborted.fetch_add(1, Ordering::SeqCst);
                            return;
                        }
                        if tx.send(Ok(row)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        QueryStream::new(handle, rx)
    }

    async fn reset(&self) {
        self.inner.resets.fetch_add(1, Ordering::SeqCst);
        self.inner.log.lock().push("RESET".to_string());
    }
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    pattern.is_empty() || name.to_lowercase().contains(&pattern.to_lowercase())
}

fn cmd_pattern(cmd: &Command) -> String {
    cmd.get_str("pattern").unwrap_or("").to_string()
}

fn cmd_states(cmd: &Command) -> StateFilter {
    match cmd.get_tokens("indexStateSet") {
        None => StateFilter::Any,
        Some(raw) => StateFilter::parse(raw).unwrap_or(StateFilter::Any),
    }
}

fn cmd_entry_types(cmd: &Command) -> EntryTypeFilter {
    match cmd.get_tokens("entryTypeSet") {
        None => EntryTypeFilter::Any,
        Some(raw) => EntryTypeFilter::parse(raw).unwrap_or(EntryTypeFilter::Any),
    }
}

fn cmd_sort(cmd: &Command) -> (SortKey, SortOrder) {
    let key = cmd
        .get_str("sortMode")
        .and_then(|s| s.parse().ok())
        .unwrap_or(SortKey::Name);
    let order = match cmd.get_str("ordering") {
        Some("DESCENDING") => SortOrder::Descending,
        _ => SortOrder::Ascending,
    };
    (key, order)
}

fn sort_rows(rows: &mut [IndexRow], cmd: &Command) {
    let (key, order) = cmd_sort(cmd);
    rows.sort_by(|a, b| node::compare(a, b, key, order));
}

fn page_window(rows: Vec<IndexRow>, cmd: &Command, overrun: bool) -> Vec<IndexRow> {
    let offset = cmd.get_u64("offset").unwrap_or(0) as usize;
    match cmd.get_u64("limit") {
        None => rows.into_iter().skip(offset).collect(),
        Some(limit) => {
            let take = if overrun {
                limit as usize + 3
            } else {
                limit as usize
            };
            rows.into_iter().skip(offset).take(take).collect()
        }
    }
}

fn epoch_field(created: Option<DateTime<Utc>>) -> i64 {
    created.map(|c| c.timestamp()).unwrap_or(0)
}

fn render_row(row: &IndexRow) -> Row {
    match row {
        IndexRow::Uuid(r) => Row::new()
            .field("id", r.id.raw())
            .field("name", &r.name)
            .field("created", epoch_field(r.created))
            .field("totalSize", r.total_size)
            .field("totalEntryCount", r.total_entry_count)
            .field("totalEntrySize", r.total_entry_size)
            .field("state", r.state),
        IndexRow::Entity(r) => Row::new()
            .field("id", r.id.raw())
            .field("jobId", r.job.raw())
            .field("name", &r.name)
            .field("created", epoch_field(r.created))
            .field("totalSize", r.total_size)
            .field("totalEntryCount", r.total_entry_count)
            .field("totalEntrySize", r.total_entry_size)
            .field("state", r.state),
        IndexRow::Storage(r) => Row::new()
            .field("id", r.id.raw())
            .field("entityId", r.entity.raw())
            .field("name", &r.name)
            .field("created", epoch_field(r.created))
            .field("totalSize", r.total_size)
            .field("totalEntryCount", r.total_entry_count)
            .field("totalEntrySize", r.total_entry_size)
            .field("state", r.state),
        IndexRow::Entry(r) => Row::new()
            .field("id", r.id.raw())
            .field("storageId", r.storage.raw())
            .field("name", &r.name)
            .field("entryType", r.entry_type)
            .field("size", r.size)
            .field("created", epoch_field(r.created)),
    }
}

fn list_uuids(index: &MemoryIndex, cmd: &Command) -> Vec<Row> {
    let pattern = cmd_pattern(cmd);
    let states = cmd_states(cmd);
    let mut rows: Vec<IndexRow> = index
        .jobs
        .iter()
        .filter(|j| pattern_matches(&pattern, &j.name))
        .filter(|j| states.matches(j.state))
        .map(|j| index.uuid_row(j))
        .collect();
    sort_rows(&mut rows, cmd);
    rows.iter().map(render_row).collect()
}

fn list_entities(index: &MemoryIndex, cmd: &Command) -> Result<Vec<Row>, SyncError> {
    let job = cmd
        .get_i64("jobId")
        .map(NodeId::from_raw)
        .ok_or_else(|| SyncError::Transport("INDEX_ENTITY_LIST requires jobId".to_string()))?;
    let pattern = cmd_pattern(cmd);
    let states = cmd_states(cmd);
    let mut rows: Vec<IndexRow> = index
        .entities
        .iter()
        .filter(|e| e.job == job)
        .filter(|e| pattern_matches(&pattern, &e.name))
        .filter(|e| states.matches(e.state))
        .map(|e| index.entity_row(e))
        .collect();
    sort_rows(&mut rows, cmd);
    Ok(rows.iter().map(render_row).collect())
}

fn filtered_storages<'a>(index: &'a MemoryIndex, cmd: &Command) -> Vec<&'a StorageRecord> {
    let pattern = cmd_pattern(cmd);
    let states = cmd_states(cmd);
    let entity = cmd.get_i64("entityId").map(NodeId::from_raw);
    let job = cmd.get_i64("jobId").map(NodeId::from_raw);
    let newest_only = cmd.get_bool("newestOnly").unwrap_or(false);

    let mut storages: Vec<&StorageRecord> = index
        .storages
        .iter()
        .filter(|s| entity.map_or(true, |e| s.entity == e))
        .filter(|s| job.map_or(true, |j| index.job_of_entity(s.entity) == Some(j)))
        .filter(|s| pattern_matches(&pattern, &s.name))
        .filter(|s| states.matches(s.state))
        .collect();

    if newest_only {
        let mut newest: HashMap<NodeId, &StorageRecord> = HashMap::new();
        for s in storages {
            let job = index.job_of_entity(s.entity).unwrap_or(NodeId::NO_JOB);
            match newest.get(&job) {
                Some(current) if current.created >= s.created => {}
                _ => {
                    newest.insert(job, s);
                }
            }
        }
        storages = newest.into_values().collect();
    }
    storages
}

fn list_storages(index: &MemoryIndex, cmd: &Command, overrun: bool) -> Vec<Row> {
    let mut rows: Vec<IndexRow> = filtered_storages(index, cmd)
        .into_iter()
        .map(|s| index.storage_row(s))
        .collect();
    sort_rows(&mut rows, cmd);
    let rows = page_window(rows, cmd, overrun);
    rows.iter().map(render_row).collect()
}

fn count_storages(index: &MemoryIndex, cmd: &Command) -> Vec<Row> {
    let storages = filtered_storages(index, cmd);
    let count = storages.len() as u64;
    let size: u64 = storages.iter().map(|s| s.total_size).sum();
    vec![Row::new().field("count", count).field("size", size)]
}

fn filtered_entries<'a>(index: &'a MemoryIndex, cmd: &Command) -> Vec<&'a EntryRecord> {
    let pattern = cmd_pattern(cmd);
    let types = cmd_entry_types(cmd);
    let newest_only = cmd.get_bool("newestOnly").unwrap_or(false);

    let entries: Vec<&EntryRecord> = index
        .entries
        .iter()
        .filter(|e| pattern_matches(&pattern, &e.name))
        .filter(|e| types.matches(e.entry_type))
        .collect();

    if newest_only {
        let mut newest: HashMap<&str, &EntryRecord> = HashMap::new();
        for e in entries {
            match newest.get(e.name.as_str()) {
                Some(current) if current.created >= e.created => {}
                _ => {
                    newest.insert(e.name.as_str(), e);
                }
            }
        }
        newest.into_values().collect()
    } else {
        entries
    }
}

fn list_entries(index: &MemoryIndex, cmd: &Command, overrun: bool) -> Vec<Row> {
    let mut rows: Vec<IndexRow> = filtered_entries(index, cmd)
        .into_iter()
        .map(|e| index.entry_row(e))
        .collect();
    sort_rows(&mut rows, cmd);
    let rows = page_window(rows, cmd, overrun);
    rows.iter().map(render_row).collect()
}

fn count_entries(index: &MemoryIndex, cmd: &Command) -> Vec<Row> {
    let entries = filtered_entries(index, cmd);
    let count = entries.len() as u64;
    let size: u64 = entries.iter().map(|e| e.size).sum();
    vec![Row::new().field("count", count).field("size", size)]
}

fn entry_fragments(index: &MemoryIndex, cmd: &Command) -> Result<Vec<Row>, SyncError> {
    let id = cmd
        .get_i64("entryId")
        .map(NodeId::from_raw)
        .ok_or_else(|| SyncError::Transport("INDEX_ENTRY_FRAGMENTS requires entryId".to_string()))?;
    let entry = index
        .entries
        .iter()
        .find(|e| e.id == id)
        .ok_or_else(|| SyncError::Transport(format!("no such entry {}", id)))?;
    Ok(vec![Row::new().field("count", entry.fragments)])
}

fn selection_update(
    index: &mut MemoryIndex,
    cmd: &Command,
    add: bool,
) -> Result<Vec<Row>, SyncError> {
    let ids = cmd
        .get_ids("ids")
        .ok_or_else(|| SyncError::Transport("selection update requires ids".to_string()))?;
    for raw in ids {
        let id = NodeId::from_raw(*raw);
        if add {
            index.selection.insert(id);
        } else {
            index.selection.remove(&id);
        }
    }
    Ok(Vec::new())
}

fn assign_storage(index: &mut MemoryIndex, cmd: &Command) -> Result<Vec<Row>, SyncError> {
    let storage = require_id(cmd, "storageId")?;
    let entity = require_id(cmd, "entityId")?;
    if !index.entities.iter().any(|e| e.id == entity) {
        return Err(SyncError::Transport(format!("no such entity {}", entity)));
    }
    let record = index
        .storages
        .iter_mut()
        .find(|s| s.id == storage)
        .ok_or_else(|| SyncError::Transport(format!("no such storage {}", storage)))?;
    record.entity = entity;
    record.state = IndexState::Ok;
    Ok(Vec::new())
}

fn refresh_storage(index: &mut MemoryIndex, cmd: &Command) -> Result<Vec<Row>, SyncError> {
    let storage = require_id(cmd, "storageId")?;
    let record = index
        .storages
        .iter_mut()
        .find(|s| s.id == storage)
        .ok_or_else(|| SyncError::Transport(format!("no such storage {}", storage)))?;
    record.state = IndexState::Ok;
    Ok(Vec::new())
}

fn delete_storage(index: &mut MemoryIndex, cmd: &Command) -> Result<Vec<Row>, SyncError> {
    let storage = require_id(cmd, "storageId")?;
    let position = index
        .storages
        .iter()
        .position(|s| s.id == storage)
        .ok_or_else(|| SyncError::Transport(format!("no such storage {}", storage)))?;
    let removed = index.storages.remove(position);
    index.entries.retain(|e| e.storage != storage);
    index.selection.remove(&storage);
    let entity_empty = !index.storages.iter().any(|s| s.entity == removed.entity);
    if entity_empty {
        index.entities.retain(|e| e.id != removed.entity);
        index.selection.remove(&removed.entity);
    }
    Ok(Vec::new())
}

fn restore_entry(index: &MemoryIndex, cmd: &Command) -> Result<Vec<Row>, SyncError> {
    let entry = require_id(cmd, "entryId")?;
    if !index.entries.iter().any(|e| e.id == entry) {
        return Err(SyncError::Transport(format!("no such entry {}", entry)));
    }
    cmd.get_str("destination")
        .ok_or_else(|| SyncError::Transport("ENTRY_RESTORE requires destination".to_string()))?;
    Ok(Vec::new())
}

fn require_id(cmd: &Command, key: &'static str) -> Result<NodeId, SyncError> {
    cmd.get_i64(key)
        .map(NodeId::from_raw)
        .ok_or_else(|| SyncError::Transport(format!("missing argument {}", key)))
}

/// Fluent dataset builder for tests and the demo binary. Ids are assigned
/// sequentially with the proper kind tags.
pub struct MemoryIndexBuilder {
    index: MemoryIndex,
    next_seq: i64,
    current_job: Option<NodeId>,
    current_entity: Option<NodeId>,
    current_storage: Option<NodeId>,
}

impl Default for MemoryIndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIndexBuilder {
    pub fn new() -> MemoryIndexBuilder {
        MemoryIndexBuilder {
            index: MemoryIndex::default(),
            next_seq: 1,
            current_job: None,
            current_entity: None,
            current_storage: None,
        }
    }

    fn next_id(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId::compose(kind, self.next_seq);
        self.next_seq += 1;
        id
    }

    /// Start a new job; subsequent entities land under it.
    pub fn job(mut self, name: &str) -> Self {
        let id = self.next_id(NodeKind::Uuid);
        self.index.jobs.push(JobRecord {
            id,
            name: name.to_string(),
            state: IndexState::Ok,
        });
        self.current_job = Some(id);
        self.current_entity = None;
        self.current_storage = None;
        self
    }

    /// Start the synthetic "no job" group for orphaned storages.
    pub fn orphans(mut self) -> Self {
        if !self.index.jobs.iter().any(|j| j.id == NodeId::NO_JOB) {
            self.index.jobs.push(JobRecord {
                id: NodeId::NO_JOB,
                name: "(no job)".to_string(),
                state: IndexState::None,
            });
        }
        self.current_job = Some(NodeId::NO_JOB);
        self.current_entity = None;
        self.current_storage = None;
        self
    }

    /// Add a backup run under the current job, named after its date.
    pub fn entity(mut self, created_epoch: i64) -> Self {
        let job = self.current_job.expect("entity requires a preceding job");
        let id = self.next_id(NodeKind::Entity);
        let created = DateTime::from_timestamp(created_epoch, 0);
        let name = created
            .map(|c| c.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.index.entities.push(EntityRecord {
            id,
            job,
            name,
            created,
            state: IndexState::Ok,
        });
        self.current_entity = Some(id);
        self.current_storage = None;
        self
    }

    /// Add an archive under the current entity.
    pub fn storage(
        mut self,
        name: &str,
        created_epoch: i64,
        size: u64,
        entry_count: u64,
        state: IndexState,
    ) -> Self {
        let entity = self
            .current_entity
            .expect("storage requires a preceding entity");
        let id = self.next_id(NodeKind::Storage);
        self.index.storages.push(StorageRecord {
            id,
            entity,
            name: name.to_string(),
            created: DateTime::from_timestamp(created_epoch, 0),
            total_size: size,
            total_entry_count: entry_count,
            total_entry_size: size,
            state,
        });
        self.current_storage = Some(id);
        self
    }

    /// Add an archived item under the current storage.
    pub fn entry(mut self, name: &str, entry_type: EntryType, size: u64) -> Self {
        let storage = self
            .current_storage
            .expect("entry requires a preceding storage");
        let created = self
            .index
            .storages
            .iter()
            .find(|s| s.id == storage)
            .and_then(|s| s.created);
        let id = self.next_id(NodeKind::Entry(entry_type));
        self.index.entries.push(EntryRecord {
            id,
            storage,
            name: name.to_string(),
            entry_type,
            size,
            created,
            fragments: 1,
        });
        self
    }

    /// Set the fragment count of the most recently added entry.
    pub fn fragments(mut self, count: u64) -> Self {
        if let Some(last) = self.index.entries.last_mut() {
            last.fragments = count;
        }
        self
    }

    pub fn build(self) -> MemoryQueryClient {
        MemoryQueryClient::new(self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::single_row;
    use crate::filter::StorageFilter;
    use crate::protocol::commands;

    fn seeded() -> MemoryQueryClient {
        MemoryIndexBuilder::new()
            .job("alpha")
            .entity(1_700_000_000)
            .storage("alpha-001.bar", 1_700_000_000, 1000, 10, IndexState::Ok)
            .storage("alpha-002.bar", 1_700_000_100, 2000, 20, IndexState::Ok)
            .entity(1_700_100_000)
            .storage("alpha-003.bar", 1_700_100_000, 3000, 30, IndexState::Error)
            .job("beta")
            .entity(1_700_200_000)
            .storage("beta-001.bar", 1_700_200_000, 4000, 40, IndexState::Ok)
            .build()
    }

    async fn collect(client: &MemoryQueryClient, cmd: Command) -> Vec<Row> {
        let mut stream = client.submit(cmd);
        let mut rows = Vec::new();
        while let Some(item) = stream.next_row().await {
            rows.push(item.unwrap());
        }
        rows
    }

    #[tokio::test]
    async fn storage_pages_are_sorted_and_windowed() {
        let client = seeded();
        let filter = StorageFilter::default();
        let rows = collect(
            &client,
            commands::storage_page(&filter, 3, SortKey::Name, SortOrder::Ascending, 1, 2),
        )
        .await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("name"), Some("alpha-002.bar"));
        assert_eq!(rows[1].get("name"), Some("alpha-003.bar"));
    }

    #[tokio::test]
    async fn count_honors_the_state_filter() {
        let client = seeded();
        let filter = StorageFilter {
            states: StateFilter::Only(vec![IndexState::Error]),
            ..StorageFilter::default()
        };
        let row = single_row(&client, commands::storage_count(&filter, 3))
            .await
            .unwrap();
        assert_eq!(row.get_u64("count").unwrap(), 1);
        assert_eq!(row.get_u64("size").unwrap(), 3000);
    }

    #[tokio::test]
    async fn newest_only_keeps_one_storage_per_job() {
        let client = seeded();
        let filter = StorageFilter {
            newest_only: true,
            ..StorageFilter::default()
        };
        let rows = collect(
            &client,
            commands::storage_page(&filter, 3, SortKey::Name, SortOrder::Ascending, 0, 32),
        )
        .await;
        let names: Vec<_> = rows.iter().filter_map(|r| r.get("name")).collect();
        assert_eq!(names, vec!["alpha-003.bar", "beta-001.bar"]);
    }

    #[tokio::test]
    async fn entity_children_belong_to_the_requested_job() {
        let client = seeded();
        let job = client.job_named("alpha");
        let filter = StorageFilter::default();
        let rows = collect(
            &client,
            commands::entity_list(job, &filter, 3, SortKey::Created, SortOrder::Ascending),
        )
        .await;
        assert_eq!(rows.len(), 2);
        for row in rows {
            assert_eq!(row.get_i64("jobId").unwrap(), job.raw());
        }
    }

    #[tokio::test]
    async fn selection_add_is_idempotent_server_side() {
        let client = seeded();
        let id = NodeId::compose(NodeKind::Storage, 3);
        for _ in 0..2 {
            collect(&client, commands::selection_add(&[id])).await;
        }
        assert_eq!(client.selection_snapshot().len(), 1);
        collect(&client, commands::selection_remove(&[id])).await;
        assert!(client.selection_snapshot().is_empty());
    }

    #[tokio::test]
    async fn delete_cascades_to_entries_and_empty_entities() {
        let client = seeded();
        let storage = NodeId::compose(NodeKind::Storage, 6);
        let before_entities = client.peek(|i| i.entities.len());
        collect(&client, commands::storage_delete(storage)).await;
        let after_entities = client.peek(|i| i.entities.len());
        assert_eq!(after_entities, before_entities - 1);
    }

    #[tokio::test]
    async fn injected_failure_consumes_exactly_one_submission() {
        let client = seeded();
        client.fail_once("INDEX_STORAGE_COUNT", 1);
        let filter = StorageFilter::default();
        let err = single_row(&client, commands::storage_count(&filter, 3)).await;
        assert!(matches!(err, Err(SyncError::Transport(_))));
        let ok = single_row(&client, commands::storage_count(&filter, 3)).await;
        assert!(ok.is_ok());
    }

    impl MemoryQueryClient {
        fn peek<T>(&self, f: impl FnOnce(&MemoryIndex) -> T) -> T {
            f(&self.inner.index.lock())
        }

        fn job_named(&self, name: &str) -> NodeId {
            self.peek(|i| {
                i.jobs
                    .iter()
                    .find(|j| j.name == name)
                    .map(|j| j.id)
                    .unwrap()
            })
        }
    }
}
