//! Shared fixtures for the integration tests: a seeded in-memory backend,
//! a spawned engine wired up to a display model, and event-drain helpers.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::DateTime;
use parking_lot::Mutex;
use tokio::time::timeout;

use porthole::checkset::CheckSet;
use porthole::client::memory::{MemoryIndexBuilder, MemoryQueryClient, StorageRecord};
use porthole::engine::{spawn_entries, spawn_storages, EngineHandle, EngineTuning};
use porthole::filter::{EntryFilter, StorageFilter};
use porthole::model::{DisplayModel, NullSink, ViewEvent, ViewState, ViewStateHandle};
use porthole::trigger::{RefreshTrigger, TriggerTuning};
use porthole::types::{EntryType, IndexState, NodeId, NodeKind, ViewKind};

pub const PAGE: u64 = 4;
pub const CAP: u64 = 100;
pub const SETTLE: Duration = Duration::from_millis(25);
const IDLE: Duration = Duration::from_millis(150);
const DEADLINE: Duration = Duration::from_secs(3);

/// Two jobs plus an orphaned storage: 7 storages across 5 entities, with
/// 9 entries of which two share a name across storage versions.
pub fn seeded_client() -> Arc<MemoryQueryClient> {
    Arc::new(
        MemoryIndexBuilder::new()
            .job("alpha")
            .entity(1_700_000_000)
            .storage("alpha-001.bar", 1_700_000_000, 1_000, 2, IndexState::Ok)
            .entry("/etc/fstab", EntryType::File, 200)
            .entry("/etc/ssl", EntryType::Directory, 0)
            .storage("alpha-002.bar", 1_700_000_600, 2_000, 2, IndexState::Ok)
            .entry("/etc/fstab", EntryType::File, 220)
            .entry("/srv/disk.img", EntryType::Image, 1_400)
            .entity(1_700_100_000)
            .storage("alpha-003.bar", 1_700_100_300, 3_000, 1, IndexState::Update)
            .entry("/var/log/syslog", EntryType::File, 90)
            .fragments(4)
            .storage("alpha-004.bar", 1_700_100_900, 4_000, 1, IndexState::Error)
            .entry("/var/tmp", EntryType::Directory, 0)
            .job("beta")
            .entity(1_700_200_000)
            .storage("beta-001.bar", 1_700_200_100, 5_000, 1, IndexState::Ok)
            .entry("/home/kit/notes.md", EntryType::File, 60)
            .storage("beta-002.bar", 1_700_200_700, 6_000, 1, IndexState::Ok)
            .entry("/home/kit/todo.md", EntryType::File, 70)
            .orphans()
            .entity(1_690_000_000)
            .storage("stray-001.bar", 1_690_000_500, 7_000, 1, IndexState::Unknown)
            .entry("/disk0.raw", EntryType::Image, 7_000)
            .build(),
    )
}

/// A live engine, its trigger, and the model its events feed.
pub struct Rig<F> {
    pub client: Arc<MemoryQueryClient>,
    pub handle: EngineHandle,
    pub model: DisplayModel,
    pub trigger: Arc<RefreshTrigger<F>>,
}

impl<F> Rig<F> {
    /// Apply events until the stream stays quiet for one idle window.
    pub async fn drain(&mut self) -> Vec<String> {
        self.drain_quiet(IDLE).await
    }

    pub async fn drain_quiet(&mut self, idle: Duration) -> Vec<String> {
        let started = Instant::now();
        let mut labels = Vec::new();
        loop {
            match timeout(idle, self.handle.next_event()).await {
                Ok(Some(event)) => {
                    labels.push(event_label(&event));
                    self.model.apply(event);
                }
                Ok(None) => break,
                Err(_) => {
                    if !labels.is_empty() || started.elapsed() >= DEADLINE {
                        break;
                    }
                }
            }
        }
        labels
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

pub fn quick_tuning() -> TriggerTuning {
    TriggerTuning {
        settle: SETTLE,
        poll: Duration::from_secs(600),
        page_size: PAGE,
    }
}

fn engine_tuning(display_cap: u64) -> EngineTuning {
    EngineTuning {
        page_size: PAGE,
        display_cap,
        min_pattern_len: 3,
    }
}

pub fn storages_rig(client: Arc<MemoryQueryClient>, tree_mode: bool) -> Rig<StorageFilter> {
    storages_rig_with(client, tree_mode, quick_tuning())
}

pub fn storages_rig_with(
    client: Arc<MemoryQueryClient>,
    tree_mode: bool,
    tuning: TriggerTuning,
) -> Rig<StorageFilter> {
    build_storages_rig(client, tree_mode, tuning, CAP)
}

/// Flat storages rig with a small display cap, for truncation tests.
pub fn flat_rig_capped(client: Arc<MemoryQueryClient>, cap: u64) -> Rig<StorageFilter> {
    build_storages_rig(client, false, quick_tuning(), cap)
}

fn build_storages_rig(
    client: Arc<MemoryQueryClient>,
    tree_mode: bool,
    tuning: TriggerTuning,
    cap: u64,
) -> Rig<StorageFilter> {
    let trigger = Arc::new(RefreshTrigger::new(tuning));
    let mut state = ViewState::for_view(ViewKind::Storages);
    state.tree_mode = tree_mode;
    let view = ViewStateHandle::new(state);
    let handle = spawn_storages(
        client.clone(),
        Arc::clone(&trigger),
        view.clone(),
        engine_tuning(cap),
    );
    let checked = Arc::new(CheckSet::new(client.clone(), 1024));
    let model = DisplayModel::new(
        ViewKind::Storages,
        PAGE,
        cap,
        view,
        trigger.clone(),
        checked,
        Box::new(NullSink),
    );
    Rig {
        client,
        handle,
        model,
        trigger,
    }
}

pub fn entries_rig(client: Arc<MemoryQueryClient>) -> Rig<EntryFilter> {
    let trigger = Arc::new(RefreshTrigger::new(quick_tuning()));
    let view = ViewStateHandle::new(ViewState::for_view(ViewKind::Entries));
    let handle = spawn_entries(
        client.clone(),
        Arc::clone(&trigger),
        view.clone(),
        engine_tuning(CAP),
    );
    let checked = Arc::new(CheckSet::new(client.clone(), 1024));
    let model = DisplayModel::new(
        ViewKind::Entries,
        PAGE,
        CAP,
        view,
        trigger.clone(),
        checked,
        Box::new(NullSink),
    );
    Rig {
        client,
        handle,
        model,
        trigger,
    }
}

pub fn event_label(event: &ViewEvent) -> String {
    match event {
        ViewEvent::Busy(on) => format!("busy:{}", on),
        ViewEvent::Count { total, .. } => format!("count:{}", total),
        ViewEvent::Page { offset, rows } => format!("page:{}+{}", offset, rows.len()),
        ViewEvent::Children { parent: None, rows } => format!("roots+{}", rows.len()),
        ViewEvent::Children {
            parent: Some(_),
            rows,
        } => format!("children+{}", rows.len()),
        ViewEvent::StateHint { ids, state } => {
            format!("hint:{}:{}", ids.len(), state.as_str())
        }
    }
}

pub fn job_id(client: &MemoryQueryClient, name: &str) -> NodeId {
    let mut found = None;
    client.alter(|index| {
        found = index.jobs.iter().find(|j| j.name == name).map(|j| j.id);
    });
    found.expect("job name in fixture")
}

/// Entity ids of one job, oldest first.
pub fn entity_ids(client: &MemoryQueryClient, job_name: &str) -> Vec<NodeId> {
    let job = job_id(client, job_name);
    let mut ids = Vec::new();
    client.alter(|index| {
        let mut entities: Vec<_> = index.entities.iter().filter(|e| e.job == job).collect();
        entities.sort_by_key(|e| e.created);
        ids = entities.iter().map(|e| e.id).collect();
    });
    ids
}

pub fn storage_id(client: &MemoryQueryClient, name: &str) -> NodeId {
    let mut found = None;
    client.alter(|index| {
        found = index.storages.iter().find(|s| s.name == name).map(|s| s.id);
    });
    found.expect("storage name in fixture")
}

pub fn entry_id(client: &MemoryQueryClient, name: &str) -> NodeId {
    let mut found = None;
    client.alter(|index| {
        found = index.entries.iter().find(|e| e.name == name).map(|e| e.id);
    });
    found.expect("entry name in fixture")
}

/// Push one storage into the dataset behind the view's back.
pub fn grow_storage(client: &MemoryQueryClient, name: &str, seq: i64, epoch: i64, size: u64) {
    client.alter(|index| {
        let entity = index.entities.first().map(|e| e.id).expect("fixture has entities");
        index.storages.push(StorageRecord {
            id: NodeId::compose(NodeKind::Storage, seq),
            entity,
            name: name.to_string(),
            created: DateTime::from_timestamp(epoch, 0),
            total_size: size,
            total_entry_count: 0,
            total_entry_size: size,
            state: IndexState::Create,
        });
    });
}

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Run `f` with `vars` set, serializing every environment-touching test.
/// Prior values are restored afterwards.
pub fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
    let _guard = ENV_LOCK.lock();
    let saved: Vec<(String, Option<String>)> = vars
        .iter()
        .map(|(key, _)| ((*key).to_string(), std::env::var(key).ok()))
        .collect();
    for (key, value) in vars {
        std::env::set_var(key, value);
    }
    let result = f();
    for (key, previous) in saved {
        match previous {
            Some(value) => std::env::set_var(&key, value),
            None => std::env::remove_var(&key),
        }
    }
    result
}
