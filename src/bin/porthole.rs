//! Porthole CLI Binary
//!
//! Drives the view synchronizer against an in-memory index fixture so the
//! whole pipeline can be exercised from a terminal: triggers, engine passes,
//! display models, selection and the bulk operations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::timeout;

use porthole::checkset::CheckSet;
use porthole::client::memory::{MemoryIndexBuilder, MemoryQueryClient, StorageRecord};
use porthole::client::fragment_count;
use porthole::config::PortholeConfig;
use porthole::engine::{spawn_entries, spawn_storages, EngineHandle, EngineTuning};
use porthole::filter::{EntryFilter, EntryTypeFilter, JobScope, StateFilter, StorageFilter};
use porthole::logging;
use porthole::model::{DisplayModel, ViewSink, ViewState, ViewStateHandle};
use porthole::node::IndexRow;
use porthole::ops::{BulkOps, BulkOutcome};
use porthole::trigger::{RefreshTrigger, TriggerPort, TriggerTuning};
use porthole::types::{EntryType, IndexState, NodeId, NodeKind, SortKey, SortOrder, ViewKind};

/// Porthole CLI - incremental views over a backup-archive index
#[derive(Parser)]
#[command(name = "porthole")]
#[command(about = "Incremental paginated views over a remotely queried backup-archive index")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, file+stderr)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the storage view, hierarchical by default
    Storages {
        /// Name filter pattern
        #[arg(long, default_value = "")]
        pattern: String,
        /// Index states to include, comma-separated, or *
        #[arg(long, default_value = "*")]
        states: String,
        /// Show only the newest archive per job
        #[arg(long)]
        newest: bool,
        /// Limit to one job id
        #[arg(long)]
        job: Option<i64>,
        /// Render the flat paged table instead of the tree
        #[arg(long)]
        flat: bool,
        /// Tree levels to expand (1 shows entities, 2 shows archives)
        #[arg(long, default_value = "2")]
        depth: u32,
        /// Sort column (name, created, size, state)
        #[arg(long, default_value = "name")]
        sort: String,
        /// Sort descending
        #[arg(long)]
        desc: bool,
        /// Page to display in flat mode
        #[arg(long, default_value = "0")]
        page: u64,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Show the flat entry view
    Entries {
        /// Name filter pattern
        #[arg(long, default_value = "")]
        pattern: String,
        /// Entry types to include, comma-separated, or *
        #[arg(long, default_value = "*")]
        types: String,
        /// Show only the newest version of each entry name
        #[arg(long)]
        newest: bool,
        /// Sort column (name, created, size)
        #[arg(long, default_value = "name")]
        sort: String,
        /// Sort descending
        #[arg(long)]
        desc: bool,
        /// Page to display
        #[arg(long, default_value = "0")]
        page: u64,
        /// Fetch fragment counts for the displayed rows
        #[arg(long)]
        fragments: bool,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Select matching archives and show the server-side selection
    Select {
        /// Name filter pattern
        #[arg(long, default_value = "")]
        pattern: String,
        /// Clear the selection instead of adding to it
        #[arg(long)]
        clear: bool,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Reassign matching archives to another entity
    Assign {
        /// Name filter pattern
        #[arg(long, default_value = "")]
        pattern: String,
        /// Target entity id, as shown in the ID column
        #[arg(long)]
        entity: i64,
        /// Continue past per-row failures
        #[arg(long)]
        ignore_errors: bool,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Request a re-index of matching archives
    Refresh {
        /// Name filter pattern
        #[arg(long, default_value = "")]
        pattern: String,
        /// Continue past per-row failures
        #[arg(long)]
        ignore_errors: bool,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Delete matching archives from the index
    Delete {
        /// Name filter pattern
        #[arg(long, default_value = "")]
        pattern: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
        /// Continue past per-row failures
        #[arg(long)]
        ignore_errors: bool,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Restore matching entries to a destination path
    Restore {
        /// Name filter pattern
        #[arg(long, default_value = "")]
        pattern: String,
        /// Entry types to include, comma-separated, or *
        #[arg(long, default_value = "*")]
        types: String,
        /// Destination path on the index host
        #[arg(long, default_value = "/tmp/porthole-restore")]
        dest: String,
        /// Continue past per-row failures
        #[arg(long)]
        ignore_errors: bool,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Watch the index while simulated remote changes land
    Watch {
        /// Reconciliation cycles to run before exiting
        #[arg(long, default_value = "3")]
        cycles: u32,
    },
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = logging::init_logging(Some(&config.logging)) {
        eprintln!("Error initializing logging: {}", e);
        process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error starting runtime: {}", e);
            process::exit(1);
        }
    };

    match runtime.block_on(execute(cli.command, &config)) {
        Ok(output) => {
            println!("{}", output);
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<PortholeConfig> {
    let mut config =
        PortholeConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }
    if let Some(output) = &cli.log_output {
        config.logging.output = output.clone();
    }
    if let Some(file) = &cli.log_file {
        config.logging.file = Some(file.clone());
    }
    Ok(config)
}

async fn execute(command: Commands, config: &PortholeConfig) -> anyhow::Result<String> {
    let client = Arc::new(demo_index());
    match command {
        Commands::Storages {
            pattern,
            states,
            newest,
            job,
            flat,
            depth,
            sort,
            desc,
            page,
            format,
        } => {
            let filter = parse_storage_filter(&pattern, &states, newest, job)?;
            let (key, order) = parse_sort(&sort, desc)?;
            cmd_storages(client, config, filter, key, order, flat, depth, page, &format).await
        }
        Commands::Entries {
            pattern,
            types,
            newest,
            sort,
            desc,
            page,
            fragments,
            format,
        } => {
            let filter = parse_entry_filter(&pattern, &types, newest)?;
            let (key, order) = parse_sort(&sort, desc)?;
            cmd_entries(client, config, filter, key, order, page, fragments, &format).await
        }
        Commands::Select {
            pattern,
            clear,
            format,
        } => {
            let filter = parse_storage_filter(&pattern, "*", false, None)?;
            cmd_select(client, config, filter, clear, &format).await
        }
        Commands::Assign {
            pattern,
            entity,
            ignore_errors,
            format,
        } => {
            let filter = parse_storage_filter(&pattern, "*", false, None)?;
            let entity = NodeId::from_raw(entity);
            cmd_assign(client, config, filter, entity, ignore_errors, &format).await
        }
        Commands::Refresh {
            pattern,
            ignore_errors,
            format,
        } => {
            let filter = parse_storage_filter(&pattern, "*", false, None)?;
            cmd_refresh(client, config, filter, ignore_errors, &format).await
        }
        Commands::Delete {
            pattern,
            yes,
            ignore_errors,
            format,
        } => {
            let filter = parse_storage_filter(&pattern, "*", false, None)?;
            cmd_delete(client, config, filter, yes, ignore_errors, &format).await
        }
        Commands::Restore {
            pattern,
            types,
            dest,
            ignore_errors,
            format,
        } => {
            let filter = parse_entry_filter(&pattern, &types, false)?;
            cmd_restore(client, config, filter, &dest, ignore_errors, &format).await
        }
        Commands::Watch { cycles } => cmd_watch(client, config, cycles).await,
    }
}

fn parse_storage_filter(
    pattern: &str,
    states: &str,
    newest: bool,
    job: Option<i64>,
) -> anyhow::Result<StorageFilter> {
    Ok(StorageFilter {
        pattern: pattern.to_string(),
        states: StateFilter::parse(states).map_err(anyhow::Error::msg)?,
        job: match job {
            Some(raw) => JobScope::Job(NodeId::from_raw(raw)),
            None => JobScope::All,
        },
        newest_only: newest,
    })
}

fn parse_entry_filter(pattern: &str, types: &str, newest: bool) -> anyhow::Result<EntryFilter> {
    Ok(EntryFilter {
        pattern: pattern.to_string(),
        entry_types: EntryTypeFilter::parse(types).map_err(anyhow::Error::msg)?,
        newest_only: newest,
    })
}

fn parse_sort(sort: &str, desc: bool) -> anyhow::Result<(SortKey, SortOrder)> {
    let key = sort
        .parse::<SortKey>()
        .map_err(|_| anyhow!("unknown sort key '{}' (name, created, size, state)", sort))?;
    let order = if desc {
        SortOrder::Descending
    } else {
        SortOrder::Ascending
    };
    Ok((key, order))
}

fn is_json(format: &str) -> anyhow::Result<bool> {
    match format {
        "json" => Ok(true),
        "text" => Ok(false),
        other => Err(anyhow!("invalid format: {} (must be 'text' or 'json')", other)),
    }
}

/// Out-of-band view notices captured from the sink for rendering after the
/// event stream settles.
#[derive(Default)]
struct Notices {
    truncated: Option<(u64, u64)>,
}

struct NoticeSink(Arc<Mutex<Notices>>);

impl ViewSink for NoticeSink {
    fn truncated(&mut self, total: u64, cap: u64) {
        self.0.lock().truncated = Some((total, cap));
    }
}

struct StorageSession {
    handle: EngineHandle,
    model: DisplayModel,
    trigger: Arc<RefreshTrigger<StorageFilter>>,
    notices: Arc<Mutex<Notices>>,
    quiet: Duration,
}

impl StorageSession {
    fn open(
        client: Arc<MemoryQueryClient>,
        config: &PortholeConfig,
        tree_mode: bool,
        key: SortKey,
        order: SortOrder,
    ) -> StorageSession {
        let tuning = config.storages_tuning();
        let trigger = Arc::new(RefreshTrigger::new(TriggerTuning {
            settle: tuning.settle,
            poll: tuning.poll,
            page_size: config.page_size,
        }));
        let mut state = ViewState::for_view(ViewKind::Storages);
        state.sort_key = key;
        state.sort_order = order;
        state.tree_mode = tree_mode;
        let view = ViewStateHandle::new(state);
        let handle = spawn_storages(
            client.clone(),
            Arc::clone(&trigger),
            view.clone(),
            EngineTuning::from_config(config),
        );
        let checked = Arc::new(CheckSet::new(client, config.selection_chunk));
        let notices = Arc::new(Mutex::new(Notices::default()));
        let model = DisplayModel::new(
            ViewKind::Storages,
            config.page_size,
            config.display_cap,
            view,
            trigger.clone(),
            checked,
            Box::new(NoticeSink(Arc::clone(&notices))),
        );
        StorageSession {
            handle,
            model,
            trigger,
            notices,
            quiet: tuning.settle + Duration::from_millis(600),
        }
    }

    async fn sync(&mut self, filter: StorageFilter) {
        self.trigger.request_full_refresh(filter, true);
        pump(&mut self.handle, &mut self.model, self.quiet).await;
    }

    async fn settle(&mut self) {
        pump(&mut self.handle, &mut self.model, self.quiet).await;
    }

    async fn materialize(&mut self) {
        materialize(&mut self.handle, &mut self.model, self.quiet).await;
    }

    /// Expand the tree level by level: jobs first, then their entities.
    async fn expand_to_depth(&mut self, depth: u32) {
        for _ in 0..depth {
            let next: Vec<NodeId> = self
                .model
                .tree_rows()
                .iter()
                .filter(|v| !v.node.expanded && expandable(&v.node.row))
                .map(|v| v.node.row.id())
                .collect();
            if next.is_empty() {
                break;
            }
            for id in next {
                self.model.expand(id);
            }
            self.settle().await;
        }
    }

    async fn close(self) {
        self.handle.shutdown().await;
    }
}

struct EntrySession {
    handle: EngineHandle,
    model: DisplayModel,
    trigger: Arc<RefreshTrigger<EntryFilter>>,
    notices: Arc<Mutex<Notices>>,
    quiet: Duration,
}

impl EntrySession {
    fn open(
        client: Arc<MemoryQueryClient>,
        config: &PortholeConfig,
        key: SortKey,
        order: SortOrder,
    ) -> EntrySession {
        let tuning = config.entries_tuning();
        let trigger = Arc::new(RefreshTrigger::new(TriggerTuning {
            settle: tuning.settle,
            poll: tuning.poll,
            page_size: config.page_size,
        }));
        let mut state = ViewState::for_view(ViewKind::Entries);
        state.sort_key = key;
        state.sort_order = order;
        let view = ViewStateHandle::new(state);
        let handle = spawn_entries(
            client.clone(),
            Arc::clone(&trigger),
            view.clone(),
            EngineTuning::from_config(config),
        );
        let checked = Arc::new(CheckSet::new(client, config.selection_chunk));
        let notices = Arc::new(Mutex::new(Notices::default()));
        let model = DisplayModel::new(
            ViewKind::Entries,
            config.page_size,
            config.display_cap,
            view,
            trigger.clone(),
            checked,
            Box::new(NoticeSink(Arc::clone(&notices))),
        );
        EntrySession {
            handle,
            model,
            trigger,
            notices,
            quiet: tuning.settle + Duration::from_millis(600),
        }
    }

    async fn sync(&mut self, filter: EntryFilter) {
        self.trigger.request_full_refresh(filter, true);
        pump(&mut self.handle, &mut self.model, self.quiet).await;
    }

    async fn settle(&mut self) {
        pump(&mut self.handle, &mut self.model, self.quiet).await;
    }

    async fn materialize(&mut self) {
        materialize(&mut self.handle, &mut self.model, self.quiet).await;
    }

    async fn close(self) {
        self.handle.shutdown().await;
    }
}

/// Apply engine events to the model until the stream stays quiet for one
/// settle-sized window.
async fn pump(handle: &mut EngineHandle, model: &mut DisplayModel, quiet: Duration) {
    let deadline = Instant::now() + quiet * 4;
    let mut applied = false;
    loop {
        match timeout(quiet, handle.next_event()).await {
            Ok(Some(event)) => {
                model.apply(event);
                applied = true;
            }
            Ok(None) => return,
            Err(_) => {
                if applied || Instant::now() >= deadline {
                    return;
                }
            }
        }
    }
}

/// Fetch every missing page of the flat view.
async fn materialize(handle: &mut EngineHandle, model: &mut DisplayModel, quiet: Duration) {
    for _ in 0..4 {
        let complete = {
            let len = model.display_len();
            model.rows_in(0..len).len() as u64 == len
        };
        if complete {
            return;
        }
        pump(handle, model, quiet).await;
    }
}

fn expandable(row: &IndexRow) -> bool {
    matches!(row.kind(), NodeKind::Uuid | NodeKind::Entity)
}

#[allow(clippy::too_many_arguments)]
async fn cmd_storages(
    client: Arc<MemoryQueryClient>,
    config: &PortholeConfig,
    filter: StorageFilter,
    key: SortKey,
    order: SortOrder,
    flat: bool,
    depth: u32,
    page: u64,
    format: &str,
) -> anyhow::Result<String> {
    let json_output = is_json(format)?;
    let mut session = StorageSession::open(client, config, !flat, key, order);
    session.sync(filter).await;

    let output = if flat {
        let start = page * config.page_size;
        let end = start + config.page_size;
        {
            let _ = session.model.rows_in(start..end);
        }
        session.settle().await;
        if json_output {
            flat_json(&session.model, page, start..end, None)?
        } else {
            format_storage_table_text(&session.model, &session.notices.lock(), page, start..end, None)
        }
    } else {
        session.expand_to_depth(depth).await;
        if json_output {
            tree_json(&session.model)?
        } else {
            format_storage_tree_text(&session.model, &session.notices.lock())
        }
    };
    session.close().await;
    Ok(output)
}

#[allow(clippy::too_many_arguments)]
async fn cmd_entries(
    client: Arc<MemoryQueryClient>,
    config: &PortholeConfig,
    filter: EntryFilter,
    key: SortKey,
    order: SortOrder,
    page: u64,
    fragments: bool,
    format: &str,
) -> anyhow::Result<String> {
    let json_output = is_json(format)?;
    let mut session = EntrySession::open(Arc::clone(&client), config, key, order);
    session.sync(filter).await;

    let start = page * config.page_size;
    let end = start + config.page_size;
    {
        let _ = session.model.rows_in(start..end);
    }
    session.settle().await;

    let mut fragment_counts: HashMap<NodeId, u64> = HashMap::new();
    if fragments {
        let ids: Vec<NodeId> = session
            .model
            .rows_in(start..end)
            .iter()
            .map(|r| r.id())
            .collect();
        for id in ids {
            if let Ok(count) = fragment_count(client.as_ref(), id).await {
                fragment_counts.insert(id, count);
            }
        }
    }

    let output = if json_output {
        flat_json(&session.model, page, start..end, fragments.then_some(&fragment_counts))?
    } else {
        format_entries_text(
            &session.model,
            &session.notices.lock(),
            page,
            start..end,
            fragments.then_some(&fragment_counts),
        )
    };
    session.close().await;
    Ok(output)
}

async fn cmd_select(
    client: Arc<MemoryQueryClient>,
    config: &PortholeConfig,
    filter: StorageFilter,
    clear: bool,
    format: &str,
) -> anyhow::Result<String> {
    let json_output = is_json(format)?;
    let mut session = StorageSession::open(client, config, false, SortKey::Name, SortOrder::Ascending);
    session.sync(filter).await;
    session.materialize().await;

    if clear {
        session.model.checked().clear().await?;
    } else {
        let ids: Vec<NodeId> = session
            .model
            .rows_in(0..session.model.display_len())
            .iter()
            .map(|r| r.id())
            .collect();
        session.model.checked().set_many(&ids, true).await?;
    }
    let selection = session.model.checked().remote_selection().await?;

    let output = if json_output {
        let mut value = flat_json_value(&session.model, 0, 0..session.model.display_len(), None);
        value["selection"] = json!(selection.iter().map(|id| id.raw()).collect::<Vec<_>>());
        serde_json::to_string_pretty(&value)?
    } else {
        let mut out = format_storage_table_text(
            &session.model,
            &session.notices.lock(),
            0,
            0..session.model.display_len(),
            Some(session.model.checked()),
        );
        out.push_str(&format!("Selected: {} rows on the server.\n", selection.len()));
        out
    };
    session.close().await;
    Ok(output)
}

/// Select everything the filter matches and hand back the session plus the
/// operations facade.
async fn select_for_ops(
    client: Arc<MemoryQueryClient>,
    config: &PortholeConfig,
    filter: StorageFilter,
) -> anyhow::Result<(StorageSession, BulkOps)> {
    let mut session =
        StorageSession::open(Arc::clone(&client), config, false, SortKey::Name, SortOrder::Ascending);
    session.sync(filter).await;
    session.materialize().await;
    let ids: Vec<NodeId> = session
        .model
        .rows_in(0..session.model.display_len())
        .iter()
        .map(|r| r.id())
        .collect();
    session.model.checked().set_many(&ids, true).await?;
    let ops = BulkOps::new(
        client,
        Arc::clone(session.model.checked()),
        session.handle.trigger(),
        session.handle.event_sender(),
        config.confirm_threshold,
    );
    Ok((session, ops))
}

async fn cmd_assign(
    client: Arc<MemoryQueryClient>,
    config: &PortholeConfig,
    filter: StorageFilter,
    entity: NodeId,
    ignore_errors: bool,
    format: &str,
) -> anyhow::Result<String> {
    let json_output = is_json(format)?;
    let (mut session, ops) = select_for_ops(client, config, filter).await?;
    let outcome = ops.assign(entity, ignore_errors).await?;
    session.settle().await;

    let output = if json_output {
        outcome_json("assign", &outcome)?
    } else {
        let mut out = format_outcome_text("Assigned", &outcome);
        out.push('\n');
        out.push_str(&format_storage_table_text(
            &session.model,
            &session.notices.lock(),
            0,
            0..session.model.display_len(),
            None,
        ));
        out
    };
    session.close().await;
    Ok(output)
}

async fn cmd_refresh(
    client: Arc<MemoryQueryClient>,
    config: &PortholeConfig,
    filter: StorageFilter,
    ignore_errors: bool,
    format: &str,
) -> anyhow::Result<String> {
    let json_output = is_json(format)?;
    let (mut session, ops) = select_for_ops(client, config, filter).await?;
    let outcome = ops.refresh_selected(ignore_errors).await?;
    session.settle().await;

    let output = if json_output {
        outcome_json("refresh", &outcome)?
    } else {
        let mut out = format_outcome_text("Requested re-index of", &outcome);
        out.push('\n');
        out.push_str(&format_storage_table_text(
            &session.model,
            &session.notices.lock(),
            0,
            0..session.model.display_len(),
            None,
        ));
        out
    };
    session.close().await;
    Ok(output)
}

async fn cmd_delete(
    client: Arc<MemoryQueryClient>,
    config: &PortholeConfig,
    filter: StorageFilter,
    yes: bool,
    ignore_errors: bool,
    format: &str,
) -> anyhow::Result<String> {
    let json_output = is_json(format)?;
    let (mut session, ops) = select_for_ops(client, config, filter).await?;

    let count = session.model.checked().len();
    if count == 0 {
        session.close().await;
        return Ok("Nothing matched; no archives deleted.".to_string());
    }
    if !yes && ops.needs_confirmation(count) {
        use dialoguer::Confirm;
        let confirmed = Confirm::new()
            .with_prompt(format!("Delete {} selected archives?", count))
            .interact()
            .map_err(|e| anyhow!("failed to get user input: {}", e))?;
        if !confirmed {
            session.close().await;
            return Ok("Deletion cancelled".to_string());
        }
    }

    let outcome = ops.delete_selected(ignore_errors).await?;
    session.settle().await;

    let output = if json_output {
        outcome_json("delete", &outcome)?
    } else {
        let mut out = format_outcome_text("Deleted", &outcome);
        out.push('\n');
        out.push_str(&format_storage_table_text(
            &session.model,
            &session.notices.lock(),
            0,
            0..session.model.display_len(),
            None,
        ));
        out
    };
    session.close().await;
    Ok(output)
}

async fn cmd_restore(
    client: Arc<MemoryQueryClient>,
    config: &PortholeConfig,
    filter: EntryFilter,
    dest: &str,
    ignore_errors: bool,
    format: &str,
) -> anyhow::Result<String> {
    let json_output = is_json(format)?;
    let mut session =
        EntrySession::open(Arc::clone(&client), config, SortKey::Name, SortOrder::Ascending);
    session.sync(filter).await;
    session.materialize().await;

    let ids: Vec<NodeId> = session
        .model
        .rows_in(0..session.model.display_len())
        .iter()
        .map(|r| r.id())
        .collect();
    session.model.checked().set_many(&ids, true).await?;
    let ops = BulkOps::new(
        client,
        Arc::clone(session.model.checked()),
        session.handle.trigger(),
        session.handle.event_sender(),
        config.confirm_threshold,
    );
    let outcome = ops.restore_selected(dest, ignore_errors).await?;

    let output = if json_output {
        outcome_json("restore", &outcome)?
    } else {
        let mut out = format_outcome_text("Restored", &outcome);
        out.push_str(&format!("Destination: {}\n", dest));
        out
    };
    session.close().await;
    Ok(output)
}

async fn cmd_watch(
    client: Arc<MemoryQueryClient>,
    config: &PortholeConfig,
    cycles: u32,
) -> anyhow::Result<String> {
    let mut session = StorageSession::open(
        Arc::clone(&client),
        config,
        false,
        SortKey::Created,
        SortOrder::Descending,
    );
    session.sync(StorageFilter::default()).await;

    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Watch")));
    out.push_str(&format!(
        "cycle 0: {} archives, {}\n",
        session.model.total(),
        format_size(session.model.total_size())
    ));

    for cycle in 1..=cycles {
        client.alter(|index| {
            let entity = index.entities.first().map(|e| e.id);
            if let Some(entity) = entity {
                index.storages.push(StorageRecord {
                    id: NodeId::compose(NodeKind::Storage, 9000 + cycle as i64),
                    entity,
                    name: format!("drift-{:03}.vma", cycle),
                    created: DateTime::from_timestamp(1_700_500_000 + cycle as i64 * 3600, 0),
                    total_size: 5 * MIB,
                    total_entry_count: 3,
                    total_entry_size: 5 * MIB,
                    state: IndexState::Create,
                });
            }
        });
        session.trigger.request_immediate_refresh();
        session.settle().await;
        out.push_str(&format!(
            "cycle {}: {} archives, {}\n",
            cycle,
            session.model.total(),
            format_size(session.model.total_size())
        ));
    }
    session.close().await;
    Ok(out)
}

const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;

/// The demo dataset: two jobs, an orphaned archive, mixed states and entry
/// types, one fragmented entry.
fn demo_index() -> MemoryQueryClient {
    MemoryIndexBuilder::new()
        .job("atlas")
        .entity(1_696_118_400)
        .storage("atlas-2023-10-01-full.vma", 1_696_120_000, 48 * GIB, 1_204_211, IndexState::Ok)
        .entry("/boot/vmlinuz", EntryType::File, 12 * MIB)
        .entry("/etc", EntryType::Directory, 0)
        .entry("/home/ada/thesis.pdf", EntryType::File, 9 * MIB)
        .fragments(2)
        .entity(1_698_796_800)
        .storage("atlas-2023-11-01-full.vma", 1_698_800_000, 52 * GIB, 1_221_340, IndexState::Ok)
        .entry("/boot/vmlinuz", EntryType::File, 12 * MIB)
        .entry("/home/ada/photos/eclipse.raw", EntryType::Image, 310 * MIB)
        .storage("atlas-2023-11-01-incr.vma", 1_698_810_000, 3 * GIB, 40_112, IndexState::Update)
        .entry("/var/log/syslog", EntryType::File, 48 * MIB)
        .job("borealis")
        .entity(1_699_401_600)
        .storage("borealis-db-2023-11-08.dump", 1_699_403_000, 17 * GIB, 88, IndexState::Ok)
        .entry("/srv/db/cluster.tar", EntryType::File, 17 * GIB)
        .fragments(5)
        .entry("/srv/db/wal", EntryType::Directory, 0)
        .storage("borealis-db-2023-11-09.dump", 1_699_489_400, 17 * GIB + 300 * MIB, 91, IndexState::Error)
        .entry("/srv/db/cluster.tar", EntryType::File, 17 * GIB)
        .orphans()
        .entity(1_690_000_000)
        .storage("legacy-host-2023-07.img", 1_690_000_500, 9 * GIB, 1, IndexState::Unknown)
        .entry("/disk0.img", EntryType::Image, 9 * GIB)
        .build()
}

/// Format a section heading with bold/underline. Respects NO_COLOR and TTY.
fn format_section_heading(title: &str) -> String {
    format!("{}", title.bold().underline())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn format_created(created: Option<DateTime<Utc>>) -> String {
    created
        .map(|c| c.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_state(state: Option<IndexState>) -> String {
    state
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_truncation(notices: &Notices) -> String {
    match notices.truncated {
        Some((total, cap)) => format!(
            "{}\n",
            format!("Showing the first {} of {} rows.", cap, total).yellow()
        ),
        None => String::new(),
    }
}

fn format_storage_tree_text(model: &DisplayModel, notices: &Notices) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Storages")));
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["ID", "Name", "Created", "Size", "Entries", "State"]);
    for visible in model.tree_rows() {
        let row = &visible.node.row;
        table.add_row(vec![
            row.id().raw().to_string(),
            format!("{}{}", "  ".repeat(visible.depth), row.name()),
            format_created(row.created()),
            format_size(row.total_size()),
            row.entry_count().to_string(),
            format_state(row.state()),
        ]);
    }
    out.push_str(&format!("{}\n\n", table));
    out.push_str(&format!(
        "Total: {} archives, {}.\n",
        model.total(),
        format_size(model.total_size())
    ));
    out.push_str(&format_truncation(notices));
    out
}

fn format_storage_table_text(
    model: &DisplayModel,
    notices: &Notices,
    page: u64,
    range: std::ops::Range<u64>,
    checked: Option<&Arc<CheckSet>>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Storages")));
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    let mut header = vec!["ID", "Name", "Created", "Size", "Entries", "State"];
    if checked.is_some() {
        header.insert(0, "Sel");
    }
    table.set_header(header);
    for row in model.rows_in(range) {
        let mut cells = vec![
            row.id().raw().to_string(),
            row.name().to_string(),
            format_created(row.created()),
            format_size(row.total_size()),
            row.entry_count().to_string(),
            format_state(row.state()),
        ];
        if let Some(checked) = checked {
            let mark = if checked.is_checked(row.id()) { "[x]" } else { "[ ]" };
            cells.insert(0, mark.to_string());
        }
        table.add_row(cells);
    }
    out.push_str(&format!("{}\n\n", table));
    out.push_str(&format!(
        "Page {}. Total: {} archives, {}.\n",
        page,
        model.total(),
        format_size(model.total_size())
    ));
    out.push_str(&format_truncation(notices));
    out
}

fn format_entries_text(
    model: &DisplayModel,
    notices: &Notices,
    page: u64,
    range: std::ops::Range<u64>,
    fragments: Option<&HashMap<NodeId, u64>>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Entries")));
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    let mut header = vec!["ID", "Name", "Type", "Size", "Created"];
    if fragments.is_some() {
        header.push("Fragments");
    }
    table.set_header(header);
    for row in model.rows_in(range) {
        let entry_type = match row {
            IndexRow::Entry(e) => e.entry_type.as_str().to_string(),
            _ => "-".to_string(),
        };
        let mut cells = vec![
            row.id().raw().to_string(),
            row.name().to_string(),
            entry_type,
            format_size(row.total_size()),
            format_created(row.created()),
        ];
        if let Some(fragments) = fragments {
            cells.push(
                fragments
                    .get(&row.id())
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            );
        }
        table.add_row(cells);
    }
    out.push_str(&format!("{}\n\n", table));
    out.push_str(&format!(
        "Page {}. Total: {} entries, {}.\n",
        page,
        model.total(),
        format_size(model.total_size())
    ));
    out.push_str(&format_truncation(notices));
    out
}

fn format_outcome_text(action: &str, outcome: &BulkOutcome) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{} {} of {} selected rows.\n",
        action,
        outcome.succeeded.len(),
        outcome.attempted
    ));
    if !outcome.failures.is_empty() {
        out.push_str(&format!(
            "{}\n",
            format!("{} failures:", outcome.failures.len()).red()
        ));
        for (id, message) in &outcome.failures {
            out.push_str(&format!("  {}: {}\n", id, message));
        }
    }
    out
}

fn level_name(row: &IndexRow) -> &'static str {
    match row {
        IndexRow::Uuid(_) => "job",
        IndexRow::Entity(_) => "entity",
        IndexRow::Storage(_) => "storage",
        IndexRow::Entry(_) => "entry",
    }
}

fn row_json(row: &IndexRow) -> serde_json::Value {
    let mut value = json!({
        "id": row.id().raw(),
        "level": level_name(row),
        "name": row.name(),
        "size": row.total_size(),
        "entries": row.entry_count(),
    });
    if let Some(created) = row.created() {
        value["created"] = json!(created.to_rfc3339());
    }
    if let Some(state) = row.state() {
        value["state"] = json!(state.as_str());
    }
    if let IndexRow::Entry(e) = row {
        value["type"] = json!(e.entry_type.as_str());
    }
    value
}

fn tree_json(model: &DisplayModel) -> anyhow::Result<String> {
    let rows: Vec<serde_json::Value> = model
        .tree_rows()
        .iter()
        .map(|v| {
            let mut value = row_json(&v.node.row);
            value["depth"] = json!(v.depth);
            value
        })
        .collect();
    let value = json!({
        "total": model.total(),
        "totalSize": model.total_size(),
        "rows": rows,
    });
    Ok(serde_json::to_string_pretty(&value)?)
}

fn flat_json_value(
    model: &DisplayModel,
    page: u64,
    range: std::ops::Range<u64>,
    fragments: Option<&HashMap<NodeId, u64>>,
) -> serde_json::Value {
    let rows: Vec<serde_json::Value> = model
        .rows_in(range)
        .iter()
        .map(|row| {
            let mut value = row_json(row);
            if let Some(fragments) = fragments {
                if let Some(count) = fragments.get(&row.id()) {
                    value["fragments"] = json!(count);
                }
            }
            value
        })
        .collect();
    json!({
        "total": model.total(),
        "totalSize": model.total_size(),
        "page": page,
        "rows": rows,
    })
}

fn flat_json(
    model: &DisplayModel,
    page: u64,
    range: std::ops::Range<u64>,
    fragments: Option<&HashMap<NodeId, u64>>,
) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&flat_json_value(
        model, page, range, fragments,
    ))?)
}

fn outcome_json(action: &str, outcome: &BulkOutcome) -> anyhow::Result<String> {
    let value = json!({
        "action": action,
        "attempted": outcome.attempted,
        "succeeded": outcome.succeeded.iter().map(|id| id.raw()).collect::<Vec<_>>(),
        "failures": outcome
            .failures
            .iter()
            .map(|(id, message)| json!({ "id": id.raw(), "error": message }))
            .collect::<Vec<_>>(),
    });
    Ok(serde_json::to_string_pretty(&value)?)
}
