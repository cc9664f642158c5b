//! Per-view query filters.
//!
//! Each view owns an independent filter. Filters are cheap value snapshots
//! compared with `==` so the refresh trigger can drop no-op updates when the
//! user retypes the same text.

use crate::types::{EntryType, IndexState, NodeId};

/// Which index states a storage query includes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StateFilter {
    #[default]
    Any,
    Only(Vec<IndexState>),
}

impl StateFilter {
    pub fn render(&self) -> String {
        match self {
            StateFilter::Any => "*".to_string(),
            StateFilter::Only(states) => states
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    pub fn matches(&self, state: IndexState) -> bool {
        match self {
            StateFilter::Any => true,
            StateFilter::Only(states) => states.contains(&state),
        }
    }

    /// Parse a `*` or comma-separated state list, as typed on a command line.
    pub fn parse(s: &str) -> Result<StateFilter, String> {
        let s = s.trim();
        if s == "*" || s.eq_ignore_ascii_case("any") {
            return Ok(StateFilter::Any);
        }
        let mut states = Vec::new();
        for token in s.split(',') {
            let state: IndexState = token
                .trim()
                .parse()
                .map_err(|_| format!("unknown index state '{}'", token.trim()))?;
            states.push(state);
        }
        Ok(StateFilter::Only(states))
    }
}

/// Which entry types an entry query includes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EntryTypeFilter {
    #[default]
    Any,
    Only(Vec<EntryType>),
}

impl EntryTypeFilter {
    pub fn render(&self) -> String {
        match self {
            EntryTypeFilter::Any => "*".to_string(),
            EntryTypeFilter::Only(types) => types
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    pub fn matches(&self, entry_type: EntryType) -> bool {
        match self {
            EntryTypeFilter::Any => true,
            EntryTypeFilter::Only(types) => types.contains(&entry_type),
        }
    }

    pub fn parse(s: &str) -> Result<EntryTypeFilter, String> {
        let s = s.trim();
        if s == "*" || s.eq_ignore_ascii_case("any") {
            return Ok(EntryTypeFilter::Any);
        }
        let mut types = Vec::new();
        for token in s.split(',') {
            let t: EntryType = token
                .trim()
                .parse()
                .map_err(|_| format!("unknown entry type '{}'", token.trim()))?;
            types.push(t);
        }
        Ok(EntryTypeFilter::Only(types))
    }
}

/// Restricts the storage view to one job's archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobScope {
    #[default]
    All,
    Job(NodeId),
}

impl JobScope {
    pub fn id(&self) -> Option<NodeId> {
        match self {
            JobScope::All => None,
            JobScope::Job(id) => Some(*id),
        }
    }
}

/// Filter for the hierarchical storage view and its flat table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StorageFilter {
    pub pattern: String,
    pub states: StateFilter,
    pub job: JobScope,
    pub newest_only: bool,
}

/// Filter for the flat entry view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntryFilter {
    pub pattern: String,
    pub entry_types: EntryTypeFilter,
    pub newest_only: bool,
}

/// A pattern shorter than the minimum is queried as empty so a half-typed
/// filter does not fan out into overly broad remote work. The threshold is a
/// tunable, not a contract.
fn effective(pattern: &str, min_len: usize) -> &str {
    if pattern.is_empty() || pattern.chars().count() >= min_len {
        pattern
    } else {
        ""
    }
}

impl StorageFilter {
    pub fn effective_pattern(&self, min_len: usize) -> &str {
        effective(&self.pattern, min_len)
    }
}

impl EntryFilter {
    pub fn effective_pattern(&self, min_len: usize) -> &str {
        effective(&self.pattern, min_len)
    }
}
