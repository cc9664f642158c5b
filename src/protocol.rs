//! Wire command formatting and result-row parsing.
//!
//! The remote index service speaks a line-oriented text protocol: a command
//! is a verb followed by `key=value` arguments, a result is a stream of
//! `key=value` rows. The synchronizer treats the vocabulary as opaque beyond
//! this formatting layer; the verbs and field names live in [`commands`] so
//! every query site builds them the same way.
//!
//! String values are single-quoted with backslash escaping. Numbers, booleans
//! (`yes`/`no`), id lists and filter token sets are rendered bare.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::ProtocolError;
use crate::filter::{EntryFilter, StorageFilter};
use crate::types::{EntryType, IndexState, NodeId, SortKey, SortOrder};

/// A typed command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Int(i64),
    UInt(u64),
    Bool(bool),
    Text(String),
    /// Pre-joined filter tokens such as `OK,ERROR` or `*`, rendered unquoted.
    Tokens(String),
    Ids(Vec<i64>),
}

impl ArgValue {
    fn render(&self) -> String {
        match self {
            ArgValue::Int(v) => v.to_string(),
            ArgValue::UInt(v) => v.to_string(),
            ArgValue::Bool(true) => "yes".to_string(),
            ArgValue::Bool(false) => "no".to_string(),
            ArgValue::Text(s) => quote(s),
            ArgValue::Tokens(s) => s.clone(),
            ArgValue::Ids(ids) => ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<u64> for ArgValue {
    fn from(v: u64) -> Self {
        ArgValue::UInt(v)
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Text(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Text(v)
    }
}

/// A command under construction. Arguments render in insertion order so the
/// formatted text is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    verb: &'static str,
    args: Vec<(&'static str, ArgValue)>,
}

impl Command {
    pub fn new(verb: &'static str) -> Command {
        Command {
            verb,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, key: &'static str, value: impl Into<ArgValue>) -> Command {
        self.args.push((key, value.into()));
        self
    }

    pub fn verb(&self) -> &'static str {
        self.verb
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.args
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(ArgValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key) {
            Some(ArgValue::UInt(v)) => Some(*v),
            Some(ArgValue::Int(v)) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(ArgValue::Int(v)) => Some(*v),
            Some(ArgValue::UInt(v)) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(ArgValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_ids(&self, key: &str) -> Option<&[i64]> {
        match self.get(key) {
            Some(ArgValue::Ids(ids)) => Some(ids),
            _ => None,
        }
    }

    pub fn get_tokens(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(ArgValue::Tokens(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Render the command to its wire form.
    pub fn render(&self) -> String {
        let mut out = String::from(self.verb);
        for (key, value) in &self.args {
            out.push(' ');
            out.push_str(key);
            out.push('=');
            out.push_str(&value.render());
        }
        out
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// One parsed result row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: BTreeMap<String, String>,
}

impl Row {
    pub fn new() -> Row {
        Row::default()
    }

    /// Builder-style field insertion, used by backends constructing rows
    /// directly instead of formatting text.
    pub fn field(mut self, key: &str, value: impl ToString) -> Row {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    /// Parse a `key=value key2='quoted'` line.
    pub fn parse(line: &str) -> Result<Row, ProtocolError> {
        let mut fields = BTreeMap::new();
        let mut chars = line.chars().peekable();

        loop {
            while matches!(chars.peek(), Some(' ')) {
                chars.next();
            }
            if chars.peek().is_none() {
                break;
            }

            let mut key = String::new();
            loop {
                match chars.next() {
                    Some('=') => break,
                    Some(c) if c != ' ' => key.push(c),
                    _ => {
                        return Err(ProtocolError::Malformed {
                            field: "row",
                            value: line.to_string(),
                        })
                    }
                }
            }

            let mut value = String::new();
            if matches!(chars.peek(), Some('\'')) {
                chars.next();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(c) => value.push(c),
                            None => {
                                return Err(ProtocolError::Malformed {
                                    field: "row",
                                    value: line.to_string(),
                                })
                            }
                        },
                        Some('\'') => break,
                        Some(c) => value.push(c),
                        None => {
                            return Err(ProtocolError::Malformed {
                                field: "row",
                                value: line.to_string(),
                            })
                        }
                    }
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ' ' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }

            fields.insert(key, value);
        }

        Ok(Row { fields })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn require(&self, field: &'static str) -> Result<&str, ProtocolError> {
        self.get(field)
            .ok_or(ProtocolError::MissingField { field })
    }

    pub fn get_i64(&self, field: &'static str) -> Result<i64, ProtocolError> {
        let raw = self.require(field)?;
        raw.parse().map_err(|_| ProtocolError::Malformed {
            field,
            value: raw.to_string(),
        })
    }

    pub fn get_u64(&self, field: &'static str) -> Result<u64, ProtocolError> {
        let raw = self.require(field)?;
        raw.parse().map_err(|_| ProtocolError::Malformed {
            field,
            value: raw.to_string(),
        })
    }

    pub fn opt_u64(&self, field: &'static str) -> Result<Option<u64>, ProtocolError> {
        match self.get(field) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| ProtocolError::Malformed {
                field,
                value: raw.to_string(),
            }),
        }
    }

    pub fn get_id(&self, field: &'static str) -> Result<NodeId, ProtocolError> {
        Ok(NodeId::from_raw(self.get_i64(field)?))
    }

    pub fn get_state(&self, field: &'static str) -> Result<IndexState, ProtocolError> {
        Ok(IndexState::from_wire(self.require(field)?))
    }

    pub fn get_entry_type(&self, field: &'static str) -> Result<EntryType, ProtocolError> {
        let raw = self.require(field)?;
        raw.parse().map_err(|_| ProtocolError::Malformed {
            field,
            value: raw.to_string(),
        })
    }

    /// Render the row back to its wire form, fields in key order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.fields {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(key);
            out.push('=');
            let bare = !value.is_empty()
                && !value.contains(' ')
                && !value.contains('\'')
                && !value.contains('\\');
            if bare {
                out.push_str(value);
            } else {
                out.push_str(&quote(value));
            }
        }
        out
    }
}

/// Command builders for every verb the synchronizer issues.
pub mod commands {
    use super::*;

    fn sort_args(cmd: Command, key: SortKey, order: SortOrder) -> Command {
        cmd.arg("sortMode", key.as_str()).arg("ordering", order.as_str())
    }

    fn storage_filter_args(cmd: Command, filter: &StorageFilter, min_pattern: usize) -> Command {
        let mut cmd = cmd
            .arg("pattern", filter.effective_pattern(min_pattern))
            .arg("indexStateSet", ArgValue::Tokens(filter.states.render()));
        if let Some(job) = filter.job.id() {
            cmd = cmd.arg("jobId", job.raw());
        }
        cmd.arg("newestOnly", filter.newest_only)
    }

    fn entry_filter_args(cmd: Command, filter: &EntryFilter, min_pattern: usize) -> Command {
        cmd.arg("pattern", filter.effective_pattern(min_pattern))
            .arg("entryTypeSet", ArgValue::Tokens(filter.entry_types.render()))
            .arg("newestOnly", filter.newest_only)
    }

    /// Top-level job rows of the hierarchy.
    pub fn uuid_list(
        filter: &StorageFilter,
        min_pattern: usize,
        key: SortKey,
        order: SortOrder,
    ) -> Command {
        let cmd = storage_filter_args(Command::new("INDEX_UUID_LIST"), filter, min_pattern);
        sort_args(cmd, key, order)
    }

    /// Entity rows under one job.
    pub fn entity_list(
        job: NodeId,
        filter: &StorageFilter,
        min_pattern: usize,
        key: SortKey,
        order: SortOrder,
    ) -> Command {
        let cmd = Command::new("INDEX_ENTITY_LIST").arg("jobId", job.raw());
        let cmd = storage_filter_args(cmd, filter, min_pattern);
        sort_args(cmd, key, order)
    }

    /// Storage rows under one entity.
    pub fn storage_children(
        entity: NodeId,
        filter: &StorageFilter,
        min_pattern: usize,
        key: SortKey,
        order: SortOrder,
    ) -> Command {
        let cmd = Command::new("INDEX_STORAGE_LIST").arg("entityId", entity.raw());
        let cmd = storage_filter_args(cmd, filter, min_pattern);
        sort_args(cmd, key, order)
    }

    /// One page of the flat storage table.
    pub fn storage_page(
        filter: &StorageFilter,
        min_pattern: usize,
        key: SortKey,
        order: SortOrder,
        offset: u64,
        limit: u64,
    ) -> Command {
        let cmd = storage_filter_args(Command::new("INDEX_STORAGE_LIST"), filter, min_pattern);
        sort_args(cmd, key, order)
            .arg("offset", offset)
            .arg("limit", limit)
    }

    /// Aggregate count and size for the storage filter.
    pub fn storage_count(filter: &StorageFilter, min_pattern: usize) -> Command {
        storage_filter_args(Command::new("INDEX_STORAGE_COUNT"), filter, min_pattern)
    }

    /// One page of the flat entry table.
    pub fn entry_page(
        filter: &EntryFilter,
        min_pattern: usize,
        key: SortKey,
        order: SortOrder,
        offset: u64,
        limit: u64,
    ) -> Command {
        let cmd = entry_filter_args(Command::new("INDEX_ENTRY_LIST"), filter, min_pattern);
        sort_args(cmd, key, order)
            .arg("offset", offset)
            .arg("limit", limit)
    }

    /// Aggregate count and size for the entry filter.
    pub fn entry_count(filter: &EntryFilter, min_pattern: usize) -> Command {
        entry_filter_args(Command::new("INDEX_ENTRY_COUNT"), filter, min_pattern)
    }

    /// Fragment count of one entry, fetched lazily for display.
    pub fn entry_fragments(entry: NodeId) -> Command {
        Command::new("INDEX_ENTRY_FRAGMENTS").arg("entryId", entry.raw())
    }

    pub fn selection_add(ids: &[NodeId]) -> Command {
        Command::new("SELECTION_ADD").arg_ids(ids)
    }

    pub fn selection_remove(ids: &[NodeId]) -> Command {
        Command::new("SELECTION_REMOVE").arg_ids(ids)
    }

    pub fn selection_clear() -> Command {
        Command::new("SELECTION_CLEAR")
    }

    pub fn selection_list() -> Command {
        Command::new("SELECTION_LIST")
    }

    /// Move one storage under a different entity.
    pub fn index_assign(storage: NodeId, entity: NodeId) -> Command {
        Command::new("INDEX_ASSIGN")
            .arg("storageId", storage.raw())
            .arg("entityId", entity.raw())
    }

    /// Request a re-index of one storage.
    pub fn index_refresh(storage: NodeId) -> Command {
        Command::new("INDEX_REFRESH").arg("storageId", storage.raw())
    }

    pub fn storage_delete(storage: NodeId) -> Command {
        Command::new("STORAGE_DELETE").arg("storageId", storage.raw())
    }

    pub fn entry_restore(entry: NodeId, destination: &str) -> Command {
        Command::new("ENTRY_RESTORE")
            .arg("entryId", entry.raw())
            .arg("destination", destination)
    }

    impl Command {
        fn arg_ids(self, ids: &[NodeId]) -> Command {
            self.arg(
                "ids",
                ArgValue::Ids(ids.iter().map(|id| id.raw()).collect()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{EntryFilter, EntryTypeFilter, JobScope, StateFilter};

    #[test]
    fn command_renders_in_insertion_order() {
        let cmd = Command::new("INDEX_STORAGE_LIST")
            .arg("offset", 64u64)
            .arg("limit", 32u64)
            .arg("pattern", "backup");
        assert_eq!(
            cmd.render(),
            "INDEX_STORAGE_LIST offset=64 limit=32 pattern='backup'"
        );
    }

    #[test]
    fn strings_are_quoted_and_escaped() {
        let cmd = Command::new("ENTRY_RESTORE").arg("destination", "it's a \\path");
        assert_eq!(
            cmd.render(),
            "ENTRY_RESTORE destination='it\\'s a \\\\path'"
        );
    }

    #[test]
    fn booleans_render_as_yes_no() {
        let cmd = Command::new("X").arg("newestOnly", true).arg("other", false);
        assert_eq!(cmd.render(), "X newestOnly=yes other=no");
    }

    #[test]
    fn id_lists_render_comma_joined() {
        let ids = vec![
            NodeId::compose(crate::types::NodeKind::Storage, 1),
            NodeId::compose(crate::types::NodeKind::Storage, 2),
        ];
        let cmd = commands::selection_add(&ids);
        assert_eq!(cmd.render(), "SELECTION_ADD ids=19,35");
    }

    #[test]
    fn row_parse_handles_quotes_and_escapes() {
        let row = Row::parse("id=35 name='it\\'s here' state=OK").unwrap();
        assert_eq!(row.get("id"), Some("35"));
        assert_eq!(row.get("name"), Some("it's here"));
        assert_eq!(row.get_state("state").unwrap(), IndexState::Ok);
    }

    #[test]
    fn row_parse_rejects_unterminated_quote() {
        assert!(Row::parse("name='oops").is_err());
    }

    #[test]
    fn row_render_parse_round_trip() {
        let row = Row::new()
            .field("id", 35)
            .field("name", "with space'and quote")
            .field("size", 1024);
        let parsed = Row::parse(&row.render()).unwrap();
        assert_eq!(parsed, row);
    }

    #[test]
    fn row_typed_getters_report_field_names() {
        let row = Row::new().field("id", "abc");
        match row.get_i64("id") {
            Err(ProtocolError::Malformed { field, .. }) => assert_eq!(field, "id"),
            other => panic!("unexpected: {:?}", other),
        }
        match row.get_u64("size") {
            Err(ProtocolError::MissingField { field }) => assert_eq!(field, "size"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn storage_page_carries_filter_sort_and_window() {
        let filter = StorageFilter {
            pattern: "backup-2024".to_string(),
            states: StateFilter::Only(vec![IndexState::Ok, IndexState::Error]),
            job: JobScope::All,
            newest_only: false,
        };
        let cmd = commands::storage_page(&filter, 3, SortKey::Created, SortOrder::Descending, 64, 32);
        let text = cmd.render();
        assert!(text.starts_with("INDEX_STORAGE_LIST "));
        assert!(text.contains("pattern='backup-2024'"));
        assert!(text.contains("indexStateSet=OK,ERROR"));
        assert!(text.contains("sortMode=CREATED"));
        assert!(text.contains("ordering=DESCENDING"));
        assert!(text.contains("offset=64"));
        assert!(text.contains("limit=32"));
    }

    #[test]
    fn filter_token_sets_render_unquoted() {
        let filter = EntryFilter {
            pattern: String::new(),
            entry_types: EntryTypeFilter::Only(vec![EntryType::File, EntryType::Image]),
            newest_only: true,
        };
        let cmd = commands::entry_count(&filter, 3);
        assert!(cmd.render().contains("entryTypeSet=FILE,IMAGE"));
        assert_eq!(cmd.get_tokens("entryTypeSet"), Some("FILE,IMAGE"));

        let any = commands::entry_count(&EntryFilter::default(), 3);
        assert!(any.render().contains("entryTypeSet=*"));
    }

    #[test]
    fn short_pattern_is_dropped_from_commands() {
        let filter = StorageFilter {
            pattern: "ab".to_string(),
            ..StorageFilter::default()
        };
        let cmd = commands::storage_count(&filter, 3);
        assert!(cmd.render().contains("pattern=''"));
    }
}
