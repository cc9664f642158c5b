//! Core identifier and vocabulary types shared across the synchronizer.
//!
//! Every displayable row carries a globally unique 64-bit id whose low four
//! bits encode the row kind, so a bare id can always be classified without a
//! lookup. Id 0 is reserved for the synthetic "no job" uuid row that groups
//! storages not attached to any job.

use std::fmt;
use std::str::FromStr;

/// Kind tag carried in the low four bits of a [`NodeId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A job, identified by uuid. Top level of the hierarchy.
    Uuid,
    /// One backup run under a job.
    Entity,
    /// One archive file under an entity.
    Storage,
    /// A flat index entry, tagged with its filesystem type.
    Entry(EntryType),
}

impl NodeKind {
    pub fn tag(self) -> i64 {
        match self {
            NodeKind::Uuid => 1,
            NodeKind::Entity => 2,
            NodeKind::Storage => 3,
            NodeKind::Entry(EntryType::File) => 4,
            NodeKind::Entry(EntryType::Image) => 5,
            NodeKind::Entry(EntryType::Directory) => 6,
            NodeKind::Entry(EntryType::Link) => 7,
            NodeKind::Entry(EntryType::Hardlink) => 8,
            NodeKind::Entry(EntryType::Special) => 9,
        }
    }

    pub fn from_tag(tag: i64) -> Option<NodeKind> {
        match tag {
            1 => Some(NodeKind::Uuid),
            2 => Some(NodeKind::Entity),
            3 => Some(NodeKind::Storage),
            4 => Some(NodeKind::Entry(EntryType::File)),
            5 => Some(NodeKind::Entry(EntryType::Image)),
            6 => Some(NodeKind::Entry(EntryType::Directory)),
            7 => Some(NodeKind::Entry(EntryType::Link)),
            8 => Some(NodeKind::Entry(EntryType::Hardlink)),
            9 => Some(NodeKind::Entry(EntryType::Special)),
            _ => None,
        }
    }

    pub fn is_entry(self) -> bool {
        matches!(self, NodeKind::Entry(_))
    }
}

/// Globally unique row identifier with the kind tag in the low four bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(i64);

impl NodeId {
    /// The synthetic "no job" uuid row. The only id with a zero tag.
    pub const NO_JOB: NodeId = NodeId(0);

    /// Compose an id from a kind and a sequence number.
    pub fn compose(kind: NodeKind, sequence: i64) -> NodeId {
        NodeId((sequence << 4) | kind.tag())
    }

    /// Wrap a raw wire id without validating the tag. Validation happens when
    /// the id is bound to an expected kind during row parsing.
    pub fn from_raw(raw: i64) -> NodeId {
        NodeId(raw)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn sequence(self) -> i64 {
        self.0 >> 4
    }

    /// Decode the kind tag. `None` for the reserved zero id and for tags
    /// outside the known range.
    pub fn kind(self) -> Option<NodeKind> {
        if self.0 == 0 {
            return None;
        }
        NodeKind::from_tag(self.0 & 0xF)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index state of a job, entity, or storage row.
///
/// Transitions are driven by remote confirmation, with one exception: assign
/// and refresh requests optimistically set `UpdateRequested` locally until
/// the next reconciliation reports the authoritative state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexState {
    None,
    Ok,
    Create,
    UpdateRequested,
    Update,
    Error,
    Unknown,
}

impl IndexState {
    /// Lenient wire parse. Unrecognized tokens map to `Unknown` so a newer
    /// server cannot break row parsing by adding states.
    pub fn from_wire(s: &str) -> IndexState {
        s.parse().unwrap_or(IndexState::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IndexState::None => "NONE",
            IndexState::Ok => "OK",
            IndexState::Create => "CREATE",
            IndexState::UpdateRequested => "UPDATE_REQUESTED",
            IndexState::Update => "UPDATE",
            IndexState::Error => "ERROR",
            IndexState::Unknown => "UNKNOWN",
        }
    }
}

impl FromStr for IndexState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(IndexState::None),
            "OK" => Ok(IndexState::Ok),
            "CREATE" => Ok(IndexState::Create),
            "UPDATE_REQUESTED" => Ok(IndexState::UpdateRequested),
            "UPDATE" => Ok(IndexState::Update),
            "ERROR" => Ok(IndexState::Error),
            "UNKNOWN" => Ok(IndexState::Unknown),
            _ => Err(()),
        }
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem type of a flat index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryType {
    File,
    Image,
    Directory,
    Link,
    Hardlink,
    Special,
}

impl EntryType {
    pub const ALL: [EntryType; 6] = [
        EntryType::File,
        EntryType::Image,
        EntryType::Directory,
        EntryType::Link,
        EntryType::Hardlink,
        EntryType::Special,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::File => "FILE",
            EntryType::Image => "IMAGE",
            EntryType::Directory => "DIRECTORY",
            EntryType::Link => "LINK",
            EntryType::Hardlink => "HARDLINK",
            EntryType::Special => "SPECIAL",
        }
    }
}

impl FromStr for EntryType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FILE" => Ok(EntryType::File),
            "IMAGE" => Ok(EntryType::Image),
            "DIRECTORY" => Ok(EntryType::Directory),
            "LINK" => Ok(EntryType::Link),
            "HARDLINK" => Ok(EntryType::Hardlink),
            "SPECIAL" => Ok(EntryType::Special),
            _ => Err(()),
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Active sort column for paged and tree queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortKey {
    Name,
    Created,
    Size,
    State,
}

impl SortKey {
    pub fn as_str(self) -> &'static str {
        match self {
            SortKey::Name => "NAME",
            SortKey::Created => "CREATED",
            SortKey::Size => "SIZE",
            SortKey::State => "STATE",
        }
    }
}

impl FromStr for SortKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NAME" => Ok(SortKey::Name),
            "CREATED" => Ok(SortKey::Created),
            "SIZE" => Ok(SortKey::Size),
            "STATE" => Ok(SortKey::State),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASCENDING",
            SortOrder::Descending => "DESCENDING",
        }
    }
}

/// Which of the two independently synchronized views a component serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Storages,
    Entries,
}

impl ViewKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ViewKind::Storages => "storages",
            ViewKind::Entries => "entries",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_round_trips_kind_and_sequence() {
        let id = NodeId::compose(NodeKind::Storage, 42);
        assert_eq!(id.kind(), Some(NodeKind::Storage));
        assert_eq!(id.sequence(), 42);
        assert_eq!(id.raw(), (42 << 4) | 3);
    }

    #[test]
    fn entry_subtypes_get_distinct_tags() {
        let mut seen = std::collections::HashSet::new();
        for t in EntryType::ALL {
            assert!(seen.insert(NodeKind::Entry(t).tag()));
        }
    }

    #[test]
    fn zero_id_has_no_kind() {
        assert_eq!(NodeId::NO_JOB.kind(), None);
        assert_eq!(NodeId::NO_JOB.raw(), 0);
    }

    #[test]
    fn unknown_tag_decodes_to_none() {
        assert_eq!(NodeId::from_raw(0xF).kind(), None);
        assert_eq!(NodeId::from_raw((7 << 4) | 0xC).kind(), None);
    }

    #[test]
    fn state_wire_parse_is_lenient() {
        assert_eq!(IndexState::from_wire("ok"), IndexState::Ok);
        assert_eq!(IndexState::from_wire("UPDATE_REQUESTED"), IndexState::UpdateRequested);
        assert_eq!(IndexState::from_wire("SOMETHING_NEW"), IndexState::Unknown);
    }

    #[test]
    fn entry_type_wire_parse_is_strict() {
        assert_eq!("directory".parse::<EntryType>(), Ok(EntryType::Directory));
        assert!("FOLDER".parse::<EntryType>().is_err());
    }

    #[test]
    fn sort_key_parse() {
        assert_eq!("created".parse::<SortKey>(), Ok(SortKey::Created));
        assert!("colour".parse::<SortKey>().is_err());
    }
}
