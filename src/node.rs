//! Displayable index rows and their ordering.
//!
//! The four row kinds form a closed family: jobs (uuid rows) contain
//! entities, entities contain storages, and entries are a flat list of
//! archived filesystem items. Rows are built fresh from query results on
//! every reconciliation pass; the only field ever mutated in place is
//! `state`, for the optimistic update shown between an assign/refresh
//! request and its confirmation.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::error::ProtocolError;
use crate::protocol::Row;
use crate::types::{EntryType, IndexState, NodeId, NodeKind, SortKey, SortOrder};

/// A job row. The tree's top level. `NodeId::NO_JOB` groups storages not
/// attached to any job.
#[derive(Debug, Clone, PartialEq)]
pub struct UuidRow {
    pub id: NodeId,
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub total_size: u64,
    pub total_entry_count: u64,
    pub total_entry_size: u64,
    pub state: IndexState,
}

/// One backup run under a job.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub id: NodeId,
    pub job: NodeId,
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub total_size: u64,
    pub total_entry_count: u64,
    pub total_entry_size: u64,
    pub state: IndexState,
}

/// One archive file under an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRow {
    pub id: NodeId,
    pub entity: NodeId,
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub total_size: u64,
    pub total_entry_count: u64,
    pub total_entry_size: u64,
    pub state: IndexState,
}

/// One archived filesystem item in the flat entry list. `fragment_count` is
/// display-only and populated lazily by a separate query.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRow {
    pub id: NodeId,
    pub storage: NodeId,
    pub name: String,
    pub entry_type: EntryType,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub fragment_count: Option<u64>,
}

/// A displayable row of any kind.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexRow {
    Uuid(UuidRow),
    Entity(EntityRow),
    Storage(StorageRow),
    Entry(EntryRow),
}

fn parse_created(row: &Row) -> Result<Option<DateTime<Utc>>, ProtocolError> {
    match row.opt_u64("created")? {
        None | Some(0) => Ok(None),
        Some(epoch) => Ok(DateTime::from_timestamp(epoch as i64, 0)),
    }
}

impl UuidRow {
    pub fn from_row(row: &Row) -> Result<UuidRow, ProtocolError> {
        let id = row.get_id("id")?;
        if id != NodeId::NO_JOB && id.kind() != Some(NodeKind::Uuid) {
            return Err(ProtocolError::IdTag {
                id: id.raw(),
                expected: "uuid",
            });
        }
        Ok(UuidRow {
            id,
            name: row.require("name")?.to_string(),
            created: parse_created(row)?,
            total_size: row.get_u64("totalSize")?,
            total_entry_count: row.get_u64("totalEntryCount")?,
            total_entry_size: row.get_u64("totalEntrySize")?,
            state: row.get_state("state")?,
        })
    }
}

impl EntityRow {
    pub fn from_row(row: &Row) -> Result<EntityRow, ProtocolError> {
        let id = row.get_id("id")?;
        if id.kind() != Some(NodeKind::Entity) {
            return Err(ProtocolError::IdTag {
                id: id.raw(),
                expected: "entity",
            });
        }
        Ok(EntityRow {
            id,
            job: row.get_id("jobId")?,
            name: row.require("name")?.to_string(),
            created: parse_created(row)?,
            total_size: row.get_u64("totalSize")?,
            total_entry_count: row.get_u64("totalEntryCount")?,
            total_entry_size: row.get_u64("totalEntrySize")?,
            state: row.get_state("state")?,
        })
    }
}

impl StorageRow {
    pub fn from_row(row: &Row) -> Result<StorageRow, ProtocolError> {
        let id = row.get_id("id")?;
        if id.kind() != Some(NodeKind::Storage) {
            return Err(ProtocolError::IdTag {
                id: id.raw(),
                expected: "storage",
            });
        }
        Ok(StorageRow {
            id,
            entity: row.get_id("entityId")?,
            name: row.require("name")?.to_string(),
            created: parse_created(row)?,
            total_size: row.get_u64("totalSize")?,
            total_entry_count: row.get_u64("totalEntryCount")?,
            total_entry_size: row.get_u64("totalEntrySize")?,
            state: row.get_state("state")?,
        })
    }
}

impl EntryRow {
    pub fn from_row(row: &Row) -> Result<EntryRow, ProtocolError> {
        let id = row.get_id("id")?;
        let entry_type = row.get_entry_type("entryType")?;
        match id.kind() {
            Some(NodeKind::Entry(tagged)) if tagged == entry_type => {}
            _ => {
                return Err(ProtocolError::IdTag {
                    id: id.raw(),
                    expected: "entry",
                })
            }
        }
        Ok(EntryRow {
            id,
            storage: row.get_id("storageId")?,
            name: row.require("name")?.to_string(),
            entry_type,
            size: row.get_u64("size")?,
            created: parse_created(row)?,
            fragment_count: None,
        })
    }
}

impl IndexRow {
    pub fn id(&self) -> NodeId {
        match self {
            IndexRow::Uuid(r) => r.id,
            IndexRow::Entity(r) => r.id,
            IndexRow::Storage(r) => r.id,
            IndexRow::Entry(r) => r.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            IndexRow::Uuid(r) => &r.name,
            IndexRow::Entity(r) => &r.name,
            IndexRow::Storage(r) => &r.name,
            IndexRow::Entry(r) => &r.name,
        }
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        match self {
            IndexRow::Uuid(r) => r.created,
            IndexRow::Entity(r) => r.created,
            IndexRow::Storage(r) => r.created,
            IndexRow::Entry(r) => r.created,
        }
    }

    pub fn total_size(&self) -> u64 {
        match self {
            IndexRow::Uuid(r) => r.total_size,
            IndexRow::Entity(r) => r.total_size,
            IndexRow::Storage(r) => r.total_size,
            IndexRow::Entry(r) => r.size,
        }
    }

    pub fn entry_count(&self) -> u64 {
        match self {
            IndexRow::Uuid(r) => r.total_entry_count,
            IndexRow::Entity(r) => r.total_entry_count,
            IndexRow::Storage(r) => r.total_entry_count,
            IndexRow::Entry(_) => 1,
        }
    }

    /// Entries carry no index state; they report `None`.
    pub fn state(&self) -> Option<IndexState> {
        match self {
            IndexRow::Uuid(r) => Some(r.state),
            IndexRow::Entity(r) => Some(r.state),
            IndexRow::Storage(r) => Some(r.state),
            IndexRow::Entry(_) => None,
        }
    }

    /// The one permitted in-place mutation, for optimistic feedback between
    /// an assign/refresh request and the confirming reconciliation. No-op on
    /// entry rows.
    pub fn set_state(&mut self, state: IndexState) {
        match self {
            IndexRow::Uuid(r) => r.state = state,
            IndexRow::Entity(r) => r.state = state,
            IndexRow::Storage(r) => r.state = state,
            IndexRow::Entry(_) => {}
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            IndexRow::Uuid(_) => NodeKind::Uuid,
            IndexRow::Entity(_) => NodeKind::Entity,
            IndexRow::Storage(_) => NodeKind::Storage,
            IndexRow::Entry(r) => NodeKind::Entry(r.entry_type),
        }
    }
}

fn cmp_nulls_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn cmp_key(a: &IndexRow, b: &IndexRow, key: SortKey) -> Ordering {
    match key {
        SortKey::Name => a.name().cmp(b.name()),
        SortKey::Created => cmp_nulls_last(a.created(), b.created()),
        SortKey::Size => a.total_size().cmp(&b.total_size()),
        SortKey::State => cmp_nulls_last(a.state(), b.state()),
    }
}

/// Total order over rows.
///
/// The active sort key is compared first, honoring `order`. Ties fall through
/// name, size, created time and state, always ascending, and terminate in id
/// ascending so two rows never compare equal unless they are the same row.
/// Absent values sort last.
pub fn compare(a: &IndexRow, b: &IndexRow, key: SortKey, order: SortOrder) -> Ordering {
    let primary = match order {
        SortOrder::Ascending => cmp_key(a, b, key),
        SortOrder::Descending => cmp_key(a, b, key).reverse(),
    };
    primary
        .then_with(|| cmp_key(a, b, SortKey::Name))
        .then_with(|| cmp_key(a, b, SortKey::Size))
        .then_with(|| cmp_key(a, b, SortKey::Created))
        .then_with(|| cmp_key(a, b, SortKey::State))
        .then_with(|| a.id().cmp(&b.id()))
}
