//! Server-mirrored selection set.
//!
//! The remote service owns the authoritative selection; this keeps a local
//! mirror for instant checkbox rendering and forwards every change. Bulk
//! updates are chunked so a select-all over tens of thousands of rows does
//! not produce an unbounded command line. The mirror is advanced only after
//! the remote command for its chunk succeeds.
//!
//! Rows observed to have vanished from the index are dropped from the
//! mirror locally; the server already cascaded its own set.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::client::{run_to_completion, QueryClient};
use crate::error::SyncError;
use crate::protocol::commands;
use crate::types::NodeId;

pub struct CheckSet {
    client: Arc<dyn QueryClient>,
    mirror: Mutex<HashSet<NodeId>>,
    chunk: usize,
}

impl CheckSet {
    pub fn new(client: Arc<dyn QueryClient>, chunk: usize) -> CheckSet {
        CheckSet {
            client,
            mirror: Mutex::new(HashSet::new()),
            chunk: chunk.max(1),
        }
    }

    pub fn is_checked(&self, id: NodeId) -> bool {
        self.mirror.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.mirror.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirror.lock().is_empty()
    }

    /// Mirror contents, sorted for stable display.
    pub fn snapshot(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.mirror.lock().iter().copied().collect();
        ids.sort();
        ids
    }

    /// Check or uncheck one row. A no-op when the mirror already agrees,
    /// so re-checking a checked row sends nothing.
    pub async fn set(&self, id: NodeId, checked: bool) -> Result<(), SyncError> {
        if self.mirror.lock().contains(&id) == checked {
            return Ok(());
        }
        let command = if checked {
            commands::selection_add(&[id])
        } else {
            commands::selection_remove(&[id])
        };
        run_to_completion(self.client.as_ref(), command).await?;
        let mut mirror = self.mirror.lock();
        if checked {
            mirror.insert(id);
        } else {
            mirror.remove(&id);
        }
        Ok(())
    }

    /// Check or uncheck many rows, chunked. Ids already in the desired
    /// state are skipped. On a mid-way failure the mirror reflects exactly
    /// the chunks that succeeded.
    pub async fn set_many(&self, ids: &[NodeId], checked: bool) -> Result<(), SyncError> {
        let pending: Vec<NodeId> = {
            let mirror = self.mirror.lock();
            ids.iter()
                .copied()
                .filter(|id| mirror.contains(id) != checked)
                .collect()
        };
        trace!(requested = ids.len(), pending = pending.len(), checked, "bulk selection update");
        for chunk in pending.chunks(self.chunk) {
            let command = if checked {
                commands::selection_add(chunk)
            } else {
                commands::selection_remove(chunk)
            };
            run_to_completion(self.client.as_ref(), command).await?;
            let mut mirror = self.mirror.lock();
            for id in chunk {
                if checked {
                    mirror.insert(*id);
                } else {
                    mirror.remove(id);
                }
            }
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), SyncError> {
        run_to_completion(self.client.as_ref(), commands::selection_clear()).await?;
        self.mirror.lock().clear();
        Ok(())
    }

    /// Fetch the authoritative selection and resynchronize the mirror.
    /// Bulk operations derive their work list from this, not the mirror.
    pub async fn remote_selection(&self) -> Result<Vec<NodeId>, SyncError> {
        let mut stream = self.client.submit(commands::selection_list());
        let mut ids = Vec::new();
        while let Some(item) = stream.next_row().await {
            let row = item?;
            ids.push(row.get_id("id")?);
        }
        let mut mirror = self.mirror.lock();
        if mirror.len() != ids.len() || !ids.iter().all(|id| mirror.contains(id)) {
            debug!(local = mirror.len(), remote = ids.len(), "selection mirror resynchronized");
            *mirror = ids.iter().copied().collect();
        }
        Ok(ids)
    }

    /// Enforce checked-lineage exclusivity: displaced ancestors and
    /// descendants are unchecked remotely before the target changes.
    pub async fn apply_lineage(
        &self,
        target: NodeId,
        checked: bool,
        displaced: &[NodeId],
    ) -> Result<(), SyncError> {
        self.set_many(displaced, false).await?;
        self.set(target, checked).await
    }

    /// Drop ids from the mirror without issuing commands, for rows the
    /// index no longer contains.
    pub fn discard_local(&self, ids: &[NodeId]) {
        let mut mirror = self.mirror.lock();
        for id in ids {
            mirror.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::{MemoryIndex, MemoryQueryClient};
    use crate::types::NodeKind;

    fn fresh(chunk: usize) -> (Arc<MemoryQueryClient>, CheckSet) {
        let client = Arc::new(MemoryQueryClient::new(MemoryIndex::default()));
        let checked = CheckSet::new(client.clone(), chunk);
        (client, checked)
    }

    fn storage_ids(n: i64) -> Vec<NodeId> {
        (1..=n).map(|seq| NodeId::compose(NodeKind::Storage, seq)).collect()
    }

    #[tokio::test]
    async fn rechecking_a_checked_row_sends_nothing() {
        let (client, checked) = fresh(1024);
        let id = NodeId::compose(NodeKind::Storage, 1);
        checked.set(id, true).await.unwrap();
        checked.set(id, true).await.unwrap();
        assert_eq!(client.commands_matching("SELECTION_ADD").len(), 1);
        assert!(checked.is_checked(id));
    }

    #[tokio::test]
    async fn bulk_updates_are_chunked() {
        let (client, checked) = fresh(1024);
        let ids = storage_ids(2500);
        checked.set_many(&ids, true).await.unwrap();
        let adds = client.commands_matching("SELECTION_ADD");
        assert_eq!(adds.len(), 3);
        assert_eq!(checked.len(), 2500);
        assert_eq!(client.selection_snapshot().len(), 2500);
    }

    #[tokio::test]
    async fn clear_empties_both_sides() {
        let (client, checked) = fresh(1024);
        checked.set_many(&storage_ids(10), true).await.unwrap();
        checked.clear().await.unwrap();
        assert!(checked.is_empty());
        assert!(client.selection_snapshot().is_empty());
    }

    #[tokio::test]
    async fn remote_selection_resynchronizes_the_mirror() {
        let (client, checked) = fresh(1024);
        let id = NodeId::compose(NodeKind::Storage, 9);
        client.alter(|index| {
            index.selection.insert(id);
        });
        let ids = checked.remote_selection().await.unwrap();
        assert_eq!(ids, vec![id]);
        assert!(checked.is_checked(id));
    }

    #[tokio::test]
    async fn lineage_application_unchecks_displaced_first() {
        let (client, checked) = fresh(1024);
        let parent = NodeId::compose(NodeKind::Uuid, 1);
        let child = NodeId::compose(NodeKind::Storage, 2);
        checked.set(parent, true).await.unwrap();

        checked.apply_lineage(child, true, &[parent]).await.unwrap();
        assert!(checked.is_checked(child));
        assert!(!checked.is_checked(parent));
        let log = client.command_log();
        let remove_pos = log.iter().position(|c| c.starts_with("SELECTION_REMOVE")).unwrap();
        let add_pos = log.iter().rposition(|c| c.starts_with("SELECTION_ADD")).unwrap();
        assert!(remove_pos < add_pos);
    }

    #[tokio::test]
    async fn discard_local_skips_the_server() {
        let (client, checked) = fresh(1024);
        let id = NodeId::compose(NodeKind::Storage, 4);
        checked.set(id, true).await.unwrap();
        let commands_before = client.command_log().len();
        checked.discard_local(&[id]);
        assert!(!checked.is_checked(id));
        assert_eq!(client.command_log().len(), commands_before);
    }
}
