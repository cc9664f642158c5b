//! Bulk operations over the selected rows.
//!
//! Every operation re-derives its work list from the authoritative remote
//! selection rather than trusting the local mirror, filters it to the row
//! kinds the verb applies to, and issues one command per row. Failures are
//! collected per row; `ignore_errors` decides whether a failure stops the
//! run or the remaining rows are still attempted.
//!
//! Operations that change index rows optimistically mark them
//! `UPDATE_REQUESTED` through a state hint. Every run finishes by
//! scheduling an immediate refresh for the authoritative answer; restores
//! raise no hint since entries carry no index state.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::checkset::CheckSet;
use crate::client::{run_to_completion, QueryClient};
use crate::error::SyncError;
use crate::model::ViewEvent;
use crate::protocol::{commands, Command};
use crate::trigger::TriggerPort;
use crate::types::{IndexState, NodeId, NodeKind};

/// Result of one bulk run.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    /// Rows the run was asked to process.
    pub attempted: usize,
    pub succeeded: Vec<NodeId>,
    /// Per-row failures with the server's message.
    pub failures: Vec<(NodeId, String)>,
}

impl BulkOutcome {
    pub fn all_ok(&self) -> bool {
        self.failures.is_empty() && self.succeeded.len() == self.attempted
    }
}

pub struct BulkOps {
    client: Arc<dyn QueryClient>,
    checked: Arc<CheckSet>,
    trigger: Arc<dyn TriggerPort>,
    hints: mpsc::UnboundedSender<ViewEvent>,
    confirm_threshold: usize,
}

impl BulkOps {
    pub fn new(
        client: Arc<dyn QueryClient>,
        checked: Arc<CheckSet>,
        trigger: Arc<dyn TriggerPort>,
        hints: mpsc::UnboundedSender<ViewEvent>,
        confirm_threshold: usize,
    ) -> BulkOps {
        BulkOps {
            client,
            checked,
            trigger,
            hints,
            confirm_threshold,
        }
    }

    /// Whether an operation over `count` rows should ask the user first.
    pub fn needs_confirmation(&self, count: usize) -> bool {
        count > self.confirm_threshold
    }

    /// The authoritative selection, resynchronizing the local mirror.
    pub async fn selection(&self) -> Result<Vec<NodeId>, SyncError> {
        self.checked.remote_selection().await
    }

    /// Reassign every selected storage to `entity`.
    pub async fn assign(
        &self,
        entity: NodeId,
        ignore_errors: bool,
    ) -> Result<BulkOutcome, SyncError> {
        let ids = storage_ids(self.selection().await?);
        info!(count = ids.len(), entity = %entity, "assigning selected storages");
        let outcome = self
            .for_each(ids, ignore_errors, |id| commands::index_assign(id, entity))
            .await?;
        self.hint(outcome.succeeded.clone(), IndexState::UpdateRequested);
        self.trigger.request_immediate_refresh();
        Ok(outcome)
    }

    /// Request a re-index of every selected storage.
    pub async fn refresh_selected(&self, ignore_errors: bool) -> Result<BulkOutcome, SyncError> {
        let ids = storage_ids(self.selection().await?);
        info!(count = ids.len(), "requesting re-index of selected storages");
        let outcome = self
            .for_each(ids, ignore_errors, commands::index_refresh)
            .await?;
        self.hint(outcome.succeeded.clone(), IndexState::UpdateRequested);
        self.trigger.request_immediate_refresh();
        Ok(outcome)
    }

    /// Delete every selected storage from the index.
    pub async fn delete_selected(&self, ignore_errors: bool) -> Result<BulkOutcome, SyncError> {
        let ids = storage_ids(self.selection().await?);
        info!(count = ids.len(), "deleting selected storages");
        let outcome = self
            .for_each(ids, ignore_errors, commands::storage_delete)
            .await?;
        // The server cascades its selection set; drop ours to match.
        self.checked.discard_local(&outcome.succeeded);
        self.trigger.request_immediate_refresh();
        Ok(outcome)
    }

    /// Restore every selected entry under `destination`.
    pub async fn restore_selected(
        &self,
        destination: &str,
        ignore_errors: bool,
    ) -> Result<BulkOutcome, SyncError> {
        let ids: Vec<NodeId> = self
            .selection()
            .await?
            .into_iter()
            .filter(|id| matches!(id.kind(), Some(NodeKind::Entry(_))))
            .collect();
        info!(count = ids.len(), destination, "restoring selected entries");
        let outcome = self
            .for_each(ids, ignore_errors, |id| {
                commands::entry_restore(id, destination)
            })
            .await?;
        self.trigger.request_immediate_refresh();
        Ok(outcome)
    }

    async fn for_each(
        &self,
        ids: Vec<NodeId>,
        ignore_errors: bool,
        command_for: impl Fn(NodeId) -> Command,
    ) -> Result<BulkOutcome, SyncError> {
        let mut outcome = BulkOutcome {
            attempted: ids.len(),
            ..BulkOutcome::default()
        };
        for id in ids {
            match run_to_completion(self.client.as_ref(), command_for(id)).await {
                Ok(()) => outcome.succeeded.push(id),
                Err(SyncError::Aborted) => return Err(SyncError::Aborted),
                Err(e) => {
                    warn!(id = %id, error = %e, "bulk operation failed for row");
                    outcome.failures.push((id, e.to_string()));
                    if !ignore_errors {
                        break;
                    }
                }
            }
        }
        Ok(outcome)
    }

    fn hint(&self, ids: Vec<NodeId>, state: IndexState) {
        if ids.is_empty() {
            return;
        }
        let _ = self.hints.send(ViewEvent::StateHint { ids, state });
    }
}

fn storage_ids(ids: Vec<NodeId>) -> Vec<NodeId> {
    ids.into_iter()
        .filter(|id| id.kind() == Some(NodeKind::Storage))
        .collect()
}
