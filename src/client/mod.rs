//! Remote query client seam.
//!
//! The synchronizer talks to the index service through [`QueryClient`]: a
//! command goes in, a stream of result rows comes out, and the returned
//! [`CommandHandle`] can abort the command synchronously from any thread.
//! The crate ships one implementation, the in-memory backend in
//! [`memory`]; a network transport is an embedding concern.

pub mod memory;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ProtocolError, SyncError};
use crate::protocol::{commands, Command, Row};
use crate::types::NodeId;

/// Cancellation handle for one in-flight command.
///
/// `abort` is synchronous and idempotent; producers observe the flag between
/// rows and stop. Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct CommandHandle {
    aborted: Arc<AtomicBool>,
}

impl CommandHandle {
    pub fn new() -> CommandHandle {
        CommandHandle::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// A command's result stream plus its cancellation handle.
pub struct QueryStream {
    pub handle: CommandHandle,
    rows: mpsc::Receiver<Result<Row, SyncError>>,
}

impl QueryStream {
    pub fn new(handle: CommandHandle, rows: mpsc::Receiver<Result<Row, SyncError>>) -> QueryStream {
        QueryStream { handle, rows }
    }

    /// Next result row. `None` means the stream ended; check
    /// [`CommandHandle::is_aborted`] to distinguish completion from abort.
    pub async fn next_row(&mut self) -> Option<Result<Row, SyncError>> {
        self.rows.recv().await
    }
}

/// Executes text-protocol commands against the index service.
#[async_trait]
pub trait QueryClient: Send + Sync {
    /// Submit a command. Row production starts immediately; dropping the
    /// stream abandons it.
    fn submit(&self, command: Command) -> QueryStream;

    /// Tear down and re-establish the session. Called by the engine in debug
    /// builds after a protocol violation. Default: no-op.
    async fn reset(&self) {}
}

/// Run a command expected to produce exactly one row, such as a count query.
pub async fn single_row(client: &dyn QueryClient, command: Command) -> Result<Row, SyncError> {
    let mut stream = client.submit(command);
    match stream.next_row().await {
        Some(Ok(row)) => Ok(row),
        Some(Err(e)) => Err(e),
        None => {
            if stream.handle.is_aborted() {
                Err(SyncError::Aborted)
            } else {
                Err(ProtocolError::EmptyResult.into())
            }
        }
    }
}

/// Run a command for its side effect, discarding any progress rows.
pub async fn run_to_completion(
    client: &dyn QueryClient,
    command: Command,
) -> Result<(), SyncError> {
    let mut stream = client.submit(command);
    while let Some(item) = stream.next_row().await {
        item?;
    }
    if stream.handle.is_aborted() {
        return Err(SyncError::Aborted);
    }
    Ok(())
}

/// Fetch the lazily-queried fragment count of one entry.
pub async fn fragment_count(client: &dyn QueryClient, entry: NodeId) -> Result<u64, SyncError> {
    let row = single_row(client, commands::entry_fragments(entry)).await?;
    Ok(row.get_u64("count")?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_shared_across_clones() {
        let handle = CommandHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_aborted());
        handle.abort();
        assert!(clone.is_aborted());
        // Idempotent.
        handle.abort();
        assert!(handle.is_aborted());
    }

    #[tokio::test]
    async fn single_row_takes_the_first_row() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Row::new().field("count", 5))).await.unwrap();
        drop(tx);
        let mut stream = QueryStream::new(CommandHandle::new(), rx);
        let row = stream.next_row().await.unwrap().unwrap();
        assert_eq!(row.get_u64("count").unwrap(), 5);
        assert!(stream.next_row().await.is_none());
    }

    #[tokio::test]
    async fn ended_stream_with_abort_flag_reads_as_aborted() {
        let (tx, rx) = mpsc::channel::<Result<Row, SyncError>>(1);
        let handle = CommandHandle::new();
        handle.abort();
        drop(tx);
        let mut stream = QueryStream::new(handle, rx);
        assert!(stream.next_row().await.is_none());
        assert!(stream.handle.is_aborted());
    }
}
