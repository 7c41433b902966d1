//! Single-writer store actor.
//!
//! All database access from the async pipeline goes through [`StoreHandle`].
//! One blocking task owns the [`Database`] and applies commands in arrival
//! order, so commits never interleave and never block the runtime.

use crate::db::{Batch, Database};
use crate::error::{Error, Result};
use crate::types::{ConversationFile, FileStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const COMMAND_QUEUE: usize = 256;

enum Command {
    LoadCheckpoint {
        path: PathBuf,
        reply: oneshot::Sender<Result<Option<ConversationFile>>>,
    },
    Commit {
        batch: Box<Batch>,
        reply: oneshot::Sender<Result<()>>,
    },
    SetStatus {
        path: PathBuf,
        status: FileStatus,
        last_error: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveFile {
        path: PathBuf,
        reply: oneshot::Sender<Result<bool>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the store actor.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<Command>,
    db: Arc<Database>,
}

impl StoreHandle {
    /// Start the actor around an already-migrated database.
    pub fn spawn(db: Database) -> (Self, JoinHandle<()>) {
        let db = Arc::new(db);
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let worker_db = db.clone();
        let task = tokio::task::spawn_blocking(move || run(worker_db, rx));
        (Self { tx, db }, task)
    }

    /// Read access for queries outside the write path (tests, CLI output).
    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::Store("store writer stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Store("store writer dropped the request".to_string()))
    }

    pub async fn load_checkpoint(&self, path: &Path) -> Result<Option<ConversationFile>> {
        let path = path.to_path_buf();
        self.call(|reply| Command::LoadCheckpoint { path, reply })
            .await?
    }

    /// Commit a batch's records together with its checkpoint.
    pub async fn commit(&self, batch: Batch) -> Result<()> {
        self.call(|reply| Command::Commit {
            batch: Box::new(batch),
            reply,
        })
        .await?
    }

    pub async fn set_status(
        &self,
        path: &Path,
        status: FileStatus,
        last_error: Option<String>,
    ) -> Result<()> {
        let path = path.to_path_buf();
        self.call(|reply| Command::SetStatus {
            path,
            status,
            last_error,
            reply,
        })
        .await?
    }

    pub async fn remove_file(&self, path: &Path) -> Result<bool> {
        let path = path.to_path_buf();
        self.call(|reply| Command::RemoveFile { path, reply })
            .await?
    }

    /// Finish queued commands, then stop the writer.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}

fn run(db: Arc<Database>, mut rx: mpsc::Receiver<Command>) {
    tracing::debug!("Store writer started");
    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::LoadCheckpoint { path, reply } => {
                let _ = reply.send(db.load_checkpoint(&path));
            }
            Command::Commit { batch, reply } => {
                let result = db.commit_batch(&batch);
                if let Err(e) = &result {
                    tracing::error!(
                        path = %batch.file.path.display(),
                        error = %e,
                        "Batch commit failed"
                    );
                }
                let _ = reply.send(result);
            }
            Command::SetStatus {
                path,
                status,
                last_error,
                reply,
            } => {
                let _ = reply.send(db.set_file_status(&path, status, last_error.as_deref()));
            }
            Command::RemoveFile { path, reply } => {
                let _ = reply.send(db.remove_file(&path));
            }
            Command::Shutdown { reply } => {
                rx.close();
                // Commands queued before the shutdown still run.
                while let Some(pending) = rx.blocking_recv() {
                    if let Command::Commit { batch, reply } = pending {
                        let _ = reply.send(db.commit_batch(&batch));
                    }
                }
                let _ = reply.send(());
                break;
            }
        }
    }
    tracing::debug!("Store writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Checkpoint;

    fn store() -> (StoreHandle, JoinHandle<()>) {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        StoreHandle::spawn(db)
    }

    fn file(offset: u64) -> ConversationFile {
        let mut file = ConversationFile::discovered(Path::new("/r/proj/conv.jsonl")).unwrap();
        file.checkpoint = Checkpoint {
            offset,
            line: 1,
            ..Checkpoint::default()
        };
        file
    }

    #[tokio::test]
    async fn test_commit_and_load() {
        let (store, task) = store();
        let path = Path::new("/r/proj/conv.jsonl");
        assert!(store.load_checkpoint(path).await.unwrap().is_none());

        store.commit(Batch::checkpoint_only(file(64))).await.unwrap();
        let loaded = store.load_checkpoint(path).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint.offset, 64);

        store
            .set_status(path, FileStatus::Error, Some("boom".to_string()))
            .await
            .unwrap();
        assert_eq!(
            store.database().load_checkpoint(path).unwrap().unwrap().status,
            FileStatus::Error
        );

        assert!(store.remove_file(path).await.unwrap());
        store.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let (store, task) = store();
        store.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(store.commit(Batch::checkpoint_only(file(1))).await.is_err());
    }
}
