use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{info, warn};

use crate::journal::Journal;
use crate::model::*;

use super::{InMemoryStore, ItemStore, ResourceLookup, StoreError};

// ── Journal writer task ──────────────────────────────────

/// Commands accepted per wake-up of the writer task.
const COMMAND_BATCH: usize = 256;

type Done = oneshot::Sender<io::Result<()>>;

enum JournalCommand {
    Append { record: Record, done: Done },
    Rewrite { records: Vec<Record>, done: Done },
    Appended { reply: oneshot::Sender<u64> },
}

/// Owns the journal. Appends that arrive together are staged back to back and
/// share one commit; a rewrite or stats request first settles whatever is
/// staged ahead of it so replies keep command order.
async fn journal_writer(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    let mut commands = Vec::with_capacity(COMMAND_BATCH);
    let mut staged: Vec<Done> = Vec::new();
    while rx.recv_many(&mut commands, COMMAND_BATCH).await > 0 {
        for command in commands.drain(..) {
            match command {
                JournalCommand::Append { record, done } => match journal.stage(&record) {
                    Ok(()) => staged.push(done),
                    Err(e) => {
                        let _ = done.send(Err(e));
                    }
                },
                JournalCommand::Rewrite { records, done } => {
                    settle(&mut journal, &mut staged);
                    let _ = done.send(journal.rewrite(&records));
                }
                JournalCommand::Appended { reply } => {
                    settle(&mut journal, &mut staged);
                    let _ = reply.send(journal.appended());
                }
            }
        }
        settle(&mut journal, &mut staged);
    }
}

/// Commit staged appends and answer each waiting writer with the outcome.
fn settle(journal: &mut Journal, staged: &mut Vec<Done>) {
    if staged.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(staged.len() as f64);
    let started = std::time::Instant::now();
    let result = journal.commit();
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for done in staged.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = done.send(reply);
    }
}

/// In-memory store made durable by an append-only journal.
///
/// Every write is journaled before it becomes visible. Writes to one project
/// are serialized so journal order matches apply order; compaction waits for
/// in-flight writes and blocks new ones while it snapshots.
pub struct JournaledStore {
    memory: InMemoryStore,
    journal_tx: mpsc::Sender<JournalCommand>,
    project_locks: DashMap<String, Arc<Mutex<()>>>,
    compaction_gate: RwLock<()>,
}

impl JournaledStore {
    /// Replay the journal at `path` and start the writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (journal, replay) = Journal::open(path)?;
        let memory = InMemoryStore::new();
        let mut rejected = 0usize;
        for record in &replay.records {
            // A record the store refuses (e.g. a patch for an item that was
            // never written) would be refused live too; skip it.
            if let Err(e) = memory.apply_record(record) {
                rejected += 1;
                warn!(project_id = record.project_id(), "skipping journal record: {e}");
            }
        }
        info!(
            path = %path.display(),
            records = replay.records.len(),
            rejected,
            discarded_bytes = replay.discarded_bytes,
            projects = memory.project_count(),
            "journal replayed"
        );

        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer(journal, journal_rx));

        Ok(Self {
            memory,
            journal_tx,
            project_locks: DashMap::new(),
            compaction_gate: RwLock::new(()),
        })
    }

    fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        self.project_locks
            .entry(project_id.to_string())
            .or_default()
            .clone()
    }

    async fn append(&self, record: Record) -> Result<(), StoreError> {
        let (done, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Append { record, done })
            .await
            .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Journal("journal writer dropped response".into()))?
            .map_err(|e| StoreError::Journal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> Result<u64, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Appended { reply })
            .await
            .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Journal("journal writer dropped response".into()))
    }

    /// Rewrite the journal as one `ItemWritten` record per live item.
    pub async fn compact(&self) -> Result<usize, StoreError> {
        let _gate = self.compaction_gate.write().await;
        let records = self.memory.snapshot();
        let count = records.len();
        let (done, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Rewrite { records, done })
            .await
            .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Journal("journal writer dropped response".into()))?
            .map_err(|e| StoreError::Journal(e.to_string()))?;
        Ok(count)
    }
}

#[async_trait]
impl ResourceLookup for JournaledStore {
    async fn find_by_resource_intersection(
        &self,
        resource_ids: &BTreeSet<String>,
    ) -> Result<Vec<ScopedItem>, StoreError> {
        Ok(self.memory.with_resources(resource_ids))
    }
}

#[async_trait]
impl ItemStore for JournaledStore {
    async fn list_projects(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.memory.project_ids())
    }

    async fn list_project_items(&self, project_id: &str) -> Result<Vec<TimelineItem>, StoreError> {
        Ok(self.memory.items(project_id))
    }

    async fn get_item(&self, project_id: &str, item_id: &str) -> Result<Option<TimelineItem>, StoreError> {
        Ok(self.memory.get(project_id, item_id))
    }

    async fn put_item(&self, project_id: &str, item: TimelineItem) -> Result<Option<TimelineItem>, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        self.memory.check_put(project_id, &item)?;
        self.append(Record::ItemWritten {
            project_id: project_id.to_string(),
            item: item.clone(),
        })
        .await?;
        self.memory.put(project_id, item)
    }

    async fn delete_item(&self, project_id: &str, item_id: &str) -> Result<Option<TimelineItem>, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        if !self.memory.contains(project_id, item_id) {
            return Ok(None);
        }
        self.append(Record::ItemDeleted {
            project_id: project_id.to_string(),
            item_id: item_id.to_string(),
        })
        .await?;
        Ok(self.memory.remove(project_id, item_id))
    }

    async fn patch_item(
        &self,
        project_id: &str,
        item_id: &str,
        patch: &ValidationPatch,
    ) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.read().await;
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        if !self.memory.contains(project_id, item_id) {
            return Err(StoreError::not_found(project_id, item_id));
        }
        self.append(Record::patched(project_id, item_id, patch)).await?;
        self.memory.patch(project_id, item_id, patch)
    }
}
