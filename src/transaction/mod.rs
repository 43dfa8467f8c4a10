// Transactions: an isolated staging area flushed as one git checkpoint.

use crate::collection::{self, CollectionRef};
use crate::document::{self, Document, Format};
use crate::error::{Result, VaultError};
use crate::store::Store;
use crate::value::Map;
use std::collections::{BTreeMap, BTreeSet};

const DEFAULT_COMMIT_MESSAGE: &str = "batch transaction update";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// A batch of document mutations, invisible to concurrent readers until
/// committed. While open nothing touches the filesystem, so rollback is
/// free.
pub struct Transaction<'a> {
    store: &'a Store,
    staged: BTreeMap<String, Document>,
    deleted: BTreeSet<String>,
    state: TxState,
}

struct FileBatch {
    cref: CollectionRef,
    updates: BTreeMap<String, Document>,
    deletes: BTreeSet<String>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(store: &'a Store) -> Transaction<'a> {
        Transaction {
            store,
            staged: BTreeMap::new(),
            deleted: BTreeSet::new(),
            state: TxState::Open,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            TxState::Open => Ok(()),
            _ => Err(VaultError::Validation(
                "transaction is no longer open".to_string(),
            )),
        }
    }

    /// Stage a write. Clears any pending delete for the same ID.
    pub fn save(&mut self, doc: Document) -> Result<()> {
        self.ensure_open()?;
        Store::validate_id(&doc.id)?;
        self.deleted.remove(&doc.id);
        self.staged.insert(doc.id.clone(), doc);
        Ok(())
    }

    /// Stage a delete. Clears any pending write for the same ID.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        self.ensure_open()?;
        Store::validate_id(id)?;
        self.staged.remove(id);
        self.deleted.insert(id.to_string());
        Ok(())
    }

    /// Read-your-own-writes: staged deletes shadow staged writes, staged
    /// writes shadow committed state.
    pub fn get(&self, id: &str) -> Result<Document> {
        self.ensure_open()?;
        if self.deleted.contains(id) {
            return Err(VaultError::NotFound(id.to_string()));
        }
        if let Some(doc) = self.staged.get(id) {
            return Ok(doc.clone());
        }
        self.store.get(id)
    }

    /// Discard all staged state. Never touches the filesystem.
    pub fn rollback(mut self) {
        self.staged.clear();
        self.deleted.clear();
        self.state = TxState::RolledBack;
    }

    /// Flush every staged mutation and record exactly one checkpoint.
    ///
    /// The version-control lock is held from the first disk write to the
    /// checkpoint, so concurrent commits serialize in lock order. A failure
    /// before the checkpoint leaves written files on disk but records no
    /// commit; history never shows a partial transaction.
    pub fn commit(mut self, reason: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        self.store.ensure_writable()?;
        if self.staged.is_empty() && self.deleted.is_empty() {
            self.state = TxState::Committed;
            return Ok(());
        }
        let message = reason.unwrap_or(DEFAULT_COMMIT_MESSAGE);

        // Partition staged work into per-collection-file batches and plain
        // single-file writes/deletes.
        let mut batches: BTreeMap<String, FileBatch> = BTreeMap::new();
        let mut plain_writes: Vec<(String, Format, &Document)> = Vec::new();
        let mut plain_deletes: Vec<String> = Vec::new();

        for (id, doc) in &self.staged {
            match collection::target(self.store.root(), id) {
                Some(cref) => {
                    let key = cref.row_key.clone();
                    batches
                        .entry(cref.rel_path.clone())
                        .or_insert_with(|| FileBatch {
                            cref,
                            updates: BTreeMap::new(),
                            deletes: BTreeSet::new(),
                        })
                        .updates
                        .insert(key, doc.clone());
                }
                None => {
                    let (rel, format) = document::location(id, &doc.metadata);
                    plain_writes.push((rel, format, doc));
                }
            }
        }
        for id in &self.deleted {
            match collection::find(self.store.root(), id) {
                Some(cref) => {
                    let key = cref.row_key.clone();
                    batches
                        .entry(cref.rel_path.clone())
                        .or_insert_with(|| FileBatch {
                            cref,
                            updates: BTreeMap::new(),
                            deletes: BTreeSet::new(),
                        })
                        .deletes
                        .insert(key);
                }
                None => {
                    let rel = self
                        .store
                        .locate_existing(id)
                        .map(|(rel, _)| rel)
                        .unwrap_or_else(|| document::location(id, &Map::new()).0);
                    plain_deletes.push(rel);
                }
            }
        }

        let guard = self.store.commit_guard()?;

        // One read-modify-write per collection file, however many rows were
        // staged against it.
        let mut added: Vec<String> = Vec::new();
        let mut collection_written: Vec<(String, Vec<u8>)> = Vec::new();
        for (rel, batch) in &batches {
            let bytes = self
                .store
                .collections()
                .render(&batch.cref, &batch.updates, &batch.deletes)?;
            self.store.write_file(rel, &bytes)?;
            added.push(rel.clone());
            collection_written.push((rel.clone(), bytes));
        }

        let mut plain_written: Vec<(String, &Document)> = Vec::new();
        for (rel, format, doc) in &plain_writes {
            let bytes = self.store.registry().serialize(*format, doc)?;
            self.store.write_file(rel, &bytes)?;
            added.push(rel.clone());
            plain_written.push((rel.clone(), doc));
        }

        let mut removed: Vec<String> = Vec::new();
        for rel in &plain_deletes {
            match std::fs::remove_file(self.store.root().join(rel)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    log::warn!("transaction delete: {rel} was already gone");
                }
                Err(e) => return Err(e.into()),
            }
            removed.push(rel.clone());
        }

        // One stage call, one checkpoint.
        self.store.vcs_add_commit(&added, &removed, message)?;
        drop(guard);

        for (rel, bytes) in &collection_written {
            self.store.index_collection_file(rel, bytes);
        }
        for (rel, doc) in &plain_written {
            self.store.index_plain(rel, doc)?;
        }
        for rel in &removed {
            self.store.index_remove(rel);
        }
        self.store.persist_index()?;

        self.state = TxState::Committed;
        Ok(())
    }
}
