//! Per-tenant hybrid knowledge store: a sled record store paired with a
//! similarity index over the same facts.
//!
//! The record store is the source of truth for which facts exist. The index is
//! a projection of it and is rebuilt whenever the two are found to disagree.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::Transactional;
use tracing::{debug, error, info, warn};

use crate::embeddings::Embedder;
use crate::error::{Error, Result};
use crate::now_ms;
use crate::vector_index::{FlatIndex, VectorIndex};

const FACTS_TREE: &str = "facts";
const CONTENT_TREE: &str = "facts_by_content";
const RECORDS_DIR: &str = "records";
pub const INDEX_FILE: &str = "facts.index";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fact {
    pub id: u64,
    pub tenant_id: String,
    pub content: String,
    pub created_at: i64,
}

/// Open-time options shared by every store of one instance.
#[derive(Clone, Default)]
pub struct StoreOptions {
    /// `None` runs the store without a similarity index; search then returns nothing.
    pub embedder: Option<Arc<dyn Embedder>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoreStats {
    pub fact_count: u64,
    pub index_vectors: u64,
    pub index_enabled: bool,
}

#[derive(Deserialize)]
struct LoreFile {
    #[serde(default)]
    facts: Vec<String>,
}

struct Inner {
    db: sled::Db,
    facts: sled::Tree,
    by_content: sled::Tree,
    index: Option<Box<dyn VectorIndex>>,
}

pub struct KnowledgeStore {
    tenant_id: String,
    root: PathBuf,
    embedder: Option<Arc<dyn Embedder>>,
    // None once closed
    inner: Mutex<Option<Inner>>,
}

impl KnowledgeStore {
    /// Open (or create) the store rooted at `root`, loading the persisted index
    /// when it is present and still matches the record store.
    pub fn open(root: &Path, tenant_id: &str, options: &StoreOptions) -> Result<Self> {
        let index: Option<Box<dyn VectorIndex>> = match &options.embedder {
            None => None,
            Some(embedder) => {
                let path = root.join(INDEX_FILE);
                let loaded = if path.exists() {
                    match FlatIndex::load(&path) {
                        Ok(idx) if idx.dim() == embedder.dim() => Some(idx),
                        Ok(idx) => {
                            warn!(tenant = %tenant_id, found = idx.dim(), expected = embedder.dim(), "index dimension changed, discarding");
                            None
                        }
                        Err(err) => {
                            error!(tenant = %tenant_id, %err, "failed to load index, creating new one");
                            None
                        }
                    }
                } else {
                    None
                };
                let index = loaded.unwrap_or_else(|| FlatIndex::new(embedder.dim()));
                Some(Box::new(index) as Box<dyn VectorIndex>)
            }
        };
        Self::open_with_index(root, tenant_id, options.embedder.clone(), index)
    }

    /// Open with a caller-supplied index. The index is reconciled against the
    /// record store before the handle is returned.
    pub fn open_with_index(
        root: &Path,
        tenant_id: &str,
        embedder: Option<Arc<dyn Embedder>>,
        index: Option<Box<dyn VectorIndex>>,
    ) -> Result<Self> {
        if embedder.is_none() && index.is_some() {
            return Err(Error::Validation("an index needs an embedder to fill it".into()));
        }
        std::fs::create_dir_all(root)?;
        let db = sled::open(root.join(RECORDS_DIR))?;
        let facts = db.open_tree(FACTS_TREE)?;
        let by_content = db.open_tree(CONTENT_TREE)?;
        let mut inner = Inner { db, facts, by_content, index };

        let index_ids: Option<BTreeSet<u64>> =
            inner.index.as_ref().map(|index| index.ids().into_iter().collect());
        if let (Some(index_ids), Some(embedder)) = (index_ids, embedder.as_ref()) {
            let record_ids: BTreeSet<u64> = record_ids(&inner.facts)?.into_iter().collect();
            if record_ids != index_ids {
                warn!(
                    tenant = %tenant_id,
                    records = record_ids.len(),
                    vectors = index_ids.len(),
                    "index out of sync with records, rebuilding"
                );
                rebuild_locked(&mut inner, tenant_id, embedder.as_ref())?;
            }
        }

        info!(tenant = %tenant_id, root = %root.display(), "knowledge store opened");
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            root: root.to_path_buf(),
            embedder,
            inner: Mutex::new(Some(inner)),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// `Ok(true)` when inserted, `Ok(false)` when the tenant already knows this text.
    pub fn add_fact(&self, text: &str) -> Result<bool> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Validation("fact must not be empty".into()));
        }
        // CPU-bound, stays outside the tenant lock
        let embedding = self.embedder.as_ref().map(|e| e.embed(text));

        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or_else(|| self.closed())?;
        match insert_record_then_index(inner, &self.tenant_id, text, embedding.as_deref())? {
            Some(id) => {
                info!(tenant = %self.tenant_id, fact_id = id, "added fact");
                Ok(true)
            }
            None => {
                debug!(tenant = %self.tenant_id, "fact already known");
                Ok(false)
            }
        }
    }

    /// Up to `k` facts nearest to `query`, closest first. Empty when the index is
    /// disabled, empty, or failing.
    pub fn search_facts(&self, query: &str, k: usize) -> Vec<String> {
        if k == 0 {
            return Vec::new();
        }
        let Some(embedder) = self.embedder.as_ref() else {
            return Vec::new();
        };
        let qvec = embedder.embed(query);

        let guard = self.inner.lock();
        let Some(inner) = guard.as_ref() else {
            warn!(tenant = %self.tenant_id, "search on closed store");
            return Vec::new();
        };
        let Some(index) = inner.index.as_ref() else {
            return Vec::new();
        };
        if index.is_empty() {
            return Vec::new();
        }

        let mut results = Vec::new();
        for (id, score) in index.search(&qvec, k) {
            match inner.facts.get(id.to_be_bytes()) {
                Ok(Some(bytes)) => match serde_json::from_slice::<Fact>(&bytes) {
                    Ok(fact) if fact.tenant_id == self.tenant_id => results.push(fact.content),
                    Ok(fact) => warn!(tenant = %self.tenant_id, owner = %fact.tenant_id, fact_id = id, "skipping foreign fact"),
                    Err(err) => warn!(tenant = %self.tenant_id, fact_id = id, %err, "unreadable fact record"),
                },
                Ok(None) => debug!(tenant = %self.tenant_id, fact_id = id, score, "stale index entry"),
                Err(err) => {
                    error!(tenant = %self.tenant_id, %err, "error searching facts");
                    return Vec::new();
                }
            }
        }
        debug!(tenant = %self.tenant_id, results = results.len(), "search complete");
        results
    }

    /// Every fact for the tenant, most recent first.
    pub fn get_all_facts(&self) -> Vec<String> {
        let guard = self.inner.lock();
        let Some(inner) = guard.as_ref() else {
            warn!(tenant = %self.tenant_id, "read on closed store");
            return Vec::new();
        };
        match load_facts(&inner.facts, &self.tenant_id) {
            Ok(mut facts) => {
                facts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
                facts.into_iter().map(|f| f.content).collect()
            }
            Err(err) => {
                error!(tenant = %self.tenant_id, %err, "error getting all facts");
                Vec::new()
            }
        }
    }

    /// Drop the whole index and re-embed every record. Returns the vector count.
    pub fn rebuild_index(&self) -> Result<usize> {
        let Some(embedder) = self.embedder.as_ref() else {
            info!(tenant = %self.tenant_id, "skipping index rebuild, vector search not available");
            return Ok(0);
        };
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or_else(|| self.closed())?;
        rebuild_locked(inner, &self.tenant_id, embedder.as_ref())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let guard = self.inner.lock();
        let inner = guard.as_ref().ok_or_else(|| self.closed())?;
        Ok(StoreStats {
            fact_count: inner.facts.len() as u64,
            index_vectors: inner.index.as_ref().map(|i| i.len() as u64).unwrap_or(0),
            index_enabled: inner.index.is_some(),
        })
    }

    pub fn fact_ids(&self) -> Result<Vec<u64>> {
        let guard = self.inner.lock();
        let inner = guard.as_ref().ok_or_else(|| self.closed())?;
        record_ids(&inner.facts)
    }

    pub fn index_ids(&self) -> Vec<u64> {
        let guard = self.inner.lock();
        guard
            .as_ref()
            .and_then(|inner| inner.index.as_ref())
            .map(|index| index.ids())
            .unwrap_or_default()
    }

    /// Migrate a legacy `{"facts": [...]}` lore file, then rename it to
    /// `<name>.migrated` so it is not imported twice.
    pub fn import_lore_file(&self, path: &Path) -> Result<usize> {
        let raw = std::fs::read(path)?;
        let lore: LoreFile = serde_json::from_slice(&raw)?;
        let mut migrated = 0usize;
        for fact in &lore.facts {
            if fact.trim().is_empty() {
                continue;
            }
            if self.add_fact(fact)? {
                migrated += 1;
            }
        }
        let mut done = path.as_os_str().to_owned();
        done.push(".migrated");
        std::fs::rename(path, PathBuf::from(done))?;
        info!(tenant = %self.tenant_id, migrated, total = lore.facts.len(), "lore migration complete");
        Ok(migrated)
    }

    /// Persist the index, then flush and release the record store. Idempotent.
    /// The records are flushed even when the index cannot be written; a missing
    /// index is rebuilt on the next open.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let Some(inner) = guard.take() else {
            return Ok(());
        };
        let persisted = match inner.index.as_ref() {
            Some(index) => index.persist(&self.root.join(INDEX_FILE)),
            None => Ok(()),
        };
        if let Err(err) = &persisted {
            error!(tenant = %self.tenant_id, %err, "failed to persist index");
        }
        inner.db.flush()?;
        persisted?;
        info!(tenant = %self.tenant_id, "knowledge store closed");
        Ok(())
    }

    fn closed(&self) -> Error {
        Error::Storage(format!("knowledge store for tenant {} is closed", self.tenant_id))
    }
}

/// Insert the record under the `(tenant, content)` constraint, then its vector.
/// If the vector insert fails the record is deleted again before returning, so
/// callers never observe one without the other. `Ok(None)` means duplicate.
fn insert_record_then_index(
    inner: &mut Inner,
    tenant_id: &str,
    content: &str,
    embedding: Option<&[f32]>,
) -> Result<Option<u64>> {
    let id = inner.db.generate_id()?;
    let fact = Fact {
        id,
        tenant_id: tenant_id.to_string(),
        content: content.to_string(),
        created_at: now_ms(),
    };
    let record = serde_json::to_vec(&fact)?;
    let id_key = id.to_be_bytes().to_vec();
    let content_key = content_key(tenant_id, content);

    let inserted = (&inner.facts, &inner.by_content)
        .transaction(|(facts, by_content)| -> ConflictableTransactionResult<bool> {
            if by_content.get(content_key.as_slice())?.is_some() {
                return Ok(false);
            }
            by_content.insert(content_key.clone(), id_key.clone())?;
            facts.insert(id_key.clone(), record.clone())?;
            Ok(true)
        })
        .map_err(tx_error)?;
    if !inserted {
        return Ok(None);
    }

    if let (Some(index), Some(vector)) = (inner.index.as_mut(), embedding) {
        if let Err(err) = index.add(id, vector) {
            let undo = (&inner.facts, &inner.by_content).transaction(
                |(facts, by_content)| -> ConflictableTransactionResult<()> {
                    facts.remove(id_key.clone())?;
                    by_content.remove(content_key.clone())?;
                    Ok(())
                },
            );
            return match undo {
                Ok(()) => {
                    warn!(tenant = %tenant_id, fact_id = id, %err, "index insert failed, record rolled back");
                    Err(Error::Storage(format!("index insert failed: {err}")))
                }
                Err(undo_err) => {
                    let undo_err = tx_error(undo_err);
                    error!(tenant = %tenant_id, fact_id = id, %err, %undo_err, "index insert failed and rollback failed");
                    Err(Error::Storage(format!(
                        "index insert failed ({err}) and record rollback failed ({undo_err})"
                    )))
                }
            };
        }
    }

    if let Err(err) = inner.db.flush() {
        warn!(tenant = %tenant_id, fact_id = id, %err, "flush after insert failed");
    }
    Ok(Some(id))
}

fn rebuild_locked(inner: &mut Inner, tenant_id: &str, embedder: &dyn Embedder) -> Result<usize> {
    let Some(index) = inner.index.as_mut() else {
        return Ok(0);
    };
    info!(tenant = %tenant_id, "rebuilding index from scratch");
    index.reset();
    let facts = load_facts(&inner.facts, tenant_id)?;
    let texts: Vec<&str> = facts.iter().map(|f| f.content.as_str()).collect();
    let vectors = embedder.embed_batch(&texts);
    for (fact, vector) in facts.iter().zip(vectors.iter()) {
        index.add(fact.id, vector)?;
    }
    info!(tenant = %tenant_id, vectors = index.len(), "index rebuilt");
    Ok(index.len())
}

fn load_facts(tree: &sled::Tree, tenant_id: &str) -> Result<Vec<Fact>> {
    let mut out = Vec::new();
    for kv in tree.iter() {
        let (_, v) = kv?;
        let fact: Fact = serde_json::from_slice(&v)?;
        if fact.tenant_id == tenant_id {
            out.push(fact);
        }
    }
    Ok(out)
}

fn record_ids(tree: &sled::Tree) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for key in tree.iter().keys() {
        let key = key?;
        let bytes: [u8; 8] = key
            .as_ref()
            .try_into()
            .map_err(|_| Error::Storage("malformed fact key".into()))?;
        ids.push(u64::from_be_bytes(bytes));
    }
    Ok(ids)
}

fn content_key(tenant_id: &str, content: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant_id.len() + 1 + content.len());
    key.extend_from_slice(tenant_id.as_bytes());
    key.push(0);
    key.extend_from_slice(content.as_bytes());
    key
}

fn tx_error(err: TransactionError<()>) -> Error {
    match err {
        TransactionError::Storage(e) => Error::Storage(e.to_string()),
        TransactionError::Abort(()) => Error::Storage("transaction aborted".into()),
    }
}
