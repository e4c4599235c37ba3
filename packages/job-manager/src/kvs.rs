//! Key-value store abstraction.
//!
//! The KVS is the single authoritative store for job eventlogs and
//! checkpoints. The core only needs transactional commit of an ordered op
//! list plus point lookups and directory listing for restart; the real
//! store lives behind this trait and an in-memory double backs the tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

/// One operation inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum KvsOp {
    /// Append a newline-terminated record to a log value.
    Append { key: String, line: String },
    /// Overwrite a document.
    Put { key: String, value: Value },
    /// Remove a key or a whole directory prefix.
    Unlink { key: String },
}

/// Ordered list of operations committed atomically.
#[derive(Debug, Default, Clone)]
pub struct KvsTxn {
    ops: Vec<KvsOp>,
}

impl KvsTxn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, key: impl Into<String>, line: impl Into<String>) {
        self.ops.push(KvsOp::Append {
            key: key.into(),
            line: line.into(),
        });
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.ops.push(KvsOp::Put {
            key: key.into(),
            value,
        });
    }

    pub fn unlink(&mut self, key: impl Into<String>) {
        self.ops.push(KvsOp::Unlink { key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[KvsOp] {
        &self.ops
    }
}

/// Store interface. Commit failures are fatal to the core (§7 of the error
/// design): there is no best-effort mode.
#[async_trait]
pub trait Kvs: Send + Sync {
    /// Read one document. `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Read a raw log value (appended records) as a single string.
    async fn get_raw(&self, key: &str) -> Result<Option<String>>;

    /// List the immediate child names under `prefix`.
    async fn lookup_dir(&self, prefix: &str) -> Result<Vec<String>>;

    /// Apply all ops atomically, in order.
    async fn commit(&self, txn: KvsTxn) -> Result<()>;
}

#[derive(Debug, Clone)]
enum Entry {
    Doc(Value),
    Log(String),
}

/// In-memory store used by tests and by hosts that persist elsewhere.
#[derive(Default)]
pub struct MemoryKvs {
    data: RwLock<BTreeMap<String, Entry>>,
    fail_commits: RwLock<bool>,
}

impl MemoryKvs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent commit fail, for fatal-path tests.
    pub async fn poison(&self) {
        *self.fail_commits.write().await = true;
    }

    pub async fn insert_doc(&self, key: &str, value: Value) {
        self.data
            .write()
            .await
            .insert(key.to_string(), Entry::Doc(value));
    }

    pub async fn insert_log(&self, key: &str, log: &str) {
        self.data
            .write()
            .await
            .insert(key.to_string(), Entry::Log(log.to_string()));
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.data.read().await.contains_key(key)
    }
}

#[async_trait]
impl Kvs for MemoryKvs {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.data.read().await.get(key) {
            Some(Entry::Doc(v)) => Ok(Some(v.clone())),
            Some(Entry::Log(_)) => Err(anyhow!("{key} holds a log, not a document")),
            None => Ok(None),
        }
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        match self.data.read().await.get(key) {
            Some(Entry::Log(s)) => Ok(Some(s.clone())),
            Some(Entry::Doc(v)) => Ok(Some(v.to_string())),
            None => Ok(None),
        }
    }

    async fn lookup_dir(&self, prefix: &str) -> Result<Vec<String>> {
        let dot_prefix = format!("{prefix}.");
        let data = self.data.read().await;
        let mut names: Vec<String> = Vec::new();
        for key in data.keys() {
            if let Some(rest) = key.strip_prefix(&dot_prefix) {
                let child = rest.split('.').next().unwrap_or(rest).to_string();
                if names.last() != Some(&child) {
                    names.push(child);
                }
            }
        }
        names.dedup();
        Ok(names)
    }

    async fn commit(&self, txn: KvsTxn) -> Result<()> {
        if *self.fail_commits.read().await {
            return Err(anyhow!("commit failed (poisoned store)"));
        }
        let mut data = self.data.write().await;
        for op in txn.ops() {
            match op {
                KvsOp::Append { key, line } => match data.get_mut(key) {
                    Some(Entry::Log(log)) => log.push_str(line),
                    Some(Entry::Doc(_)) => {
                        return Err(anyhow!("{key} holds a document, cannot append"));
                    }
                    None => {
                        data.insert(key.clone(), Entry::Log(line.clone()));
                    }
                },
                KvsOp::Put { key, value } => {
                    data.insert(key.clone(), Entry::Doc(value.clone()));
                }
                KvsOp::Unlink { key } => {
                    let dir_prefix = format!("{key}.");
                    data.retain(|k, _| k != key && !k.starts_with(&dir_prefix));
                }
            }
        }
        Ok(())
    }
}
