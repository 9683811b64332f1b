// src/storage.rs
// Persistent store capabilities and their RocksDB / in-memory backends.
//
// The consensus core only sees the three narrow traits below. Commit
// bitmaps live under a sibling `commit_bitmap/{n}` key so sync serving and
// epoch replay can read them without decoding blocks.

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use rocksdb::{Options, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use crate::block::{Block, BlockNumber, Receipt};
use crate::slashing::EvidenceRecord;

/// Shared RocksDB handle (Arc for cheap cloning).
pub type RocksDb = Arc<DB>;

pub trait BlockStore: Send + Sync {
    /// Persist a finalised block: decoded form for indexing, the exact raw
    /// bytes for sync serving, and the decisive commit bitmap.
    fn put_full_block(&self, block: &Block, raw_bytes: &[u8], bitmap: u64) -> Result<()>;
    fn get_raw_block_by_number(&self, number: BlockNumber) -> Result<Option<Vec<u8>>>;
    fn get_commit_bitmap(&self, number: BlockNumber) -> Result<Option<u64>>;
    fn set_latest_block_number(&self, number: BlockNumber) -> Result<()>;
    fn get_latest_block_number(&self) -> Result<Option<BlockNumber>>;
}

pub trait ReceiptStore: Send + Sync {
    fn put_receipts(&self, number: BlockNumber, receipts: &[Receipt]) -> Result<()>;
    fn get_receipts(&self, number: BlockNumber) -> Result<Vec<Receipt>>;
}

/// Evidence stream, keyed `(block_number, validator_index, kind)` so
/// resubmitted evidence is visibly idempotent.
pub trait EvidenceStore: Send + Sync {
    fn put_evidence(&self, record: &EvidenceRecord) -> Result<()>;
    fn has_evidence(&self, key: &str) -> Result<bool>;
    fn list_evidence(&self) -> Result<Vec<EvidenceRecord>>;
}

fn block_key(number: BlockNumber) -> String {
    // zero-padded so lexicographic key order equals numeric order
    format!("block/{:020}", number)
}

fn bitmap_key(number: BlockNumber) -> String {
    format!("commit_bitmap/{:020}", number)
}

fn receipts_key(number: BlockNumber) -> String {
    format!("receipts/{:020}", number)
}

fn evidence_key(key: &str) -> String {
    format!("evidence/{}", key)
}

const LATEST_KEY: &str = "meta/latest_block";

/// Open RocksDB with retry/backoff; transient lock contention during a
/// restart resolves within a few attempts.
pub fn open_db(path: &Path) -> Result<RocksDb> {
    let mut attempt = 0u32;
    let max_attempts = 8u32;
    let mut wait = 250u64;

    loop {
        match open_rocksdb_internal(path) {
            Ok(db) => return Ok(Arc::new(db)),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(anyhow!(
                        "failed to open RocksDB at '{}' after {} attempts: {}",
                        path.display(),
                        attempt,
                        e
                    ));
                }
                log::warn!(
                    "open_db attempt {}/{} failed: {} - retrying in {}ms",
                    attempt,
                    max_attempts,
                    e,
                    wait
                );
                sleep(Duration::from_millis(wait));
                wait = std::cmp::min(wait * 2, 2000);
            }
        }
    }
}

fn open_rocksdb_internal(path: &Path) -> Result<DB, rocksdb::Error> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.increase_parallelism(num_cpus::get() as i32);
    opts.set_max_background_jobs(4);
    opts.set_write_buffer_size(64 * 1024 * 1024);
    opts.set_max_open_files(512);
    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    DB::open(&opts, path)
}

/// RocksDB-backed implementation of all three store capabilities.
#[derive(Clone)]
pub struct RocksStore {
    db: RocksDb,
}

impl RocksStore {
    pub fn new(db: RocksDb) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { db: open_db(path)? })
    }

    fn put_json<V: serde::Serialize>(&self, key: &str, val: &V) -> Result<()> {
        let bytes = serde_json::to_vec(val)?;
        self.db.put(key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl BlockStore for RocksStore {
    fn put_full_block(&self, block: &Block, raw_bytes: &[u8], bitmap: u64) -> Result<()> {
        let number = self.get_latest_block_number()?.map_or(1, |n| n + 1);
        self.put_json(&block_key(number), &block.header)?;
        self.db
            .put(format!("{}/raw", block_key(number)).as_bytes(), raw_bytes)?;
        self.db.put(bitmap_key(number).as_bytes(), bitmap.to_le_bytes())?;
        self.set_latest_block_number(number)?;
        Ok(())
    }

    fn get_raw_block_by_number(&self, number: BlockNumber) -> Result<Option<Vec<u8>>> {
        Ok(self
            .db
            .get(format!("{}/raw", block_key(number)).as_bytes())?)
    }

    fn get_commit_bitmap(&self, number: BlockNumber) -> Result<Option<u64>> {
        match self.db.get(bitmap_key(number).as_bytes())? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow!("invalid bitmap bytes for block {}", number))?;
                Ok(Some(u64::from_le_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    fn set_latest_block_number(&self, number: BlockNumber) -> Result<()> {
        self.db.put(LATEST_KEY.as_bytes(), number.to_le_bytes())?;
        Ok(())
    }

    fn get_latest_block_number(&self) -> Result<Option<BlockNumber>> {
        match self.db.get(LATEST_KEY.as_bytes())? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow!("invalid latest-block bytes"))?;
                Ok(Some(u64::from_le_bytes(arr)))
            }
            None => Ok(None),
        }
    }
}

impl ReceiptStore for RocksStore {
    fn put_receipts(&self, number: BlockNumber, receipts: &[Receipt]) -> Result<()> {
        self.put_json(&receipts_key(number), &receipts.to_vec())
    }

    fn get_receipts(&self, number: BlockNumber) -> Result<Vec<Receipt>> {
        Ok(self.get_json(&receipts_key(number))?.unwrap_or_default())
    }
}

impl EvidenceStore for RocksStore {
    fn put_evidence(&self, record: &EvidenceRecord) -> Result<()> {
        self.put_json(&evidence_key(&record.key()), record)
    }

    fn has_evidence(&self, key: &str) -> Result<bool> {
        Ok(self.db.get(evidence_key(key).as_bytes())?.is_some())
    }

    fn list_evidence(&self) -> Result<Vec<EvidenceRecord>> {
        let prefix = b"evidence/";
        let mut out = Vec::new();
        for item in self.db.prefix_iterator(prefix) {
            let (k, v) = item?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }
}

/// In-memory store used by tests and ephemeral nodes.
#[derive(Default)]
pub struct MemStore {
    raw_blocks: RwLock<HashMap<BlockNumber, Vec<u8>>>,
    bitmaps: RwLock<HashMap<BlockNumber, u64>>,
    receipts: RwLock<HashMap<BlockNumber, Vec<Receipt>>>,
    evidence: RwLock<HashMap<String, EvidenceRecord>>,
    latest: RwLock<Option<BlockNumber>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl BlockStore for MemStore {
    fn put_full_block(&self, _block: &Block, raw_bytes: &[u8], bitmap: u64) -> Result<()> {
        let number = self.latest.read().map_or(1, |n| n + 1);
        self.raw_blocks.write().insert(number, raw_bytes.to_vec());
        self.bitmaps.write().insert(number, bitmap);
        *self.latest.write() = Some(number);
        Ok(())
    }

    fn get_raw_block_by_number(&self, number: BlockNumber) -> Result<Option<Vec<u8>>> {
        Ok(self.raw_blocks.read().get(&number).cloned())
    }

    fn get_commit_bitmap(&self, number: BlockNumber) -> Result<Option<u64>> {
        Ok(self.bitmaps.read().get(&number).copied())
    }

    fn set_latest_block_number(&self, number: BlockNumber) -> Result<()> {
        *self.latest.write() = Some(number);
        Ok(())
    }

    fn get_latest_block_number(&self) -> Result<Option<BlockNumber>> {
        Ok(*self.latest.read())
    }
}

impl ReceiptStore for MemStore {
    fn put_receipts(&self, number: BlockNumber, receipts: &[Receipt]) -> Result<()> {
        self.receipts.write().insert(number, receipts.to_vec());
        Ok(())
    }

    fn get_receipts(&self, number: BlockNumber) -> Result<Vec<Receipt>> {
        Ok(self.receipts.read().get(&number).cloned().unwrap_or_default())
    }
}

impl EvidenceStore for MemStore {
    fn put_evidence(&self, record: &EvidenceRecord) -> Result<()> {
        self.evidence.write().insert(record.key(), record.clone());
        Ok(())
    }

    fn has_evidence(&self, key: &str) -> Result<bool> {
        Ok(self.evidence.read().contains_key(key))
    }

    fn list_evidence(&self) -> Result<Vec<EvidenceRecord>> {
        Ok(self.evidence.read().values().cloned().collect())
    }
}
