//! RocksDB-backed ledger store
//!
//! # Column Families
//!
//! - `balances` - Balance rows (key: user_id)
//! - `transactions` - Transaction records (key: transaction_id)
//! - `user_index` - Per-user history (key: len(user_id) || user_id || seq)
//! - `pending` - PENDING records awaiting reconciliation (key: created_at || seq)
//! - `meta` - Counters
//!
//! RocksDB has no conditional update, so inserts and commits run their
//! checks and their `WriteBatch` under one writer lock. Reads go straight to
//! the database. Every call runs on the blocking pool so disk I/O never
//! stalls the async workers and the caller's timeout stays live.

use super::{newest_first, Commit, LedgerStore, VersionedBalance};
use crate::config::Config;
use crate::error::{LedgerError, StoreError, StoreResult};
use crate::types::{HistoryFilter, TransactionId, TransactionRecord, TransactionStatus, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Column family names
const CF_BALANCES: &str = "balances";
const CF_TRANSACTIONS: &str = "transactions";
const CF_USER_INDEX: &str = "user_index";
const CF_PENDING: &str = "pending";
const CF_META: &str = "meta";

const KEY_NEXT_SEQ: &[u8] = b"next_seq";

#[derive(Debug, Serialize, Deserialize)]
struct StoredTransaction {
    seq: u64,
    record: TransactionRecord,
}

/// [`LedgerStore`] on RocksDB
pub struct RocksStore {
    inner: Arc<Inner>,
}

/// Database handle shared with blocking tasks
struct Inner {
    db: DB,
    write_lock: Mutex<()>,
    sync_writes: bool,
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.inner.db.path())
            .field("sync_writes", &self.inner.sync_writes)
            .finish()
    }
}

impl RocksStore {
    /// Open or create the database under `config.data_dir`
    pub fn open(config: &Config) -> Result<Self, LedgerError> {
        Self::open_path(&config.data_dir, config)
    }

    /// Open or create the database at `path`
    pub fn open_path(path: impl AsRef<Path>, config: &Config) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_BALANCES, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_USER_INDEX, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_PENDING, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)
            .map_err(|e| LedgerError::Store(e.into()))?;

        tracing::info!(path = ?path, "Opened ledger RocksDB");

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                write_lock: Mutex::new(()),
                sync_writes: config.rocksdb.sync_writes,
            }),
        })
    }

    /// Run `op` against the database on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&Inner) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StoreError::Backend(format!("RocksDB task failed: {}", e)))?
    }

    // Column family options

    fn cf_options_rows() -> Options {
        let mut opts = Options::default();
        // Balances are read on every apply, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }
}

impl Inner {
    fn cf_handle(&self, name: &str) -> StoreResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("Column family {} not found", name)))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    // Key helpers

    fn user_prefix(user_id: &UserId) -> Vec<u8> {
        let bytes = user_id.as_str().as_bytes();
        let mut key = Vec::with_capacity(4 + bytes.len() + 8);
        key.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        key.extend_from_slice(bytes);
        key
    }

    fn user_index_key(user_id: &UserId, seq: u64) -> Vec<u8> {
        let mut key = Self::user_prefix(user_id);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn pending_key(created_at: DateTime<Utc>, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(16);
        key.extend_from_slice(&Self::ordered_nanos(created_at).to_be_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    /// Signed nanos mapped onto u64 so byte order matches time order
    fn ordered_nanos(at: DateTime<Utc>) -> u64 {
        (at.timestamp_nanos_opt().unwrap_or(i64::MAX) as u64) ^ (1 << 63)
    }

    // Row helpers

    fn read_stored(&self, id: &TransactionId) -> StoreResult<Option<StoredTransaction>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        match self.db.get_cf(cf, id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_balance(&self, user_id: &UserId) -> StoreResult<VersionedBalance> {
        let cf = self.cf_handle(CF_BALANCES)?;
        match self.db.get_cf(cf, user_id.as_str().as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(VersionedBalance::default()),
        }
    }

    fn next_seq(&self) -> StoreResult<u64> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(cf, KEY_NEXT_SEQ)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Serialization("corrupt sequence counter".into()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    // Store operations, run on the blocking pool

    fn insert_transaction(&self, record: &TransactionRecord) -> StoreResult<TransactionRecord> {
        let _guard = self.write_lock.lock();

        if let Some(existing) = self.read_stored(&record.id)? {
            return Ok(existing.record);
        }

        let seq = self.next_seq()?;
        let stored = StoredTransaction {
            seq,
            record: record.clone(),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf_handle(CF_TRANSACTIONS)?,
            record.id.as_str().as_bytes(),
            bincode::serialize(&stored)?,
        );
        batch.put_cf(
            self.cf_handle(CF_USER_INDEX)?,
            Self::user_index_key(&record.user_id, seq),
            record.id.as_str().as_bytes(),
        );
        if record.status == TransactionStatus::Pending {
            batch.put_cf(
                self.cf_handle(CF_PENDING)?,
                Self::pending_key(record.created_at, seq),
                record.id.as_str().as_bytes(),
            );
        }
        batch.put_cf(self.cf_handle(CF_META)?, KEY_NEXT_SEQ, (seq + 1).to_be_bytes());

        self.db.write_opt(batch, &self.write_options())?;

        tracing::debug!(
            transaction_id = %record.id,
            user_id = %record.user_id,
            seq,
            "Transaction recorded"
        );

        Ok(record.clone())
    }

    fn commit(&self, commit: &Commit) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let record = &commit.transaction;

        let stored = self.read_stored(&record.id)?.ok_or_else(|| {
            StoreError::Backend(format!("transaction {} was never inserted", record.id))
        })?;
        if stored.record.status != TransactionStatus::Pending {
            return Err(StoreError::Conflict(format!(
                "transaction {} is already {:?}",
                record.id, stored.record.status
            )));
        }

        let current = self.read_balance(&record.user_id)?;
        if current.version != commit.expected_version {
            return Err(StoreError::Conflict(format!(
                "balance of {} moved from version {} to {}",
                record.user_id, commit.expected_version, current.version
            )));
        }

        let mut batch = WriteBatch::default();
        if let Some(balance) = commit.new_balance {
            let row = VersionedBalance {
                balance,
                version: current.version + 1,
            };
            batch.put_cf(
                self.cf_handle(CF_BALANCES)?,
                record.user_id.as_str().as_bytes(),
                bincode::serialize(&row)?,
            );
        }
        let updated = StoredTransaction {
            seq: stored.seq,
            record: record.clone(),
        };
        batch.put_cf(
            self.cf_handle(CF_TRANSACTIONS)?,
            record.id.as_str().as_bytes(),
            bincode::serialize(&updated)?,
        );
        batch.delete_cf(
            self.cf_handle(CF_PENDING)?,
            Self::pending_key(stored.record.created_at, stored.seq),
        );

        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn user_transactions(
        &self,
        user_id: &UserId,
        filter: &HistoryFilter,
    ) -> StoreResult<Vec<TransactionRecord>> {
        let cf = self.cf_handle(CF_USER_INDEX)?;
        let prefix = Self::user_prefix(user_id);

        let mut records = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let id = TransactionId::new(String::from_utf8_lossy(&value).into_owned());
            if let Some(stored) = self.read_stored(&id)? {
                if filter.matches(&stored.record) {
                    records.push((stored.seq, stored.record));
                }
            }
        }

        Ok(newest_first(records, filter))
    }

    fn pending_transactions(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TransactionRecord>> {
        let cf = self.cf_handle(CF_PENDING)?;
        let cutoff = Self::ordered_nanos(created_before);

        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            if records.len() >= limit {
                break;
            }
            let (key, value) = item?;
            let mut nanos = [0u8; 8];
            nanos.copy_from_slice(&key[..8]);
            if u64::from_be_bytes(nanos) >= cutoff {
                break;
            }
            let id = TransactionId::new(String::from_utf8_lossy(&value).into_owned());
            if let Some(stored) = self.read_stored(&id)? {
                if stored.record.status == TransactionStatus::Pending {
                    records.push(stored.record);
                }
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl LedgerStore for RocksStore {
    async fn load_balance(&self, user_id: &UserId) -> StoreResult<VersionedBalance> {
        let user_id = user_id.clone();
        self.blocking(move |inner| inner.read_balance(&user_id)).await
    }

    async fn load_transaction(&self, id: &TransactionId) -> StoreResult<Option<TransactionRecord>> {
        let id = id.clone();
        self.blocking(move |inner| Ok(inner.read_stored(&id)?.map(|stored| stored.record)))
            .await
    }

    async fn insert_transaction(&self, record: &TransactionRecord) -> StoreResult<TransactionRecord> {
        let record = record.clone();
        self.blocking(move |inner| inner.insert_transaction(&record)).await
    }

    async fn commit(&self, commit: &Commit) -> StoreResult<()> {
        let commit = commit.clone();
        self.blocking(move |inner| inner.commit(&commit)).await
    }

    async fn user_transactions(
        &self,
        user_id: &UserId,
        filter: &HistoryFilter,
    ) -> StoreResult<Vec<TransactionRecord>> {
        let user_id = user_id.clone();
        let filter = filter.clone();
        self.blocking(move |inner| inner.user_transactions(&user_id, &filter)).await
    }

    async fn pending_transactions(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TransactionRecord>> {
        self.blocking(move |inner| inner.pending_transactions(created_before, limit))
            .await
    }
}
