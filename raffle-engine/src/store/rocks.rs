//! RocksDB-backed raffle store
//!
//! # Column Families
//!
//! - `raffles` - Raffle rows (key: raffle_id)
//! - `participations` - Entries (key: len(raffle_id) || raffle_id || user_id)
//! - `winners` - Drawn places (key: len(raffle_id) || raffle_id || place)
//!
//! Conditional writes run their check and their `WriteBatch` under one
//! writer lock. All database work happens on the blocking pool.

use super::{
    merge_entry, raise_flag, EntryRegistration, RaffleFilter, RaffleStore, Registration,
    StatusChange, StatusChangeResult, WinnerFlag,
};
use crate::config::Config;
use crate::error::{RaffleError, Result};
use crate::types::{
    Participation, ParticipationStatus, Raffle, RaffleId, RaffleStatus, WinnerRecord,
};
use async_trait::async_trait;
use ledger_core::{StoreError, StoreResult, UserId};
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use std::path::Path;
use std::sync::Arc;

const CF_RAFFLES: &str = "raffles";
const CF_PARTICIPATIONS: &str = "participations";
const CF_WINNERS: &str = "winners";

/// [`RaffleStore`] on RocksDB
pub struct RocksRaffleStore {
    inner: Arc<Inner>,
}

struct Inner {
    db: DB,
    write_lock: Mutex<()>,
    sync_writes: bool,
}

impl std::fmt::Debug for RocksRaffleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksRaffleStore")
            .field("path", &self.inner.db.path())
            .field("sync_writes", &self.inner.sync_writes)
            .finish()
    }
}

impl RocksRaffleStore {
    /// Open or create the database under `config.data_dir`
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_path(&config.data_dir, config)
    }

    /// Open or create the database at `path`
    pub fn open_path(path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .map_err(|e| RaffleError::Config(format!("Failed to create {:?}: {}", path, e)))?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_RAFFLES, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_PARTICIPATIONS, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_WINNERS, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)
            .map_err(|e| RaffleError::Store(e.into()))?;

        tracing::info!(path = ?path, "Opened raffle RocksDB");

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                write_lock: Mutex::new(()),
                sync_writes: config.rocksdb.sync_writes,
            }),
        })
    }

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

    fn cf_options_rows() -> Options {
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

    fn raffle_prefix(raffle_id: &RaffleId) -> Vec<u8> {
        let bytes = raffle_id.as_str().as_bytes();
        let mut key = Vec::with_capacity(4 + bytes.len() + 16);
        key.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        key.extend_from_slice(bytes);
        key
    }

    fn participation_key(raffle_id: &RaffleId, user_id: &UserId) -> Vec<u8> {
        let mut key = Self::raffle_prefix(raffle_id);
        key.extend_from_slice(user_id.as_str().as_bytes());
        key
    }

    fn winner_key(raffle_id: &RaffleId, place: u32) -> Vec<u8> {
        let mut key = Self::raffle_prefix(raffle_id);
        key.extend_from_slice(&place.to_be_bytes());
        key
    }

    // Row helpers

    fn read_raffle(&self, id: &RaffleId) -> StoreResult<Option<Raffle>> {
        let cf = self.cf_handle(CF_RAFFLES)?;
        match self.db.get_cf(cf, id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_participation(
        &self,
        raffle_id: &RaffleId,
        user_id: &UserId,
    ) -> StoreResult<Option<Participation>> {
        let cf = self.cf_handle(CF_PARTICIPATIONS)?;
        match self
            .db
            .get_cf(cf, Self::participation_key(raffle_id, user_id))?
        {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_prefix<T: serde::de::DeserializeOwned>(
        &self,
        cf_name: &str,
        raffle_id: &RaffleId,
    ) -> StoreResult<Vec<T>> {
        let cf = self.cf_handle(cf_name)?;
        let prefix = Self::raffle_prefix(raffle_id);

        let mut rows = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    fn read_winners(&self, raffle_id: &RaffleId) -> StoreResult<Vec<WinnerRecord>> {
        // Big-endian place keys scan in place order
        self.scan_prefix(CF_WINNERS, raffle_id)
    }

    fn put_raffle(&self, batch: &mut WriteBatch, raffle: &Raffle) -> StoreResult<()> {
        batch.put_cf(
            self.cf_handle(CF_RAFFLES)?,
            raffle.id.as_str().as_bytes(),
            bincode::serialize(raffle)?,
        );
        Ok(())
    }

    // Store operations, run on the blocking pool

    fn insert_raffle(&self, raffle: &Raffle) -> StoreResult<Raffle> {
        let _guard = self.write_lock.lock();
        if let Some(existing) = self.read_raffle(&raffle.id)? {
            return Ok(existing);
        }
        let mut batch = WriteBatch::default();
        self.put_raffle(&mut batch, raffle)?;
        self.db.write_opt(batch, &self.write_options())?;

        tracing::debug!(raffle_id = %raffle.id, "Raffle recorded");
        Ok(raffle.clone())
    }

    fn list_raffles(&self, filter: &RaffleFilter) -> StoreResult<Vec<Raffle>> {
        let cf = self.cf_handle(CF_RAFFLES)?;
        let mut raffles = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let raffle: Raffle = bincode::deserialize(&value)?;
            if filter.matches(&raffle) {
                raffles.push(raffle);
            }
        }
        raffles.sort_by(|a, b| a.end_time.cmp(&b.end_time).then_with(|| a.id.cmp(&b.id)));
        raffles.truncate(filter.limit.unwrap_or(raffles.len()));
        Ok(raffles)
    }

    fn change_status(
        &self,
        id: &RaffleId,
        change: &StatusChange,
    ) -> StoreResult<StatusChangeResult> {
        let _guard = self.write_lock.lock();
        let mut raffle = match self.read_raffle(id)? {
            Some(raffle) => raffle,
            None => return Ok(StatusChangeResult::NotFound),
        };
        if !change.permits(&raffle) {
            return Ok(StatusChangeResult::Rejected(raffle));
        }

        change.apply_to(&mut raffle);
        let mut batch = WriteBatch::default();
        self.put_raffle(&mut batch, &raffle)?;
        self.db.write_opt(batch, &self.write_options())?;

        tracing::debug!(raffle_id = %id, status = %raffle.status, "Raffle status changed");
        Ok(StatusChangeResult::Changed(raffle))
    }

    fn register_entry(&self, registration: &EntryRegistration) -> StoreResult<Registration> {
        let _guard = self.write_lock.lock();
        let mut raffle = match self.read_raffle(&registration.raffle_id)? {
            Some(raffle) => raffle,
            None => return Ok(Registration::NotFound),
        };

        let existing = self.read_participation(&registration.raffle_id, &registration.user_id)?;
        if let Some(participation) = existing
            .as_ref()
            .filter(|p| p.fee_transactions.contains(&registration.fee_transaction_id))
        {
            return Ok(Registration::AlreadyRegistered(participation.clone()));
        }
        if raffle.status != RaffleStatus::Active {
            return Ok(Registration::Closed(raffle.status));
        }

        let (participation, new_participant) = merge_entry(existing, registration);
        if new_participant {
            raffle.participants_count += 1;
        }
        raffle.total_entries += u64::from(registration.entries);

        let mut batch = WriteBatch::default();
        self.put_raffle(&mut batch, &raffle)?;
        batch.put_cf(
            self.cf_handle(CF_PARTICIPATIONS)?,
            Self::participation_key(&registration.raffle_id, &registration.user_id),
            bincode::serialize(&participation)?,
        );
        self.db.write_opt(batch, &self.write_options())?;

        Ok(Registration::Registered {
            participation,
            new_participant,
        })
    }

    fn participations(&self, raffle_id: &RaffleId) -> StoreResult<Vec<Participation>> {
        let mut rows: Vec<Participation> = self.scan_prefix(CF_PARTICIPATIONS, raffle_id)?;
        rows.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        Ok(rows)
    }

    fn set_participation_status(
        &self,
        raffle_id: &RaffleId,
        user_id: &UserId,
        status: ParticipationStatus,
    ) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        if let Some(mut participation) = self.read_participation(raffle_id, user_id)? {
            participation.status = status;
            self.db.put_cf_opt(
                self.cf_handle(CF_PARTICIPATIONS)?,
                Self::participation_key(raffle_id, user_id),
                bincode::serialize(&participation)?,
                &self.write_options(),
            )?;
        }
        Ok(())
    }

    fn insert_winners(
        &self,
        raffle_id: &RaffleId,
        winners: &[WinnerRecord],
    ) -> StoreResult<Vec<WinnerRecord>> {
        let _guard = self.write_lock.lock();
        let existing = self.read_winners(raffle_id)?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        let cf = self.cf_handle(CF_WINNERS)?;
        let mut batch = WriteBatch::default();
        for winner in winners {
            batch.put_cf(
                cf,
                Self::winner_key(raffle_id, winner.place),
                bincode::serialize(winner)?,
            );
        }
        self.db.write_opt(batch, &self.write_options())?;

        let mut stored = winners.to_vec();
        stored.sort_by_key(|w| w.place);
        Ok(stored)
    }

    fn set_winner_flag(
        &self,
        raffle_id: &RaffleId,
        place: u32,
        flag: WinnerFlag,
    ) -> StoreResult<Option<WinnerRecord>> {
        let _guard = self.write_lock.lock();
        let cf = self.cf_handle(CF_WINNERS)?;
        let key = Self::winner_key(raffle_id, place);
        let mut winner: WinnerRecord = match self.db.get_cf(cf, &key)? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => return Ok(None),
        };
        raise_flag(&mut winner, flag);
        self.db
            .put_cf_opt(cf, key, bincode::serialize(&winner)?, &self.write_options())?;
        Ok(Some(winner))
    }
}

#[async_trait]
impl RaffleStore for RocksRaffleStore {
    async fn insert_raffle(&self, raffle: &Raffle) -> StoreResult<Raffle> {
        let raffle = raffle.clone();
        self.blocking(move |inner| inner.insert_raffle(&raffle)).await
    }

    async fn load_raffle(&self, id: &RaffleId) -> StoreResult<Option<Raffle>> {
        let id = id.clone();
        self.blocking(move |inner| inner.read_raffle(&id)).await
    }

    async fn list_raffles(&self, filter: &RaffleFilter) -> StoreResult<Vec<Raffle>> {
        let filter = filter.clone();
        self.blocking(move |inner| inner.list_raffles(&filter)).await
    }

    async fn change_status(
        &self,
        id: &RaffleId,
        change: &StatusChange,
    ) -> StoreResult<StatusChangeResult> {
        let id = id.clone();
        let change = change.clone();
        self.blocking(move |inner| inner.change_status(&id, &change)).await
    }

    async fn register_entry(&self, registration: &EntryRegistration) -> StoreResult<Registration> {
        let registration = registration.clone();
        self.blocking(move |inner| inner.register_entry(&registration)).await
    }

    async fn load_participation(
        &self,
        raffle_id: &RaffleId,
        user_id: &UserId,
    ) -> StoreResult<Option<Participation>> {
        let raffle_id = raffle_id.clone();
        let user_id = user_id.clone();
        self.blocking(move |inner| inner.read_participation(&raffle_id, &user_id)).await
    }

    async fn participations(&self, raffle_id: &RaffleId) -> StoreResult<Vec<Participation>> {
        let raffle_id = raffle_id.clone();
        self.blocking(move |inner| inner.participations(&raffle_id)).await
    }

    async fn set_participation_status(
        &self,
        raffle_id: &RaffleId,
        user_id: &UserId,
        status: ParticipationStatus,
    ) -> StoreResult<()> {
        let raffle_id = raffle_id.clone();
        let user_id = user_id.clone();
        self.blocking(move |inner| inner.set_participation_status(&raffle_id, &user_id, status))
            .await
    }

    async fn insert_winners(
        &self,
        raffle_id: &RaffleId,
        winners: &[WinnerRecord],
    ) -> StoreResult<Vec<WinnerRecord>> {
        let raffle_id = raffle_id.clone();
        let winners = winners.to_vec();
        self.blocking(move |inner| inner.insert_winners(&raffle_id, &winners)).await
    }

    async fn winners(&self, raffle_id: &RaffleId) -> StoreResult<Vec<WinnerRecord>> {
        let raffle_id = raffle_id.clone();
        self.blocking(move |inner| inner.read_winners(&raffle_id)).await
    }

    async fn set_winner_flag(
        &self,
        raffle_id: &RaffleId,
        place: u32,
        flag: WinnerFlag,
    ) -> StoreResult<Option<WinnerRecord>> {
        let raffle_id = raffle_id.clone();
        self.blocking(move |inner| inner.set_winner_flag(&raffle_id, place, flag)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use ledger_core::{Currency, TransactionId};
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;

    fn open_store(dir: &tempfile::TempDir) -> RocksRaffleStore {
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        RocksRaffleStore::open(&config).unwrap()
    }

    fn raffle(id: &str) -> Raffle {
        let now = Utc::now();
        Raffle {
            id: RaffleId::new(id),
            title: "Weekly".into(),
            entry_fee: Decimal::ONE,
            entry_currency: Currency::Tickets,
            prize_amount: Decimal::new(10050, 2),
            prize_currency: Currency::Winix,
            start_time: now - Duration::hours(1),
            end_time: now + Duration::hours(1),
            winners_count: 2,
            status: RaffleStatus::Active,
            participants_count: 0,
            total_entries: 0,
            prize_distribution: BTreeMap::from([(1, Decimal::from(70)), (2, Decimal::new(3050, 2))]),
            lease: None,
            created_at: now,
            settled_at: None,
        }
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = RaffleId::new("r1");

        {
            let store = open_store(&dir);
            store.insert_raffle(&raffle("r1")).await.unwrap();
            for (user, fee) in [("a", "f1"), ("b", "f2"), ("a", "f3")] {
                store
                    .register_entry(&EntryRegistration {
                        raffle_id: id.clone(),
                        user_id: UserId::new(user),
                        entries: 2,
                        fee_transaction_id: TransactionId::new(fee),
                        now: Utc::now(),
                    })
                    .await
                    .unwrap();
            }
        }

        let store = open_store(&dir);
        let stored = store.load_raffle(&id).await.unwrap().unwrap();
        assert_eq!(stored.participants_count, 2);
        assert_eq!(stored.total_entries, 6);
        assert_eq!(stored.prize_distribution.get(&2), Some(&Decimal::new(3050, 2)));

        let rows = store.participations(&id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].user_id, UserId::new("a"));
        assert_eq!(rows[0].entry_count, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_entries_are_all_counted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(&dir));
        let id = RaffleId::new("r1");
        store.insert_raffle(&raffle("r1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..12 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .register_entry(&EntryRegistration {
                        raffle_id: id,
                        user_id: UserId::new(format!("user-{}", i % 4)),
                        entries: 1,
                        fee_transaction_id: TransactionId::new(format!("fee-{}", i)),
                        now: Utc::now(),
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.load_raffle(&id).await.unwrap().unwrap();
        assert_eq!(stored.participants_count, 4);
        assert_eq!(stored.total_entries, 12);
        let rows = store.participations(&id).await.unwrap();
        assert!(rows.iter().all(|p| p.entry_count == 3));
    }

    #[tokio::test]
    async fn test_raffle_prefixes_do_not_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        for id in ["r1", "r10"] {
            store.insert_raffle(&raffle(id)).await.unwrap();
            store
                .register_entry(&EntryRegistration {
                    raffle_id: RaffleId::new(id),
                    user_id: UserId::new("u"),
                    entries: 1,
                    fee_transaction_id: TransactionId::new(format!("fee-{}", id)),
                    now: Utc::now(),
                })
                .await
                .unwrap();
        }

        let rows = store.participations(&RaffleId::new("r1")).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_list_filters_by_status_and_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.insert_raffle(&raffle("r1")).await.unwrap();
        store.insert_raffle(&raffle("r2")).await.unwrap();

        let filter = RaffleFilter {
            statuses: vec![RaffleStatus::Active],
            ended_by: Some(Utc::now() + Duration::hours(2)),
            limit: Some(1),
            ..RaffleFilter::default()
        };
        assert_eq!(store.list_raffles(&filter).await.unwrap().len(), 1);

        let none_ended = RaffleFilter {
            ended_by: Some(Utc::now()),
            ..RaffleFilter::default()
        };
        assert!(store.list_raffles(&none_ended).await.unwrap().is_empty());
    }
}
