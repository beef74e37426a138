//! Storage layer using RocksDB
//!
//! The ledger store is a pessimistic `TransactionDB`. Every mutating operation
//! runs inside a [`UnitOfWork`] that locks the rows it reads for update, so two
//! purchases against the same stock line serialize while disjoint transfers run
//! in parallel. A unit of work that is dropped without `commit` is rolled back.
//!
//! # Column Families
//!
//! - `accounts` - Accounts (key: account_id)
//! - `stands` - Stands (key: stand_id)
//! - `stock` - Stock lines (key: stock_line_id)
//! - `transactions` - Append-only transaction records (key: transaction_id)
//! - `tombolas` - Tombolas (key: tombola_id)
//! - `tickets` - Tickets (key: ticket_id)
//! - `prizes` - Prizes (key: prize_id)
//! - `winners` - Append-only winner records (key: winner_id)
//! - `indices` - Secondary indices (key: tag || owner || id, or tag || unique value)
//! - `payment_orders` - Token orders awaiting payment confirmation (key: payment ref)

use crate::{
    error::{Error, Result},
    types::{
        Account, AccountId, NewTransaction, Prize, PrizeId, Stand, StandId, StockLine,
        StockLineId, Ticket, TicketId, TokenOrder, Tombola, TombolaId, TransactionId,
        TransactionRecord, WinnerId, WinnerRecord,
    },
    Config,
};
use chrono::Utc;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompressionType, Direction, IteratorMode, Options,
    SingleThreaded, SnapshotWithThreadMode, Transaction, TransactionDB, TransactionDBOptions,
    TransactionOptions, WriteOptions,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

type Db = TransactionDB<SingleThreaded>;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_STANDS: &str = "stands";
const CF_STOCK: &str = "stock";
const CF_TRANSACTIONS: &str = "transactions";
const CF_TOMBOLAS: &str = "tombolas";
const CF_TICKETS: &str = "tickets";
const CF_PRIZES: &str = "prizes";
const CF_WINNERS: &str = "winners";
const CF_INDICES: &str = "indices";
const CF_PAYMENT_ORDERS: &str = "payment_orders";

/// Column families keyed by a sequential id
const ENTITY_CFS: [&str; 8] = [
    CF_ACCOUNTS,
    CF_STANDS,
    CF_STOCK,
    CF_TRANSACTIONS,
    CF_TOMBOLAS,
    CF_TICKETS,
    CF_PRIZES,
    CF_WINNERS,
];

/// Column families keyed by something else
const AUX_CFS: [&str; 2] = [CF_INDICES, CF_PAYMENT_ORDERS];

/// Index tags
const IDX_ACCOUNT_TX: u8 = b'a';
const IDX_COUNTERPARTY_TX: u8 = b'c';
const IDX_STAND_TX: u8 = b's';
const IDX_PAYMENT_REF: u8 = b'p';
const IDX_TOMBOLA_TICKET: u8 = b'k';
const IDX_TICKET_SERIAL: u8 = b'n';
const IDX_TOMBOLA_WINNER: u8 = b'w';

/// Row lock taken by a read inside a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lock {
    /// Snapshot read, no lock
    None,
    /// Exclusive lock held until commit or rollback
    Exclusive,
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Db,
    /// Highest id allocated per entity column family
    sequences: HashMap<&'static str, AtomicU64>,
    lock_timeout_ms: i64,
    unit_of_work_timeout_ms: i64,
    deadlock_detect: bool,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(config.transactions.lock_timeout_ms);

        let cf_descriptors = ENTITY_CFS
            .iter()
            .chain(AUX_CFS.iter())
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db: Db = TransactionDB::open_cf_descriptors(&db_opts, &txn_db_opts, path, cf_descriptors)?;

        let mut sequences = HashMap::with_capacity(ENTITY_CFS.len());
        for name in ENTITY_CFS {
            let cf = db
                .cf_handle(name)
                .ok_or_else(|| Error::StoreUnavailable(format!("Column family {} not found", name)))?;
            let last = match db.iterator_cf(cf, IteratorMode::End).next() {
                Some(item) => {
                    let (key, _) = item?;
                    decode_id(&key)?
                }
                None => 0,
            };
            sequences.insert(name, AtomicU64::new(last));
        }

        tracing::info!(
            path = ?path,
            column_families = ENTITY_CFS.len() + AUX_CFS.len(),
            "Opened RocksDB transaction store"
        );

        Ok(Self {
            db,
            sequences,
            lock_timeout_ms: config.transactions.lock_timeout_ms,
            unit_of_work_timeout_ms: config.transactions.unit_of_work_timeout_ms,
            deadlock_detect: config.transactions.deadlock_detect,
        })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Append-only history, rarely read back
            CF_TRANSACTIONS | CF_WINNERS => {
                opts.set_compression_type(DBCompressionType::Zstd);
            }
            CF_INDICES => {
                opts.set_compression_type(DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::StoreUnavailable(format!("Column family {} not found", name)))
    }

    fn next_id(&self, cf: &str) -> Result<u64> {
        let sequence = self
            .sequences
            .get(cf)
            .ok_or_else(|| Error::StoreUnavailable(format!("No sequence for {}", cf)))?;
        Ok(sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Begin a unit of work
    pub fn begin(&self) -> UnitOfWork<'_> {
        let write_opts = WriteOptions::default();
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_lock_timeout(self.lock_timeout_ms);
        txn_opts.set_expiration(self.unit_of_work_timeout_ms);
        txn_opts.set_deadlock_detect(self.deadlock_detect);

        UnitOfWork {
            storage: self,
            txn: self.db.transaction_opt(&write_opts, &txn_opts),
        }
    }

    /// Run `f` in a fresh unit of work
    ///
    /// Commits when `f` succeeds. Any error rolls the whole unit back before
    /// it is returned, so no partial effect is ever visible.
    pub fn in_unit_of_work<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&UnitOfWork<'_>) -> Result<T>,
    {
        let uow = self.begin();
        match f(&uow) {
            Ok(value) => {
                uow.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = uow.rollback() {
                    tracing::error!(error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }

    // Committed reads

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.cf_handle(cf)?;
        match self.db.get_cf(handle, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn index_ids(&self, tag: u8, owner: u64) -> Result<Vec<u64>> {
        let handle = self.cf_handle(CF_INDICES)?;
        let prefix = index_prefix(tag, owner);
        let iter = self
            .db
            .iterator_cf(handle, IteratorMode::From(prefix.as_slice(), Direction::Forward));
        collect_index_ids(iter, &prefix)
    }

    /// Get account by ID
    pub fn get_account(&self, id: AccountId) -> Result<Account> {
        self.get(CF_ACCOUNTS, &id.to_key())?
            .ok_or(Error::AccountNotFound(id))
    }

    /// Get stand by ID
    pub fn get_stand(&self, id: StandId) -> Result<Stand> {
        self.get(CF_STANDS, &id.to_key())?.ok_or(Error::StandNotFound(id))
    }

    /// Get stock line by ID
    pub fn get_stock_line(&self, id: StockLineId) -> Result<StockLine> {
        self.get(CF_STOCK, &id.to_key())?
            .ok_or(Error::StockLineNotFound(id))
    }

    /// Get tombola by ID
    pub fn get_tombola(&self, id: TombolaId) -> Result<Tombola> {
        self.get(CF_TOMBOLAS, &id.to_key())?
            .ok_or(Error::TombolaNotFound(id))
    }

    /// Get ticket by ID
    pub fn get_ticket(&self, id: TicketId) -> Result<Ticket> {
        self.get(CF_TICKETS, &id.to_key())?.ok_or(Error::TicketNotFound(id))
    }

    /// Get prize by ID
    pub fn get_prize(&self, id: PrizeId) -> Result<Prize> {
        self.get(CF_PRIZES, &id.to_key())?.ok_or(Error::PrizeNotFound(id))
    }

    /// Get transaction record by ID
    pub fn get_transaction(&self, id: TransactionId) -> Result<Option<TransactionRecord>> {
        self.get(CF_TRANSACTIONS, &id.to_key())
    }

    /// All accounts, creation order
    pub fn all_accounts(&self) -> Result<Vec<Account>> {
        self.snapshot().all_accounts()
    }

    /// All stands, creation order
    pub fn all_stands(&self) -> Result<Vec<Stand>> {
        self.snapshot().all_stands()
    }

    /// All tombolas, creation order
    pub fn all_tombolas(&self) -> Result<Vec<Tombola>> {
        self.snapshot().all_tombolas()
    }

    /// Full transaction history, creation order
    pub fn all_transactions(&self) -> Result<Vec<TransactionRecord>> {
        self.snapshot().all_transactions()
    }

    /// Records booked on `account` or naming it as counterparty, creation order
    pub fn transactions_for_account(&self, account: AccountId) -> Result<Vec<TransactionRecord>> {
        self.snapshot().transactions_for_account(account)
    }

    /// Records made at `stand`, creation order
    pub fn transactions_for_stand(&self, stand: StandId) -> Result<Vec<TransactionRecord>> {
        self.snapshot().transactions_for_stand(stand)
    }

    /// Tickets of a tombola, creation order
    pub fn tickets_for_tombola(&self, tombola: TombolaId) -> Result<Vec<Ticket>> {
        self.index_ids(IDX_TOMBOLA_TICKET, tombola.get())?
            .into_iter()
            .map(|id| self.get_ticket(TicketId::new(id)))
            .collect()
    }

    /// Winner records of a tombola, creation order
    pub fn winners_for_tombola(&self, tombola: TombolaId) -> Result<Vec<WinnerRecord>> {
        self.index_ids(IDX_TOMBOLA_WINNER, tombola.get())?
            .into_iter()
            .map(|id| {
                self.get(CF_WINNERS, &id.to_be_bytes())?.ok_or_else(|| {
                    Error::StoreUnavailable(format!("Dangling winner index entry {}", id))
                })
            })
            .collect()
    }

    /// Pending token order for a payment reference
    pub fn get_payment_order(&self, payment_ref: &str) -> Result<Option<TokenOrder>> {
        self.get(CF_PAYMENT_ORDERS, payment_ref.as_bytes())
    }

    /// All token orders awaiting confirmation, ordered by payment reference
    pub fn pending_payment_orders(&self) -> Result<Vec<(String, TokenOrder)>> {
        let handle = self.cf_handle(CF_PAYMENT_ORDERS)?;
        let mut orders = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (key, value) = item?;
            let payment_ref = String::from_utf8(key.into_vec())
                .map_err(|_| Error::StoreUnavailable("Malformed payment order key".to_string()))?;
            orders.push((payment_ref, bincode::deserialize(&value)?));
        }
        Ok(orders)
    }

    /// Consistent view of the committed state at this instant
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            storage: self,
            inner: self.db.snapshot(),
        }
    }

    /// Storage statistics
    pub fn stats(&self) -> StorageStats {
        let high_water = |cf: &str| {
            self.sequences
                .get(cf)
                .map(|s| s.load(Ordering::SeqCst))
                .unwrap_or(0)
        };
        StorageStats {
            accounts: high_water(CF_ACCOUNTS),
            stands: high_water(CF_STANDS),
            transactions: high_water(CF_TRANSACTIONS),
            tickets: high_water(CF_TICKETS),
            winners: high_water(CF_WINNERS),
        }
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("stats", &self.stats())
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .finish_non_exhaustive()
    }
}

/// Id high-water marks (ids are never reused, so these bound the row counts)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    /// Accounts
    pub accounts: u64,
    /// Stands
    pub stands: u64,
    /// Transaction records
    pub transactions: u64,
    /// Tickets
    pub tickets: u64,
    /// Winner records
    pub winners: u64,
}

/// Point-in-time read view
///
/// Every read through one snapshot sees the same set of commits, so reports
/// that combine several column families never mix states.
pub struct Snapshot<'a> {
    storage: &'a Storage,
    inner: SnapshotWithThreadMode<'a, Db>,
}

impl std::fmt::Debug for Snapshot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").finish_non_exhaustive()
    }
}

impl<'a> Snapshot<'a> {
    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.storage.cf_handle(cf)?;
        match self.inner.get_cf(handle, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let handle = self.storage.cf_handle(cf)?;
        let mut rows = Vec::new();
        for item in self.inner.iterator_cf(handle, IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    fn index_ids(&self, tag: u8, owner: u64) -> Result<Vec<u64>> {
        let handle = self.storage.cf_handle(CF_INDICES)?;
        let prefix = index_prefix(tag, owner);
        let iter = self
            .inner
            .iterator_cf(handle, IteratorMode::From(prefix.as_slice(), Direction::Forward));
        collect_index_ids(iter, &prefix)
    }

    fn load_transactions(&self, ids: Vec<u64>) -> Result<Vec<TransactionRecord>> {
        ids.into_iter()
            .map(|id| {
                self.get(CF_TRANSACTIONS, &id.to_be_bytes())?.ok_or_else(|| {
                    Error::StoreUnavailable(format!("Dangling transaction index entry {}", id))
                })
            })
            .collect()
    }

    /// Get account by ID
    pub fn account(&self, id: AccountId) -> Result<Account> {
        self.get(CF_ACCOUNTS, &id.to_key())?
            .ok_or(Error::AccountNotFound(id))
    }

    /// All accounts, creation order
    pub fn all_accounts(&self) -> Result<Vec<Account>> {
        self.scan(CF_ACCOUNTS)
    }

    /// All stands, creation order
    pub fn all_stands(&self) -> Result<Vec<Stand>> {
        self.scan(CF_STANDS)
    }

    /// All tombolas, creation order
    pub fn all_tombolas(&self) -> Result<Vec<Tombola>> {
        self.scan(CF_TOMBOLAS)
    }

    /// Full transaction history, creation order
    pub fn all_transactions(&self) -> Result<Vec<TransactionRecord>> {
        self.scan(CF_TRANSACTIONS)
    }

    /// Records booked on `account` or naming it as counterparty, creation order
    pub fn transactions_for_account(&self, account: AccountId) -> Result<Vec<TransactionRecord>> {
        let mut ids = self.index_ids(IDX_ACCOUNT_TX, account.get())?;
        ids.extend(self.index_ids(IDX_COUNTERPARTY_TX, account.get())?);
        ids.sort_unstable();
        ids.dedup();
        self.load_transactions(ids)
    }

    /// Records made at `stand`, creation order
    pub fn transactions_for_stand(&self, stand: StandId) -> Result<Vec<TransactionRecord>> {
        let ids = self.index_ids(IDX_STAND_TX, stand.get())?;
        self.load_transactions(ids)
    }
}

/// All-or-nothing group of store mutations
///
/// Reads see the unit's own writes. Rows read with [`Lock::Exclusive`] stay
/// locked until `commit` or `rollback`; dropping the unit rolls it back.
pub struct UnitOfWork<'a> {
    storage: &'a Storage,
    txn: Transaction<'a, Db>,
}

impl std::fmt::Debug for UnitOfWork<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork").finish_non_exhaustive()
    }
}

impl<'a> UnitOfWork<'a> {
    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8], lock: Lock) -> Result<Option<T>> {
        let handle = self.storage.cf_handle(cf)?;
        let value = match lock {
            Lock::None => self.txn.get_cf(handle, key)?,
            Lock::Exclusive => self.txn.get_for_update_cf(handle, key, true)?,
        };
        match value {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let handle = self.storage.cf_handle(cf)?;
        let bytes = bincode::serialize(value)?;
        self.txn.put_cf(handle, key, bytes)?;
        Ok(())
    }

    fn put_index(&self, key: &[u8]) -> Result<()> {
        let handle = self.storage.cf_handle(CF_INDICES)?;
        self.txn.put_cf(handle, key, b"")?;
        Ok(())
    }

    fn index_ids(&self, tag: u8, owner: u64) -> Result<Vec<u64>> {
        let handle = self.storage.cf_handle(CF_INDICES)?;
        let prefix = index_prefix(tag, owner);
        let iter = self
            .txn
            .iterator_cf(handle, IteratorMode::From(prefix.as_slice(), Direction::Forward));
        collect_index_ids(iter, &prefix)
    }

    // Accounts

    /// Allocate an account id
    pub fn next_account_id(&self) -> Result<AccountId> {
        Ok(AccountId::new(self.storage.next_id(CF_ACCOUNTS)?))
    }

    /// Read an account
    pub fn account(&self, id: AccountId, lock: Lock) -> Result<Account> {
        self.read(CF_ACCOUNTS, &id.to_key(), lock)?
            .ok_or(Error::AccountNotFound(id))
    }

    /// Read and exclusively lock an account
    pub fn account_for_update(&self, id: AccountId) -> Result<Account> {
        self.account(id, Lock::Exclusive)
    }

    /// Write an account, rejecting a negative balance
    pub fn put_account(&self, account: &Account) -> Result<()> {
        if account.balance_tokens < 0 {
            return Err(Error::InsufficientBalance {
                account: account.id,
                required: -account.balance_tokens,
                available: 0,
            });
        }
        self.write(CF_ACCOUNTS, &account.id.to_key(), account)
    }

    // Stands and stock

    /// Allocate a stand id
    pub fn next_stand_id(&self) -> Result<StandId> {
        Ok(StandId::new(self.storage.next_id(CF_STANDS)?))
    }

    /// Read a stand
    pub fn stand(&self, id: StandId, lock: Lock) -> Result<Stand> {
        self.read(CF_STANDS, &id.to_key(), lock)?
            .ok_or(Error::StandNotFound(id))
    }

    /// Read and exclusively lock a stand
    pub fn stand_for_update(&self, id: StandId) -> Result<Stand> {
        self.stand(id, Lock::Exclusive)
    }

    /// Write a stand
    pub fn put_stand(&self, stand: &Stand) -> Result<()> {
        self.write(CF_STANDS, &stand.id.to_key(), stand)
    }

    /// Allocate a stock line id
    pub fn next_stock_line_id(&self) -> Result<StockLineId> {
        Ok(StockLineId::new(self.storage.next_id(CF_STOCK)?))
    }

    /// Read a stock line
    pub fn stock_line(&self, id: StockLineId, lock: Lock) -> Result<StockLine> {
        self.read(CF_STOCK, &id.to_key(), lock)?
            .ok_or(Error::StockLineNotFound(id))
    }

    /// Write a stock line, rejecting a negative quantity
    pub fn put_stock_line(&self, line: &StockLine) -> Result<()> {
        if line.quantity < 0 {
            return Err(Error::StockExhausted {
                stock_line: line.id,
                requested: -line.quantity,
                available: 0,
            });
        }
        self.write(CF_STOCK, &line.id.to_key(), line)
    }

    // Transactions

    /// Append a transaction record with its indices
    ///
    /// A payment reference can be appended once; the reference key is locked
    /// so two units crediting the same payment cannot both commit.
    pub fn append_transaction(&self, new: NewTransaction) -> Result<TransactionRecord> {
        if let Some(payment_ref) = &new.payment_ref {
            let key = unique_key(IDX_PAYMENT_REF, payment_ref);
            let handle = self.storage.cf_handle(CF_INDICES)?;
            if self.txn.get_for_update_cf(handle, &key, true)?.is_some() {
                return Err(Error::DuplicatePayment(payment_ref.clone()));
            }
        }

        let id = TransactionId::new(self.storage.next_id(CF_TRANSACTIONS)?);
        let record = TransactionRecord {
            id,
            account_id: new.account_id,
            counterparty_account_id: new.counterparty_account_id,
            amount: new.amount,
            kind: new.kind,
            description: new.description,
            stand_id: new.stand_id,
            tombola_id: new.tombola_id,
            payment_ref: new.payment_ref,
            fiat_amount: new.fiat_amount,
            applied: new.applied,
            manual: new.manual,
            timestamp: Utc::now(),
        };

        self.write(CF_TRANSACTIONS, &id.to_key(), &record)?;
        self.put_index(&index_key(IDX_ACCOUNT_TX, record.account_id.get(), id.get()))?;
        if let Some(counterparty) = record.counterparty_account_id {
            self.put_index(&index_key(IDX_COUNTERPARTY_TX, counterparty.get(), id.get()))?;
        }
        if let Some(stand) = record.stand_id {
            self.put_index(&index_key(IDX_STAND_TX, stand.get(), id.get()))?;
        }
        if let Some(payment_ref) = &record.payment_ref {
            self.put_index(&unique_key(IDX_PAYMENT_REF, payment_ref))?;
        }

        tracing::debug!(
            transaction_id = %record.id,
            account_id = %record.account_id,
            amount = record.amount,
            kind = %record.kind,
            "Transaction record staged"
        );

        Ok(record)
    }

    // Tombolas, tickets, prizes, winners

    /// Allocate a tombola id
    pub fn next_tombola_id(&self) -> Result<TombolaId> {
        Ok(TombolaId::new(self.storage.next_id(CF_TOMBOLAS)?))
    }

    /// Read a tombola
    pub fn tombola(&self, id: TombolaId, lock: Lock) -> Result<Tombola> {
        self.read(CF_TOMBOLAS, &id.to_key(), lock)?
            .ok_or(Error::TombolaNotFound(id))
    }

    /// Write a tombola
    pub fn put_tombola(&self, tombola: &Tombola) -> Result<()> {
        self.write(CF_TOMBOLAS, &tombola.id.to_key(), tombola)
    }

    /// Allocate a ticket id
    pub fn next_ticket_id(&self) -> Result<TicketId> {
        Ok(TicketId::new(self.storage.next_id(CF_TICKETS)?))
    }

    /// Whether a serial number is already used; locks the serial key
    pub fn serial_taken(&self, serial: &str) -> Result<bool> {
        let handle = self.storage.cf_handle(CF_INDICES)?;
        let key = unique_key(IDX_TICKET_SERIAL, serial);
        Ok(self.txn.get_for_update_cf(handle, &key, true)?.is_some())
    }

    /// Write a new ticket with its tombola and serial indices
    pub fn insert_ticket(&self, ticket: &Ticket) -> Result<()> {
        self.write(CF_TICKETS, &ticket.id.to_key(), ticket)?;
        self.put_index(&index_key(
            IDX_TOMBOLA_TICKET,
            ticket.tombola_id.get(),
            ticket.id.get(),
        ))?;
        self.put_index(&unique_key(IDX_TICKET_SERIAL, &ticket.serial_number))
    }

    /// Read and exclusively lock a ticket
    pub fn ticket_for_update(&self, id: TicketId) -> Result<Ticket> {
        self.read(CF_TICKETS, &id.to_key(), Lock::Exclusive)?
            .ok_or(Error::TicketNotFound(id))
    }

    /// Overwrite an existing ticket
    pub fn put_ticket(&self, ticket: &Ticket) -> Result<()> {
        self.write(CF_TICKETS, &ticket.id.to_key(), ticket)
    }

    /// Tickets of a tombola as seen by this unit of work, creation order
    pub fn tickets_for_tombola(&self, tombola: TombolaId) -> Result<Vec<Ticket>> {
        self.index_ids(IDX_TOMBOLA_TICKET, tombola.get())?
            .into_iter()
            .map(|id| {
                let id = TicketId::new(id);
                self.read(CF_TICKETS, &id.to_key(), Lock::None)?
                    .ok_or(Error::TicketNotFound(id))
            })
            .collect()
    }

    /// Allocate a prize id
    pub fn next_prize_id(&self) -> Result<PrizeId> {
        Ok(PrizeId::new(self.storage.next_id(CF_PRIZES)?))
    }

    /// Read a prize
    pub fn prize(&self, id: PrizeId) -> Result<Prize> {
        self.read(CF_PRIZES, &id.to_key(), Lock::None)?
            .ok_or(Error::PrizeNotFound(id))
    }

    /// Write a prize
    pub fn put_prize(&self, prize: &Prize) -> Result<()> {
        self.write(CF_PRIZES, &prize.id.to_key(), prize)
    }

    /// Append a winner record with its tombola index
    pub fn append_winner(
        &self,
        tombola_id: TombolaId,
        prize_id: PrizeId,
        ticket_id: TicketId,
        owner_account_id: AccountId,
    ) -> Result<WinnerRecord> {
        let id = WinnerId::new(self.storage.next_id(CF_WINNERS)?);
        let record = WinnerRecord {
            id,
            tombola_id,
            prize_id,
            ticket_id,
            owner_account_id,
            drawn_at: Utc::now(),
        };
        self.write(CF_WINNERS, &id.to_key(), &record)?;
        self.put_index(&index_key(IDX_TOMBOLA_WINNER, tombola_id.get(), id.get()))?;
        Ok(record)
    }

    /// Winner records of a tombola as seen by this unit of work
    pub fn winners_for_tombola(&self, tombola: TombolaId) -> Result<Vec<WinnerRecord>> {
        self.index_ids(IDX_TOMBOLA_WINNER, tombola.get())?
            .into_iter()
            .map(|id| {
                self.read(CF_WINNERS, &id.to_be_bytes(), Lock::None)?
                    .ok_or_else(|| {
                        Error::StoreUnavailable(format!("Dangling winner index entry {}", id))
                    })
            })
            .collect()
    }

    // Payment orders

    /// Store a token order until its payment is confirmed
    pub fn put_payment_order(&self, payment_ref: &str, order: &TokenOrder) -> Result<()> {
        self.write(CF_PAYMENT_ORDERS, payment_ref.as_bytes(), order)
    }

    /// Lock, remove and return the order for `payment_ref`
    pub fn take_payment_order(&self, payment_ref: &str) -> Result<Option<TokenOrder>> {
        let order = self.read(CF_PAYMENT_ORDERS, payment_ref.as_bytes(), Lock::Exclusive)?;
        if order.is_some() {
            let handle = self.storage.cf_handle(CF_PAYMENT_ORDERS)?;
            self.txn.delete_cf(handle, payment_ref.as_bytes())?;
        }
        Ok(order)
    }

    /// Whether a payment reference has already been credited
    pub fn payment_credited(&self, payment_ref: &str) -> Result<bool> {
        let handle = self.storage.cf_handle(CF_INDICES)?;
        let key = unique_key(IDX_PAYMENT_REF, payment_ref);
        Ok(self.txn.get_cf(handle, &key)?.is_some())
    }

    // Completion

    /// Commit all staged writes atomically
    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }

    /// Discard all staged writes and release locks
    pub fn rollback(self) -> Result<()> {
        self.txn.rollback()?;
        Ok(())
    }
}

// Key helpers

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .get(..8)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| Error::StoreUnavailable("Malformed id key".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

fn index_prefix(tag: u8, owner: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(tag);
    key.extend_from_slice(&owner.to_be_bytes());
    key
}

fn index_key(tag: u8, owner: u64, id: u64) -> Vec<u8> {
    let mut key = index_prefix(tag, owner);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn unique_key(tag: u8, value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + value.len());
    key.push(tag);
    key.extend_from_slice(value.as_bytes());
    key
}

fn collect_index_ids<I>(iter: I, prefix: &[u8]) -> Result<Vec<u64>>
where
    I: Iterator<Item = std::result::Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>>,
{
    let mut ids = Vec::new();
    for item in iter {
        let (key, _) = item?;
        if !key.starts_with(prefix) {
            break;
        }
        ids.push(decode_id(&key[prefix.len()..])?);
    }
    Ok(ids)
}
