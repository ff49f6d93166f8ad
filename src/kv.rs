//! Mutable table store backing the un-frozen portion of the archive.
//!
//! This is the in-process stand-in for the node's transactional database: a
//! fixed set of well-known tables, each an ordered byte-key/byte-value map,
//! behind a cloneable transaction handle. The archive owns the layout of
//! every table; callers only open the store and hand the transaction to the
//! aggregator.

use eyre::Result;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

/// Well-known tables, one group per archive stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    /// Latest account value per address.
    AccountVals,
    /// Account versions keyed by `addr ‖ be64(txNum)`.
    AccountHistory,
    /// Latest storage value per `addr ‖ location`.
    StorageVals,
    /// Storage versions keyed by `addr ‖ location ‖ be64(txNum)`.
    StorageHistory,
    /// Latest contract code per address.
    CodeVals,
    /// Code versions keyed by `addr ‖ be64(txNum)`.
    CodeHistory,
    /// Log-address touch log keyed by `be64(txNum) ‖ addr`.
    LogAddrKeys,
    /// Log-topic touch log keyed by `be64(txNum) ‖ topic`.
    LogTopicKeys,
    /// Trace-sender touch log keyed by `be64(txNum) ‖ addr`.
    TraceFromKeys,
    /// Trace-recipient touch log keyed by `be64(txNum) ‖ addr`.
    TraceToKeys,
}

impl Table {
    pub const fn name(&self) -> &'static str {
        match self {
            Table::AccountVals => "account_vals",
            Table::AccountHistory => "account_history",
            Table::StorageVals => "storage_vals",
            Table::StorageHistory => "storage_history",
            Table::CodeVals => "code_vals",
            Table::CodeHistory => "code_history",
            Table::LogAddrKeys => "log_addr_keys",
            Table::LogTopicKeys => "log_topic_keys",
            Table::TraceFromKeys => "trace_from_keys",
            Table::TraceToKeys => "trace_to_keys",
        }
    }

    pub const fn all() -> &'static [Table] {
        &[
            Table::AccountVals,
            Table::AccountHistory,
            Table::StorageVals,
            Table::StorageHistory,
            Table::CodeVals,
            Table::CodeHistory,
            Table::LogAddrKeys,
            Table::LogTopicKeys,
            Table::TraceFromKeys,
            Table::TraceToKeys,
        ]
    }

    const fn index(self) -> usize {
        self as usize
    }
}

const TABLE_COUNT: usize = 10;

type Tables = [BTreeMap<Vec<u8>, Vec<u8>>; TABLE_COUNT];

/// In-memory table store.
pub struct Db {
    tables: Arc<RwLock<Tables>>,
}

impl Db {
    pub fn open() -> Self {
        Self {
            tables: Arc::new(RwLock::new(std::array::from_fn(|_| BTreeMap::new()))),
        }
    }

    /// Begin a transaction. Handles share the underlying tables; the archive
    /// is single-writer, so transactional isolation between handles is the
    /// caller's concern, not the store's.
    pub fn begin(&self) -> Tx {
        Tx {
            tables: Arc::clone(&self.tables),
        }
    }
}

/// Transaction handle over the table store.
#[derive(Clone, Debug)]
pub struct Tx {
    tables: Arc<RwLock<Tables>>,
}

impl Tx {
    pub fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.read().expect("kv read lock");
        Ok(tables[table.index()].get(key).cloned())
    }

    pub fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<()> {
        let mut tables = self.tables.write().expect("kv write lock");
        tables[table.index()].insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    pub fn delete(&self, table: Table, key: &[u8]) -> Result<()> {
        let mut tables = self.tables.write().expect("kv write lock");
        tables[table.index()].remove(key);
        Ok(())
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read().expect("kv read lock");
        let map = &tables[table.index()];
        let iter = map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded));
        Ok(iter
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// All entries with `from <= key < to`, in key order.
    pub fn scan_range(&self, table: Table, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read().expect("kv read lock");
        let map = &tables[table.index()];
        let iter = map.range::<[u8], _>((Bound::Included(from), Bound::Excluded(to)));
        Ok(iter.map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Remove every entry with `from <= key < to`; returns the number removed.
    pub fn clear_range(&self, table: Table, from: &[u8], to: &[u8]) -> Result<u64> {
        let mut tables = self.tables.write().expect("kv write lock");
        let map = &mut tables[table.index()];
        let doomed: Vec<Vec<u8>> = map
            .range::<[u8], _>((Bound::Included(from), Bound::Excluded(to)))
            .map(|(k, _)| k.clone())
            .collect();
        let removed = doomed.len() as u64;
        for key in doomed {
            map.remove(&key);
        }
        Ok(removed)
    }
}
