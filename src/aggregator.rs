//! The aggregator: orchestrates the seven archive streams.
//!
//! Writes are tagged with the current txNum and land in the mutable store.
//! At every step boundary [`Aggregator::finish_tx`] freezes the closed step
//! (collate → build → integrate → prune) and then drives size-tiered merges
//! (select → merge → integrate-merged → delete) until no stream has an
//! eligible range left. File production and merging fan out one task per
//! stream; the join is unconditional and the last error observed on the
//! funnel wins, so every task has published its artifact (or failed) before
//! anything is torn down.

use crate::domain::{
    Collation, Domain, DomainContext, DomainMergedFiles, DomainRanges, DomainStats, DomainTables,
    HistoryIterator, ScanIterator, StaticFiles,
};
use crate::files::{FilesItem, MergeRange};
use crate::inverted::{InvertedFiles, InvertedIndex, InvertedIterator};
use crate::kv::{Table, Tx};
use alloy_primitives::{Address, B256};
use eyre::{eyre, Result, WrapErr};
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

const SCHEMA_VERSION: u64 = 1;
const META_FILE_NAME: &str = "meta.json";

/// Ceiling on merged-file size, in steps.
const MAX_SPAN_STEPS: u64 = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArchiveMeta {
    schema_version: u64,
    aggregation_step: u64,
}

/// Static-file footprint across the seven streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesStats {
    /// Static files currently integrated, summed over all streams.
    pub static_files_total: u64,
    /// The durability horizon: every txNum below it is fully represented in
    /// static files on every stream.
    pub frozen_up_to: u64,
}

#[derive(Debug)]
pub struct Aggregator {
    aggregation_step: u64,
    accounts: Domain,
    storage: Domain,
    code: Domain,
    log_addrs: InvertedIndex,
    log_topics: InvertedIndex,
    traces_from: InvertedIndex,
    traces_to: InvertedIndex,
    tx_num: u64,
    rw_tx: Option<Tx>,
    // Scratch for composing `addr ‖ loc` storage keys. Single-writer state;
    // contexts carry their own.
    key_buf: Vec<u8>,
}

impl Aggregator {
    pub fn new(dir: &Path, aggregation_step: u64) -> Result<Self> {
        if aggregation_step == 0 {
            return Err(eyre!("aggregation step must be positive"));
        }
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create {}", dir.display()))?;
        validate_or_write_meta(dir, aggregation_step)?;

        let accounts = Domain::new(
            dir,
            "accounts",
            aggregation_step,
            DomainTables {
                vals: Table::AccountVals,
                history: Table::AccountHistory,
            },
            0,
            false,
        )?;
        let storage = Domain::new(
            dir,
            "storage",
            aggregation_step,
            DomainTables {
                vals: Table::StorageVals,
                history: Table::StorageHistory,
            },
            20,
            false,
        )?;
        let code = Domain::new(
            dir,
            "code",
            aggregation_step,
            DomainTables {
                vals: Table::CodeVals,
                history: Table::CodeHistory,
            },
            0,
            true,
        )?;
        let log_addrs = InvertedIndex::new(dir, "logaddrs", aggregation_step, Table::LogAddrKeys)?;
        let log_topics =
            InvertedIndex::new(dir, "logtopics", aggregation_step, Table::LogTopicKeys)?;
        let traces_from =
            InvertedIndex::new(dir, "tracesfrom", aggregation_step, Table::TraceFromKeys)?;
        let traces_to = InvertedIndex::new(dir, "tracesto", aggregation_step, Table::TraceToKeys)?;

        Ok(Self {
            aggregation_step,
            accounts,
            storage,
            code,
            log_addrs,
            log_topics,
            traces_from,
            traces_to,
            tx_num: 0,
            rw_tx: None,
            key_buf: Vec::new(),
        })
    }

    /// Rebinds every stream to a new read-write transaction.
    pub fn set_tx(&mut self, tx: Tx) {
        self.rw_tx = Some(tx.clone());
        self.accounts.set_tx(tx.clone());
        self.storage.set_tx(tx.clone());
        self.code.set_tx(tx.clone());
        self.log_addrs.set_tx(tx.clone());
        self.log_topics.set_tx(tx.clone());
        self.traces_from.set_tx(tx.clone());
        self.traces_to.set_tx(tx);
    }

    /// Advances the logical clock for every stream.
    pub fn set_tx_num(&mut self, tx_num: u64) {
        self.tx_num = tx_num;
        self.accounts.set_tx_num(tx_num);
        self.storage.set_tx_num(tx_num);
        self.code.set_tx_num(tx_num);
        self.log_addrs.set_tx_num(tx_num);
        self.log_topics.set_tx_num(tx_num);
        self.traces_from.set_tx_num(tx_num);
        self.traces_to.set_tx_num(tx_num);
    }

    fn rw_tx(&self) -> Result<&Tx> {
        self.rw_tx
            .as_ref()
            .ok_or_else(|| eyre!("no transaction bound"))
    }

    pub fn update_account_data(&mut self, addr: Address, account: &[u8]) -> Result<()> {
        self.accounts.put(addr.as_slice(), account)
    }

    pub fn update_account_code(&mut self, addr: Address, code: &[u8]) -> Result<()> {
        if code.is_empty() {
            self.code.delete(addr.as_slice())
        } else {
            self.code.put(addr.as_slice(), code)
        }
    }

    /// Deletes the account, its code, and every storage slot under it.
    pub fn delete_account(&mut self, addr: Address) -> Result<()> {
        self.accounts.delete(addr.as_slice())?;
        self.code.delete(addr.as_slice())?;
        let tx = self.rw_tx()?.clone();
        let mut slots = Vec::new();
        self.storage
            .iterate_prefix(addr.as_slice(), &tx, |key, _| slots.push(key.to_vec()))?;
        for key in slots {
            self.storage.delete(&key)?;
        }
        Ok(())
    }

    pub fn write_account_storage(&mut self, addr: Address, loc: B256, value: &[u8]) -> Result<()> {
        fill_storage_key(&mut self.key_buf, &addr, &loc);
        if value.is_empty() {
            self.storage.delete(&self.key_buf)
        } else {
            self.storage.put(&self.key_buf, value)
        }
    }

    pub fn add_log_addr(&mut self, addr: Address) -> Result<()> {
        self.log_addrs.add(addr.as_slice())
    }

    pub fn add_log_topic(&mut self, topic: B256) -> Result<()> {
        self.log_topics.add(topic.as_slice())
    }

    pub fn add_trace_from(&mut self, addr: Address) -> Result<()> {
        self.traces_from.add(addr.as_slice())
    }

    pub fn add_trace_to(&mut self, addr: Address) -> Result<()> {
        self.traces_to.add(addr.as_slice())
    }

    pub fn read_account_data(&self, addr: Address, tx: &Tx) -> Result<Option<Vec<u8>>> {
        self.accounts.get(addr.as_slice(), tx)
    }

    pub fn read_account_data_before_tx_num(
        &self,
        addr: Address,
        tx_num: u64,
        tx: &Tx,
    ) -> Result<Option<Vec<u8>>> {
        self.accounts.get_before_tx_num(addr.as_slice(), tx_num, tx)
    }

    pub fn read_account_storage(
        &mut self,
        addr: Address,
        loc: B256,
        tx: &Tx,
    ) -> Result<Option<Vec<u8>>> {
        fill_storage_key(&mut self.key_buf, &addr, &loc);
        self.storage.get(&self.key_buf, tx)
    }

    pub fn read_account_storage_before_tx_num(
        &mut self,
        addr: Address,
        loc: B256,
        tx_num: u64,
        tx: &Tx,
    ) -> Result<Option<Vec<u8>>> {
        fill_storage_key(&mut self.key_buf, &addr, &loc);
        self.storage.get_before_tx_num(&self.key_buf, tx_num, tx)
    }

    pub fn read_account_code(&self, addr: Address, tx: &Tx) -> Result<Option<Vec<u8>>> {
        self.code.get(addr.as_slice(), tx)
    }

    pub fn read_account_code_before_tx_num(
        &self,
        addr: Address,
        tx_num: u64,
        tx: &Tx,
    ) -> Result<Option<Vec<u8>>> {
        self.code.get_before_tx_num(addr.as_slice(), tx_num, tx)
    }

    pub fn read_account_code_size(&self, addr: Address, tx: &Tx) -> Result<usize> {
        Ok(self
            .code
            .get(addr.as_slice(), tx)?
            .map_or(0, |code| code.len()))
    }

    pub fn read_account_code_size_before_tx_num(
        &self,
        addr: Address,
        tx_num: u64,
        tx: &Tx,
    ) -> Result<usize> {
        Ok(self
            .code
            .get_before_tx_num(addr.as_slice(), tx_num, tx)?
            .map_or(0, |code| code.len()))
    }

    pub fn log_addr_iterator(
        &self,
        addr: Address,
        start_tx: u64,
        end_tx: u64,
        tx: &Tx,
    ) -> Result<InvertedIterator> {
        self.log_addrs
            .iterate_range(addr.as_slice(), start_tx, end_tx, tx)
    }

    pub fn log_topic_iterator(
        &self,
        topic: B256,
        start_tx: u64,
        end_tx: u64,
        tx: &Tx,
    ) -> Result<InvertedIterator> {
        self.log_topics
            .iterate_range(topic.as_slice(), start_tx, end_tx, tx)
    }

    pub fn trace_from_iterator(
        &self,
        addr: Address,
        start_tx: u64,
        end_tx: u64,
        tx: &Tx,
    ) -> Result<InvertedIterator> {
        self.traces_from
            .iterate_range(addr.as_slice(), start_tx, end_tx, tx)
    }

    pub fn trace_to_iterator(
        &self,
        addr: Address,
        start_tx: u64,
        end_tx: u64,
        tx: &Tx,
    ) -> Result<InvertedIterator> {
        self.traces_to
            .iterate_range(addr.as_slice(), start_tx, end_tx, tx)
    }

    pub fn ready_to_finish_tx(&self) -> bool {
        (self.tx_num + 1) % self.aggregation_step == 0
    }

    /// Runs the freeze/merge cycle when a step just completed; a no-op
    /// otherwise. The newest step always stays in the mutable store.
    pub fn finish_tx(&mut self) -> Result<()> {
        if (self.tx_num + 1) % self.aggregation_step != 0 {
            return Ok(());
        }
        let step = self.tx_num / self.aggregation_step;
        if step == 0 {
            return Ok(());
        }
        let step = step - 1;
        let tx = self.rw_tx()?.clone();
        let tx_from = step * self.aggregation_step;
        let tx_to = (step + 1) * self.aggregation_step;

        let collation = self.collate(step, tx_from, tx_to, &tx)?;
        let sf = self.build_files(step, collation)?;
        self.integrate_files(sf, tx_from, tx_to);
        self.prune(step, tx_from, tx_to)?;

        let max_end_tx = self.end_tx_num_minimax();
        let max_span = MAX_SPAN_STEPS * self.aggregation_step;
        loop {
            let r = self.find_merge_range(max_end_tx, max_span);
            if !r.any() {
                break;
            }
            let outs = self.static_files_in_range(&r);
            let merged = self.merge_files(&outs, &r)?;
            self.integrate_merged_files(&outs, merged);
            self.delete_files(&outs)?;
        }
        Ok(())
    }

    fn collate(&self, step: u64, tx_from: u64, tx_to: u64, tx: &Tx) -> Result<AggCollation> {
        Ok(AggCollation {
            accounts: self.accounts.collate(step, tx_from, tx_to, tx)?,
            storage: self.storage.collate(step, tx_from, tx_to, tx)?,
            code: self.code.collate(step, tx_from, tx_to, tx)?,
            log_addrs: self.log_addrs.collate(tx_from, tx_to, tx)?,
            log_topics: self.log_topics.collate(tx_from, tx_to, tx)?,
            traces_from: self.traces_from.collate(tx_from, tx_to, tx)?,
            traces_to: self.traces_to.collate(tx_from, tx_to, tx)?,
        })
    }

    /// Builds one static file per stream, concurrently. The join is
    /// unconditional; on failure every artifact that did get built is
    /// discarded and the last error observed wins.
    fn build_files(&self, step: u64, collation: AggCollation) -> Result<AggStaticFiles> {
        let AggCollation {
            accounts,
            storage,
            code,
            log_addrs,
            log_topics,
            traces_from,
            traces_to,
        } = collation;
        let (err_tx, err_rx) = mpsc::sync_channel::<eyre::Report>(7);

        let mut built = thread::scope(|scope| {
            let accounts_task = spawn_domain_build(scope, &self.accounts, step, accounts, &err_tx);
            let storage_task = spawn_domain_build(scope, &self.storage, step, storage, &err_tx);
            let code_task = spawn_domain_build(scope, &self.code, step, code, &err_tx);
            let log_addrs_task =
                spawn_inverted_build(scope, &self.log_addrs, step, log_addrs, &err_tx);
            let log_topics_task =
                spawn_inverted_build(scope, &self.log_topics, step, log_topics, &err_tx);
            let traces_from_task =
                spawn_inverted_build(scope, &self.traces_from, step, traces_from, &err_tx);
            let traces_to_task =
                spawn_inverted_build(scope, &self.traces_to, step, traces_to, &err_tx);
            BuiltFiles {
                accounts: join_task(accounts_task, &err_tx),
                storage: join_task(storage_task, &err_tx),
                code: join_task(code_task, &err_tx),
                log_addrs: join_task(log_addrs_task, &err_tx),
                log_topics: join_task(log_topics_task, &err_tx),
                traces_from: join_task(traces_from_task, &err_tx),
                traces_to: join_task(traces_to_task, &err_tx),
            }
        });
        drop(err_tx);

        let mut last_error = None;
        for err in err_rx.try_iter() {
            last_error = Some(err);
        }
        if let Some(err) = last_error {
            built.discard();
            return Err(err);
        }
        built.finish()
    }

    fn integrate_files(&self, sf: AggStaticFiles, tx_from: u64, tx_to: u64) {
        self.accounts.integrate_files(sf.accounts, tx_from, tx_to);
        self.storage.integrate_files(sf.storage, tx_from, tx_to);
        self.code.integrate_files(sf.code, tx_from, tx_to);
        self.log_addrs.integrate_files(sf.log_addrs, tx_from, tx_to);
        self.log_topics.integrate_files(sf.log_topics, tx_from, tx_to);
        self.traces_from
            .integrate_files(sf.traces_from, tx_from, tx_to);
        self.traces_to.integrate_files(sf.traces_to, tx_from, tx_to);
    }

    fn prune(&self, step: u64, tx_from: u64, tx_to: u64) -> Result<()> {
        self.accounts.prune(step, tx_from, tx_to)?;
        self.storage.prune(step, tx_from, tx_to)?;
        self.code.prune(step, tx_from, tx_to)?;
        self.log_addrs.prune(tx_from, tx_to)?;
        self.log_topics.prune(tx_from, tx_to)?;
        self.traces_from.prune(tx_from, tx_to)?;
        self.traces_to.prune(tx_from, tx_to)?;
        Ok(())
    }

    /// Minimum over all streams of the largest file-covered txNum.
    pub fn end_tx_num_minimax(&self) -> u64 {
        [
            self.accounts.end_tx_num_minimax(),
            self.storage.end_tx_num_minimax(),
            self.code.end_tx_num_minimax(),
            self.log_addrs.end_tx_num_minimax(),
            self.log_topics.end_tx_num_minimax(),
            self.traces_from.end_tx_num_minimax(),
            self.traces_to.end_tx_num_minimax(),
        ]
        .into_iter()
        .min()
        .unwrap_or(0)
    }

    fn find_merge_range(&self, max_end_tx: u64, max_span: u64) -> Ranges {
        let r = Ranges {
            accounts: self.accounts.find_merge_range(max_end_tx, max_span),
            storage: self.storage.find_merge_range(max_end_tx, max_span),
            code: self.code.find_merge_range(max_end_tx, max_span),
            log_addrs: self.log_addrs.find_merge_range(max_end_tx, max_span),
            log_topics: self.log_topics.find_merge_range(max_end_tx, max_span),
            traces_from: self.traces_from.find_merge_range(max_end_tx, max_span),
            traces_to: self.traces_to.find_merge_range(max_end_tx, max_span),
        };
        debug!(max_end_tx, max_span, ranges = ?r, "selected merge ranges");
        r
    }

    fn static_files_in_range(&self, r: &Ranges) -> SelectedStaticFiles {
        let (accounts_values, accounts_history) = self.accounts.static_files_in_range(&r.accounts);
        let (storage_values, storage_history) = self.storage.static_files_in_range(&r.storage);
        let (code_values, code_history) = self.code.static_files_in_range(&r.code);
        SelectedStaticFiles {
            accounts_values,
            accounts_history,
            storage_values,
            storage_history,
            code_values,
            code_history,
            log_addrs: selected_inverted(&self.log_addrs, r.log_addrs),
            log_topics: selected_inverted(&self.log_topics, r.log_topics),
            traces_from: selected_inverted(&self.traces_from, r.traces_from),
            traces_to: selected_inverted(&self.traces_to, r.traces_to),
        }
    }

    /// Merges each stream whose range flag is set, concurrently, with the
    /// same join-then-collect error handling as `build_files`.
    fn merge_files(&self, outs: &SelectedStaticFiles, r: &Ranges) -> Result<MergedFiles> {
        let (err_tx, err_rx) = mpsc::sync_channel::<eyre::Report>(7);

        let mut merged = thread::scope(|scope| {
            let accounts_task = spawn_domain_merge(
                scope,
                &self.accounts,
                &outs.accounts_values,
                &outs.accounts_history,
                &r.accounts,
                &err_tx,
            );
            let storage_task = spawn_domain_merge(
                scope,
                &self.storage,
                &outs.storage_values,
                &outs.storage_history,
                &r.storage,
                &err_tx,
            );
            let code_task = spawn_domain_merge(
                scope,
                &self.code,
                &outs.code_values,
                &outs.code_history,
                &r.code,
                &err_tx,
            );
            let log_addrs_task =
                spawn_inverted_merge(scope, &self.log_addrs, &outs.log_addrs, r.log_addrs, &err_tx);
            let log_topics_task = spawn_inverted_merge(
                scope,
                &self.log_topics,
                &outs.log_topics,
                r.log_topics,
                &err_tx,
            );
            let traces_from_task = spawn_inverted_merge(
                scope,
                &self.traces_from,
                &outs.traces_from,
                r.traces_from,
                &err_tx,
            );
            let traces_to_task =
                spawn_inverted_merge(scope, &self.traces_to, &outs.traces_to, r.traces_to, &err_tx);
            MergedFiles {
                accounts: join_task(accounts_task, &err_tx).flatten(),
                storage: join_task(storage_task, &err_tx).flatten(),
                code: join_task(code_task, &err_tx).flatten(),
                log_addrs: join_task(log_addrs_task, &err_tx).flatten(),
                log_topics: join_task(log_topics_task, &err_tx).flatten(),
                traces_from: join_task(traces_from_task, &err_tx).flatten(),
                traces_to: join_task(traces_to_task, &err_tx).flatten(),
            }
        });
        drop(err_tx);

        let mut last_error = None;
        for err in err_rx.try_iter() {
            last_error = Some(err);
        }
        if let Some(err) = last_error {
            merged.discard();
            return Err(err);
        }
        Ok(merged)
    }

    fn integrate_merged_files(&self, outs: &SelectedStaticFiles, merged: MergedFiles) {
        if let Some(m) = merged.accounts {
            self.accounts
                .integrate_merged_files(&outs.accounts_values, &outs.accounts_history, m);
        }
        if let Some(m) = merged.storage {
            self.storage
                .integrate_merged_files(&outs.storage_values, &outs.storage_history, m);
        }
        if let Some(m) = merged.code {
            self.code
                .integrate_merged_files(&outs.code_values, &outs.code_history, m);
        }
        if let Some(m) = merged.log_addrs {
            self.log_addrs.integrate_merged_files(&outs.log_addrs, m);
        }
        if let Some(m) = merged.log_topics {
            self.log_topics.integrate_merged_files(&outs.log_topics, m);
        }
        if let Some(m) = merged.traces_from {
            self.traces_from
                .integrate_merged_files(&outs.traces_from, m);
        }
        if let Some(m) = merged.traces_to {
            self.traces_to.integrate_merged_files(&outs.traces_to, m);
        }
    }

    fn delete_files(&self, outs: &SelectedStaticFiles) -> Result<()> {
        self.accounts
            .delete_files(&outs.accounts_values, &outs.accounts_history)?;
        self.storage
            .delete_files(&outs.storage_values, &outs.storage_history)?;
        self.code
            .delete_files(&outs.code_values, &outs.code_history)?;
        self.log_addrs.delete_files(&outs.log_addrs)?;
        self.log_topics.delete_files(&outs.log_topics)?;
        self.traces_from.delete_files(&outs.traces_from)?;
        self.traces_to.delete_files(&outs.traces_to)?;
        Ok(())
    }

    /// Drains the per-domain lifecycle counters. Inverted-index streams do
    /// not participate, matching the original surface.
    pub fn get_and_reset_stats(&self) -> DomainStats {
        let mut stats = DomainStats::default();
        stats.accumulate(self.accounts.get_and_reset_stats());
        stats.accumulate(self.storage.get_and_reset_stats());
        stats.accumulate(self.code.get_and_reset_stats());
        stats
    }

    pub fn stats(&self) -> FilesStats {
        FilesStats {
            static_files_total: self.accounts.static_file_count()
                + self.storage.static_file_count()
                + self.code.static_file_count()
                + self.log_addrs.static_file_count()
                + self.log_topics.static_file_count()
                + self.traces_from.static_file_count()
                + self.traces_to.static_file_count(),
            frozen_up_to: self.end_tx_num_minimax(),
        }
    }

    /// Read-only snapshot for state reconstruction. Carries its own storage
    /// key buffer so concurrent contexts never share scratch state.
    pub fn make_context(&self) -> AggregatorContext {
        AggregatorContext {
            accounts: self.accounts.make_context(),
            storage: self.storage.make_context(),
            code: self.code.make_context(),
            key_buf: Vec::new(),
        }
    }

    /// Tears down all seven streams: drops the transaction binding and every
    /// static-file handle. Idempotent; also runs on drop. Streams constructed
    /// before a failure in `new` tear down the same way when they unwind.
    pub fn close(&mut self) {
        self.rw_tx = None;
        self.accounts.close();
        self.storage.close();
        self.code.close();
        self.log_addrs.close();
        self.log_topics.close();
        self.traces_from.close();
        self.traces_to.close();
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.close();
    }
}

/// Transient per-step collation across all streams; purely in-memory, so
/// dropping it is its release.
struct AggCollation {
    accounts: Collation,
    storage: Collation,
    code: Collation,
    log_addrs: BTreeMap<Vec<u8>, RoaringTreemap>,
    log_topics: BTreeMap<Vec<u8>, RoaringTreemap>,
    traces_from: BTreeMap<Vec<u8>, RoaringTreemap>,
    traces_to: BTreeMap<Vec<u8>, RoaringTreemap>,
}

/// Built-but-unintegrated files of one step across all streams.
struct AggStaticFiles {
    accounts: StaticFiles,
    storage: StaticFiles,
    code: StaticFiles,
    log_addrs: InvertedFiles,
    log_topics: InvertedFiles,
    traces_from: InvertedFiles,
    traces_to: InvertedFiles,
}

/// Per-stream build results before completeness is established.
struct BuiltFiles {
    accounts: Option<StaticFiles>,
    storage: Option<StaticFiles>,
    code: Option<StaticFiles>,
    log_addrs: Option<InvertedFiles>,
    log_topics: Option<InvertedFiles>,
    traces_from: Option<InvertedFiles>,
    traces_to: Option<InvertedFiles>,
}

impl BuiltFiles {
    fn discard(&mut self) {
        for sf in [&mut self.accounts, &mut self.storage, &mut self.code]
            .into_iter()
            .flat_map(Option::as_mut)
        {
            sf.discard();
        }
        for f in [
            &mut self.log_addrs,
            &mut self.log_topics,
            &mut self.traces_from,
            &mut self.traces_to,
        ]
        .into_iter()
        .flat_map(Option::as_mut)
        {
            f.discard();
        }
    }

    fn finish(mut self) -> Result<AggStaticFiles> {
        let complete = self.accounts.is_some()
            && self.storage.is_some()
            && self.code.is_some()
            && self.log_addrs.is_some()
            && self.log_topics.is_some()
            && self.traces_from.is_some()
            && self.traces_to.is_some();
        if !complete {
            self.discard();
            return Err(eyre!("stream build finished without an artifact"));
        }
        match (
            self.accounts.take(),
            self.storage.take(),
            self.code.take(),
            self.log_addrs.take(),
            self.log_topics.take(),
            self.traces_from.take(),
            self.traces_to.take(),
        ) {
            (
                Some(accounts),
                Some(storage),
                Some(code),
                Some(log_addrs),
                Some(log_topics),
                Some(traces_from),
                Some(traces_to),
            ) => Ok(AggStaticFiles {
                accounts,
                storage,
                code,
                log_addrs,
                log_topics,
                traces_from,
                traces_to,
            }),
            _ => Err(eyre!("stream build finished without an artifact")),
        }
    }
}

/// Borrowed selection of merge inputs; closing it is dropping the `Arc`
/// clones, never unlinking.
struct SelectedStaticFiles {
    accounts_values: Vec<Arc<FilesItem>>,
    accounts_history: Vec<Arc<FilesItem>>,
    storage_values: Vec<Arc<FilesItem>>,
    storage_history: Vec<Arc<FilesItem>>,
    code_values: Vec<Arc<FilesItem>>,
    code_history: Vec<Arc<FilesItem>>,
    log_addrs: Vec<Arc<FilesItem>>,
    log_topics: Vec<Arc<FilesItem>>,
    traces_from: Vec<Arc<FilesItem>>,
    traces_to: Vec<Arc<FilesItem>>,
}

/// Merge outputs per stream; absent where the range flag was unset.
struct MergedFiles {
    accounts: Option<DomainMergedFiles>,
    storage: Option<DomainMergedFiles>,
    code: Option<DomainMergedFiles>,
    log_addrs: Option<Arc<FilesItem>>,
    log_topics: Option<Arc<FilesItem>>,
    traces_from: Option<Arc<FilesItem>>,
    traces_to: Option<Arc<FilesItem>>,
}

impl MergedFiles {
    fn discard(&mut self) {
        for m in [&mut self.accounts, &mut self.storage, &mut self.code] {
            if let Some(m) = m.as_mut() {
                m.discard();
            }
            *m = None;
        }
        for item in [
            &mut self.log_addrs,
            &mut self.log_topics,
            &mut self.traces_from,
            &mut self.traces_to,
        ] {
            if let Some(item) = item.take() {
                if let Err(err) = item.delete_from_disk() {
                    warn!(error = %err, "failed to remove discarded merged file");
                }
            }
        }
    }
}

/// Merge candidates across all streams.
#[derive(Debug, Clone, Copy, Default)]
struct Ranges {
    accounts: DomainRanges,
    storage: DomainRanges,
    code: DomainRanges,
    log_addrs: MergeRange,
    log_topics: MergeRange,
    traces_from: MergeRange,
    traces_to: MergeRange,
}

impl Ranges {
    fn any(&self) -> bool {
        self.accounts.any()
            || self.storage.any()
            || self.code.any()
            || self.log_addrs.needs_merge
            || self.log_topics.needs_merge
            || self.traces_from.needs_merge
            || self.traces_to.needs_merge
    }
}

fn selected_inverted(index: &InvertedIndex, r: MergeRange) -> Vec<Arc<FilesItem>> {
    if r.needs_merge {
        index.static_files_in_range(r.from, r.to)
    } else {
        Vec::new()
    }
}

fn spawn_domain_build<'scope>(
    scope: &'scope thread::Scope<'scope, '_>,
    domain: &'scope Domain,
    step: u64,
    collation: Collation,
    err_tx: &mpsc::SyncSender<eyre::Report>,
) -> thread::ScopedJoinHandle<'scope, Option<StaticFiles>> {
    let err_tx = err_tx.clone();
    scope.spawn(move || match domain.build_files(step, collation) {
        Ok(sf) => Some(sf),
        Err(err) => {
            let _ = err_tx.send(err);
            None
        }
    })
}

fn spawn_inverted_build<'scope>(
    scope: &'scope thread::Scope<'scope, '_>,
    index: &'scope InvertedIndex,
    step: u64,
    collation: BTreeMap<Vec<u8>, RoaringTreemap>,
    err_tx: &mpsc::SyncSender<eyre::Report>,
) -> thread::ScopedJoinHandle<'scope, Option<InvertedFiles>> {
    let err_tx = err_tx.clone();
    scope.spawn(move || match index.build_files(step, collation) {
        Ok(sf) => Some(sf),
        Err(err) => {
            let _ = err_tx.send(err);
            None
        }
    })
}

fn spawn_domain_merge<'scope>(
    scope: &'scope thread::Scope<'scope, '_>,
    domain: &'scope Domain,
    values_in: &'scope [Arc<FilesItem>],
    history_in: &'scope [Arc<FilesItem>],
    r: &'scope DomainRanges,
    err_tx: &mpsc::SyncSender<eyre::Report>,
) -> thread::ScopedJoinHandle<'scope, Option<Option<DomainMergedFiles>>> {
    let err_tx = err_tx.clone();
    scope.spawn(move || {
        if !r.any() {
            return Some(None);
        }
        match domain.merge_files(values_in, history_in, r) {
            Ok(m) => Some(Some(m)),
            Err(err) => {
                let _ = err_tx.send(err);
                None
            }
        }
    })
}

fn spawn_inverted_merge<'scope>(
    scope: &'scope thread::Scope<'scope, '_>,
    index: &'scope InvertedIndex,
    inputs: &'scope [Arc<FilesItem>],
    r: MergeRange,
    err_tx: &mpsc::SyncSender<eyre::Report>,
) -> thread::ScopedJoinHandle<'scope, Option<Option<Arc<FilesItem>>>> {
    let err_tx = err_tx.clone();
    scope.spawn(move || {
        if !r.needs_merge {
            return Some(None);
        }
        match index.merge_files(inputs, r) {
            Ok(item) => Some(Some(item)),
            Err(err) => {
                let _ = err_tx.send(err);
                None
            }
        }
    })
}

/// Joins one stream task; a panicked task counts as a failed one.
fn join_task<T>(
    handle: thread::ScopedJoinHandle<'_, Option<T>>,
    err_tx: &mpsc::SyncSender<eyre::Report>,
) -> Option<T> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => {
            let _ = err_tx.send(eyre!("stream task panicked"));
            None
        }
    }
}

fn fill_storage_key(buf: &mut Vec<u8>, addr: &Address, loc: &B256) {
    buf.clear();
    buf.extend_from_slice(addr.as_slice());
    buf.extend_from_slice(loc.as_slice());
}

fn validate_or_write_meta(dir: &Path, aggregation_step: u64) -> Result<()> {
    let path = dir.join(META_FILE_NAME);
    if path.exists() {
        let bytes = fs::read(&path).wrap_err("failed to read meta.json")?;
        let meta: ArchiveMeta =
            serde_json::from_slice(&bytes).wrap_err("failed to decode meta.json")?;
        if meta.schema_version != SCHEMA_VERSION {
            return Err(eyre!(
                "schema version mismatch: expected {}, got {} (delete the archive dir to rebuild)",
                SCHEMA_VERSION,
                meta.schema_version
            ));
        }
        if meta.aggregation_step != aggregation_step {
            return Err(eyre!(
                "aggregation step mismatch: expected {}, got {}",
                aggregation_step,
                meta.aggregation_step
            ));
        }
        return Ok(());
    }
    let meta = ArchiveMeta {
        schema_version: SCHEMA_VERSION,
        aggregation_step,
    };
    let bytes = serde_json::to_vec_pretty(&meta).wrap_err("failed to encode meta.json")?;
    fs::write(&path, bytes).wrap_err("failed to write meta.json")
}

/// Read-only snapshot handle bundling the domain contexts used by state
/// reconstruction.
pub struct AggregatorContext {
    accounts: DomainContext,
    storage: DomainContext,
    code: DomainContext,
    key_buf: Vec<u8>,
}

impl AggregatorContext {
    pub fn iterate_accounts_recon_txs(
        &self,
        from_key: &[u8],
        to_key: &[u8],
        tx_num: u64,
    ) -> ScanIterator {
        self.accounts.iterate_recon_txs(from_key, to_key, tx_num)
    }

    pub fn iterate_storage_recon_txs(
        &self,
        from_key: &[u8],
        to_key: &[u8],
        tx_num: u64,
    ) -> ScanIterator {
        self.storage.iterate_recon_txs(from_key, to_key, tx_num)
    }

    pub fn iterate_code_recon_txs(
        &self,
        from_key: &[u8],
        to_key: &[u8],
        tx_num: u64,
    ) -> ScanIterator {
        self.code.iterate_recon_txs(from_key, to_key, tx_num)
    }

    pub fn iterate_accounts_history(
        &self,
        from_key: &[u8],
        to_key: &[u8],
        tx_num: u64,
    ) -> HistoryIterator {
        self.accounts.iterate_history(from_key, to_key, tx_num)
    }

    pub fn iterate_storage_history(
        &self,
        from_key: &[u8],
        to_key: &[u8],
        tx_num: u64,
    ) -> HistoryIterator {
        self.storage.iterate_history(from_key, to_key, tx_num)
    }

    pub fn iterate_code_history(
        &self,
        from_key: &[u8],
        to_key: &[u8],
        tx_num: u64,
    ) -> HistoryIterator {
        self.code.iterate_history(from_key, to_key, tx_num)
    }

    pub fn read_account_data_no_state(
        &self,
        addr: Address,
        tx_num: u64,
    ) -> Result<(Option<Vec<u8>>, bool, u64)> {
        self.accounts.get_no_state(addr.as_slice(), tx_num)
    }

    pub fn read_account_storage_no_state(
        &mut self,
        addr: Address,
        loc: B256,
        tx_num: u64,
    ) -> Result<(Option<Vec<u8>>, bool, u64)> {
        fill_storage_key(&mut self.key_buf, &addr, &loc);
        self.storage.get_no_state(&self.key_buf, tx_num)
    }

    pub fn read_account_code_no_state(
        &self,
        addr: Address,
        tx_num: u64,
    ) -> Result<(Option<Vec<u8>>, bool, u64)> {
        self.code.get_no_state(addr.as_slice(), tx_num)
    }

    pub fn read_account_code_size_no_state(
        &self,
        addr: Address,
        tx_num: u64,
    ) -> Result<(usize, bool, u64)> {
        let (code, from_files, state_tx) = self.code.get_no_state(addr.as_slice(), tx_num)?;
        Ok((code.map_or(0, |code| code.len()), from_files, state_tx))
    }

    pub fn max_accounts_tx_num(&self, addr: Address) -> (bool, u64) {
        self.accounts.max_tx_num(addr.as_slice())
    }

    pub fn max_storage_tx_num(&mut self, addr: Address, loc: B256) -> (bool, u64) {
        fill_storage_key(&mut self.key_buf, &addr, &loc);
        self.storage.max_tx_num(&self.key_buf)
    }

    pub fn max_code_tx_num(&self, addr: Address) -> (bool, u64) {
        self.code.max_tx_num(addr.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Db;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    const STEP: u64 = 4;

    fn temp_dir() -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time moves forward")
            .as_nanos();
        let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
        let mut path = std::env::temp_dir();
        path.push(format!(
            "state-archive-aggregator-test-{now}-{}-{suffix}",
            std::process::id()
        ));
        path
    }

    fn setup(dir: &Path) -> (Db, Tx, Aggregator) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let db = Db::open();
        let tx = db.begin();
        let mut agg = Aggregator::new(dir, STEP).expect("new aggregator");
        agg.set_tx(tx.clone());
        (db, tx, agg)
    }

    fn addr(byte: u8) -> Address {
        Address::from([byte; 20])
    }

    fn finish(agg: &mut Aggregator) {
        if agg.ready_to_finish_tx() {
            agg.finish_tx().expect("finish tx");
        }
    }

    #[test]
    fn first_step_is_held_back_then_frozen() {
        let dir = temp_dir();
        let (_db, tx, mut agg) = setup(&dir);

        for (t, byte) in [(0u64, 0xa0u8), (1, 0xb0), (2, 0xc0), (3, 0xd0)] {
            agg.set_tx_num(t);
            agg.update_account_data(addr(byte), &[byte]).expect("update");
            finish(&mut agg);
        }
        // Step 0 just completed but the newest step stays in the store.
        assert_eq!(agg.stats().frozen_up_to, 0);

        for t in 4..8 {
            agg.set_tx_num(t);
            finish(&mut agg);
        }
        assert_eq!(agg.stats().frozen_up_to, STEP);

        agg.set_tx_num(5);
        for byte in [0xa0u8, 0xb0, 0xc0, 0xd0] {
            assert_eq!(
                agg.read_account_data(addr(byte), &tx).expect("read"),
                Some(vec![byte])
            );
        }

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn as_of_reads_after_freeze() {
        let dir = temp_dir();
        let (_db, tx, mut agg) = setup(&dir);
        let alice = addr(0xaa);

        for t in 0..12u64 {
            agg.set_tx_num(t);
            if t == 0 {
                agg.update_account_data(alice, b"1").expect("update");
            }
            if t == 4 {
                agg.update_account_data(alice, b"2").expect("update");
            }
            finish(&mut agg);
        }
        assert_eq!(agg.stats().frozen_up_to, 2 * STEP);

        assert_eq!(
            agg.read_account_data_before_tx_num(alice, 3, &tx).expect("as-of"),
            Some(b"1".to_vec())
        );
        assert_eq!(
            agg.read_account_data_before_tx_num(alice, 4, &tx).expect("as-of"),
            Some(b"2".to_vec())
        );
        assert_eq!(
            agg.read_account_data_before_tx_num(alice, 100, &tx).expect("as-of"),
            Some(b"2".to_vec())
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn thirty_two_steps_merge_into_one_file_per_stream() {
        let dir = temp_dir();
        let (_db, tx, mut agg) = setup(&dir);
        let alice = addr(0xaa);

        // One more step than the span so steps 0..31 all freeze.
        for t in 0..(33 * STEP) {
            agg.set_tx_num(t);
            agg.update_account_data(alice, &t.to_be_bytes()).expect("update");
            agg.add_log_addr(alice).expect("add");
            finish(&mut agg);
        }
        assert_eq!(agg.stats().frozen_up_to, 32 * STEP);
        // One values + one history file per domain, one file per inverted
        // index: everything below the horizon merged to a single span.
        assert_eq!(agg.stats().static_files_total, 10);

        let segs = fs::read_dir(dir.join("accounts"))
            .expect("read accounts dir")
            .count();
        // Two file sets (values + history) of four parts each; merge inputs
        // are unlinked.
        assert_eq!(segs, 8);

        let expected = (32 * STEP - 1).to_be_bytes().to_vec();
        assert_eq!(
            agg.read_account_data_before_tx_num(alice, 32 * STEP - 1, &tx)
                .expect("as-of"),
            Some(expected)
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn delete_account_clears_storage() {
        let dir = temp_dir();
        let (_db, tx, mut agg) = setup(&dir);
        let alice = addr(0xaa);
        let loc = B256::from([0x11u8; 32]);

        agg.set_tx_num(0);
        agg.write_account_storage(alice, loc, b"value").expect("write");
        agg.set_tx_num(1);
        agg.delete_account(alice).expect("delete");
        assert_eq!(agg.read_account_storage(alice, loc, &tx).expect("read"), None);
        assert_eq!(agg.read_account_data(alice, &tx).expect("read"), None);
        assert_eq!(agg.read_account_code(alice, &tx).expect("read"), None);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn delete_account_reaches_frozen_storage_slots() {
        let dir = temp_dir();
        let (_db, tx, mut agg) = setup(&dir);
        let alice = addr(0xaa);
        let loc = B256::from([0x11u8; 32]);

        for t in 0..8u64 {
            agg.set_tx_num(t);
            if t == 0 {
                agg.write_account_storage(alice, loc, b"frozen").expect("write");
            }
            finish(&mut agg);
        }
        assert_eq!(agg.stats().frozen_up_to, STEP);

        agg.set_tx_num(8);
        agg.delete_account(alice).expect("delete");
        assert_eq!(agg.read_account_storage(alice, loc, &tx).expect("read"), None);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn log_addr_iterator_bounds_the_range() {
        let dir = temp_dir();
        let (_db, tx, mut agg) = setup(&dir);
        let x = addr(0x77);

        for t in [10u64, 20, 30] {
            agg.set_tx_num(t);
            agg.add_log_addr(x).expect("add");
        }
        let txs: Vec<u64> = agg
            .log_addr_iterator(x, 15, 25, &tx)
            .expect("iterator")
            .collect();
        assert_eq!(txs, vec![20]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn finish_tx_off_boundary_is_a_no_op() {
        let dir = temp_dir();
        let (_db, _tx, mut agg) = setup(&dir);
        agg.set_tx_num(5);
        assert!(!agg.ready_to_finish_tx());
        agg.finish_tx().expect("finish tx");
        assert_eq!(agg.stats().static_files_total, 0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn build_failure_discards_every_stream_artifact() {
        use std::os::unix::fs::PermissionsExt;

        let dir = temp_dir();
        let (_db, tx, mut agg) = setup(&dir);
        let alice = addr(0xaa);

        for t in 0..7u64 {
            agg.set_tx_num(t);
            if t < 4 {
                agg.update_account_data(alice, &[t as u8]).expect("update");
                agg.add_log_topic(B256::from([t as u8; 32])).expect("add");
            }
            finish(&mut agg);
        }

        // Make the code stream's directory unwritable so its build fails.
        let code_dir = dir.join("code");
        fs::set_permissions(&code_dir, fs::Permissions::from_mode(0o555)).expect("chmod");
        agg.set_tx_num(7);
        assert!(agg.ready_to_finish_tx());
        let err = agg.finish_tx().expect_err("build must fail");
        assert!(!err.to_string().is_empty());

        // No stream kept files for the failed step.
        assert_eq!(agg.stats().frozen_up_to, 0);
        assert_eq!(agg.stats().static_files_total, 0);
        let accounts_files = fs::read_dir(dir.join("accounts")).expect("read dir").count();
        assert_eq!(accounts_files, 0);

        // With I/O restored the same boundary freezes cleanly.
        fs::set_permissions(&code_dir, fs::Permissions::from_mode(0o755)).expect("chmod");
        agg.finish_tx().expect("retry finish tx");
        assert_eq!(agg.stats().frozen_up_to, STEP);
        assert_eq!(
            agg.read_account_data(alice, &tx).expect("read"),
            Some(vec![3])
        );
        let topics: Vec<u64> = agg
            .log_topic_iterator(B256::from([2u8; 32]), 0, 100, &tx)
            .expect("iterator")
            .collect();
        assert_eq!(topics, vec![2]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn reopen_restores_the_archive() {
        let dir = temp_dir();
        let (db, tx, mut agg) = setup(&dir);
        let alice = addr(0xaa);

        for t in 0..8u64 {
            agg.set_tx_num(t);
            if t == 1 {
                agg.update_account_data(alice, b"kept").expect("update");
                agg.update_account_code(alice, b"code").expect("update");
            }
            finish(&mut agg);
        }
        drop(agg);

        let mut agg = Aggregator::new(&dir, STEP).expect("reopen");
        agg.set_tx(db.begin());
        assert_eq!(agg.stats().frozen_up_to, STEP);
        assert_eq!(
            agg.read_account_data(alice, &tx).expect("read"),
            Some(b"kept".to_vec())
        );
        assert_eq!(agg.read_account_code_size(alice, &tx).expect("size"), 4);

        // A step mismatch on reopen is refused.
        let err = Aggregator::new(&dir, STEP * 2).expect_err("step mismatch");
        assert!(err.to_string().contains("aggregation step mismatch"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn context_reads_bypass_the_mutable_store() {
        let dir = temp_dir();
        let (_db, _tx, mut agg) = setup(&dir);
        let alice = addr(0xaa);
        let loc = B256::from([0x22u8; 32]);

        for t in 0..8u64 {
            agg.set_tx_num(t);
            if t == 2 {
                agg.update_account_data(alice, b"frozen").expect("update");
                agg.write_account_storage(alice, loc, b"slot").expect("write");
            }
            finish(&mut agg);
        }
        agg.set_tx_num(8);
        agg.update_account_data(alice, b"mutable-only").expect("update");

        let mut ctx = agg.make_context();
        let (value, from_files, state_tx) =
            ctx.read_account_data_no_state(alice, 100).expect("no-state");
        assert_eq!(value, Some(b"frozen".to_vec()));
        assert!(from_files);
        assert_eq!(state_tx, 2);

        let (slot, from_files, _) = ctx
            .read_account_storage_no_state(alice, loc, 100)
            .expect("no-state");
        assert_eq!(slot, Some(b"slot".to_vec()));
        assert!(from_files);
        assert_eq!(ctx.max_accounts_tx_num(alice), (true, 2));
        assert_eq!(ctx.max_storage_tx_num(alice, loc), (true, 2));
        assert_eq!(ctx.max_code_tx_num(alice), (false, 0));

        let recon: Vec<_> = ctx.iterate_accounts_recon_txs(&[], &[], 100).collect();
        assert_eq!(recon, vec![(alice.as_slice().to_vec(), 2)]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn stats_drain_domain_counters() {
        let dir = temp_dir();
        let (_db, tx, mut agg) = setup(&dir);

        for t in 0..8u64 {
            agg.set_tx_num(t);
            agg.update_account_data(addr(t as u8), &[1]).expect("update");
            finish(&mut agg);
        }
        // The frozen value comes back from a file, which counts as one read.
        assert_eq!(
            agg.read_account_data(addr(0), &tx).expect("read"),
            Some(vec![1])
        );
        let stats = agg.get_and_reset_stats();
        assert_eq!(stats.collations, 3);
        assert_eq!(stats.files_built, 3);
        assert_eq!(stats.prunes, 3);
        assert_eq!(stats.file_reads, 1);
        assert_eq!(agg.get_and_reset_stats(), DomainStats::default());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn close_releases_streams_and_is_idempotent() {
        let dir = temp_dir();
        let (_db, _tx, mut agg) = setup(&dir);

        for t in 0..8u64 {
            agg.set_tx_num(t);
            agg.update_account_data(addr(t as u8), &[1]).expect("update");
            finish(&mut agg);
        }
        assert_eq!(agg.stats().static_files_total, 10);

        agg.close();
        assert_eq!(agg.stats().static_files_total, 0);
        assert_eq!(agg.stats().frozen_up_to, 0);
        agg.close();
        assert_eq!(agg.stats().static_files_total, 0);
        drop(agg);

        // The files themselves stay on disk; a reopen rescans them.
        let agg = Aggregator::new(&dir, STEP).expect("reopen");
        assert_eq!(agg.stats().frozen_up_to, STEP);

        let _ = fs::remove_dir_all(&dir);
    }
}
