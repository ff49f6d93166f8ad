//! A domain stream: one keyed store with full version history.
//!
//! Recent versions live in two mutable tables — `vals` holds the latest
//! value per key stamped with its txNum, `history` holds every version
//! keyed by `key ‖ be64(txNum)`. Freezing a step turns the step's versions
//! into a pair of static files: a *values* file (latest version per key in
//! the range) and a *history* file (every version in the range). An empty
//! payload is a tombstone in both worlds, so deletions shadow older values
//! across the file stack.

use crate::files::{
    self, file_base, files_in_range, scan_stream_dir, FileBuilder, FilesItem, MergeRange,
};
use crate::kv::{Table, Tx};
use eyre::{eyre, Result, WrapErr};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

const VALUES_KIND: &str = "vals";
const HISTORY_KIND: &str = "hist";

/// Well-known mutable tables of one domain.
#[derive(Debug, Clone, Copy)]
pub struct DomainTables {
    pub vals: Table,
    pub history: Table,
}

/// Per-domain lifecycle counters, drained by `get_and_reset_stats`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DomainStats {
    pub collations: u64,
    pub files_built: u64,
    pub merges: u64,
    pub prunes: u64,
    /// Segment rows fetched while answering reads.
    pub file_reads: u64,
}

impl DomainStats {
    pub fn accumulate(&mut self, other: DomainStats) {
        self.collations += other.collations;
        self.files_built += other.files_built;
        self.merges += other.merges;
        self.prunes += other.prunes;
        self.file_reads += other.file_reads;
    }
}

#[derive(Default)]
#[derive(Debug)]
struct StatsCounters {
    collations: AtomicU64,
    files_built: AtomicU64,
    merges: AtomicU64,
    prunes: AtomicU64,
    file_reads: AtomicU64,
}

/// Merge candidates per file type; a domain merges values and history
/// independently, though integration keeps their ranges in lockstep.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DomainRanges {
    pub values: MergeRange,
    pub history: MergeRange,
}

impl DomainRanges {
    pub fn any(&self) -> bool {
        self.values.needs_merge || self.history.needs_merge
    }
}

/// In-memory intermediate of one step's versions, keyed and ordered.
pub(crate) struct Collation {
    step: u64,
    keys: BTreeMap<Vec<u8>, Vec<(u64, Vec<u8>)>>,
}

/// Freshly built, not-yet-integrated static files of one step.
pub(crate) struct StaticFiles {
    pub values: Option<Arc<FilesItem>>,
    pub history: Option<Arc<FilesItem>>,
}

impl StaticFiles {
    /// Drops the handles and unlinks the files. For artifacts that were
    /// never integrated; integrated files are owned by the domain instead.
    pub fn discard(&mut self) {
        for item in [self.values.take(), self.history.take()].into_iter().flatten() {
            if let Err(err) = item.delete_from_disk() {
                warn!(error = %err, "failed to remove discarded static file");
            }
        }
    }
}

/// Merge outputs, per file type.
pub(crate) struct DomainMergedFiles {
    pub values: Option<Arc<FilesItem>>,
    pub history: Option<Arc<FilesItem>>,
}

impl DomainMergedFiles {
    pub fn discard(&mut self) {
        for item in [self.values.take(), self.history.take()].into_iter().flatten() {
            if let Err(err) = item.delete_from_disk() {
                warn!(error = %err, "failed to remove discarded merged file");
            }
        }
    }
}

#[derive(Debug)]
pub struct Domain {
    dir: PathBuf,
    name: String,
    aggregation_step: u64,
    tables: DomainTables,
    prefix_len: usize,
    compress_vals: bool,
    tx_num: u64,
    tx: Option<Tx>,
    values_files: RwLock<Vec<Arc<FilesItem>>>,
    history_files: RwLock<Vec<Arc<FilesItem>>>,
    stats: StatsCounters,
}

impl Domain {
    pub fn new(
        dir: &Path,
        name: &str,
        aggregation_step: u64,
        tables: DomainTables,
        prefix_len: usize,
        compress_vals: bool,
    ) -> Result<Self> {
        let stream_dir = dir.join(name);
        std::fs::create_dir_all(&stream_dir)
            .wrap_err_with(|| format!("failed to create {}", stream_dir.display()))?;
        let values = scan_stream_dir(&stream_dir, name, VALUES_KIND, aggregation_step)?;
        let history = scan_stream_dir(&stream_dir, name, HISTORY_KIND, aggregation_step)?;
        Ok(Self {
            dir: stream_dir,
            name: name.to_string(),
            aggregation_step,
            tables,
            prefix_len,
            compress_vals,
            tx_num: 0,
            tx: None,
            values_files: RwLock::new(values),
            history_files: RwLock::new(history),
            stats: StatsCounters::default(),
        })
    }

    pub fn set_tx(&mut self, tx: Tx) {
        self.tx = Some(tx);
    }

    pub fn set_tx_num(&mut self, tx_num: u64) {
        self.tx_num = tx_num;
    }

    fn rw_tx(&self) -> Result<&Tx> {
        self.tx.as_ref().ok_or_else(|| eyre!("no transaction bound"))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_version(key, value)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write_version(key, &[])
    }

    fn write_version(&self, key: &[u8], payload: &[u8]) -> Result<()> {
        let tx = self.rw_tx()?;
        tx.put(self.tables.vals, key, &stamp_value(self.tx_num, payload))?;
        tx.put(self.tables.history, &history_key(key, self.tx_num), payload)
    }

    /// Latest value: mutable store first, then values files newest-first.
    pub fn get(&self, key: &[u8], tx: &Tx) -> Result<Option<Vec<u8>>> {
        if let Some(raw) = tx.get(self.tables.vals, key)? {
            let (_, payload) = split_stamped(&raw)?;
            return Ok(non_empty(payload));
        }
        let values = self.values_files.read().expect("values files lock");
        for item in values.iter().rev() {
            if let Some(row) = item.row_for_key(key) {
                self.stats.file_reads.fetch_add(1, Ordering::Relaxed);
                let raw = item.segment.row(row)?;
                let (_, payload) = split_stamped(&raw)?;
                return Ok(non_empty(payload));
            }
        }
        Ok(None)
    }

    /// Latest version with `versionTxNum <= tx_num`, composed across the
    /// mutable history and the history files.
    pub fn get_before_tx_num(&self, key: &[u8], tx_num: u64, tx: &Tx) -> Result<Option<Vec<u8>>> {
        let mut candidate: Option<(u64, Vec<u8>)> = None;
        for (k, payload) in tx.scan_prefix(self.tables.history, key)? {
            if k.len() != key.len() + 8 {
                continue;
            }
            let (_, stamp) = split_history_key(&k)?;
            if stamp <= tx_num {
                candidate = Some((stamp, payload));
            }
        }

        let history = self.history_files.read().expect("history files lock");
        for item in history.iter().rev() {
            if item.start_tx > tx_num {
                continue;
            }
            let Some(entry) = item.index.lookup(key) else {
                continue;
            };
            let upto = entry.versions.partition_point(|&(t, _)| t <= tx_num);
            if upto == 0 {
                continue;
            }
            let (stamp, row) = entry.versions[upto - 1];
            if candidate.as_ref().is_none_or(|(t, _)| stamp > *t) {
                self.stats.file_reads.fetch_add(1, Ordering::Relaxed);
                candidate = Some((stamp, item.segment.row(row)?));
            }
            break;
        }

        Ok(candidate.and_then(|(_, payload)| non_empty(&payload)))
    }

    /// Visits every live key starting with `prefix`, newest version winning
    /// across the mutable store and the values files.
    pub fn iterate_prefix(
        &self,
        prefix: &[u8],
        tx: &Tx,
        mut f: impl FnMut(&[u8], &[u8]),
    ) -> Result<()> {
        if self.prefix_len != 0 && prefix.len() != self.prefix_len {
            return Err(eyre!(
                "prefix length mismatch for {}: expected {}, got {}",
                self.name,
                self.prefix_len,
                prefix.len()
            ));
        }
        let mut acc: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let values = self.values_files.read().expect("values files lock");
        for item in values.iter() {
            let entries = item.index.entries();
            for entry in &entries[item.index.lower_bound(prefix)..] {
                if !entry.key.starts_with(prefix) {
                    break;
                }
                let Some(&(_, row)) = entry.versions.first() else {
                    continue;
                };
                self.stats.file_reads.fetch_add(1, Ordering::Relaxed);
                let raw = item.segment.row(row)?;
                let (_, payload) = split_stamped(&raw)?;
                acc.insert(entry.key.clone(), payload.to_vec());
            }
        }
        drop(values);
        for (key, raw) in tx.scan_prefix(self.tables.vals, prefix)? {
            let (_, payload) = split_stamped(&raw)?;
            acc.insert(key, payload.to_vec());
        }
        for (key, payload) in &acc {
            if !payload.is_empty() {
                f(key, payload);
            }
        }
        Ok(())
    }

    pub(crate) fn collate(
        &self,
        step: u64,
        tx_from: u64,
        tx_to: u64,
        tx: &Tx,
    ) -> Result<Collation> {
        self.stats.collations.fetch_add(1, Ordering::Relaxed);
        let mut keys: BTreeMap<Vec<u8>, Vec<(u64, Vec<u8>)>> = BTreeMap::new();
        for (k, payload) in tx.scan_prefix(self.tables.history, &[])? {
            let (key, stamp) = split_history_key(&k)?;
            if stamp >= tx_from && stamp < tx_to {
                // Table order is (key, stamp), so versions arrive ascending.
                keys.entry(key.to_vec()).or_default().push((stamp, payload));
            }
        }
        Ok(Collation { step, keys })
    }

    pub(crate) fn build_files(&self, step: u64, collation: Collation) -> Result<StaticFiles> {
        if step != collation.step {
            return Err(eyre!(
                "collation step mismatch for {}: expected {}, got {}",
                self.name,
                step,
                collation.step
            ));
        }
        self.stats.files_built.fetch_add(1, Ordering::Relaxed);
        let tx_from = step * self.aggregation_step;
        let tx_to = (step + 1) * self.aggregation_step;

        let values = self.build_values_file(&collation, step, tx_from, tx_to)?;
        let history = match self.build_history_file(&collation, step, tx_from, tx_to) {
            Ok(history) => history,
            Err(err) => {
                let _ = values.delete_from_disk();
                return Err(err);
            }
        };
        Ok(StaticFiles {
            values: Some(values),
            history: Some(history),
        })
    }

    fn build_values_file(
        &self,
        collation: &Collation,
        step: u64,
        tx_from: u64,
        tx_to: u64,
    ) -> Result<Arc<FilesItem>> {
        let base = file_base(&self.dir, &self.name, step, step + 1, VALUES_KIND);
        let mut builder = FileBuilder::create(&base, tx_from, tx_to, self.compress_vals)?;
        let result = (|| {
            for (key, versions) in &collation.keys {
                let Some((stamp, payload)) = versions.last() else {
                    continue;
                };
                let row = stamp_value(*stamp, payload);
                builder.push_key(key, &[(*stamp, row.as_slice())])?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => builder.finish(tx_from, tx_to),
            Err(err) => {
                let _ = builder.abort();
                Err(err)
            }
        }
    }

    fn build_history_file(
        &self,
        collation: &Collation,
        step: u64,
        tx_from: u64,
        tx_to: u64,
    ) -> Result<Arc<FilesItem>> {
        let base = file_base(&self.dir, &self.name, step, step + 1, HISTORY_KIND);
        let mut builder = FileBuilder::create(&base, tx_from, tx_to, self.compress_vals)?;
        let result = (|| {
            for (key, versions) in &collation.keys {
                let rows: Vec<(u64, &[u8])> = versions
                    .iter()
                    .map(|(stamp, payload)| (*stamp, payload.as_slice()))
                    .collect();
                builder.push_key(key, &rows)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => builder.finish(tx_from, tx_to),
            Err(err) => {
                let _ = builder.abort();
                Err(err)
            }
        }
    }

    pub(crate) fn integrate_files(&self, sf: StaticFiles, tx_from: u64, tx_to: u64) {
        if let Some(values) = sf.values {
            debug_assert_eq!((values.start_tx, values.end_tx), (tx_from, tx_to));
            let mut list = self.values_files.write().expect("values files lock");
            list.push(values);
            list.sort_by_key(|item| (item.end_tx, item.start_tx));
        }
        if let Some(history) = sf.history {
            debug_assert_eq!((history.start_tx, history.end_tx), (tx_from, tx_to));
            let mut list = self.history_files.write().expect("history files lock");
            list.push(history);
            list.sort_by_key(|item| (item.end_tx, item.start_tx));
        }
    }

    /// Drops mutable data now covered by static files: history versions in
    /// `[tx_from, tx_to)` and current values whose stamp is below `tx_to`.
    pub(crate) fn prune(&self, _step: u64, tx_from: u64, tx_to: u64) -> Result<()> {
        self.stats.prunes.fetch_add(1, Ordering::Relaxed);
        let tx = self.rw_tx()?;
        for (k, _) in tx.scan_prefix(self.tables.history, &[])? {
            let (_, stamp) = split_history_key(&k)?;
            if stamp >= tx_from && stamp < tx_to {
                tx.delete(self.tables.history, &k)?;
            }
        }
        for (k, raw) in tx.scan_prefix(self.tables.vals, &[])? {
            let (stamp, _) = split_stamped(&raw)?;
            if stamp < tx_to {
                tx.delete(self.tables.vals, &k)?;
            }
        }
        Ok(())
    }

    pub(crate) fn end_tx_num_minimax(&self) -> u64 {
        let values_max = max_end_tx(&self.values_files.read().expect("values files lock"));
        let history_max = max_end_tx(&self.history_files.read().expect("history files lock"));
        values_max.min(history_max)
    }

    pub(crate) fn find_merge_range(&self, max_end_tx: u64, max_span: u64) -> DomainRanges {
        DomainRanges {
            values: files::find_merge_range(
                &self.values_files.read().expect("values files lock"),
                max_end_tx,
                max_span,
                self.aggregation_step,
            ),
            history: files::find_merge_range(
                &self.history_files.read().expect("history files lock"),
                max_end_tx,
                max_span,
                self.aggregation_step,
            ),
        }
    }

    /// Borrowed (`Arc`-cloned) inputs for a merge; `(values, history)`.
    pub(crate) fn static_files_in_range(
        &self,
        r: &DomainRanges,
    ) -> (Vec<Arc<FilesItem>>, Vec<Arc<FilesItem>>) {
        let values = if r.values.needs_merge {
            files_in_range(
                &self.values_files.read().expect("values files lock"),
                r.values.from,
                r.values.to,
            )
        } else {
            Vec::new()
        };
        let history = if r.history.needs_merge {
            files_in_range(
                &self.history_files.read().expect("history files lock"),
                r.history.from,
                r.history.to,
            )
        } else {
            Vec::new()
        };
        (values, history)
    }

    pub(crate) fn merge_files(
        &self,
        values_in: &[Arc<FilesItem>],
        history_in: &[Arc<FilesItem>],
        r: &DomainRanges,
    ) -> Result<DomainMergedFiles> {
        self.stats.merges.fetch_add(1, Ordering::Relaxed);
        let values = if r.values.needs_merge {
            Some(self.merge_values(values_in, r.values)?)
        } else {
            None
        };
        let history = if r.history.needs_merge {
            match self.merge_history(history_in, r.history) {
                Ok(history) => Some(history),
                Err(err) => {
                    if let Some(values) = &values {
                        let _ = values.delete_from_disk();
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };
        Ok(DomainMergedFiles { values, history })
    }

    fn merge_values(&self, inputs: &[Arc<FilesItem>], r: MergeRange) -> Result<Arc<FilesItem>> {
        // Inputs arrive oldest-first; the newest version per key wins.
        // Tombstones stay: a deletion must keep shadowing older files that
        // are not part of this merge.
        let mut latest: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for item in inputs {
            for entry in item.index.entries() {
                let Some(&(_, row)) = entry.versions.first() else {
                    continue;
                };
                latest.insert(entry.key.clone(), item.segment.row(row)?);
            }
        }
        let base = self.merged_base(r, VALUES_KIND);
        let mut builder = FileBuilder::create(&base, r.from, r.to, self.compress_vals)?;
        let result = (|| {
            for (key, raw) in &latest {
                let (stamp, _) = split_stamped(raw)?;
                builder.push_key(key, &[(stamp, raw.as_slice())])?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => builder.finish(r.from, r.to),
            Err(err) => {
                let _ = builder.abort();
                Err(err)
            }
        }
    }

    fn merge_history(&self, inputs: &[Arc<FilesItem>], r: MergeRange) -> Result<Arc<FilesItem>> {
        let mut versions: BTreeMap<Vec<u8>, Vec<(u64, Vec<u8>)>> = BTreeMap::new();
        for item in inputs {
            for entry in item.index.entries() {
                let slot = versions.entry(entry.key.clone()).or_default();
                for &(stamp, row) in &entry.versions {
                    slot.push((stamp, item.segment.row(row)?));
                }
            }
        }
        for slot in versions.values_mut() {
            slot.sort_by_key(|&(stamp, _)| stamp);
        }
        let base = self.merged_base(r, HISTORY_KIND);
        let mut builder = FileBuilder::create(&base, r.from, r.to, self.compress_vals)?;
        let result = (|| {
            for (key, slot) in &versions {
                let rows: Vec<(u64, &[u8])> = slot
                    .iter()
                    .map(|(stamp, payload)| (*stamp, payload.as_slice()))
                    .collect();
                builder.push_key(key, &rows)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => builder.finish(r.from, r.to),
            Err(err) => {
                let _ = builder.abort();
                Err(err)
            }
        }
    }

    fn merged_base(&self, r: MergeRange, kind: &str) -> PathBuf {
        file_base(
            &self.dir,
            &self.name,
            r.from / self.aggregation_step,
            r.to / self.aggregation_step,
            kind,
        )
    }

    pub(crate) fn integrate_merged_files(
        &self,
        values_out: &[Arc<FilesItem>],
        history_out: &[Arc<FilesItem>],
        merged: DomainMergedFiles,
    ) {
        if let Some(values) = merged.values {
            let mut list = self.values_files.write().expect("values files lock");
            files::replace_with_merged(&mut list, values_out, values);
        }
        if let Some(history) = merged.history {
            let mut list = self.history_files.write().expect("history files lock");
            files::replace_with_merged(&mut list, history_out, history);
        }
    }

    pub(crate) fn delete_files(
        &self,
        values_out: &[Arc<FilesItem>],
        history_out: &[Arc<FilesItem>],
    ) -> Result<()> {
        for item in values_out.iter().chain(history_out) {
            item.delete_from_disk()?;
        }
        Ok(())
    }

    pub fn get_and_reset_stats(&self) -> DomainStats {
        DomainStats {
            collations: self.stats.collations.swap(0, Ordering::Relaxed),
            files_built: self.stats.files_built.swap(0, Ordering::Relaxed),
            merges: self.stats.merges.swap(0, Ordering::Relaxed),
            prunes: self.stats.prunes.swap(0, Ordering::Relaxed),
            file_reads: self.stats.file_reads.swap(0, Ordering::Relaxed),
        }
    }

    pub(crate) fn static_file_count(&self) -> u64 {
        let values = self.values_files.read().expect("values files lock").len();
        let history = self.history_files.read().expect("history files lock").len();
        (values + history) as u64
    }

    /// Read-only snapshot of the file stack for reconstruction scans.
    pub fn make_context(&self) -> DomainContext {
        DomainContext {
            values: self.values_files.read().expect("values files lock").clone(),
            history: self.history_files.read().expect("history files lock").clone(),
        }
    }

    /// Releases the transaction binding and every static-file handle.
    /// Idempotent; contexts holding their own clones keep their files alive.
    pub fn close(&mut self) {
        self.tx = None;
        self.values_files.write().expect("values files lock").clear();
        self.history_files.write().expect("history files lock").clear();
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.close();
    }
}

/// Snapshot handle over a domain's static files. Reads here never consult
/// the mutable store; that is the point — reconstruction needs to know what
/// the files alone say.
pub struct DomainContext {
    values: Vec<Arc<FilesItem>>,
    history: Vec<Arc<FilesItem>>,
}

impl DomainContext {
    /// As-of read against static files only. Returns the payload (`None`
    /// when the file-recorded version is a deletion), whether any
    /// file-resident version answered, and that version's txNum.
    pub fn get_no_state(&self, key: &[u8], tx_num: u64) -> Result<(Option<Vec<u8>>, bool, u64)> {
        for item in self.history.iter().rev() {
            if item.start_tx > tx_num {
                continue;
            }
            let Some(entry) = item.index.lookup(key) else {
                continue;
            };
            let upto = entry.versions.partition_point(|&(t, _)| t <= tx_num);
            if upto == 0 {
                continue;
            }
            let (stamp, row) = entry.versions[upto - 1];
            let payload = item.segment.row(row)?;
            return Ok((non_empty(&payload), true, stamp));
        }
        Ok((None, false, 0))
    }

    /// Largest txNum at which `key` was modified in static files.
    pub fn max_tx_num(&self, key: &[u8]) -> (bool, u64) {
        for item in self.history.iter().rev() {
            if let Some(entry) = item.index.lookup(key) {
                if let Some(&(stamp, _)) = entry.versions.last() {
                    return (true, stamp);
                }
            }
        }
        (false, 0)
    }

    /// Keys in `[from_key, to_key)` with file-recorded activity strictly
    /// before `tx_num`, with the latest such txNum. An empty `to_key` means
    /// unbounded.
    pub fn iterate_recon_txs(&self, from_key: &[u8], to_key: &[u8], tx_num: u64) -> ScanIterator {
        ScanIterator {
            pos: self
                .history
                .iter()
                .map(|item| item.index.lower_bound(from_key))
                .collect(),
            files: self.history.clone(),
            to_key: to_key.to_vec(),
            tx_num,
        }
    }

    /// Historical values snapshot-consistent with `tx_num` for keys in
    /// `[from_key, to_key)`; deletions are skipped.
    pub fn iterate_history(&self, from_key: &[u8], to_key: &[u8], tx_num: u64) -> HistoryIterator {
        HistoryIterator {
            pos: self
                .history
                .iter()
                .map(|item| item.index.lower_bound(from_key))
                .collect(),
            files: self.history.clone(),
            to_key: to_key.to_vec(),
            tx_num,
        }
    }
}

/// Lazy, finite, non-restartable k-way merge over history-file indexes.
pub struct ScanIterator {
    files: Vec<Arc<FilesItem>>,
    pos: Vec<usize>,
    to_key: Vec<u8>,
    tx_num: u64,
}

impl Iterator for ScanIterator {
    type Item = (Vec<u8>, u64);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = next_key(&self.files, &self.pos, &self.to_key)?;
            let mut best: Option<u64> = None;
            for (i, item) in self.files.iter().enumerate() {
                let Some(entry) = item.index.entries().get(self.pos[i]) else {
                    continue;
                };
                if entry.key != key {
                    continue;
                }
                for &(stamp, _) in &entry.versions {
                    if stamp < self.tx_num {
                        best = Some(best.map_or(stamp, |b| b.max(stamp)));
                    }
                }
                self.pos[i] += 1;
            }
            if let Some(stamp) = best {
                return Some((key, stamp));
            }
        }
    }
}

/// Lazy, finite, non-restartable iterator over historical values as of a
/// txNum. Row reads can fail, so items are `Result`s.
pub struct HistoryIterator {
    files: Vec<Arc<FilesItem>>,
    pos: Vec<usize>,
    to_key: Vec<u8>,
    tx_num: u64,
}

impl Iterator for HistoryIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = next_key(&self.files, &self.pos, &self.to_key)?;
            let mut best: Option<(u64, usize, u64)> = None;
            for (i, item) in self.files.iter().enumerate() {
                let Some(entry) = item.index.entries().get(self.pos[i]) else {
                    continue;
                };
                if entry.key != key {
                    continue;
                }
                let upto = entry.versions.partition_point(|&(t, _)| t <= self.tx_num);
                if upto > 0 {
                    let (stamp, row) = entry.versions[upto - 1];
                    if best.is_none_or(|(t, _, _)| stamp > t) {
                        best = Some((stamp, i, row));
                    }
                }
                self.pos[i] += 1;
            }
            let Some((_, file, row)) = best else {
                continue;
            };
            match self.files[file].segment.row(row) {
                Ok(payload) if payload.is_empty() => continue,
                Ok(payload) => return Some(Ok((key, payload))),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Smallest key at the current positions, respecting the end bound.
fn next_key(files: &[Arc<FilesItem>], pos: &[usize], to_key: &[u8]) -> Option<Vec<u8>> {
    let mut min_key: Option<&[u8]> = None;
    for (i, item) in files.iter().enumerate() {
        let Some(entry) = item.index.entries().get(pos[i]) else {
            continue;
        };
        if !to_key.is_empty() && entry.key.as_slice() >= to_key {
            continue;
        }
        if min_key.is_none_or(|k| entry.key.as_slice() < k) {
            min_key = Some(entry.key.as_slice());
        }
    }
    min_key.map(<[u8]>::to_vec)
}

fn max_end_tx(files: &[Arc<FilesItem>]) -> u64 {
    files.iter().map(|item| item.end_tx).max().unwrap_or(0)
}

fn non_empty(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.is_empty() {
        None
    } else {
        Some(payload.to_vec())
    }
}

fn stamp_value(tx_num: u64, payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(8 + payload.len());
    raw.extend_from_slice(&tx_num.to_be_bytes());
    raw.extend_from_slice(payload);
    raw
}

fn split_stamped(raw: &[u8]) -> Result<(u64, &[u8])> {
    if raw.len() < 8 {
        return Err(eyre!("malformed stamped value ({} bytes)", raw.len()));
    }
    let stamp = u64::from_be_bytes(raw[..8].try_into().expect("8-byte stamp"));
    Ok((stamp, &raw[8..]))
}

fn history_key(key: &[u8], tx_num: u64) -> Vec<u8> {
    let mut raw = Vec::with_capacity(key.len() + 8);
    raw.extend_from_slice(key);
    raw.extend_from_slice(&tx_num.to_be_bytes());
    raw
}

fn split_history_key(raw: &[u8]) -> Result<(&[u8], u64)> {
    if raw.len() < 8 {
        return Err(eyre!("malformed history key ({} bytes)", raw.len()));
    }
    let (key, stamp) = raw.split_at(raw.len() - 8);
    Ok((key, u64::from_be_bytes(stamp.try_into().expect("8-byte stamp"))))
}
