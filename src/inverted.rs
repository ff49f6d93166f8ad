//! An inverted-index stream: for each key, the set of txNums at which the
//! key was touched.
//!
//! Recent touches land in a single mutable table as `be64(txNum) ‖ key`
//! appends, so the write path never rewrites a bitmap. Freezing a step
//! groups the range's touches per key into 64-bit roaring bitmaps and
//! writes one serialized bitmap per row into a static file.

use crate::files::{
    self, file_base, files_in_range, scan_stream_dir, FileBuilder, FilesItem, MergeRange,
};
use crate::kv::{Table, Tx};
use eyre::{eyre, Result, WrapErr};
use roaring::RoaringTreemap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::warn;

const INVERTED_KIND: &str = "inv";

/// Freshly built, not-yet-integrated static file of one step.
pub(crate) struct InvertedFiles {
    pub item: Option<Arc<FilesItem>>,
}

impl InvertedFiles {
    pub fn discard(&mut self) {
        if let Some(item) = self.item.take() {
            if let Err(err) = item.delete_from_disk() {
                warn!(error = %err, "failed to remove discarded static file");
            }
        }
    }
}

#[derive(Debug)]
pub struct InvertedIndex {
    dir: PathBuf,
    name: String,
    aggregation_step: u64,
    keys_table: Table,
    tx_num: u64,
    tx: Option<Tx>,
    files: RwLock<Vec<Arc<FilesItem>>>,
}

impl InvertedIndex {
    pub fn new(dir: &Path, name: &str, aggregation_step: u64, keys_table: Table) -> Result<Self> {
        let stream_dir = dir.join(name);
        std::fs::create_dir_all(&stream_dir)
            .wrap_err_with(|| format!("failed to create {}", stream_dir.display()))?;
        let files = scan_stream_dir(&stream_dir, name, INVERTED_KIND, aggregation_step)?;
        Ok(Self {
            dir: stream_dir,
            name: name.to_string(),
            aggregation_step,
            keys_table,
            tx_num: 0,
            tx: None,
            files: RwLock::new(files),
        })
    }

    pub fn set_tx(&mut self, tx: Tx) {
        self.tx = Some(tx);
    }

    pub fn set_tx_num(&mut self, tx_num: u64) {
        self.tx_num = tx_num;
    }

    /// Records `(key, current txNum)`.
    pub fn add(&self, key: &[u8]) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| eyre!("no transaction bound"))?;
        tx.put(self.keys_table, &touch_key(self.tx_num, key), &[])
    }

    /// Ascending txNums in `[start_tx, end_tx)` at which `key` was touched,
    /// across static files and the mutable table.
    pub fn iterate_range(
        &self,
        key: &[u8],
        start_tx: u64,
        end_tx: u64,
        tx: &Tx,
    ) -> Result<InvertedIterator> {
        let mut bitmap = RoaringTreemap::new();
        let list = self.files.read().expect("inverted files lock");
        for item in list.iter() {
            if item.end_tx <= start_tx || item.start_tx >= end_tx {
                continue;
            }
            if let Some(row) = item.row_for_key(key) {
                bitmap |= read_bitmap(item, row)?;
            }
        }
        drop(list);
        for (k, _) in tx.scan_range(
            self.keys_table,
            &start_tx.to_be_bytes(),
            &end_tx.to_be_bytes(),
        )? {
            let (stamp, touched) = split_touch_key(&k)?;
            if touched == key {
                bitmap.insert(stamp);
            }
        }
        bitmap.remove_range(..start_tx);
        bitmap.remove_range(end_tx..);
        Ok(InvertedIterator {
            inner: bitmap.into_iter(),
        })
    }

    pub(crate) fn collate(
        &self,
        tx_from: u64,
        tx_to: u64,
        tx: &Tx,
    ) -> Result<BTreeMap<Vec<u8>, RoaringTreemap>> {
        let mut keys: BTreeMap<Vec<u8>, RoaringTreemap> = BTreeMap::new();
        for (k, _) in tx.scan_range(
            self.keys_table,
            &tx_from.to_be_bytes(),
            &tx_to.to_be_bytes(),
        )? {
            let (stamp, key) = split_touch_key(&k)?;
            keys.entry(key.to_vec()).or_default().insert(stamp);
        }
        Ok(keys)
    }

    pub(crate) fn build_files(
        &self,
        step: u64,
        collation: BTreeMap<Vec<u8>, RoaringTreemap>,
    ) -> Result<InvertedFiles> {
        let tx_from = step * self.aggregation_step;
        let tx_to = (step + 1) * self.aggregation_step;
        let base = file_base(&self.dir, &self.name, step, step + 1, INVERTED_KIND);
        let item = write_bitmap_file(&base, tx_from, tx_to, &collation)?;
        Ok(InvertedFiles { item: Some(item) })
    }

    pub(crate) fn integrate_files(&self, sf: InvertedFiles, tx_from: u64, tx_to: u64) {
        if let Some(item) = sf.item {
            debug_assert_eq!((item.start_tx, item.end_tx), (tx_from, tx_to));
            let mut list = self.files.write().expect("inverted files lock");
            list.push(item);
            list.sort_by_key(|item| (item.end_tx, item.start_tx));
        }
    }

    pub(crate) fn prune(&self, tx_from: u64, tx_to: u64) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| eyre!("no transaction bound"))?;
        tx.clear_range(
            self.keys_table,
            &tx_from.to_be_bytes(),
            &tx_to.to_be_bytes(),
        )?;
        Ok(())
    }

    pub(crate) fn end_tx_num_minimax(&self) -> u64 {
        let list = self.files.read().expect("inverted files lock");
        list.iter().map(|item| item.end_tx).max().unwrap_or(0)
    }

    pub(crate) fn find_merge_range(&self, max_end_tx: u64, max_span: u64) -> MergeRange {
        files::find_merge_range(
            &self.files.read().expect("inverted files lock"),
            max_end_tx,
            max_span,
            self.aggregation_step,
        )
    }

    pub(crate) fn static_files_in_range(&self, from: u64, to: u64) -> Vec<Arc<FilesItem>> {
        files_in_range(&self.files.read().expect("inverted files lock"), from, to)
    }

    pub(crate) fn merge_files(
        &self,
        inputs: &[Arc<FilesItem>],
        r: MergeRange,
    ) -> Result<Arc<FilesItem>> {
        let mut keys: BTreeMap<Vec<u8>, RoaringTreemap> = BTreeMap::new();
        for item in inputs {
            for entry in item.index.entries() {
                let Some(&(_, row)) = entry.versions.first() else {
                    continue;
                };
                *keys.entry(entry.key.clone()).or_default() |= read_bitmap(item, row)?;
            }
        }
        let base = file_base(
            &self.dir,
            &self.name,
            r.from / self.aggregation_step,
            r.to / self.aggregation_step,
            INVERTED_KIND,
        );
        write_bitmap_file(&base, r.from, r.to, &keys)
    }

    pub(crate) fn integrate_merged_files(&self, outs: &[Arc<FilesItem>], merged: Arc<FilesItem>) {
        let mut list = self.files.write().expect("inverted files lock");
        files::replace_with_merged(&mut list, outs, merged);
    }

    pub(crate) fn delete_files(&self, outs: &[Arc<FilesItem>]) -> Result<()> {
        for item in outs {
            item.delete_from_disk()?;
        }
        Ok(())
    }

    pub(crate) fn static_file_count(&self) -> u64 {
        self.files.read().expect("inverted files lock").len() as u64
    }

    /// Releases the transaction binding and every static-file handle.
    /// Idempotent.
    pub fn close(&mut self) {
        self.tx = None;
        self.files.write().expect("inverted files lock").clear();
    }
}

impl Drop for InvertedIndex {
    fn drop(&mut self) {
        self.close();
    }
}

/// Ascending txNum iterator produced by [`InvertedIndex::iterate_range`].
pub struct InvertedIterator {
    inner: roaring::treemap::IntoIter,
}

impl Iterator for InvertedIterator {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.inner.next()
    }
}

fn write_bitmap_file(
    base: &Path,
    tx_from: u64,
    tx_to: u64,
    keys: &BTreeMap<Vec<u8>, RoaringTreemap>,
) -> Result<Arc<FilesItem>> {
    let mut builder = FileBuilder::create(base, tx_from, tx_to, false)?;
    let result = (|| {
        for (key, bitmap) in keys {
            let mut raw = Vec::with_capacity(bitmap.serialized_size());
            bitmap
                .serialize_into(&mut raw)
                .wrap_err("failed to serialize bitmap")?;
            builder.push_key(key, &[(bitmap.max().unwrap_or(0), raw.as_slice())])?;
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

fn read_bitmap(item: &FilesItem, row: u64) -> Result<RoaringTreemap> {
    let raw = item.segment.row(row)?;
    RoaringTreemap::deserialize_from(raw.as_slice()).wrap_err("failed to deserialize bitmap")
}

fn touch_key(tx_num: u64, key: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(8 + key.len());
    raw.extend_from_slice(&tx_num.to_be_bytes());
    raw.extend_from_slice(key);
    raw
}

fn split_touch_key(raw: &[u8]) -> Result<(u64, &[u8])> {
    if raw.len() < 8 {
        return Err(eyre!("malformed touch key ({} bytes)", raw.len()));
    }
    let (stamp, key) = raw.split_at(8);
    Ok((u64::from_be_bytes(stamp.try_into().expect("8-byte stamp")), key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Db;
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
            "state-archive-inverted-test-{now}-{}-{suffix}",
            std::process::id()
        ));
        path
    }

    fn log_addrs(dir: &Path) -> (Db, Tx, InvertedIndex) {
        let db = Db::open();
        let tx = db.begin();
        let mut index =
            InvertedIndex::new(dir, "logaddrs", STEP, Table::LogAddrKeys).expect("new index");
        index.set_tx(tx.clone());
        (db, tx, index)
    }

    fn touch_at(index: &mut InvertedIndex, tx_num: u64, key: &[u8]) {
        index.set_tx_num(tx_num);
        index.add(key).expect("add");
    }

    fn freeze(index: &InvertedIndex, tx: &Tx, step: u64) {
        let tx_from = step * STEP;
        let tx_to = (step + 1) * STEP;
        let collation = index.collate(tx_from, tx_to, tx).expect("collate");
        let sf = index.build_files(step, collation).expect("build files");
        index.integrate_files(sf, tx_from, tx_to);
        index.prune(tx_from, tx_to).expect("prune");
    }

    #[test]
    fn range_iteration_over_mutable_touches() {
        let dir = temp_dir();
        let (_db, tx, mut index) = log_addrs(&dir);
        touch_at(&mut index, 10, b"xx");
        touch_at(&mut index, 20, b"xx");
        touch_at(&mut index, 30, b"xx");
        touch_at(&mut index, 22, b"yy");

        let txs: Vec<u64> = index.iterate_range(b"xx", 15, 25, &tx).expect("iterate").collect();
        assert_eq!(txs, vec![20]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn range_iteration_spans_files_and_mutable() {
        let dir = temp_dir();
        let (_db, tx, mut index) = log_addrs(&dir);
        touch_at(&mut index, 0, b"xx");
        touch_at(&mut index, 2, b"xx");
        touch_at(&mut index, 3, b"yy");
        freeze(&index, &tx, 0);
        touch_at(&mut index, 5, b"xx");

        // Frozen touches are gone from the mutable table.
        assert!(tx
            .scan_range(Table::LogAddrKeys, &0u64.to_be_bytes(), &STEP.to_be_bytes())
            .expect("scan")
            .is_empty());

        let txs: Vec<u64> = index.iterate_range(b"xx", 0, 100, &tx).expect("iterate").collect();
        assert_eq!(txs, vec![0, 2, 5]);
        let txs: Vec<u64> = index.iterate_range(b"xx", 1, 5, &tx).expect("iterate").collect();
        assert_eq!(txs, vec![2]);
        let txs: Vec<u64> = index.iterate_range(b"yy", 0, 100, &tx).expect("iterate").collect();
        assert_eq!(txs, vec![3]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn merge_unions_per_key_bitmaps() {
        let dir = temp_dir();
        let (_db, tx, mut index) = log_addrs(&dir);
        touch_at(&mut index, 1, b"xx");
        freeze(&index, &tx, 0);
        touch_at(&mut index, 6, b"xx");
        touch_at(&mut index, 7, b"yy");
        freeze(&index, &tx, 1);

        let r = index.find_merge_range(index.end_tx_num_minimax(), 32 * STEP);
        assert!(r.needs_merge);
        assert_eq!((r.from, r.to), (0, 2 * STEP));
        let outs = index.static_files_in_range(r.from, r.to);
        assert_eq!(outs.len(), 2);
        let merged = index.merge_files(&outs, r).expect("merge");
        index.integrate_merged_files(&outs, merged);
        index.delete_files(&outs).expect("delete");

        assert_eq!(index.static_file_count(), 1);
        let txs: Vec<u64> = index.iterate_range(b"xx", 0, 100, &tx).expect("iterate").collect();
        assert_eq!(txs, vec![1, 6]);
        let txs: Vec<u64> = index.iterate_range(b"yy", 0, 100, &tx).expect("iterate").collect();
        assert_eq!(txs, vec![7]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reopen_rescans_static_files() {
        let dir = temp_dir();
        let (db, tx, mut index) = log_addrs(&dir);
        touch_at(&mut index, 2, b"xx");
        freeze(&index, &tx, 0);
        drop(index);

        let tx = db.begin();
        let index =
            InvertedIndex::new(&dir, "logaddrs", STEP, Table::LogAddrKeys).expect("reopen");
        assert_eq!(index.end_tx_num_minimax(), STEP);
        let txs: Vec<u64> = index.iterate_range(b"xx", 0, 100, &tx).expect("iterate").collect();
        assert_eq!(txs, vec![2]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
