//! Static-file bundles: a compressed segment plus its key index, the
//! open-time directory rescan, and the size-tiered merge-range selector
//! shared by every archive stream.

use crate::segment::{
    ext_path, Segment, SegmentWriter, SEGMENT_CONFIG_EXTENSION, SEGMENT_DATA_EXTENSION,
    SEGMENT_OFFSETS_EXTENSION,
};
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

pub(crate) const INDEX_EXTENSION: &str = "idx";

/// One key's entry in a segment index: `(txNum, row)` version pairs, in
/// txNum order. Values and inverted segments carry a single version per key;
/// history segments the full list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IndexEntry {
    pub key: Vec<u8>,
    pub versions: Vec<(u64, u64)>,
}

/// Sorted key → row index for one segment, persisted as bincode.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct KeyIndex {
    entries: Vec<IndexEntry>,
}

impl KeyIndex {
    pub fn new(entries: Vec<IndexEntry>) -> Self {
        Self { entries }
    }

    pub fn write(&self, base: &Path) -> Result<()> {
        let path = ext_path(base, INDEX_EXTENSION);
        let file = File::create(&path)
            .wrap_err_with(|| format!("failed to create {}", path.display()))?;
        bincode::serialize_into(file, &self.entries)
            .wrap_err_with(|| format!("failed to encode {}", path.display()))
    }

    pub fn load(base: &Path) -> Result<Self> {
        let path = ext_path(base, INDEX_EXTENSION);
        let file =
            File::open(&path).wrap_err_with(|| format!("failed to open {}", path.display()))?;
        let entries: Vec<IndexEntry> = bincode::deserialize_from(file)
            .wrap_err_with(|| format!("failed to decode {}", path.display()))?;
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&IndexEntry> {
        self.entries
            .binary_search_by(|entry| entry.key.as_slice().cmp(key))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Index of the first entry with `key >= bound`.
    pub fn lower_bound(&self, bound: &[u8]) -> usize {
        self.entries
            .partition_point(|entry| entry.key.as_slice() < bound)
    }
}

/// An immutable static file covering `[start_tx, end_tx)`: the data segment
/// and its key index, plus the base path for unlinking. Shared via `Arc` so
/// readers keep unlinked files alive through the mmap.
#[derive(Debug)]
pub(crate) struct FilesItem {
    pub start_tx: u64,
    pub end_tx: u64,
    base: PathBuf,
    pub segment: Segment,
    pub index: KeyIndex,
}

impl FilesItem {
    pub fn open(base: &Path, start_tx: u64, end_tx: u64) -> Result<Self> {
        let segment = Segment::open(base)?;
        if segment.config().start_tx != start_tx || segment.config().end_tx != end_tx {
            return Err(eyre!(
                "segment range mismatch for {}: expected [{}, {}), got [{}, {})",
                base.display(),
                start_tx,
                end_tx,
                segment.config().start_tx,
                segment.config().end_tx
            ));
        }
        let index = KeyIndex::load(base)?;
        Ok(Self {
            start_tx,
            end_tx,
            base: base.to_path_buf(),
            segment,
            index,
        })
    }

    /// Row number for single-version segments (values, inverted).
    pub fn row_for_key(&self, key: &[u8]) -> Option<u64> {
        self.index
            .lookup(key)
            .and_then(|entry| entry.versions.first())
            .map(|&(_, row)| row)
    }

    pub fn delete_from_disk(&self) -> Result<()> {
        remove_segment_files(&self.base)
    }
}

/// Builds one static file: writes the segment rows and the index, then
/// reopens the finished artifact. `rows` yields `(key, versions, payload)`
/// groups in key order; each payload lands on one row per version.
pub(crate) struct FileBuilder {
    base: PathBuf,
    writer: SegmentWriter,
    entries: Vec<IndexEntry>,
    next_row: u64,
}

impl FileBuilder {
    pub fn create(base: &Path, start_tx: u64, end_tx: u64, compressed: bool) -> Result<Self> {
        let writer = SegmentWriter::create(base, start_tx, end_tx, compressed)?;
        Ok(Self {
            base: base.to_path_buf(),
            writer,
            entries: Vec::new(),
            next_row: 0,
        })
    }

    /// Appends all of one key's version rows. Keys must arrive in ascending
    /// order with at least one version each. An empty payload is a deletion
    /// marker and lands as an empty row.
    pub fn push_key(&mut self, key: &[u8], versions: &[(u64, &[u8])]) -> Result<()> {
        let mut index_versions = Vec::with_capacity(versions.len());
        for (tx_num, payload) in versions {
            if payload.is_empty() {
                self.writer.push_empty()?;
            } else {
                self.writer.push(payload)?;
            }
            index_versions.push((*tx_num, self.next_row));
            self.next_row += 1;
        }
        self.entries.push(IndexEntry {
            key: key.to_vec(),
            versions: index_versions,
        });
        Ok(())
    }

    pub fn finish(self, start_tx: u64, end_tx: u64) -> Result<Arc<FilesItem>> {
        self.writer.finish()?;
        KeyIndex::new(self.entries).write(&self.base)?;
        Ok(Arc::new(FilesItem::open(&self.base, start_tx, end_tx)?))
    }

    /// Removes whatever this builder has written so far. Used on the failure
    /// path so an aborted build leaves no partial artifacts behind.
    pub fn abort(self) -> Result<()> {
        drop(self.writer);
        remove_segment_files(&self.base)
    }
}

fn remove_segment_files(base: &Path) -> Result<()> {
    for ext in [
        SEGMENT_DATA_EXTENSION,
        SEGMENT_OFFSETS_EXTENSION,
        SEGMENT_CONFIG_EXTENSION,
        INDEX_EXTENSION,
    ] {
        let path = ext_path(base, ext);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .wrap_err_with(|| format!("failed to remove {}", path.display()));
            }
        }
    }
    Ok(())
}

/// Base path for a stream file: `<dir>/<name>.<from_step>-<to_step>.<kind>`.
pub(crate) fn file_base(dir: &Path, name: &str, from_step: u64, to_step: u64, kind: &str) -> PathBuf {
    dir.join(format!("{name}.{from_step}-{to_step}.{kind}"))
}

/// Rescans a stream directory for `<name>.<a>-<b>.<kind>` file sets and
/// reopens the complete ones. Incomplete or unreadable sets (a crash between
/// segment write and config write, a corrupt index) are removed so a
/// subsequent freeze can rebuild them. Returns files sorted by range.
pub(crate) fn scan_stream_dir(
    dir: &Path,
    name: &str,
    kind: &str,
    step: u64,
) -> Result<Vec<Arc<FilesItem>>> {
    let mut groups: BTreeMap<(u64, u64), bool> = BTreeMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).wrap_err_with(|| format!("failed to read {}", dir.display()))
        }
    };
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some((range, ext)) = parse_stream_file(&file_name, name, kind) else {
            continue;
        };
        let has_config = groups.entry(range).or_insert(false);
        *has_config |= ext == SEGMENT_CONFIG_EXTENSION;
    }

    let mut files = Vec::new();
    for ((from_step, to_step), has_config) in groups {
        let base = file_base(dir, name, from_step, to_step, kind);
        if !has_config {
            warn!(base = %base.display(), "removing static file without config");
            remove_segment_files(&base)?;
            continue;
        }
        match FilesItem::open(&base, from_step * step, to_step * step) {
            Ok(item) => files.push(Arc::new(item)),
            Err(err) => {
                warn!(base = %base.display(), error = %err, "removing unreadable static file");
                remove_segment_files(&base)?;
            }
        }
    }
    files.sort_by_key(|item| (item.end_tx, item.start_tx));
    Ok(files)
}

fn parse_stream_file(file_name: &str, name: &str, kind: &str) -> Option<((u64, u64), String)> {
    let rest = file_name.strip_prefix(name)?.strip_prefix('.')?;
    let (range, rest) = rest.split_once('.')?;
    let (file_kind, ext) = rest.split_once('.')?;
    if file_kind != kind || ext.contains('.') {
        return None;
    }
    let (from, to) = range.split_once('-')?;
    let from: u64 = from.parse().ok()?;
    let to: u64 = to.parse().ok()?;
    if from >= to {
        return None;
    }
    Some(((from, to), ext.to_string()))
}

/// A candidate merge: the half-open txNum range to replace with one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MergeRange {
    pub needs_merge: bool,
    pub from: u64,
    pub to: u64,
}

/// Size-tiered merge selection over one file list.
///
/// A file ending at `end` can anchor a merged file of the largest
/// power-of-two step multiple dividing `end/step`, capped by `max_span`. The
/// merge is worth doing when that aligned span reaches further back than the
/// file's own start; the earliest range wins. Only files at or below
/// `max_end_tx` participate, which keeps merges inside the range every
/// stream has on disk.
pub(crate) fn find_merge_range(
    files: &[Arc<FilesItem>],
    max_end_tx: u64,
    max_span: u64,
    step: u64,
) -> MergeRange {
    let mut range = MergeRange::default();
    for item in files {
        if item.end_tx > max_end_tx {
            continue;
        }
        let end_step = item.end_tx / step;
        if end_step == 0 {
            continue;
        }
        let span_steps = end_step & end_step.wrapping_neg();
        let span = span_steps.saturating_mul(step).min(max_span);
        let from = item.end_tx.saturating_sub(span);
        if from < item.start_tx && (!range.needs_merge || from < range.from) {
            range = MergeRange {
                needs_merge: true,
                from,
                to: item.end_tx,
            };
        }
    }
    range
}

/// Files fully contained in `[from, to)`.
pub(crate) fn files_in_range(files: &[Arc<FilesItem>], from: u64, to: u64) -> Vec<Arc<FilesItem>> {
    files
        .iter()
        .filter(|item| item.start_tx >= from && item.end_tx <= to)
        .cloned()
        .collect()
}

/// Swaps a merged file in for its inputs: the inputs leave the list, the
/// merged file joins it, order is restored. Readers holding `Arc` clones of
/// the inputs are unaffected.
pub(crate) fn replace_with_merged(
    list: &mut Vec<Arc<FilesItem>>,
    outs: &[Arc<FilesItem>],
    merged: Arc<FilesItem>,
) {
    list.retain(|item| !outs.iter().any(|out| Arc::ptr_eq(item, out)));
    list.push(merged);
    list.sort_by_key(|item| (item.end_tx, item.start_tx));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir() -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time moves forward")
            .as_nanos();
        let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
        let mut path = std::env::temp_dir();
        path.push(format!(
            "state-archive-files-test-{now}-{}-{suffix}",
            std::process::id()
        ));
        path
    }

    const STEP: u64 = 4;

    fn make_file(dir: &Path, name: &str, from_step: u64, to_step: u64) -> Arc<FilesItem> {
        let base = file_base(dir, name, from_step, to_step, "vals");
        let mut builder =
            FileBuilder::create(&base, from_step * STEP, to_step * STEP, false).expect("create");
        builder
            .push_key(b"key", &[(from_step * STEP, b"value".as_slice())])
            .expect("push");
        builder
            .finish(from_step * STEP, to_step * STEP)
            .expect("finish")
    }

    #[test]
    fn index_lookup_and_bounds() {
        let index = KeyIndex::new(vec![
            IndexEntry {
                key: b"aa".to_vec(),
                versions: vec![(0, 0)],
            },
            IndexEntry {
                key: b"cc".to_vec(),
                versions: vec![(1, 1), (5, 2)],
            },
        ]);
        assert!(index.lookup(b"aa").is_some());
        assert!(index.lookup(b"bb").is_none());
        assert_eq!(index.lookup(b"cc").expect("entry").versions.len(), 2);
        assert_eq!(index.lower_bound(b"ab"), 1);
        assert_eq!(index.lower_bound(b"zz"), 2);
    }

    #[test]
    fn merge_range_picks_adjacent_aligned_pair() {
        let dir = temp_dir();
        let files = vec![
            make_file(&dir, "accounts", 0, 1),
            make_file(&dir, "accounts", 1, 2),
        ];
        let range = find_merge_range(&files, 2 * STEP, 32 * STEP, STEP);
        assert!(range.needs_merge);
        assert_eq!((range.from, range.to), (0, 2 * STEP));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn merge_range_skips_already_merged_file() {
        let dir = temp_dir();
        let files = vec![make_file(&dir, "accounts", 0, 2)];
        let range = find_merge_range(&files, 2 * STEP, 32 * STEP, STEP);
        assert!(!range.needs_merge);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn merge_range_respects_max_span() {
        let dir = temp_dir();
        let files = vec![
            make_file(&dir, "accounts", 0, 2),
            make_file(&dir, "accounts", 2, 3),
            make_file(&dir, "accounts", 3, 4),
        ];
        // A span of four steps is aligned at end 4, but the cap keeps the
        // merge at two steps.
        let range = find_merge_range(&files, 4 * STEP, 2 * STEP, STEP);
        assert!(range.needs_merge);
        assert_eq!((range.from, range.to), (2 * STEP, 4 * STEP));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn merge_range_ignores_files_past_horizon() {
        let dir = temp_dir();
        let files = vec![
            make_file(&dir, "accounts", 0, 1),
            make_file(&dir, "accounts", 1, 2),
        ];
        let range = find_merge_range(&files, STEP, 32 * STEP, STEP);
        assert!(!range.needs_merge);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rescan_reopens_complete_sets_and_removes_leftovers() {
        let dir = temp_dir();
        make_file(&dir, "accounts", 0, 1);

        // An interrupted build: segment data without a config.
        let orphan = file_base(&dir, "accounts", 1, 2, "vals");
        fs::write(ext_path(&orphan, SEGMENT_DATA_EXTENSION), b"partial").expect("write orphan");

        let files = scan_stream_dir(&dir, "accounts", "vals", STEP).expect("scan");
        assert_eq!(files.len(), 1);
        assert_eq!((files[0].start_tx, files[0].end_tx), (0, STEP));
        assert!(!ext_path(&orphan, SEGMENT_DATA_EXTENSION).exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn replace_with_merged_swaps_inputs() {
        let dir = temp_dir();
        let mut list = vec![
            make_file(&dir, "accounts", 0, 1),
            make_file(&dir, "accounts", 1, 2),
        ];
        let outs = list.clone();
        let merged = make_file(&dir, "accounts", 0, 2);
        replace_with_merged(&mut list, &outs, Arc::clone(&merged));
        assert_eq!(list.len(), 1);
        assert!(Arc::ptr_eq(&list[0], &merged));
        let _ = fs::remove_dir_all(&dir);
    }
}
