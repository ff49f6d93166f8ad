//! Raw compressed-segment format: a data file of concatenated rows, a
//! sidecar offsets file, and a bincode config.
//!
//! Layout on disk for a segment with base path `B`:
//! - `B.seg` — row payloads back to back, each optionally zstd-compressed
//! - `B.off` — `[1-byte offset width = 8][u64-le offsets, rows + 1 entries]`
//! - `B.conf` — bincode [`SegmentConfig`], written last so a crashed build
//!   never leaves a segment that looks complete

use eyre::{eyre, Result, WrapErr};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub(crate) const SEGMENT_DATA_EXTENSION: &str = "seg";
pub(crate) const SEGMENT_OFFSETS_EXTENSION: &str = "off";
pub(crate) const SEGMENT_CONFIG_EXTENSION: &str = "conf";

const SEGMENT_VERSION: u32 = 1;
const OFFSET_SIZE_BYTES: u8 = 8;
const ZSTD_LEVEL: i32 = 0;

/// Appends `.ext` to a base path that may itself contain dots.
pub(crate) fn ext_path(base: &Path, ext: &str) -> PathBuf {
    let mut os = base.as_os_str().to_os_string();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SegmentConfig {
    pub version: u32,
    pub start_tx: u64,
    pub end_tx: u64,
    pub rows: u64,
    pub compressed: bool,
    /// Largest uncompressed row length; bounds the decompression buffer.
    pub max_row_size: u64,
    pub data_crc: u32,
}

pub(crate) struct SegmentWriter {
    base: PathBuf,
    data_file: BufWriter<File>,
    offsets_file: BufWriter<File>,
    config: SegmentConfig,
    offset: u64,
    hasher: crc32fast::Hasher,
}

impl SegmentWriter {
    pub fn create(base: &Path, start_tx: u64, end_tx: u64, compressed: bool) -> Result<Self> {
        if let Some(parent) = base.parent() {
            fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
        }
        let data_path = ext_path(base, SEGMENT_DATA_EXTENSION);
        let offsets_path = ext_path(base, SEGMENT_OFFSETS_EXTENSION);
        let data_file = BufWriter::new(
            File::create(&data_path)
                .wrap_err_with(|| format!("failed to create {}", data_path.display()))?,
        );
        let mut offsets_file = match File::create(&offsets_path) {
            Ok(file) => BufWriter::new(file),
            Err(err) => {
                let _ = fs::remove_file(&data_path);
                return Err(err)
                    .wrap_err_with(|| format!("failed to create {}", offsets_path.display()));
            }
        };
        offsets_file
            .write_all(&[OFFSET_SIZE_BYTES])
            .wrap_err("failed to write offset size")?;
        offsets_file
            .write_all(&0u64.to_le_bytes())
            .wrap_err("failed to write initial offset")?;

        Ok(Self {
            base: base.to_path_buf(),
            data_file,
            offsets_file,
            config: SegmentConfig {
                version: SEGMENT_VERSION,
                start_tx,
                end_tx,
                rows: 0,
                compressed,
                max_row_size: 0,
                data_crc: 0,
            },
            offset: 0,
            hasher: crc32fast::Hasher::new(),
        })
    }

    /// Appends one row.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return self.push_empty();
        }
        let stored: Vec<u8>;
        let stored_bytes: &[u8] = if self.config.compressed {
            stored = zstd::bulk::compress(bytes, ZSTD_LEVEL).wrap_err("failed to compress row")?;
            &stored
        } else {
            bytes
        };
        self.data_file.write_all(stored_bytes)?;
        self.hasher.update(stored_bytes);
        self.offset = self.offset.saturating_add(stored_bytes.len() as u64);
        self.offsets_file.write_all(&self.offset.to_le_bytes())?;
        self.config.rows += 1;
        self.config.max_row_size = self.config.max_row_size.max(bytes.len() as u64);
        Ok(())
    }

    /// Appends an empty row: one offset entry, no data bytes.
    pub fn push_empty(&mut self) -> Result<()> {
        self.offsets_file.write_all(&self.offset.to_le_bytes())?;
        self.config.rows += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.data_file.flush()?;
        self.offsets_file.flush()?;
        self.config.data_crc = self.hasher.finalize();

        let config_path = ext_path(&self.base, SEGMENT_CONFIG_EXTENSION);
        let file = File::create(&config_path)
            .wrap_err_with(|| format!("failed to create {}", config_path.display()))?;
        bincode::serialize_into(file, &self.config)
            .wrap_err_with(|| format!("failed to encode {}", config_path.display()))?;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct Segment {
    config: SegmentConfig,
    // None when every row is empty and the data file has zero length.
    mmap: Option<Mmap>,
    offsets: Vec<u64>,
}

impl Segment {
    pub fn open(base: &Path) -> Result<Self> {
        let config_path = ext_path(base, SEGMENT_CONFIG_EXTENSION);
        let file = File::open(&config_path)
            .wrap_err_with(|| format!("failed to open {}", config_path.display()))?;
        let config: SegmentConfig = bincode::deserialize_from(file)
            .wrap_err_with(|| format!("failed to decode {}", config_path.display()))?;
        if config.version != SEGMENT_VERSION {
            return Err(eyre!(
                "segment version mismatch for {}: expected {}, got {}",
                base.display(),
                SEGMENT_VERSION,
                config.version
            ));
        }

        let offsets = read_offsets(&ext_path(base, SEGMENT_OFFSETS_EXTENSION))?;
        if offsets.len() as u64 != config.rows + 1 {
            return Err(eyre!(
                "offset count mismatch for {}: expected {}, got {}",
                base.display(),
                config.rows + 1,
                offsets.len()
            ));
        }

        let data_path = ext_path(base, SEGMENT_DATA_EXTENSION);
        let data_file = File::open(&data_path)
            .wrap_err_with(|| format!("failed to open {}", data_path.display()))?;
        let data_len = data_file.metadata()?.len();
        if offsets.last().copied().unwrap_or(0) != data_len {
            return Err(eyre!(
                "data length mismatch for {}: offsets end at {}, file is {}",
                base.display(),
                offsets.last().copied().unwrap_or(0),
                data_len
            ));
        }
        let mmap = if data_len == 0 {
            None
        } else {
            // Safety: segment data files are immutable once finished; merge
            // inputs are unlinked, never truncated or rewritten in place.
            Some(unsafe { Mmap::map(&data_file) }.wrap_err_with(|| {
                format!("failed to mmap {}", data_path.display())
            })?)
        };

        let mut hasher = crc32fast::Hasher::new();
        if let Some(mmap) = &mmap {
            hasher.update(mmap);
        }
        let crc = hasher.finalize();
        if crc != config.data_crc {
            return Err(eyre!(
                "segment crc mismatch for {}: expected {}, got {}",
                base.display(),
                config.data_crc,
                crc
            ));
        }

        Ok(Self {
            config,
            mmap,
            offsets,
        })
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    pub fn rows(&self) -> u64 {
        self.config.rows
    }

    /// Returns the row's uncompressed payload. Empty rows decode to an empty
    /// vector.
    pub fn row(&self, row: u64) -> Result<Vec<u8>> {
        if row >= self.config.rows {
            return Err(eyre!(
                "row {} out of bounds ({} rows)",
                row,
                self.config.rows
            ));
        }
        let start = self.offsets[row as usize] as usize;
        let end = self.offsets[row as usize + 1] as usize;
        if start == end {
            return Ok(Vec::new());
        }
        let mmap = self
            .mmap
            .as_ref()
            .ok_or_else(|| eyre!("non-empty row in zero-length segment"))?;
        let bytes = &mmap[start..end];
        if self.config.compressed {
            zstd::bulk::decompress(bytes, self.config.max_row_size as usize)
                .wrap_err("failed to decompress row")
        } else {
            Ok(bytes.to_vec())
        }
    }
}

fn read_offsets(path: &Path) -> Result<Vec<u64>> {
    let mut file =
        File::open(path).wrap_err_with(|| format!("failed to open {}", path.display()))?;
    let mut width = [0u8; 1];
    file.read_exact(&mut width)
        .wrap_err("failed to read offset size")?;
    if width[0] != OFFSET_SIZE_BYTES {
        return Err(eyre!(
            "unsupported offset size in {}: {}",
            path.display(),
            width[0]
        ));
    }
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    if raw.len() % 8 != 0 {
        return Err(eyre!("truncated offsets file {}", path.display()));
    }
    Ok(raw
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().expect("8-byte chunk")))
        .collect())
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
            "state-archive-segment-test-{now}-{}-{suffix}",
            std::process::id()
        ));
        path
    }

    #[test]
    fn roundtrip_uncompressed_with_empty_rows() {
        let dir = temp_dir();
        let base = dir.join("stream.0-1.vals");
        let mut writer = SegmentWriter::create(&base, 0, 4, false).expect("create");
        writer.push(b"alpha").expect("push");
        writer.push_empty().expect("push empty");
        writer.push(b"gamma").expect("push");
        writer.finish().expect("finish");

        let segment = Segment::open(&base).expect("open");
        assert_eq!(segment.rows(), 3);
        assert_eq!(segment.row(0).expect("row 0"), b"alpha");
        assert!(segment.row(1).expect("row 1").is_empty());
        assert_eq!(segment.row(2).expect("row 2"), b"gamma");
        assert!(segment.row(3).is_err());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn roundtrip_compressed() {
        let dir = temp_dir();
        let base = dir.join("code.0-1.vals");
        let payload = vec![0x42u8; 4096];
        let mut writer = SegmentWriter::create(&base, 0, 4, true).expect("create");
        writer.push(&payload).expect("push");
        writer.push_empty().expect("push empty");
        writer.finish().expect("finish");

        let segment = Segment::open(&base).expect("open");
        assert!(segment.config().compressed);
        assert_eq!(segment.config().max_row_size, 4096);
        assert_eq!(segment.row(0).expect("row 0"), payload);
        assert!(segment.row(1).expect("row 1").is_empty());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupted_data_is_rejected_on_open() {
        let dir = temp_dir();
        let base = dir.join("stream.0-1.vals");
        let mut writer = SegmentWriter::create(&base, 0, 4, false).expect("create");
        writer.push(b"payload").expect("push");
        writer.finish().expect("finish");

        let data_path = ext_path(&base, SEGMENT_DATA_EXTENSION);
        let mut bytes = fs::read(&data_path).expect("read data");
        bytes[0] ^= 0xff;
        fs::write(&data_path, &bytes).expect("rewrite data");

        let err = Segment::open(&base).expect_err("corrupt segment must not open");
        assert!(err.to_string().contains("crc mismatch"));

        let _ = fs::remove_dir_all(&dir);
    }
}
