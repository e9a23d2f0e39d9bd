//! Segmented append-only log store with crash recovery.
//!
//! Entries live in segment files named by the index of the first entry the
//! segment may hold (e.g. `00000000000000000001.seg`). Each file starts with
//! a checksummed header frame recording the segment's base index and the term
//! of the entry immediately before it, so the log is self-describing across
//! restarts even after whole-segment compaction.
//!
//! Recovery scans segments in index order, validates every frame, truncates a
//! torn tail in place, and discards anything after the first corruption. The
//! surviving prefix is exactly the set of entries that were durably appended.

use crate::error::{Result, StoreError};
use crate::record::{self, RecordError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024; // 64 MiB

/// Fsync policy for the active segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// Fsync before `append` returns. Required on any node whose append
    /// acknowledgments feed replication decisions.
    #[default]
    Always,
    /// Let the OS flush when it pleases. Only suitable for tests.
    Os,
}

/// Configuration for the log store.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the segment files.
    pub dir: PathBuf,
    /// Maximum segment size in bytes before rotation (default: 64 MiB).
    pub max_segment_size: u64,
    /// Fsync policy (default: Always).
    pub fsync: FsyncPolicy,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("log"),
            max_segment_size: DEFAULT_SEGMENT_SIZE,
            fsync: FsyncPolicy::Always,
        }
    }
}

impl LogConfig {
    fn validate(&self) -> Result<()> {
        if self.max_segment_size == 0 {
            return Err(StoreError::InvalidConfig {
                reason: "max_segment_size must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// A single durable log entry. Index and term are consensus-level concepts;
/// the payload is opaque to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub index: u64,
    pub term: u64,
    pub payload: Bytes,
}

/// First frame of every segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct SegmentHeader {
    /// Index of the first entry this segment may hold.
    base_index: u64,
    /// Term of entry `base_index - 1` (0 when there is none).
    prev_term: u64,
}

/// Bookkeeping for one segment file.
#[derive(Debug)]
struct Segment {
    base_index: u64,
    prev_term: u64,
    path: PathBuf,
    /// Last entry index present, None for an empty (header-only) segment.
    /// Only the final segment may be empty.
    last: Option<u64>,
    size: u64,
}

/// Result of log recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Number of entries recovered.
    pub entries_recovered: u64,
    /// Number of segment files scanned.
    pub segments_scanned: u64,
    /// Bytes discarded due to torn writes or corruption.
    pub bytes_truncated: u64,
    /// Whether any corruption was detected.
    pub corruption_detected: bool,
    /// First retained index (one past the compaction boundary).
    pub first_index: u64,
    /// Last recovered index (0 for an empty log).
    pub last_index: u64,
}

/// Segmented log store.
///
/// All entries are cached in memory; the disk is the source of truth only
/// across restarts. The caller must keep appends contiguous; the store
/// rejects gaps rather than papering over them.
pub struct LogStore {
    config: LogConfig,
    segments: Vec<Segment>,
    active: File,
    entries: BTreeMap<u64, StoredEntry>,
    /// Compaction boundary: the index/term of the entry immediately before
    /// `first_index()`. (0, 0) for a log that was never compacted.
    prev_index: u64,
    prev_term: u64,
}

impl LogStore {
    /// Opens the log, performing recovery.
    ///
    /// Scans all segments in order, validates checksums, truncates a torn
    /// tail, and drops any segments past the first corruption point.
    pub async fn open(config: LogConfig) -> Result<(Self, RecoveryReport)> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.dir).await?;
        remove_stale_temp_files(&config.dir).await?;

        let mut bases = find_segment_bases(&config.dir).await?;
        bases.sort_unstable();

        let mut report = RecoveryReport {
            entries_recovered: 0,
            segments_scanned: 0,
            bytes_truncated: 0,
            corruption_detected: false,
            first_index: 1,
            last_index: 0,
        };

        let mut segments: Vec<Segment> = Vec::new();
        let mut entries: BTreeMap<u64, StoredEntry> = BTreeMap::new();

        for base in bases {
            let path = segment_path(&config.dir, base);
            report.segments_scanned += 1;

            // A non-final segment must be full of entries right up to the
            // next segment's base; an empty one means the tail is gone.
            if let Some(prev) = segments.last() {
                let expected_base = match prev.last {
                    Some(last) => last + 1,
                    None => {
                        report.corruption_detected = true;
                        discard_segment(&path, &mut report).await?;
                        continue;
                    }
                };
                if base != expected_base {
                    tracing::warn!(
                        segment = %path.display(),
                        expected = expected_base,
                        "segment base out of sequence, discarding suffix"
                    );
                    report.corruption_detected = true;
                    discard_segment(&path, &mut report).await?;
                    continue;
                }
            }

            match replay_segment(&path, base, &segments, &mut entries, &mut report).await? {
                Some(segment) => segments.push(segment),
                // Corruption point reached: everything later is discarded.
                None => continue,
            }
        }

        if segments.is_empty() {
            let (segment, file) = create_segment(&config.dir, 1, 0, config.fsync).await?;
            segments.push(segment);
            let store = Self {
                config,
                segments,
                active: file,
                entries,
                prev_index: 0,
                prev_term: 0,
            };
            return Ok((store, report));
        }

        let prev_index = segments[0].base_index - 1;
        let prev_term = segments[0].prev_term;
        report.first_index = prev_index + 1;
        report.last_index = entries.keys().next_back().copied().unwrap_or(prev_index);
        report.entries_recovered = entries.len() as u64;

        let last = segments.len() - 1;
        let active = OpenOptions::new()
            .append(true)
            .open(&segments[last].path)
            .await?;

        tracing::info!(
            entries = report.entries_recovered,
            segments = report.segments_scanned,
            truncated_bytes = report.bytes_truncated,
            first_index = report.first_index,
            last_index = report.last_index,
            "log recovered"
        );

        Ok((
            Self {
                config,
                segments,
                active,
                entries,
                prev_index,
                prev_term,
            },
            report,
        ))
    }

    /// Index of the first retained entry (one past the compaction boundary).
    pub fn first_index(&self) -> u64 {
        self.prev_index + 1
    }

    /// Index of the last entry, or the compaction boundary for an empty log.
    pub fn last_index(&self) -> u64 {
        self.entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.prev_index)
    }

    /// Term of the last entry, or the boundary term for an empty log.
    pub fn last_term(&self) -> u64 {
        self.entries
            .values()
            .next_back()
            .map(|e| e.term)
            .unwrap_or(self.prev_term)
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term of the entry at `index`.
    ///
    /// Answers at the compaction boundary itself (the snapshot's last
    /// included entry) even though its payload is gone. Index 0 is the
    /// "before any entry" sentinel with term 0.
    pub fn term_of(&self, index: u64) -> Result<Option<u64>> {
        if index == self.prev_index {
            return Ok(Some(self.prev_term));
        }
        if index < self.prev_index {
            return Err(StoreError::Compacted { index });
        }
        Ok(self.entries.get(&index).map(|e| e.term))
    }

    /// Returns the entry at `index`, or None past the end of the log.
    pub fn entry(&self, index: u64) -> Result<Option<StoredEntry>> {
        if index < self.first_index() {
            return Err(StoreError::Compacted { index });
        }
        Ok(self.entries.get(&index).cloned())
    }

    /// Returns entries in `[from, to_exclusive)`, clamped to the end of the
    /// log.
    pub fn range(&self, from: u64, to_exclusive: u64) -> Result<Vec<StoredEntry>> {
        if from < self.first_index() {
            return Err(StoreError::Compacted { index: from });
        }
        Ok(self
            .entries
            .range(from..to_exclusive)
            .map(|(_, e)| e.clone())
            .collect())
    }

    /// Appends a contiguous batch of entries, rotating segments as needed.
    ///
    /// With `FsyncPolicy::Always` the batch is durable when this returns.
    pub async fn append(&mut self, batch: &[StoredEntry]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut expected = self.last_index() + 1;
        for entry in batch {
            if entry.index != expected {
                return Err(StoreError::NonContiguous {
                    expected,
                    got: entry.index,
                });
            }
            expected += 1;
        }

        for entry in batch {
            let frame = record::encode_frame(&bincode::serialize(entry)?);

            let needs_rotation = {
                let segment = self.active_segment();
                segment.last.is_some()
                    && segment.size + frame.len() as u64 > self.config.max_segment_size
            };
            if needs_rotation {
                self.rotate(entry.index).await?;
            }

            self.active.write_all(&frame).await?;
            let segment = self.active_segment_mut();
            segment.size += frame.len() as u64;
            segment.last = Some(entry.index);
            self.entries.insert(entry.index, entry.clone());
        }

        if self.config.fsync == FsyncPolicy::Always {
            self.active.sync_data().await?;
        }

        Ok(())
    }

    /// Removes all entries at and after `from`.
    ///
    /// Used for conflict resolution when a leader's log disagrees with ours.
    /// The containing segment is rewritten atomically (temp file + rename);
    /// later segments are deleted outright.
    pub async fn truncate_suffix(&mut self, from: u64) -> Result<()> {
        if from <= self.prev_index {
            return Err(StoreError::OutOfRange {
                index: from,
                reason: "cannot truncate into the compacted region".to_string(),
            });
        }
        if from > self.last_index() {
            return Ok(());
        }

        // `from > prev_index` guarantees some segment contains it.
        let pos = self
            .segments
            .iter()
            .rposition(|s| s.base_index <= from)
            .ok_or_else(|| StoreError::OutOfRange {
                index: from,
                reason: "no segment covers this index".to_string(),
            })?;

        for segment in self.segments.split_off(pos + 1) {
            tokio::fs::remove_file(&segment.path).await?;
        }

        let header = SegmentHeader {
            base_index: self.segments[pos].base_index,
            prev_term: self.segments[pos].prev_term,
        };
        let mut buf = Vec::new();
        buf.extend_from_slice(&record::encode_frame(&bincode::serialize(&header)?));
        for (_, entry) in self.entries.range(header.base_index..from) {
            buf.extend_from_slice(&record::encode_frame(&bincode::serialize(entry)?));
        }

        let path = self.segments[pos].path.clone();
        write_atomically(&path, &buf).await?;

        let segment = &mut self.segments[pos];
        segment.size = buf.len() as u64;
        segment.last = if from > segment.base_index {
            Some(from - 1)
        } else {
            None
        };

        self.entries.split_off(&from);
        self.active = OpenOptions::new().append(true).open(&path).await?;

        tracing::debug!(from, last_index = self.last_index(), "log suffix truncated");
        Ok(())
    }

    /// Discards whole segments entirely covered by `[.., through]`.
    ///
    /// Compaction is segment-granular: entries inside a partially covered
    /// segment survive on disk and stay readable. The caller must have a
    /// durable snapshot through `through` before calling this. Returns the
    /// number of segments removed.
    pub async fn compact(&mut self, through: u64, through_term: u64) -> Result<u64> {
        if through <= self.prev_index {
            return Ok(0);
        }
        if through > self.last_index() {
            return Err(StoreError::OutOfRange {
                index: through,
                reason: "compaction past the end of the log".to_string(),
            });
        }

        if through == self.last_index() {
            let removed = self.segments.len() as u64;
            self.reset(through, through_term).await?;
            return Ok(removed);
        }

        let mut removed = 0u64;
        while self.segments.len() >= 2 {
            let covered = matches!(self.segments[0].last, Some(last) if last <= through);
            if !covered {
                break;
            }
            let segment = self.segments.remove(0);
            tokio::fs::remove_file(&segment.path).await?;
            removed += 1;
        }

        if removed > 0 {
            self.prev_index = self.segments[0].base_index - 1;
            self.prev_term = self.segments[0].prev_term;
            self.entries = self.entries.split_off(&self.segments[0].base_index);
            tracing::debug!(
                through,
                first_index = self.first_index(),
                segments_removed = removed,
                "log compacted"
            );
        }

        Ok(removed)
    }

    /// Replaces the entire log with an empty one starting after the given
    /// boundary. Used when installing a snapshot that supersedes the log.
    pub async fn reset(&mut self, prev_index: u64, prev_term: u64) -> Result<()> {
        let base = prev_index + 1;
        let header = SegmentHeader {
            base_index: base,
            prev_term,
        };
        let path = segment_path(&self.config.dir, base);
        let frame = record::encode_frame(&bincode::serialize(&header)?);
        write_atomically(&path, &frame).await?;

        for segment in self.segments.drain(..) {
            if segment.path != path {
                tokio::fs::remove_file(&segment.path).await?;
            }
        }

        self.entries.clear();
        self.prev_index = prev_index;
        self.prev_term = prev_term;
        self.segments.push(Segment {
            base_index: base,
            prev_term,
            path: path.clone(),
            last: None,
            size: frame.len() as u64,
        });
        self.active = OpenOptions::new().append(true).open(&path).await?;

        tracing::info!(prev_index, prev_term, "log reset to snapshot boundary");
        Ok(())
    }

    /// Explicitly fsyncs the active segment.
    pub async fn sync(&mut self) -> Result<()> {
        self.active.sync_data().await?;
        Ok(())
    }

    // `segments` is never empty after open.
    fn active_segment(&self) -> &Segment {
        &self.segments[self.segments.len() - 1]
    }

    fn active_segment_mut(&mut self) -> &mut Segment {
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    /// Finalizes the active segment and starts a new one based at
    /// `next_index`.
    async fn rotate(&mut self, next_index: u64) -> Result<()> {
        self.active.sync_data().await?;

        let prev_term = self.last_term();
        let (segment, file) =
            create_segment(&self.config.dir, next_index, prev_term, self.config.fsync).await?;

        tracing::debug!(
            old_base = self.active_segment().base_index,
            new_base = next_index,
            "segment rotated"
        );

        self.segments.push(segment);
        self.active = file;
        Ok(())
    }
}

/// Replays one segment file into the cache.
///
/// Returns None when a corruption point was reached: the file tail has been
/// truncated (or the whole file deleted) and the caller must discard every
/// later segment.
async fn replay_segment(
    path: &Path,
    base: u64,
    prior: &[Segment],
    entries: &mut BTreeMap<u64, StoredEntry>,
    report: &mut RecoveryReport,
) -> Result<Option<Segment>> {
    let buffer = tokio::fs::read(path).await?;
    let file_size = buffer.len() as u64;

    // Header first.
    let (header, mut offset) = match record::decode_frame(&buffer) {
        Ok((payload, consumed)) => {
            let header: SegmentHeader = bincode::deserialize(&payload)?;
            (header, consumed)
        }
        Err(RecordError::Incomplete) | Err(RecordError::CrcMismatch { .. }) => {
            tracing::warn!(segment = %path.display(), "unreadable segment header, discarding");
            report.corruption_detected = true;
            report.bytes_truncated += file_size;
            tokio::fs::remove_file(path).await?;
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    if header.base_index != base {
        tracing::warn!(
            segment = %path.display(),
            header_base = header.base_index,
            "segment header disagrees with file name, discarding"
        );
        report.corruption_detected = true;
        report.bytes_truncated += file_size;
        tokio::fs::remove_file(path).await?;
        return Ok(None);
    }

    // The boundary term must chain onto the previous segment's last entry.
    if let Some(prev) = prior.last() {
        let expected_term = prev
            .last
            .and_then(|last| entries.get(&last).map(|e| e.term))
            .unwrap_or(prev.prev_term);
        if header.prev_term != expected_term {
            tracing::warn!(
                segment = %path.display(),
                header_term = header.prev_term,
                expected_term,
                "segment boundary term mismatch, discarding"
            );
            report.corruption_detected = true;
            report.bytes_truncated += file_size;
            tokio::fs::remove_file(path).await?;
            return Ok(None);
        }
    }

    let mut expected_index = base;
    let mut last: Option<u64> = None;
    let mut corrupt = false;

    while (offset as u64) < file_size {
        match record::decode_frame(&buffer[offset..]) {
            Ok((payload, consumed)) => {
                let entry: StoredEntry = match bincode::deserialize(&payload) {
                    Ok(entry) => entry,
                    Err(_) => {
                        corrupt = true;
                        break;
                    }
                };
                if entry.index != expected_index {
                    corrupt = true;
                    break;
                }
                expected_index += 1;
                last = Some(entry.index);
                entries.insert(entry.index, entry);
                offset += consumed;
            }
            Err(RecordError::Incomplete) | Err(RecordError::CrcMismatch { .. }) => {
                corrupt = true;
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut size = file_size;
    if corrupt {
        let truncated = file_size - offset as u64;
        tracing::warn!(
            segment = %path.display(),
            valid_bytes = offset,
            truncated_bytes = truncated,
            "corrupt log tail truncated"
        );
        report.corruption_detected = true;
        report.bytes_truncated += truncated;
        write_atomically(path, &buffer[..offset]).await?;
        size = offset as u64;
    }

    // A truncated segment keeps its clean prefix; any later segment now
    // fails the base continuity check and gets discarded by the caller.
    Ok(Some(Segment {
        base_index: base,
        prev_term: header.prev_term,
        path: path.to_path_buf(),
        last,
        size,
    }))
}

/// Deletes a segment that lies past a corruption point.
async fn discard_segment(path: &Path, report: &mut RecoveryReport) -> Result<()> {
    let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
    report.bytes_truncated += size;
    tokio::fs::remove_file(path).await?;
    Ok(())
}

/// Creates a fresh segment file containing only its header frame.
async fn create_segment(
    dir: &Path,
    base: u64,
    prev_term: u64,
    fsync: FsyncPolicy,
) -> Result<(Segment, File)> {
    let path = segment_path(dir, base);
    let header = SegmentHeader {
        base_index: base,
        prev_term,
    };
    let frame = record::encode_frame(&bincode::serialize(&header)?);

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&path)
        .await?;
    file.write_all(&frame).await?;
    if fsync == FsyncPolicy::Always {
        file.sync_data().await?;
    }
    drop(file);

    let file = OpenOptions::new().append(true).open(&path).await?;
    Ok((
        Segment {
            base_index: base,
            prev_term,
            path,
            last: None,
            size: frame.len() as u64,
        },
        file,
    ))
}

/// Atomic replace via temp file + rename. The original is untouched if the
/// process dies mid-write.
async fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("seg.tmp");

    let mut temp = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)
        .await?;
    temp.write_all(data).await?;
    temp.sync_all().await?;
    drop(temp);

    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn remove_stale_temp_files(dir: &Path) -> Result<()> {
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
            tracing::debug!(path = %path.display(), "removing stale temp file");
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

async fn find_segment_bases(dir: &Path) -> Result<Vec<u64>> {
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    let mut bases = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        if let Some(base) = parse_segment_base(&entry.path()) {
            bases.push(base);
        }
    }
    Ok(bases)
}

fn segment_path(dir: &Path, base: u64) -> PathBuf {
    dir.join(format!("{:020}.seg", base))
}

fn parse_segment_base(path: &Path) -> Option<u64> {
    if path.extension()?.to_str()? != "seg" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> LogConfig {
        LogConfig {
            dir: dir.to_path_buf(),
            max_segment_size: DEFAULT_SEGMENT_SIZE,
            fsync: FsyncPolicy::Os,
        }
    }

    fn entry(index: u64, term: u64) -> StoredEntry {
        StoredEntry {
            index,
            term,
            payload: Bytes::from(format!("payload-{}", index)),
        }
    }

    fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<StoredEntry> {
        range.map(|i| entry(i, term)).collect()
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let temp = TempDir::new().unwrap();
        let (mut log, report) = LogStore::open(test_config(temp.path())).await.unwrap();

        assert_eq!(report.entries_recovered, 0);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.first_index(), 1);

        log.append(&entries(1..=5, 1)).await.unwrap();

        assert_eq!(log.last_index(), 5);
        assert_eq!(log.last_term(), 1);
        assert_eq!(log.entry(3).unwrap().unwrap(), entry(3, 1));
        assert_eq!(log.entry(6).unwrap(), None);
        assert_eq!(log.term_of(0).unwrap(), Some(0));
        assert_eq!(log.range(2, 5).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rejects_non_contiguous_append() {
        let temp = TempDir::new().unwrap();
        let (mut log, _) = LogStore::open(test_config(temp.path())).await.unwrap();

        log.append(&entries(1..=3, 1)).await.unwrap();

        let result = log.append(&[entry(5, 1)]).await;
        assert!(matches!(
            result,
            Err(StoreError::NonContiguous { expected: 4, got: 5 })
        ));
    }

    #[tokio::test]
    async fn test_recovery_on_reopen() {
        let temp = TempDir::new().unwrap();

        {
            let (mut log, _) = LogStore::open(test_config(temp.path())).await.unwrap();
            log.append(&entries(1..=10, 2)).await.unwrap();
            log.sync().await.unwrap();
        }

        let (log, report) = LogStore::open(test_config(temp.path())).await.unwrap();
        assert_eq!(report.entries_recovered, 10);
        assert!(!report.corruption_detected);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.entry(7).unwrap().unwrap(), entry(7, 2));
    }

    #[tokio::test]
    async fn test_segment_rotation_and_recovery() {
        let temp = TempDir::new().unwrap();
        let config = LogConfig {
            max_segment_size: 256,
            ..test_config(temp.path())
        };

        {
            let (mut log, _) = LogStore::open(config.clone()).await.unwrap();
            log.append(&entries(1..=40, 1)).await.unwrap();
            log.sync().await.unwrap();
        }

        let (log, report) = LogStore::open(config).await.unwrap();
        assert!(report.segments_scanned >= 2, "should have rotated");
        assert_eq!(report.entries_recovered, 40);
        assert_eq!(log.last_index(), 40);
    }

    #[tokio::test]
    async fn test_torn_tail_truncated_on_recovery() {
        let temp = TempDir::new().unwrap();

        {
            let (mut log, _) = LogStore::open(test_config(temp.path())).await.unwrap();
            log.append(&entries(1..=5, 1)).await.unwrap();
            log.sync().await.unwrap();
        }

        // Simulate a torn write at the tail of the only segment.
        let path = segment_path(temp.path(), 1);
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(b"TORN_PARTIAL_FRAME");
        std::fs::write(&path, &data).unwrap();

        let (log, report) = LogStore::open(test_config(temp.path())).await.unwrap();
        assert!(report.corruption_detected);
        assert!(report.bytes_truncated > 0);
        assert_eq!(report.entries_recovered, 5);
        assert_eq!(log.last_index(), 5);
    }

    #[tokio::test]
    async fn test_corrupt_record_discards_suffix() {
        let temp = TempDir::new().unwrap();

        {
            let (mut log, _) = LogStore::open(test_config(temp.path())).await.unwrap();
            log.append(&entries(1..=5, 1)).await.unwrap();
            log.sync().await.unwrap();
        }

        // Flip bits inside the last entry's frame.
        let path = segment_path(temp.path(), 1);
        let mut data = std::fs::read(&path).unwrap();
        let n = data.len();
        data[n - 10] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let (log, report) = LogStore::open(test_config(temp.path())).await.unwrap();
        assert!(report.corruption_detected);
        assert!(report.entries_recovered < 5);
        assert_eq!(log.last_index(), report.last_index);

        // The log stays usable after truncation.
        let mut log = log;
        let next = log.last_index() + 1;
        log.append(&[entry(next, 2)]).await.unwrap();
        assert_eq!(log.last_index(), next);
    }

    #[tokio::test]
    async fn test_truncate_suffix() {
        let temp = TempDir::new().unwrap();
        let (mut log, _) = LogStore::open(test_config(temp.path())).await.unwrap();

        log.append(&entries(1..=10, 1)).await.unwrap();
        log.truncate_suffix(6).await.unwrap();

        assert_eq!(log.last_index(), 5);
        assert_eq!(log.entry(6).unwrap(), None);

        // Appends continue from the truncation point, possibly in a new term.
        log.append(&entries(6..=8, 2)).await.unwrap();
        assert_eq!(log.last_index(), 8);
        assert_eq!(log.term_of(6).unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_truncate_survives_reopen() {
        let temp = TempDir::new().unwrap();

        {
            let (mut log, _) = LogStore::open(test_config(temp.path())).await.unwrap();
            log.append(&entries(1..=10, 1)).await.unwrap();
            log.truncate_suffix(4).await.unwrap();
            log.append(&entries(4..=6, 3)).await.unwrap();
            log.sync().await.unwrap();
        }

        let (log, report) = LogStore::open(test_config(temp.path())).await.unwrap();
        assert!(!report.corruption_detected);
        assert_eq!(log.last_index(), 6);
        assert_eq!(log.term_of(3).unwrap(), Some(1));
        assert_eq!(log.term_of(4).unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_truncate_below_boundary_rejected() {
        let temp = TempDir::new().unwrap();
        let (mut log, _) = LogStore::open(test_config(temp.path())).await.unwrap();

        log.append(&entries(1..=10, 1)).await.unwrap();
        log.compact(10, 1).await.unwrap();

        let result = log.truncate_suffix(5).await;
        assert!(matches!(result, Err(StoreError::OutOfRange { .. })));
    }

    #[tokio::test]
    async fn test_compact_whole_segments() {
        let temp = TempDir::new().unwrap();
        let config = LogConfig {
            max_segment_size: 256,
            ..test_config(temp.path())
        };
        let (mut log, _) = LogStore::open(config.clone()).await.unwrap();

        log.append(&entries(1..=40, 1)).await.unwrap();
        let removed = log.compact(20, 1).await.unwrap();
        assert!(removed >= 1, "should delete at least one segment");

        let first = log.first_index();
        assert!(first > 1);
        assert!(first <= 21, "compaction is segment-granular");
        assert!(matches!(
            log.entry(first - 2),
            Err(StoreError::Compacted { .. })
        ));
        // The boundary term is still answerable for consistency checks.
        assert_eq!(log.term_of(first - 1).unwrap(), Some(1));
        assert_eq!(log.last_index(), 40);

        // Boundary survives restart via the segment header.
        drop(log);
        let (log, _) = LogStore::open(config).await.unwrap();
        assert_eq!(log.first_index(), first);
        assert_eq!(log.term_of(first - 1).unwrap(), Some(1));
        assert_eq!(log.last_index(), 40);
    }

    #[tokio::test]
    async fn test_compact_entire_log_resets() {
        let temp = TempDir::new().unwrap();
        let (mut log, _) = LogStore::open(test_config(temp.path())).await.unwrap();

        log.append(&entries(1..=10, 3)).await.unwrap();
        log.compact(10, 3).await.unwrap();

        assert!(log.is_empty());
        assert_eq!(log.first_index(), 11);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 3);

        log.append(&entries(11..=12, 4)).await.unwrap();
        assert_eq!(log.last_index(), 12);

        drop(log);
        let (log, report) = LogStore::open(test_config(temp.path())).await.unwrap();
        assert_eq!(report.first_index, 11);
        assert_eq!(log.last_index(), 12);
        assert_eq!(log.term_of(10).unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_reset_to_snapshot_boundary() {
        let temp = TempDir::new().unwrap();
        let (mut log, _) = LogStore::open(test_config(temp.path())).await.unwrap();

        log.append(&entries(1..=5, 1)).await.unwrap();
        log.reset(100, 7).await.unwrap();

        assert!(log.is_empty());
        assert_eq!(log.first_index(), 101);
        assert_eq!(log.last_term(), 7);
        assert!(matches!(log.entry(3), Err(StoreError::Compacted { .. })));

        log.append(&entries(101..=103, 8)).await.unwrap();

        drop(log);
        let (log, _) = LogStore::open(test_config(temp.path())).await.unwrap();
        assert_eq!(log.first_index(), 101);
        assert_eq!(log.last_index(), 103);
        assert_eq!(log.term_of(100).unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let temp = TempDir::new().unwrap();
        let config = LogConfig {
            max_segment_size: 0,
            ..test_config(temp.path())
        };
        assert!(LogStore::open(config).await.is_err());
    }
}
