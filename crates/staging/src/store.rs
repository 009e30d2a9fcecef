//! Append-only record batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use pipeline_core::config::StagingConfig;
use pipeline_core::{BatchName, Error, RecordKind, Result, RunKey, StagedRecord};

use crate::fsutil::{atomic_write, is_hidden};

const BATCH_EXT: &str = "jsonl";

/// First line of every batch and segment file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BatchHeader {
    kind: RecordKind,
    count: usize,
    published_at: DateTime<Utc>,
}

/// Handle to a published batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRef {
    pub run: RunKey,
    pub batch: BatchName,
    pub path: PathBuf,
    pub count: usize,
}

/// A batch read back with the publish time from its header. The publish
/// time identifies one version of the batch.
#[derive(Debug, Clone)]
pub struct LoadedBatch<R> {
    pub published_at: DateTime<Utc>,
    pub records: Vec<R>,
}

/// Handle to one published segment of a batch under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRef {
    pub index: u32,
    pub path: PathBuf,
    pub count: usize,
}

/// Staging area rooted at a directory.
#[derive(Debug, Clone)]
pub struct StagingStore {
    root: PathBuf,
}

impl StagingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &StagingConfig) -> Self {
        Self::new(config.root.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything for one run.
    pub fn run_dir(&self, run: &RunKey) -> PathBuf {
        self.root.join(&run.environment).join(run.date_segment())
    }

    fn batch_path(&self, run: &RunKey, batch: BatchName) -> PathBuf {
        self.run_dir(run).join(format!("{}.{BATCH_EXT}", batch.as_str()))
    }

    fn segment_dir(&self, run: &RunKey, batch: BatchName) -> PathBuf {
        self.run_dir(run).join(format!("{}.seg", batch.as_str()))
    }

    /// Publish `records` as the batch, atomically replacing any earlier
    /// version.
    pub fn publish<R: StagedRecord>(
        &self,
        run: &RunKey,
        batch: BatchName,
        records: &[R],
    ) -> Result<BatchRef> {
        let path = self.batch_path(run, batch);
        atomic_write(&path, &encode(records)?)?;
        info!(run = %run, batch = %batch, count = records.len(), "published batch");
        Ok(BatchRef {
            run: run.clone(),
            batch,
            path,
            count: records.len(),
        })
    }

    /// Read a published batch. Fails with `MissingInput` when it was never
    /// published and `CorruptBatch` when the file does not match its header.
    pub fn read<R: StagedRecord>(&self, run: &RunKey, batch: BatchName) -> Result<Vec<R>> {
        Ok(self.load(run, batch)?.records)
    }

    /// Like [`read`](Self::read), keeping the header's publish time.
    pub fn load<R: StagedRecord>(&self, run: &RunKey, batch: BatchName) -> Result<LoadedBatch<R>> {
        let path = self.batch_path(run, batch);
        if !path.exists() {
            return Err(Error::missing_input(format!(
                "batch {batch} for {run} has not been published"
            )));
        }
        let (header, records) = decode(&path)?;
        Ok(LoadedBatch {
            published_at: header.published_at,
            records,
        })
    }

    pub fn exists(&self, run: &RunKey, batch: BatchName) -> bool {
        self.batch_path(run, batch).is_file()
    }

    /// Publish the next numbered segment of a batch under construction.
    pub fn append_segment<R: StagedRecord>(
        &self,
        run: &RunKey,
        batch: BatchName,
        records: &[R],
    ) -> Result<SegmentRef> {
        let dir = self.segment_dir(run, batch);
        let index = self
            .segment_paths(&dir)?
            .last()
            .map(|(index, _)| index + 1)
            .unwrap_or(0);
        let path = dir.join(format!("{index:06}.{BATCH_EXT}"));
        atomic_write(&path, &encode(records)?)?;
        debug!(run = %run, batch = %batch, segment = index, count = records.len(), "appended segment");
        Ok(SegmentRef {
            index,
            path,
            count: records.len(),
        })
    }

    /// Records of every segment, in segment order.
    pub fn read_segments<R: StagedRecord>(&self, run: &RunKey, batch: BatchName) -> Result<Vec<R>> {
        let dir = self.segment_dir(run, batch);
        let mut records = Vec::new();
        for (_, path) in self.segment_paths(&dir)? {
            records.extend(decode::<R>(&path)?.1);
        }
        Ok(records)
    }

    /// Publish the concatenation of all segments as the batch, then drop the
    /// segments. With no segments an empty batch is published.
    pub fn seal_segments<R: StagedRecord>(&self, run: &RunKey, batch: BatchName) -> Result<BatchRef> {
        let records = self.read_segments::<R>(run, batch)?;
        let batch_ref = self.publish(run, batch, &records)?;
        self.clear_segments(run, batch)?;
        Ok(batch_ref)
    }

    /// Remove unsealed segments, e.g. before a forced re-run.
    pub fn clear_segments(&self, run: &RunKey, batch: BatchName) -> Result<()> {
        let dir = self.segment_dir(run, batch);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn segment_paths(&self, dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut segments = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if is_hidden(&path) || path.extension().and_then(|e| e.to_str()) != Some(BATCH_EXT) {
                continue;
            }
            let index = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok());
            if let Some(index) = index {
                segments.push((index, path));
            }
        }
        segments.sort_by_key(|(index, _)| *index);
        Ok(segments)
    }
}

fn encode<R: StagedRecord>(records: &[R]) -> Result<Vec<u8>> {
    let header = BatchHeader {
        kind: R::KIND,
        count: records.len(),
        published_at: Utc::now(),
    };
    let mut buf = serde_json::to_vec(&header)?;
    buf.push(b'\n');
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

fn decode<R: StagedRecord>(path: &Path) -> Result<(BatchHeader, Vec<R>)> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut lines = reader.lines();

    let header_line = lines
        .next()
        .ok_or_else(|| Error::corrupt_batch(format!("{} is empty", path.display())))??;
    let header: BatchHeader = serde_json::from_str(&header_line)
        .map_err(|e| Error::corrupt_batch(format!("{}: bad header: {e}", path.display())))?;
    if header.kind != R::KIND {
        return Err(Error::corrupt_batch(format!(
            "{} holds {} records, expected {}",
            path.display(),
            header.kind.as_str(),
            R::KIND.as_str()
        )));
    }

    let mut records = Vec::with_capacity(header.count);
    for (line_no, line) in lines.enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| {
            Error::corrupt_batch(format!("{} line {}: {e}", path.display(), line_no + 2))
        })?;
        records.push(record);
    }

    if records.len() != header.count {
        return Err(Error::corrupt_batch(format!(
            "{} has {} records, header says {}",
            path.display(),
            records.len(),
            header.count
        )));
    }
    Ok((header, records))
}
