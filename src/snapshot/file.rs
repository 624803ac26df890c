// Snapshot files - line oriented balance and spent-address checkpoints
//
// Layout, one record per line, surrounding whitespace ignored:
//
//   <address>;<balance>      section 1, balances
//   ===
//   <address>                section 2, spent addresses
//   ===
//   <bundle>                 section 3 (optional), bundles kept verbatim
//
// The snapshot timestamp is the file stem: `1525017600.snap`.

use crate::convert::Hash;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SNAPSHOT_SEPARATOR: &str = "===";
pub const SNAPSHOT_EXTENSION: &str = "snap";

/// Errors reading or writing snapshot files
#[derive(Error, Debug)]
pub enum SnapshotFileError {
    #[error("Snapshot file line {line}: {reason}")]
    Format { line: usize, reason: String },

    #[error("Snapshot file name must be <timestamp>.snap: {0}")]
    InvalidFileName(String),

    #[error("Snapshot file I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// The three sections of a snapshot file, in order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    Balances,
    Spent,
    PendingBundles,
}

/// One parsed line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotRecord {
    Balance { address: Hash, value: i64 },
    Spent(Hash),
    PendingBundle(Hash),
}

/// Streaming parser over the sections of a snapshot file
pub struct SnapshotReader<R> {
    lines: io::Lines<R>,
    section: Section,
    line: usize,
}

impl<R: BufRead> SnapshotReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            section: Section::Balances,
            line: 0,
        }
    }

    /// Section the parser is currently in
    pub fn section(&self) -> Section {
        self.section
    }

    fn format_error(&self, reason: impl Into<String>) -> SnapshotFileError {
        SnapshotFileError::Format {
            line: self.line,
            reason: reason.into(),
        }
    }

    fn parse_id(&self, field: &str) -> Result<Hash, SnapshotFileError> {
        Hash::from_trytes(field).map_err(|e| self.format_error(e.to_string()))
    }

    fn parse_line(&self, line: &str) -> Result<SnapshotRecord, SnapshotFileError> {
        match self.section {
            Section::Balances => {
                let fields: Vec<&str> = line.split(';').collect();
                if fields.len() != 2 {
                    return Err(self.format_error(format!(
                        "expected <address>;<balance>, found {} fields",
                        fields.len()
                    )));
                }
                let address = self.parse_id(fields[0].trim())?;
                let value = fields[1]
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| self.format_error(format!("invalid balance: {}", e)))?;
                Ok(SnapshotRecord::Balance { address, value })
            }
            Section::Spent => Ok(SnapshotRecord::Spent(self.parse_id(line)?)),
            Section::PendingBundles => Ok(SnapshotRecord::PendingBundle(self.parse_id(line)?)),
        }
    }
}

impl<R: BufRead> Iterator for SnapshotReader<R> {
    type Item = Result<SnapshotRecord, SnapshotFileError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == SNAPSHOT_SEPARATOR {
                self.section = match self.section {
                    Section::Balances => Section::Spent,
                    Section::Spent => Section::PendingBundles,
                    Section::PendingBundles => {
                        return Some(Err(self.format_error("unexpected fourth section")))
                    }
                };
                continue;
            }
            return Some(self.parse_line(line));
        }
    }
}

/// Counts gathered by a validation pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub balances: usize,
    pub spent: usize,
    pub pending_bundles: usize,
    pub total_value: i128,
}

/// Open a snapshot file for streaming
pub fn open_file(path: &Path) -> Result<SnapshotReader<BufReader<File>>, SnapshotFileError> {
    Ok(SnapshotReader::new(BufReader::new(File::open(path)?)))
}

/// Parse a whole snapshot file without storing anything
pub fn validate_file(path: &Path) -> Result<SnapshotSummary, SnapshotFileError> {
    let mut summary = SnapshotSummary::default();
    for record in open_file(path)? {
        match record? {
            SnapshotRecord::Balance { value, .. } => {
                summary.balances += 1;
                summary.total_value += value as i128;
            }
            SnapshotRecord::Spent(_) => summary.spent += 1,
            SnapshotRecord::PendingBundle(_) => summary.pending_bundles += 1,
        }
    }
    Ok(summary)
}

/// Snapshot timestamp encoded in the file name
pub fn timestamp_from_path(path: &Path) -> Result<i64, SnapshotFileError> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.parse::<i64>().ok())
        .ok_or_else(|| SnapshotFileError::InvalidFileName(path.display().to_string()))
}

/// Path of the snapshot file for `timestamp` inside `dir`
pub fn snapshot_path(dir: &Path, timestamp: i64) -> PathBuf {
    dir.join(format!("{}.{}", timestamp, SNAPSHOT_EXTENSION))
}

/// Compacted ledger state written to a snapshot file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotContents {
    pub balances: BTreeMap<Hash, i64>,
    pub spent: BTreeSet<Hash>,
    pub pending_bundles: BTreeSet<Hash>,
}

/// Write `contents` as `<dir>/<timestamp>.snap`
///
/// The file is written under a temporary name and renamed into place, so a
/// reader never sees a half written snapshot.
pub fn write_file(
    dir: &Path,
    timestamp: i64,
    contents: &SnapshotContents,
) -> Result<PathBuf, SnapshotFileError> {
    fs::create_dir_all(dir)?;
    let path = snapshot_path(dir, timestamp);
    let tmp = path.with_extension("tmp");
    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        for (address, value) in &contents.balances {
            writeln!(out, "{};{}", address, value)?;
        }
        writeln!(out, "{}", SNAPSHOT_SEPARATOR)?;
        for address in &contents.spent {
            writeln!(out, "{}", address)?;
        }
        if !contents.pending_bundles.is_empty() {
            writeln!(out, "{}", SNAPSHOT_SEPARATOR)?;
            for bundle in &contents.pending_bundles {
                writeln!(out, "{}", bundle)?;
            }
        }
        out.flush()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(path)
}
