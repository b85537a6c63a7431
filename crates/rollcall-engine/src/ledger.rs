//! Attendance ledger backed by a two-column CSV file (`Name,Time`).
//!
//! The ledger holds every record persisted so far and answers "already
//! marked?" against that full history, so duplicates are suppressed across
//! process restarts as well as within a session. Each successful mark is
//! appended and synced before `mark` returns.
//!
//! Two processes sharing one ledger file are not coordinated: there is no file
//! lock, so both may append a row for the same identity.

use chrono::NaiveDateTime;
use rollcall_core::Identity;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const LEDGER_HEADER: [&str; 2] = ["Name", "Time"];
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger I/O at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger CSV at {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("malformed ledger {path} at line {line}: {reason}")]
    Malformed {
        path: String,
        line: u64,
        reason: String,
    },
}

/// One attendance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub identity: Identity,
    pub time: NaiveDateTime,
}

/// In-memory view of the ledger file plus the append path.
#[derive(Debug)]
pub struct AttendanceLedger {
    path: PathBuf,
    records: Vec<AttendanceRecord>,
    marked: HashSet<Identity>,
}

impl AttendanceLedger {
    /// Load the ledger at `path`. A missing or empty file is an empty ledger.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let mut ledger = Self {
            path,
            records: Vec::new(),
            marked: HashSet::new(),
        };

        let file = match File::open(&ledger.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %ledger.path.display(), "no ledger yet; starting empty");
                return Ok(ledger);
            }
            Err(e) => return Err(ledger.io(e)),
        };

        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
        let headers = reader.headers().map_err(|e| ledger.csv(e))?.clone();
        if headers.is_empty() {
            tracing::info!(path = %ledger.path.display(), "empty ledger file; starting empty");
            return Ok(ledger);
        }
        if headers.iter().ne(LEDGER_HEADER) {
            return Err(ledger.malformed(
                1,
                format!("expected header {LEDGER_HEADER:?}, found {:?}", headers.iter().collect::<Vec<_>>()),
            ));
        }

        for row in reader.records() {
            let row = row.map_err(|e| ledger.csv(e))?;
            let line = row.position().map_or(0, |p| p.line());
            let (Some(name), Some(time)) = (row.get(0), row.get(1)) else {
                return Err(ledger.malformed(line, "expected two columns".to_string()));
            };
            let time = NaiveDateTime::parse_from_str(time, TIME_FORMAT)
                .map_err(|e| ledger.malformed(line, format!("bad time {time:?}: {e}")))?;

            ledger.marked.insert(name.to_string());
            ledger.records.push(AttendanceRecord {
                identity: name.to_string(),
                time,
            });
        }

        tracing::info!(
            path = %ledger.path.display(),
            records = ledger.records.len(),
            identities = ledger.marked.len(),
            "loaded ledger"
        );
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records in file order.
    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_marked(&self, identity: &str) -> bool {
        self.marked.contains(identity)
    }

    /// Append a record unless `identity` is already marked.
    ///
    /// Returns `Ok(true)` when a row was written and `Ok(false)` for a no-op.
    /// On error the in-memory state is unchanged.
    pub fn mark(&mut self, identity: &str, time: NaiveDateTime) -> Result<bool, LedgerError> {
        if self.is_marked(identity) {
            tracing::debug!(identity, "already marked");
            return Ok(false);
        }

        let record = AttendanceRecord {
            identity: identity.to_string(),
            time,
        };
        self.append(&record)?;

        tracing::info!(identity, time = %time.format(TIME_FORMAT), "attendance marked");
        self.marked.insert(record.identity.clone());
        self.records.push(record);
        Ok(true)
    }

    fn append(&self, record: &AttendanceRecord) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io(e))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io(e))?;
        let len = file.metadata().map_err(|e| self.io(e))?.len();
        let needs_header = len == 0;

        // A hand-edited file may lack the final newline; rows must not be glued on.
        if len > 0 && !ends_with_newline(&mut file).map_err(|e| self.io(e))? {
            file.write_all(b"\n").map_err(|e| self.io(e))?;
        }

        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(&mut file);
            if needs_header {
                writer.write_record(LEDGER_HEADER).map_err(|e| self.csv(e))?;
            }
            let time = record.time.format(TIME_FORMAT).to_string();
            writer
                .write_record([record.identity.as_str(), time.as_str()])
                .map_err(|e| self.csv(e))?;
            writer.flush().map_err(|e| self.io(e))?;
        }

        file.sync_data().map_err(|e| self.io(e))
    }

    fn io(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn csv(&self, source: csv::Error) -> LedgerError {
        LedgerError::Csv {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn malformed(&self, line: u64, reason: String) -> LedgerError {
        LedgerError::Malformed {
            path: self.path.display().to_string(),
            line,
            reason,
        }
    }
}

fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
