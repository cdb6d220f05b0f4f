//! JSONL (JSON Lines) store for agent records
//!
//! One versioned [`AgentRecord`] per line.

use super::{AgentRecord, StateStore, RECORD_VERSION};
use crate::{AgoraError, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// JSONL reader for agent records
pub struct JsonlReader {
    reader: BufReader<File>,
}

impl JsonlReader {
    /// Open a JSONL file for reading
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }

    /// Read all records from the file
    pub fn read_all(&mut self) -> Result<Vec<AgentRecord>> {
        let mut records = Vec::new();

        for (index, line) in self.reader.by_ref().lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let record: AgentRecord = serde_json::from_str(&line).map_err(|e| {
                AgoraError::Parse(format!("Invalid JSONL at line {}: {}", index + 1, e))
            })?;

            if record.version != RECORD_VERSION {
                tracing::warn!(
                    version = record.version,
                    agent_id = %record.id,
                    "Unknown record version, attempting to use it anyway"
                );
            }
            records.push(record);
        }

        Ok(records)
    }
}

/// JSONL writer for agent records
pub struct JsonlWriter {
    writer: BufWriter<File>,
}

impl JsonlWriter {
    /// Create (or truncate) a JSONL file for writing
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Write a single record
    pub fn write(&mut self, record: &AgentRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        writeln!(self.writer, "{}", json)?;
        Ok(())
    }

    pub fn write_all(&mut self, records: &[AgentRecord]) -> Result<()> {
        for record in records {
            self.write(record)?;
        }
        Ok(())
    }

    /// Flush the buffer to disk
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read all records from a JSONL file
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<AgentRecord>> {
    JsonlReader::open(path)?.read_all()
}

/// Write all records to a JSONL file
pub fn write_records(path: impl AsRef<Path>, records: &[AgentRecord]) -> Result<()> {
    let mut writer = JsonlWriter::create(path)?;
    writer.write_all(records)?;
    writer.flush()
}

/// [`StateStore`] backed by a single JSONL file
#[derive(Debug, Clone)]
pub struct JsonlStore {
    path: PathBuf,
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonlStore {
    fn save_all(&self, records: &[AgentRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        write_records(&self.path, records)?;
        tracing::debug!(path = %self.path.display(), count = records.len(), "Agent records saved");
        Ok(())
    }

    /// A missing file loads as no records
    fn load_all(&self) -> Result<Vec<AgentRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        read_records(&self.path)
    }
}
