//! Snapshot egress - writes published snapshots to file
//!
//! Snapshots are written in JSONL format (one JSON object per line)
//! to the file specified in config.

use crate::domain::snapshot::Snapshot;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

/// Egress writer for snapshots
pub struct Egress {
    file_path: String,
}

impl Egress {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "egress_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Write a snapshot to the egress file
    /// Returns true if successful, false otherwise
    pub fn write_snapshot(&self, snapshot: &Snapshot) -> bool {
        let json = snapshot.to_json();

        match self.append_line(&json) {
            Ok(()) => {
                debug!(
                    id = %snapshot.id,
                    key = %snapshot.key,
                    markers = %snapshot.markers.len(),
                    "snapshot_egressed"
                );
                true
            }
            Err(e) => {
                error!(id = %snapshot.id, error = %e, "snapshot_egress_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;

        Ok(())
    }
}
