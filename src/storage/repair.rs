//! Offline repair of every shard store under a data root
//!
//! Run before the node serves anything. Each subdirectory is an independent
//! store repaired in place; the first irrecoverable failure aborts the run.

use crate::common::{Error, Result};
use crate::storage::kv::KvBackend;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct RepairReport {
    pub repaired: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

pub fn repair_data_dir(backend: &dyn KvBackend, data_dir: impl AsRef<Path>) -> Result<RepairReport> {
    let data_dir = data_dir.as_ref();
    tracing::info!("Repairing {} stores under {}", backend.name(), data_dir.display());

    let mut entries: Vec<PathBuf> = std::fs::read_dir(data_dir)
        .map_err(|e| Error::RepairFailed {
            path: data_dir.to_path_buf(),
            reason: e.to_string(),
        })?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();

    let mut report = RepairReport::default();
    for path in entries {
        if !path.is_dir() {
            tracing::warn!("Skipping non-directory {}", path.display());
            report.skipped.push(path);
            continue;
        }
        tracing::info!("Repairing {}", path.display());
        backend.repair(&path).map_err(|e| Error::RepairFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        report.repaired.push(path);
    }

    tracing::info!("Repair finished: {} stores", report.repaired.len());
    Ok(report)
}
