//! Rendezvous-file helpers shared by the loader CLI, the shutdown
//! coordinator and the dashboard's control endpoints. Only existence
//! matters; creation and removal are atomic at the filesystem level.

use std::path::Path;

use anyhow::Result;
use chrono::Utc;

pub fn flag_exists(path: &Path) -> bool {
    path.exists()
}

/// Create the flag. Returns `false` when it already existed (idempotent).
pub fn create_flag(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    std::fs::write(path, format!("shutdown requested at {}\n", Utc::now()))?;
    Ok(true)
}

/// Remove the flag. Returns `false` when it did not exist (idempotent).
pub fn remove_flag(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
