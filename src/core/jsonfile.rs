//! JSON source files: atomic replacement and tolerant loading.
//!
//! Writers go through a sibling temp file and `fs::rename`, so a concurrent
//! reader sees either the previous document or the new one, never a torn
//! write. Readers distinguish a missing file from a corrupt one; corrupt
//! files can be moved aside so the next writer starts clean.

use crate::core::error::KeelError;
use crate::core::time;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use ulid::Ulid;

/// Outcome of reading a JSON source.
#[derive(Debug)]
pub enum Loaded<T> {
    Missing,
    Present(T),
    Corrupt { reason: String },
}

impl<T> Loaded<T> {
    pub fn present(self) -> Option<T> {
        match self {
            Loaded::Present(v) => Some(v),
            _ => None,
        }
    }
}

pub fn load<T: DeserializeOwned>(path: &Path) -> Result<Loaded<T>, KeelError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(e) => return Err(KeelError::IoError(e)),
    };
    match serde_json::from_slice::<T>(&bytes) {
        Ok(v) => Ok(Loaded::Present(v)),
        Err(e) => Ok(Loaded::Corrupt {
            reason: e.to_string(),
        }),
    }
}

/// Strict read: missing is `NotFound`, unparsable is `CorruptSource`.
pub fn load_required<T: DeserializeOwned>(path: &Path) -> Result<T, KeelError> {
    match load(path)? {
        Loaded::Present(v) => Ok(v),
        Loaded::Missing => Err(KeelError::NotFound(path.display().to_string())),
        Loaded::Corrupt { reason } => Err(KeelError::CorruptSource {
            path: path.display().to_string(),
            reason,
        }),
    }
}

pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), KeelError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &bytes)
}

pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), KeelError> {
    let parent = path
        .parent()
        .ok_or_else(|| KeelError::ValidationError(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, Ulid::new()));

    let result = (|| -> Result<(), KeelError> {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Moves a corrupt source aside as `<name>.corrupted_<epoch_ms>`.
pub fn quarantine(path: &Path) -> Result<PathBuf, KeelError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let target = path.with_file_name(format!(
        "{}.corrupted_{}",
        file_name,
        time::now_epoch_ms()
    ));
    fs::rename(path, &target)?;
    Ok(target)
}
