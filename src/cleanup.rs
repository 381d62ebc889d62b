use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use anyhow::Result;
use tracing::{info, warn};

use crate::store::ProjectStore;

/// Temporary uploads older than this are abandoned.
pub const TMP_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub async fn cleanup_projects(projects: &Arc<dyn ProjectStore>) -> Result<u64> {
  let deleted = projects.delete_empty_deleting_projects().await?;
  if deleted > 0 {
    info!("Deleted {} projects", deleted);
  }
  Ok(deleted)
}

/// Deletes entries directly under `tmp_dir` whose modification time is older than `max_age`.
pub fn cleanup_tmp_directory(tmp_dir: &Path, max_age: Duration) -> Result<usize> {
  let entries = match fs::read_dir(tmp_dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
    Err(e) => return Err(e.into()),
  };

  let now = SystemTime::now();
  let mut removed = 0;
  for entry in entries.filter_map(|e| e.ok()) {
    let path = entry.path();
    let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
      continue;
    };
    if now.duration_since(modified).unwrap_or_default() <= max_age {
      continue;
    }

    let result = if path.is_dir() { fs::remove_dir_all(&path) } else { fs::remove_file(&path) };
    match result {
      Ok(()) => {
        info!("Cleaned up: {}", path.display());
        removed += 1;
      }
      Err(e) => warn!("Cannot clean up {}: {}", path.display(), e),
    }
  }
  Ok(removed)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn removes_only_stale_entries() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("fresh.zip"), b"x").unwrap();
    fs::create_dir(dir.path().join("upload")).unwrap();

    assert_eq!(cleanup_tmp_directory(dir.path(), TMP_MAX_AGE).unwrap(), 0);
    assert!(dir.path().join("fresh.zip").exists());

    std::thread::sleep(Duration::from_millis(1100));
    assert_eq!(cleanup_tmp_directory(dir.path(), Duration::from_secs(1)).unwrap(), 2);
    assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
  }

  #[test]
  fn missing_tmp_directory_is_fine() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(cleanup_tmp_directory(&dir.path().join("nope"), TMP_MAX_AGE).unwrap(), 0);
  }
}
