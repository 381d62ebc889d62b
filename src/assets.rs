//! On-disk layout of a task and the outputs extracted from a node's asset archive.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Archive every node produces for a finished task.
pub const ALL_ASSETS_ARCHIVE: &str = "all.zip";

enum AssetSource {
  File(&'static str),
  /// Packaged on demand from a directory; available when the directory exists.
  Directory(&'static str),
}

const ASSETS: &[(&str, AssetSource)] = &[
  ("all.zip", AssetSource::Directory(".")),
  ("orthophoto.tif", AssetSource::File("odm_orthophoto/odm_orthophoto.tif")),
  ("orthophoto.png", AssetSource::File("odm_orthophoto/odm_orthophoto.png")),
  ("orthophoto.mbtiles", AssetSource::File("odm_orthophoto/odm_orthophoto.mbtiles")),
  ("orthophoto.kmz", AssetSource::File("odm_orthophoto/odm_orthophoto.kmz")),
  ("georeferenced_model.las", AssetSource::File("odm_georeferencing/odm_georeferenced_model.las")),
  ("georeferenced_model.laz", AssetSource::File("odm_georeferencing/odm_georeferenced_model.laz")),
  ("georeferenced_model.ply", AssetSource::File("odm_georeferencing/odm_georeferenced_model.ply")),
  ("georeferenced_model.csv", AssetSource::File("odm_georeferencing/odm_georeferenced_model.csv")),
  ("textured_model.zip", AssetSource::Directory("odm_texturing")),
  ("textured_model.glb", AssetSource::File("odm_texturing/odm_textured_model_geo.glb")),
  ("3d_tiles_model.zip", AssetSource::Directory("3d_tiles/model")),
  ("3d_tiles_pointcloud.zip", AssetSource::Directory("3d_tiles/pointcloud")),
  ("dtm.tif", AssetSource::File("odm_dem/dtm.tif")),
  ("dsm.tif", AssetSource::File("odm_dem/dsm.tif")),
  ("dtm_tiles.zip", AssetSource::Directory("dtm_tiles")),
  ("dsm_tiles.zip", AssetSource::Directory("dsm_tiles")),
  ("orthophoto_tiles.zip", AssetSource::Directory("orthophoto_tiles")),
  ("cameras.json", AssetSource::File("cameras.json")),
  ("shots.geojson", AssetSource::File("odm_report/shots.geojson")),
  ("report.pdf", AssetSource::File("odm_report/report.pdf")),
  ("ground_control_points.geojson", AssetSource::File("odm_georeferencing/ground_control_points.geojson")),
];

#[derive(Debug, Error)]
pub enum ArchiveError {
  #[error("Invalid zip file: {0}")]
  Corrupt(#[from] zip::result::ZipError),

  #[error(transparent)]
  Io(#[from] io::Error),
}

impl ArchiveError {
  /// A corrupt download is worth fetching again; an I/O failure on our side is not.
  pub fn is_corrupt(&self) -> bool {
    matches!(self, ArchiveError::Corrupt(_))
  }
}

/// Filesystem layout rooted at `MEDIA_ROOT`.
#[derive(Debug, Clone)]
pub struct TaskPaths {
  media_root: PathBuf,
}

impl TaskPaths {
  pub fn new(media_root: impl Into<PathBuf>) -> Self {
    Self { media_root: media_root.into() }
  }

  pub fn media_root(&self) -> &Path {
    &self.media_root
  }

  /// `project/<project>/task/<task>/`, holding the input images at its top level.
  pub fn task_dir(&self, project_id: Uuid, task_id: Uuid) -> PathBuf {
    self.media_root
      .join("project")
      .join(project_id.to_string())
      .join("task")
      .join(task_id.to_string())
  }

  pub fn assets_dir(&self, project_id: Uuid, task_id: Uuid) -> PathBuf {
    self.task_dir(project_id, task_id).join("assets")
  }

  pub fn tmp_dir(&self) -> PathBuf {
    self.media_root.join("tmp")
  }
}

/// Input images: every regular file at the top of the task directory.
pub fn scan_images(task_dir: &Path) -> Vec<PathBuf> {
  let Ok(entries) = fs::read_dir(task_dir) else {
    return Vec::new();
  };
  let mut images: Vec<PathBuf> = entries
    .filter_map(|entry| entry.ok())
    .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
    .map(|entry| entry.path())
    .collect();
  images.sort();
  images
}

/// Extracts `archive` into `dest`, removes the archive, and lifts the contents out of a
/// stray single top-level directory.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
  let file = File::open(archive)?;
  let mut zip = zip::ZipArchive::new(file)?;
  zip.extract(dest)?;
  info!("Extracted {}", archive.display());
  fs::remove_file(archive)?;
  flatten_single_top_level_dir(dest)?;
  Ok(())
}

fn flatten_single_top_level_dir(dest: &Path) -> io::Result<()> {
  let top_level: Vec<PathBuf> = fs::read_dir(dest)?
    .filter_map(|entry| entry.ok())
    .map(|entry| entry.path())
    .collect();
  let [only] = top_level.as_slice() else {
    return Ok(());
  };
  if !only.is_dir() || only.ends_with("odm_orthophoto") {
    return Ok(());
  }

  let children: Vec<PathBuf> = fs::read_dir(only)?
    .filter_map(|entry| entry.ok())
    .map(|entry| entry.path())
    .collect();
  if children.is_empty() {
    return Ok(());
  }

  info!("Top level directory found in archive, moving its contents up");
  for child in children {
    if let Some(name) = child.file_name() {
      fs::rename(&child, dest.join(name))?;
    }
  }
  fs::remove_dir_all(only)
}

pub fn available_assets(assets_dir: &Path) -> Vec<String> {
  ASSETS
    .iter()
    .filter(|(_, source)| match source {
      AssetSource::File(path) => assets_dir.join(path).is_file(),
      AssetSource::Directory(path) => assets_dir.join(path).is_dir(),
    })
    .map(|(name, _)| name.to_string())
    .collect()
}

/// Size of a directory tree in megabytes, symlinks excluded.
pub fn directory_size_mb(dir: &Path) -> f64 {
  let bytes: u64 = WalkDir::new(dir)
    .into_iter()
    .filter_map(|entry| entry.ok())
    .filter(|entry| entry.file_type().is_file())
    .filter_map(|entry| entry.metadata().ok())
    .map(|meta| meta.len())
    .sum();
  bytes as f64 / 1024.0 / 1024.0
}

/// Deletes input images, keeping processed outputs. Returns how many were removed.
pub fn remove_images(task_dir: &Path) -> usize {
  let mut removed = 0;
  for image in scan_images(task_dir) {
    match fs::remove_file(&image) {
      Ok(()) => removed += 1,
      Err(e) => warn!("Cannot remove {}: {}", image.display(), e),
    }
  }
  removed
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use zip::write::SimpleFileOptions;

  fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, data) in entries {
      writer.start_file(*name, SimpleFileOptions::default()).unwrap();
      writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
  }

  #[test]
  fn task_dir_layout() {
    let paths = TaskPaths::new("/media");
    let project = Uuid::nil();
    let task = Uuid::nil();
    assert_eq!(
      paths.assets_dir(project, task),
      PathBuf::from(format!("/media/project/{}/task/{}/assets", project, task))
    );
  }

  #[test]
  fn extract_lists_available_assets() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join(ALL_ASSETS_ARCHIVE);
    write_zip(&archive, &[
      ("odm_orthophoto/odm_orthophoto.tif", b"tif"),
      ("odm_dem/dsm.tif", b"dsm"),
      ("odm_texturing/model.obj", b"obj"),
    ]);

    extract_archive(&archive, dir.path()).unwrap();
    assert!(!archive.exists());
    let assets = available_assets(dir.path());
    assert_eq!(assets, vec!["all.zip", "orthophoto.tif", "textured_model.zip", "dsm.tif"]);
  }

  #[test]
  fn extract_flattens_wrapping_directory() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("download.zip");
    write_zip(&archive, &[("results/odm_dem/dtm.tif", b"dtm"), ("results/cameras.json", b"{}")]);
    let dest = dir.path().join("assets");
    fs::create_dir(&dest).unwrap();

    extract_archive(&archive, &dest).unwrap();
    assert!(dest.join("odm_dem/dtm.tif").is_file());
    assert!(dest.join("cameras.json").is_file());
    assert!(!dest.join("results").exists());
  }

  #[test]
  fn corrupt_archive_is_reported_as_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join(ALL_ASSETS_ARCHIVE);
    fs::write(&archive, b"definitely not a zip").unwrap();
    let err = extract_archive(&archive, dir.path()).unwrap_err();
    assert!(err.is_corrupt());
  }

  #[test]
  fn scan_and_remove_images_leave_directories() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.jpg"), vec![0u8; 1024]).unwrap();
    fs::write(dir.path().join("b.jpg"), vec![0u8; 1024]).unwrap();
    fs::create_dir(dir.path().join("assets")).unwrap();
    fs::write(dir.path().join("assets/dsm.tif"), vec![0u8; 2048]).unwrap();

    assert_eq!(scan_images(dir.path()).len(), 2);
    assert!((directory_size_mb(dir.path()) - 4096.0 / 1024.0 / 1024.0).abs() < 1e-9);
    assert_eq!(remove_images(dir.path()), 2);
    assert!(scan_images(dir.path()).is_empty());
    assert!(dir.path().join("assets/dsm.tif").exists());
  }
}
