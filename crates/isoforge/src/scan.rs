//! Host directory capture into a [DirTree].

use crate::error::{Error, Result};
use crate::model::{DirTree, EntryAttributes, FileSource};
use std::path::Path;

/// Mirrors the directory at `root` into a fresh tree.
///
/// Entries are visited in file-name order, so the produced image depends
/// only on the directory contents. Files record their host path and are
/// opened again at emission time; symlinks and special files are skipped.
pub fn scan_directory(root: &Path) -> Result<DirTree> {
  let mut tree = DirTree::new();
  let mut parents = vec![tree.root()];

  for entry in walkdir::WalkDir::new(root).min_depth(1).sort_by_file_name() {
    let entry = entry?;
    let name = entry.file_name().to_string_lossy().into_owned();
    parents.truncate(entry.depth());
    let parent = parents
      .last()
      .copied()
      .ok_or_else(|| Error::BuilderState("walk produced an orphaned entry".to_string()))?;

    if entry.file_type().is_dir() {
      let id = tree.add_directory(parent, &name, EntryAttributes::empty())?;
      parents.push(id);
    } else if entry.file_type().is_file() {
      log::debug!("captured {}", entry.path().display());
      tree.add_file(
        parent,
        &name,
        FileSource::Host(entry.path().to_path_buf()),
        EntryAttributes::empty(),
      )?;
    }
  }
  Ok(tree)
}
