//! Sector reservation and the side tables tracking every allocated extent.
//!
//! The image grows by appending whole sectors: every allocation records the
//! current sector in a side table and seeks the stream forward, so the next
//! allocation naturally continues where the previous one ended. Emission
//! later seeks back into the reserved regions.

use crate::error::{Error, Result};
use crate::model::{DirTree, NodeId, Payload};
use crate::spec::SECTOR_SIZE;
use crate::writer::ImageWriter;
use std::collections::HashMap;
use std::io::{Seek, Write};

/// Fixed part of a directory record preceding the identifier bytes.
pub(crate) const RECORD_BASE_LEN: u32 = 33;

/// Combined size of the self and parent records heading every extent.
pub(crate) const SELF_PARENT_LEN: u32 = 68;

/// Where one directory or file extent lives. Empty files keep a zero sector
/// and reserve nothing.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ExtentLoc {
  pub sector: u32,
  pub sector_count: u32,
  pub data_length: u32,
}

/// Allocation results for one volume.
#[derive(Debug, Default)]
pub(crate) struct VolumeLayout {
  pub descriptor_sector: u32,
  pub type_l_sector: u32,
  pub type_m_sector: u32,
  pub path_table_bytes: u32,
  pub logical_block_count: u32,
  pub directories: HashMap<NodeId, ExtentLoc>,
  pub files: HashMap<NodeId, ExtentLoc>,
}

impl VolumeLayout {
  pub fn directory(&self, id: NodeId) -> Result<ExtentLoc> {
    self
      .directories
      .get(&id)
      .copied()
      .ok_or_else(|| Error::BuilderState("directory extent has not been allocated".into()))
  }

  pub fn file(&self, id: NodeId) -> Result<ExtentLoc> {
    self
      .files
      .get(&id)
      .copied()
      .ok_or_else(|| Error::BuilderState("file extent has not been allocated".into()))
  }
}

/// Record length including the identifier and the even-length pad byte.
pub(crate) fn base_record_len(identifier_len: usize) -> u32 {
  let length = RECORD_BASE_LEN + identifier_len as u32;
  length + length % 2
}

/// Record length of one path table entry, even-padded.
pub(crate) fn path_table_record_len(identifier_len: usize) -> u32 {
  let length = 8 + identifier_len as u32;
  length + length % 2
}

fn sectors_for(bytes: u32) -> u32 {
  bytes.div_ceil(SECTOR_SIZE as u32)
}

fn require_sector_start<W: Write + Seek>(w: &mut ImageWriter<W>) -> Result<()> {
  if !w.at_sector_start()? {
    return Err(Error::BuilderState(
      "allocation requires a sector boundary".into(),
    ));
  }
  Ok(())
}

/// Reserves one sector for a volume descriptor and returns it.
pub(crate) fn allocate_descriptor<W: Write + Seek>(w: &mut ImageWriter<W>) -> Result<u32> {
  require_sector_start(w)?;
  let sector = w.current_sector()?;
  w.advance_sectors(1)?;
  Ok(sector)
}

/// Bytes a directory extent occupies, including the padding that keeps every
/// record inside the sector it starts in.
pub(crate) fn measure_directory(tree: &DirTree, dir: NodeId) -> Result<u32> {
  let sector = SECTOR_SIZE as u32;
  let mut length: u32 = SELF_PARENT_LEN;
  for &child in tree.children(dir) {
    let record = base_record_len(tree.mapped(child)?.identifier.len());
    let within = length % sector;
    if within + record > sector {
      length = length
        .checked_add(sector - within)
        .ok_or(Error::SizeOverflow { field: "directory extent length" })?;
    }
    length = length
      .checked_add(record)
      .ok_or(Error::SizeOverflow { field: "directory extent length" })?;
  }
  Ok(length)
}

/// Reserves extents for `dir` and all directories below it, depth-first.
pub(crate) fn allocate_directory_extents<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  tree: &DirTree,
  dir: NodeId,
  layout: &mut VolumeLayout,
) -> Result<()> {
  require_sector_start(w)?;
  let bytes = measure_directory(tree, dir)?;
  let sector_count = sectors_for(bytes).max(1);
  let sector = w.current_sector()?;
  let data_length = sector_count
    .checked_mul(SECTOR_SIZE as u32)
    .ok_or(Error::SizeOverflow { field: "directory data length" })?;
  let previous = layout.directories.insert(
    dir,
    ExtentLoc {
      sector,
      sector_count,
      data_length,
    },
  );
  if previous.is_some() {
    return Err(Error::BuilderState("directory extent allocated twice".into()));
  }
  log::debug!("directory extent at sector {sector} ({sector_count} sectors)");
  w.advance_sectors(sector_count)?;

  for &child in tree.children(dir) {
    if tree.is_directory(child) {
      allocate_directory_extents(w, tree, child, layout)?;
    }
  }
  Ok(())
}

/// Reserves file extents below `dir`, visiting child directories before the
/// directory's own files.
pub(crate) fn allocate_file_extents<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  tree: &DirTree,
  dir: NodeId,
  layout: &mut VolumeLayout,
) -> Result<()> {
  for &child in tree.children(dir) {
    if tree.is_directory(child) {
      allocate_file_extents(w, tree, child, layout)?;
    }
  }
  for &child in tree.children(dir) {
    if let Payload::File { data_length, .. } = &tree.node(child).payload {
      require_sector_start(w)?;
      let sector_count = sectors_for(*data_length);
      let loc = if sector_count == 0 {
        ExtentLoc::default()
      } else {
        let sector = w.current_sector()?;
        log::debug!("file extent at sector {sector} ({sector_count} sectors)");
        w.advance_sectors(sector_count)?;
        ExtentLoc {
          sector,
          sector_count,
          data_length: *data_length,
        }
      };
      if layout.files.insert(child, loc).is_some() {
        return Err(Error::BuilderState("file extent allocated twice".into()));
      }
    }
  }
  Ok(())
}

/// Byte length of one path table (the L and M forms are the same size).
pub(crate) fn measure_path_table(tree: &DirTree) -> Result<u32> {
  fn walk(tree: &DirTree, dir: NodeId, size: &mut u32) -> Result<()> {
    for &child in tree.children(dir) {
      if tree.is_directory(child) {
        let record = path_table_record_len(tree.mapped(child)?.identifier.len());
        *size = size
          .checked_add(record)
          .ok_or(Error::SizeOverflow { field: "path table size" })?;
        walk(tree, child, size)?;
      }
    }
    Ok(())
  }

  let mut size = path_table_record_len(1);
  walk(tree, tree.root(), &mut size)?;
  Ok(size)
}
