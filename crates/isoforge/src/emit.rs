//! Emission of every on-disk structure at its allocated position.

use crate::error::{Error, Result};
use crate::layout::{base_record_len, ExtentLoc, VolumeLayout};
use crate::model::{
  BootCatalog, BootEntry, DirTree, EntryAttributes, FileSource, NodeId, Payload, Volume,
};
use crate::spec::{
  FileFlags, RecordTimestamp, VolumeDescriptorType, VolumeTimestamp, BOOT_INDICATOR_BOOTABLE,
  BOOT_INDICATOR_NOT_BOOTABLE, DESCRIPTOR_VERSION, EL_TORITO_SYSTEM_ID, SECTION_HEADER_FINAL,
  SECTION_HEADER_MORE, SECTOR_SIZE, STANDARD_IDENTIFIER, VALIDATION_HEADER_ID, VALIDATION_KEY,
};
use crate::writer::{CharacterSet, ImageWriter};
use std::collections::VecDeque;
use std::io::{Read, Seek, Write};

pub(crate) fn write_descriptor_header<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  descriptor_type: VolumeDescriptorType,
) -> Result<()> {
  w.write_u8(descriptor_type as u8)?;
  w.write_bytes(STANDARD_IDENTIFIER)?;
  w.write_u8(DESCRIPTOR_VERSION)
}

pub(crate) fn write_set_terminator<W: Write + Seek>(w: &mut ImageWriter<W>) -> Result<()> {
  write_descriptor_header(w, VolumeDescriptorType::Terminator)?;
  w.write_zeros(SECTOR_SIZE - 7)
}

/// Primary or supplementary volume descriptor at the current position.
pub(crate) fn write_volume_descriptor<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  volume: &Volume,
  layout: &VolumeLayout,
  root: ExtentLoc,
  is_primary: bool,
  ts: &RecordTimestamp,
) -> Result<()> {
  let p = &volume.properties;
  let descriptor_type = if is_primary {
    VolumeDescriptorType::Primary
  } else {
    VolumeDescriptorType::Supplementary
  };

  write_descriptor_header(w, descriptor_type)?;
  w.write_u8(0)?;
  w.write_padded_str(&p.system_identifier, 32, CharacterSet::ACharacters)?;
  w.write_padded_str(&p.volume_identifier, 32, CharacterSet::DCharacters)?;
  w.write_zeros(8)?;
  w.write_u32_both(layout.logical_block_count)?;
  w.write_zeros(32)?;
  w.write_u16_both(p.volume_set_size)?;
  w.write_u16_both(p.volume_sequence_number)?;
  w.write_u16_both(p.logical_block_size)?;
  let table_size = layout
    .path_table_bytes
    .div_ceil(SECTOR_SIZE as u32)
    .checked_mul(SECTOR_SIZE as u32)
    .ok_or(Error::SizeOverflow { field: "path table size" })?;
  w.write_u32_both(table_size)?;
  w.write_u32_le(layout.type_l_sector)?;
  w.write_zeros(4)?;
  w.write_u32_be(layout.type_m_sector)?;
  w.write_zeros(4)?;
  write_directory_record(
    w,
    &RecordSpec {
      identifier: &[0x00],
      extent_sector: root.sector,
      data_length: root.data_length,
      flags: FileFlags::DIRECTORY,
      volume_sequence_number: p.volume_sequence_number,
    },
    ts,
  )?;
  w.write_padded_str(&p.volume_set_identifier, 128, CharacterSet::DCharacters)?;
  w.write_padded_str(&p.publisher_identifier, 128, CharacterSet::ACharacters)?;
  w.write_padded_str(&p.data_preparer_identifier, 128, CharacterSet::ACharacters)?;
  w.write_padded_str(&p.application_identifier, 128, CharacterSet::ACharacters)?;
  w.write_file_identifier(&p.copyright_file_identifier, 37)?;
  w.write_file_identifier(&p.abstract_file_identifier, 37)?;
  w.write_file_identifier(&p.bibliographic_file_identifier, 37)?;
  for time in [
    p.creation_time,
    p.modification_time,
    p.expiration_time,
    p.effective_time,
  ] {
    w.write_volume_timestamp(time.map(VolumeTimestamp::from).as_ref())?;
  }
  w.write_u8(1)?; // file structure version
  w.write_u8(0)?;
  w.write_zeros(SECTOR_SIZE - 883)
}

/// One directory record, fully described by the caller.
pub(crate) struct RecordSpec<'a> {
  pub identifier: &'a [u8],
  pub extent_sector: u32,
  pub data_length: u32,
  pub flags: FileFlags,
  pub volume_sequence_number: u16,
}

/// Writes one directory record at the current position and returns its
/// on-disk length.
pub(crate) fn write_directory_record<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  record: &RecordSpec<'_>,
  ts: &RecordTimestamp,
) -> Result<u32> {
  let length = base_record_len(record.identifier.len());
  let length_byte =
    u8::try_from(length).map_err(|_| Error::SizeOverflow { field: "directory record length" })?;
  let identifier_length = u8::try_from(record.identifier.len())
    .map_err(|_| Error::SizeOverflow { field: "identifier length" })?;

  w.write_u8(length_byte)?;
  w.write_u8(0)?; // extended attribute record length
  w.write_u32_both(record.extent_sector)?;
  w.write_u32_both(record.data_length)?;
  w.write_record_timestamp(ts)?;
  w.write_u8(record.flags.bits())?;
  w.write_u8(0)?; // file unit size
  w.write_u8(0)?; // interleave gap size
  w.write_u16_both(record.volume_sequence_number)?;
  w.write_u8(identifier_length)?;
  w.write_bytes(record.identifier)?;
  if record.identifier.len() % 2 == 0 {
    w.write_u8(0)?;
  }
  Ok(length)
}

/// On-disk file flags of one entry.
pub(crate) fn file_flags(attributes: EntryAttributes, is_directory: bool) -> FileFlags {
  let mut flags = FileFlags::empty();
  if attributes.contains(EntryAttributes::HIDDEN) {
    flags |= FileFlags::EXISTENCE;
  }
  if is_directory {
    flags |= FileFlags::DIRECTORY;
  }
  if attributes.contains(EntryAttributes::ASSOCIATED) {
    flags |= FileFlags::ASSOCIATED_FILE;
  }
  if attributes.contains(EntryAttributes::RECORD) {
    flags |= FileFlags::RECORD;
  }
  if attributes.contains(EntryAttributes::PROTECTION) {
    flags |= FileFlags::PROTECTION;
  }
  if attributes.contains(EntryAttributes::MULTI_EXTENT) {
    flags |= FileFlags::MULTI_EXTENT;
  }
  flags
}

/// Pads to the next sector first when the record would straddle a boundary,
/// so every record ends in the sector it begins in.
fn write_contained_record<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  record: &RecordSpec<'_>,
  ts: &RecordTimestamp,
) -> Result<u32> {
  let length = u64::from(base_record_len(record.identifier.len()));
  let within = w.position()? % SECTOR_SIZE;
  if within + length > SECTOR_SIZE {
    w.write_zeros(SECTOR_SIZE - within)?;
  }
  write_directory_record(w, record, ts)
}

/// Writes the extent of `dir`: self and parent records followed by one
/// record per child in the canonical order.
fn write_directory_extent<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  tree: &DirTree,
  dir: NodeId,
  layout: &VolumeLayout,
  self_loc: ExtentLoc,
  parent_loc: ExtentLoc,
  volume_sequence_number: u16,
  ts: &RecordTimestamp,
) -> Result<()> {
  w.seek_to_sector(self_loc.sector)?;
  log::debug!(
    "writing directory extent at sector {} ({} children)",
    self_loc.sector,
    tree.children(dir).len()
  );

  write_contained_record(
    w,
    &RecordSpec {
      identifier: &[0x00],
      extent_sector: self_loc.sector,
      data_length: self_loc.data_length,
      flags: FileFlags::DIRECTORY,
      volume_sequence_number,
    },
    ts,
  )?;
  write_contained_record(
    w,
    &RecordSpec {
      identifier: &[0x01],
      extent_sector: parent_loc.sector,
      data_length: parent_loc.data_length,
      flags: FileFlags::DIRECTORY,
      volume_sequence_number,
    },
    ts,
  )?;

  for &child in tree.children(dir) {
    let node = tree.node(child);
    let mapped = tree.mapped(child)?;
    let (loc, flags) = match &node.payload {
      Payload::Directory { .. } => (layout.directory(child)?, file_flags(node.attributes, true)),
      Payload::File { .. } => (layout.file(child)?, file_flags(node.attributes, false)),
    };
    write_contained_record(
      w,
      &RecordSpec {
        identifier: &mapped.identifier,
        extent_sector: loc.sector,
        data_length: loc.data_length,
        flags,
        volume_sequence_number,
      },
      ts,
    )?;
  }
  Ok(())
}

/// Emits the directory extents of the whole subtree depth-first, passing
/// each directory its parent's location; the root's parent is itself.
pub(crate) fn write_directory_tree<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  tree: &DirTree,
  dir: NodeId,
  layout: &VolumeLayout,
  parent_loc: ExtentLoc,
  volume_sequence_number: u16,
  ts: &RecordTimestamp,
) -> Result<()> {
  let self_loc = layout.directory(dir)?;
  write_directory_extent(
    w,
    tree,
    dir,
    layout,
    self_loc,
    parent_loc,
    volume_sequence_number,
    ts,
  )?;
  for &child in tree.children(dir) {
    if tree.is_directory(child) {
      write_directory_tree(w, tree, child, layout, self_loc, volume_sequence_number, ts)?;
    }
  }
  Ok(())
}

/// One record of the path table, in breadth-first order.
pub(crate) struct PathTableEntry {
  pub identifier: Vec<u8>,
  pub extent_sector: u32,
  pub parent_number: u16,
}

/// Collects path table records: the root is record 1 (its own parent), then
/// every directory breadth-first in the canonical child order.
pub(crate) fn collect_path_table(
  tree: &DirTree,
  layout: &VolumeLayout,
) -> Result<Vec<PathTableEntry>> {
  let mut entries = vec![PathTableEntry {
    identifier: vec![0x00],
    extent_sector: layout.directory(tree.root())?.sector,
    parent_number: 1,
  }];
  let mut queue: VecDeque<(NodeId, u16)> = VecDeque::from([(tree.root(), 1)]);

  while let Some((dir, number)) = queue.pop_front() {
    for &child in tree.children(dir) {
      if !tree.is_directory(child) {
        continue;
      }
      entries.push(PathTableEntry {
        identifier: tree.mapped(child)?.identifier.clone(),
        extent_sector: layout.directory(child)?.sector,
        parent_number: number,
      });
      let child_number = u16::try_from(entries.len())
        .map_err(|_| Error::SizeOverflow { field: "path table record number" })?;
      queue.push_back((child, child_number));
    }
  }
  Ok(entries)
}

/// Writes one path table at the current position and returns its byte length.
pub(crate) fn write_path_table<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  entries: &[PathTableEntry],
  big_endian: bool,
) -> Result<u32> {
  let start = w.position()?;
  for entry in entries {
    let identifier_length = u8::try_from(entry.identifier.len())
      .map_err(|_| Error::SizeOverflow { field: "identifier length" })?;
    w.write_u8(identifier_length)?;
    w.write_u8(0)?; // extended attribute record length
    if big_endian {
      w.write_u32_be(entry.extent_sector)?;
      w.write_u16_be(entry.parent_number)?;
    } else {
      w.write_u32_le(entry.extent_sector)?;
      w.write_u16_le(entry.parent_number)?;
    }
    w.write_bytes(&entry.identifier)?;
    if entry.identifier.len() % 2 == 1 {
      w.write_u8(0)?;
    }
  }
  let bytes = w.position()? - start;
  u32::try_from(bytes).map_err(|_| Error::SizeOverflow { field: "path table size" })
}

/// El Torito boot record pointing at the catalog sector.
pub(crate) fn write_boot_record<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  boot_catalog_sector: u32,
) -> Result<()> {
  write_descriptor_header(w, VolumeDescriptorType::BootRecord)?;
  let mut system_id = [0u8; 64];
  system_id[..EL_TORITO_SYSTEM_ID.len()].copy_from_slice(EL_TORITO_SYSTEM_ID);
  w.write_bytes(&system_id)?;
  w.write_u32_le(boot_catalog_sector)?;
  w.write_zeros(1973)
}

/// Sum of the sixteen little-endian words of a 32-byte catalog entry.
pub(crate) fn checksum16(data: &[u8]) -> u16 {
  data
    .chunks_exact(2)
    .fold(0u16, |sum, pair| sum.wrapping_add(u16::from_le_bytes([pair[0], pair[1]])))
}

/// Validation entry with its complement checksum, so the sixteen words of
/// the finished entry sum to zero.
fn write_validation_entry<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  catalog: &BootCatalog,
) -> Result<()> {
  let id = catalog.id_string.as_bytes();
  if id.len() > 24 {
    return Err(Error::InvalidArgument {
      name: catalog.id_string.clone(),
      reason: "longer than 24 bytes".to_string(),
    });
  }
  if let Some(&bad) = id.iter().find(|&&b| !CharacterSet::ACharacters.allows(b)) {
    return Err(Error::InvalidArgument {
      name: catalog.id_string.clone(),
      reason: format!("character {:?} not allowed in this field", bad as char),
    });
  }

  let mut entry = [0u8; 32];
  entry[0] = VALIDATION_HEADER_ID;
  entry[1] = catalog.platform_id as u8;
  entry[4..4 + id.len()].copy_from_slice(id);
  for slot in entry[4 + id.len()..28].iter_mut() {
    *slot = b' ';
  }
  entry[30] = VALIDATION_KEY[0];
  entry[31] = VALIDATION_KEY[1];
  let checksum = 0u16.wrapping_sub(checksum16(&entry));
  entry[28..30].copy_from_slice(&checksum.to_le_bytes());
  w.write_bytes(&entry)
}

/// One 32-byte boot entry. Section entries additionally carry the selection
/// criteria bytes; the initial entry leaves that area zero.
fn write_boot_entry<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  entry: &BootEntry,
  data_sector: u32,
  in_section: bool,
) -> Result<()> {
  w.write_u8(if entry.bootable {
    BOOT_INDICATOR_BOOTABLE
  } else {
    BOOT_INDICATOR_NOT_BOOTABLE
  })?;
  w.write_u8(entry.media_type as u8)?;
  w.write_u16_le(entry.load_segment)?;
  w.write_u8(entry.system_type)?;
  w.write_u8(0)?;
  w.write_u16_le(entry.sector_count)?;
  w.write_u32_le(data_sector)?;
  match (&entry.selection_criteria, in_section) {
    (Some(criteria), true) => {
      if criteria.len() > 19 {
        return Err(Error::InvalidArgument {
          name: "selection criteria".to_string(),
          reason: "longer than 19 bytes".to_string(),
        });
      }
      w.write_u8(1)?; // language and version information
      w.write_bytes(criteria)?;
      w.write_zeros((19 - criteria.len()) as u64)
    }
    _ => w.write_zeros(20),
  }
}

fn write_section_header<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  platform_id: u8,
  entry_count: u16,
  last: bool,
) -> Result<()> {
  w.write_u8(if last { SECTION_HEADER_FINAL } else { SECTION_HEADER_MORE })?;
  w.write_u8(platform_id)?;
  w.write_u16_le(entry_count)?;
  w.write_zeros(28)
}

/// The whole boot catalog sector: validation entry, initial entry, then any
/// platform sections. `data_sectors` carries the reserved extent of every
/// entry in catalog order.
pub(crate) fn write_boot_catalog<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  catalog: &BootCatalog,
  data_sectors: &[u32],
) -> Result<()> {
  let start = w.position()?;
  let mut sectors = data_sectors.iter().copied();
  let mut next_sector = || {
    sectors
      .next()
      .ok_or_else(|| Error::BuilderState("boot image extent has not been allocated".into()))
  };

  write_validation_entry(w, catalog)?;
  write_boot_entry(w, &catalog.initial_entry, next_sector()?, false)?;
  for (ix, section) in catalog.sections.iter().enumerate() {
    let entry_count = u16::try_from(section.entries.len())
      .map_err(|_| Error::SizeOverflow { field: "boot section entry count" })?;
    let last = ix + 1 == catalog.sections.len();
    write_section_header(w, section.platform_id as u8, entry_count, last)?;
    for entry in &section.entries {
      write_boot_entry(w, entry, next_sector()?, true)?;
    }
  }

  let used = w.position()? - start;
  if used > SECTOR_SIZE {
    return Err(Error::ModelInconsistent(
      "boot catalog does not fit one sector".to_string(),
    ));
  }
  w.write_zeros(SECTOR_SIZE - used)
}

/// Streams every file extent below `dir` to its reserved location, in the
/// same order the extents were allocated.
pub(crate) fn write_file_extents<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  tree: &DirTree,
  dir: NodeId,
  layout: &VolumeLayout,
) -> Result<()> {
  for &child in tree.children(dir) {
    if tree.is_directory(child) {
      write_file_extents(w, tree, child, layout)?;
    }
  }
  for &child in tree.children(dir) {
    if let Payload::File { source, data_length } = &tree.node(child).payload {
      let loc = layout.file(child)?;
      if loc.sector_count == 0 {
        continue;
      }
      w.seek_to_sector(loc.sector)?;
      log::debug!(
        "writing file extent at sector {} ({} bytes)",
        loc.sector,
        data_length
      );
      match source {
        FileSource::Host(path) => {
          // opened here and released again on every exit path
          let file = std::fs::File::open(path)?;
          copy_exact(w, file, *data_length, tree.node(child).name.as_str())?;
        }
        FileSource::Memory(bytes) => w.write_bytes(bytes)?,
      }
    }
  }
  Ok(())
}

/// Streams exactly `expected` bytes from `reader`; any drift from the
/// pre-measured length fails the build.
fn copy_exact<W: Write + Seek, R: Read>(
  w: &mut ImageWriter<W>,
  mut reader: R,
  expected: u32,
  name: &str,
) -> Result<()> {
  let mut buffer = [0u8; 8192];
  let mut copied: u64 = 0;
  loop {
    let read = reader.read(&mut buffer)?;
    if read == 0 {
      break;
    }
    copied += read as u64;
    if copied > u64::from(expected) {
      return Err(Error::ContentRace {
        name: name.to_string(),
      });
    }
    w.write_bytes(&buffer[..read])?;
  }
  if copied != u64::from(expected) {
    return Err(Error::ContentRace {
      name: name.to_string(),
    });
  }
  Ok(())
}
