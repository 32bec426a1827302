//! Build driver orchestrating canonicalisation, allocation and emission.

use crate::emit;
use crate::error::{Error, Result};
use crate::layout::{self, VolumeLayout};
use crate::model::{BootCatalog, BootEntry, Volume};
use crate::names;
use crate::spec::{RecordTimestamp, SECTOR_SIZE, SYSTEM_AREA_SECTORS};
use crate::writer::ImageWriter;
use std::io::{Seek, Write};

/// Interchange level the canonicaliser enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibilityLevel {
  /// 8.3 d-character identifiers.
  Level1,
  /// Identifiers up to 30/31 bytes, any ASCII.
  Level2,
  Level3,
}

bitflags::bitflags! {
  /// Switches relaxing or tightening name handling.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct CompatibilityFlags: u8 {
    /// Cap directory nesting at eight levels.
    const LIMIT_DIRECTORIES = 1 << 0;
    /// Shorten over-long name portions instead of failing.
    const TRUNCATE_FILE_NAMES = 1 << 1;
    /// Fold lower case into the level 1 alphabet.
    const UPPER_CASE_FILE_NAMES = 1 << 2;
    /// Disambiguate colliding identifiers with `~N` aliases.
    const RESOLVE_NAME_CONFLICTS = 1 << 3;
    /// Drop surplus `.` characters instead of failing.
    const STRIP_ILLEGAL_DOTS = 1 << 4;
  }

  /// Format extensions; only El Torito is functional in this revision.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct Extensions: u8 {
    const ROCK_RIDGE = 1 << 0;
    const JOLIET = 1 << 1;
    const UDF = 1 << 2;
    const EL_TORITO = 1 << 3;
    const APPLE = 1 << 4;
  }
}

/// Sector recording mode of the output image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackMode {
  Mode1,
  Mode2Form1,
  Mode2Form2,
}

#[derive(Debug, Clone)]
pub struct ImageOptions {
  pub level: CompatibilityLevel,
  pub flags: CompatibilityFlags,
  pub mode: TrackMode,
  pub extensions: Extensions,
}

impl Default for ImageOptions {
  fn default() -> Self {
    Self {
      level: CompatibilityLevel::Level1,
      flags: CompatibilityFlags::TRUNCATE_FILE_NAMES
        | CompatibilityFlags::UPPER_CASE_FILE_NAMES
        | CompatibilityFlags::RESOLVE_NAME_CONFLICTS
        | CompatibilityFlags::STRIP_ILLEGAL_DOTS,
      mode: TrackMode::Mode1,
      extensions: Extensions::EL_TORITO,
    }
  }
}

/// Builds one disk image from a primary volume, optional supplementary
/// volumes and an optional boot catalog.
#[derive(Debug)]
pub struct ImageBuilder {
  options: ImageOptions,
  primary: Option<Volume>,
  supplementary: Vec<Volume>,
  boot_catalog: Option<BootCatalog>,
  timestamp: Option<chrono::DateTime<chrono::FixedOffset>>,
}

impl ImageBuilder {
  /// Fails with [Error::Unsupported] for modes and extensions this revision
  /// cannot produce.
  pub fn new(options: ImageOptions) -> Result<Self> {
    if options.mode != TrackMode::Mode1 {
      return Err(Error::Unsupported("only Mode 1 sectors can be produced"));
    }
    if options.extensions.contains(Extensions::UDF) {
      return Err(Error::Unsupported("UDF structures"));
    }
    if options.extensions.contains(Extensions::APPLE) {
      return Err(Error::Unsupported("Apple extensions"));
    }
    Ok(Self {
      options,
      primary: None,
      supplementary: Vec::new(),
      boot_catalog: None,
      timestamp: None,
    })
  }

  pub fn options(&self) -> &ImageOptions {
    &self.options
  }

  pub fn set_primary(&mut self, volume: Volume) -> &mut Self {
    self.primary = Some(volume);
    self
  }

  pub fn add_supplementary(&mut self, volume: Volume) -> &mut Self {
    self.supplementary.push(volume);
    self
  }

  pub fn set_boot_catalog(&mut self, catalog: BootCatalog) -> &mut Self {
    self.boot_catalog = Some(catalog);
    self
  }

  /// Fixes the recording timestamp. Without one the build reads the wall
  /// clock once and stamps every record with that single reading.
  pub fn set_timestamp(&mut self, timestamp: chrono::DateTime<chrono::FixedOffset>) -> &mut Self {
    self.timestamp = Some(timestamp);
    self
  }

  /// Builds the image into `output`. On error the partially written stream
  /// is left as-is for inspection; it is not a valid image.
  pub fn build<W: Write + Seek>(mut self, output: W) -> Result<()> {
    let mut primary = self
      .primary
      .take()
      .ok_or_else(|| Error::ModelInconsistent("image has no primary volume".to_string()))?;

    for volume in std::iter::once(&primary).chain(self.supplementary.iter()) {
      if u64::from(volume.properties.logical_block_size) != SECTOR_SIZE {
        return Err(Error::Unsupported("logical blocks smaller than a sector"));
      }
    }
    if self.boot_catalog.is_some() && !self.options.extensions.contains(Extensions::EL_TORITO) {
      return Err(Error::Unsupported("boot catalog without the El Torito extension"));
    }

    let timestamp = self
      .timestamp
      .unwrap_or_else(|| chrono::Local::now().fixed_offset());
    let record_ts = RecordTimestamp::from(timestamp);

    names::canonicalise_tree(&mut primary.tree, &self.options)?;
    for volume in &mut self.supplementary {
      names::canonicalise_tree(&mut volume.tree, &self.options)?;
    }

    let mut w = ImageWriter::new(output);
    // The system area stays zero; everything starts at sector 16.
    w.seek_to_sector(SYSTEM_AREA_SECTORS)?;

    let primary_descriptor_sector = layout::allocate_descriptor(&mut w)?;
    let boot_record_sector = match &self.boot_catalog {
      Some(_) => Some(layout::allocate_descriptor(&mut w)?),
      None => None,
    };
    let mut supplementary_descriptor_sectors = Vec::with_capacity(self.supplementary.len());
    for _ in &self.supplementary {
      supplementary_descriptor_sectors.push(layout::allocate_descriptor(&mut w)?);
    }
    emit::write_set_terminator(&mut w)?;

    if let (Some(catalog), Some(record_sector)) = (self.boot_catalog.take(), boot_record_sector) {
      emit_boot(&mut w, &catalog, record_sector)?;
    }

    emit_volume(&mut w, &primary, primary_descriptor_sector, true, &record_ts)?;
    for (volume, descriptor_sector) in self
      .supplementary
      .iter()
      .zip(supplementary_descriptor_sectors)
    {
      emit_volume(&mut w, volume, descriptor_sector, false, &record_ts)?;
    }

    // Round the image up to a whole sector.
    let end = w.seek_to_end()?;
    if end % SECTOR_SIZE != 0 {
      let target = end.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
      w.seek_to(target - 1)?;
      w.write_u8(0)?;
    }
    Ok(())
  }
}

/// Reserves and writes the boot catalog, every boot image extent and the
/// boot record that points at the catalog.
fn emit_boot<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  catalog: &BootCatalog,
  boot_record_sector: u32,
) -> Result<()> {
  let catalog_sector = layout::allocate_descriptor(w)?;

  let entries: Vec<&BootEntry> = std::iter::once(&catalog.initial_entry)
    .chain(catalog.sections.iter().flat_map(|s| s.entries.iter()))
    .collect();
  let mut data_sectors = Vec::with_capacity(entries.len());
  for entry in &entries {
    let bytes = u32::try_from(entry.data.len())
      .map_err(|_| Error::SizeOverflow { field: "boot image length" })?;
    let sectors = bytes.div_ceil(SECTOR_SIZE as u32);
    if sectors == 0 {
      data_sectors.push(0);
      continue;
    }
    let sector = w.current_sector()?;
    data_sectors.push(sector);
    w.advance_sectors(sectors)?;
  }

  // Image data first; the catalog and the boot record that reference it are
  // back-filled into their reserved sectors.
  let resume = w.position()?;
  for (entry, &sector) in entries.iter().zip(&data_sectors) {
    if entry.data.is_empty() {
      continue;
    }
    w.seek_to_sector(sector)?;
    w.write_bytes(&entry.data)?;
  }
  w.seek_to(resume)?;

  w.preserving_location(|w| {
    w.seek_to_sector(catalog_sector)?;
    emit::write_boot_catalog(w, catalog, &data_sectors)
  })?;
  w.preserving_location(|w| {
    w.seek_to_sector(boot_record_sector)?;
    emit::write_boot_record(w, catalog_sector)
  })?;
  log::info!("boot catalog at sector {catalog_sector}, boot record at sector {boot_record_sector}");
  Ok(())
}

/// Lays out and writes one volume: directory extents, the shared path table
/// area (type L immediately followed by type M), file extents, and finally
/// the descriptor back in its reserved sector.
fn emit_volume<W: Write + Seek>(
  w: &mut ImageWriter<W>,
  volume: &Volume,
  descriptor_sector: u32,
  is_primary: bool,
  ts: &RecordTimestamp,
) -> Result<()> {
  let tree = &volume.tree;
  let mut vol_layout = VolumeLayout {
    descriptor_sector,
    ..Default::default()
  };

  layout::allocate_directory_extents(w, tree, tree.root(), &mut vol_layout)?;

  let expected_bytes = layout::measure_path_table(tree)?;
  let entries = emit::collect_path_table(tree, &vol_layout)?;
  vol_layout.type_l_sector = w.current_sector()?;
  let l_bytes = emit::write_path_table(w, &entries, false)?;
  vol_layout.type_m_sector = w.current_sector()?;
  let m_bytes = emit::write_path_table(w, &entries, true)?;
  if l_bytes != m_bytes || l_bytes != expected_bytes {
    return Err(Error::BuilderState(
      "path tables differ from their measured length".to_string(),
    ));
  }
  vol_layout.path_table_bytes = l_bytes;
  w.seek_to_next_sector()?;

  layout::allocate_file_extents(w, tree, tree.root(), &mut vol_layout)?;

  // Frontier of this volume; record and extent emission seeks below it.
  let end = w.position()?;
  let root_loc = vol_layout.directory(tree.root())?;
  emit::write_directory_tree(
    w,
    tree,
    tree.root(),
    &vol_layout,
    root_loc,
    volume.properties.volume_sequence_number,
    ts,
  )?;
  emit::write_file_extents(w, tree, tree.root(), &vol_layout)?;
  w.seek_to(end)?;

  vol_layout.logical_block_count = w.current_sector()?;
  w.preserving_location(|w| {
    w.seek_to_sector(descriptor_sector)?;
    emit::write_volume_descriptor(w, volume, &vol_layout, root_loc, is_primary, ts)
  })?;
  log::info!(
    "volume {:?}: {} logical blocks",
    volume.properties.volume_identifier,
    vol_layout.logical_block_count
  );
  Ok(())
}
