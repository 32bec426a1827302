//! In-memory description of a disk image: volumes, directory trees and the
//! optional boot catalog.
//!
//! The model is built first (by [crate::scan] or by hand) and then handed to
//! the builder, which only touches the mapped-name slots while
//! canonicalising. Allocated positions never live on the nodes; the layout
//! side tables key off [NodeId] instead.

use crate::error::{Error, Result};
use crate::spec::SECTOR_SIZE;
use std::path::PathBuf;

pub(crate) type SourceName = arraystring::ArrayString<arraystring::typenum::U255>;

bitflags::bitflags! {
  /// Per-entry attributes carried into the on-disk file flags.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct EntryAttributes: u8 {
    /// Clears the "existence" bit so conforming readers hide the entry.
    const HIDDEN = 1 << 0;
    /// Marks an associated file; it shares the identifier of a non-associated
    /// sibling with the same source name.
    const ASSOCIATED = 1 << 1;
    const RECORD = 1 << 2;
    const PROTECTION = 1 << 3;
    const MULTI_EXTENT = 1 << 4;
  }
}

/// Where a file's bytes come from at emission time.
#[derive(Debug, Clone)]
pub enum FileSource {
  /// A host file, opened only while its extent is being written.
  Host(PathBuf),
  /// Bytes held directly in memory.
  Memory(Vec<u8>),
}

/// Canonicalised on-disk name: text form plus its equal-length ASCII bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MappedName {
  pub text: String,
  pub identifier: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct Node {
  pub name: SourceName,
  pub attributes: EntryAttributes,
  pub mapped: Option<MappedName>,
  pub payload: Payload,
}

#[derive(Debug)]
pub(crate) enum Payload {
  Directory { children: Vec<NodeId> },
  File { source: FileSource, data_length: u32 },
}

/// Handle to a node in a [DirTree].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

/// Arena-backed directory tree; node 0 is the root directory.
#[derive(Debug)]
pub struct DirTree {
  nodes: Vec<Node>,
}

impl DirTree {
  pub fn new() -> Self {
    Self {
      nodes: vec![Node {
        name: SourceName::new(),
        attributes: EntryAttributes::empty(),
        mapped: None,
        payload: Payload::Directory { children: vec![] },
      }],
    }
  }

  pub fn root(&self) -> NodeId {
    NodeId(0)
  }

  /// Adds a directory under `parent` and returns its handle.
  pub fn add_directory(
    &mut self,
    parent: NodeId,
    name: &str,
    attributes: EntryAttributes,
  ) -> Result<NodeId> {
    self.push_child(
      parent,
      Node {
        name: SourceName::from(name),
        attributes,
        mapped: None,
        payload: Payload::Directory { children: vec![] },
      },
    )
  }

  /// Adds a file under `parent`. The data length is measured here; if the
  /// source yields a different number of bytes at emission time the build
  /// fails with [Error::ContentRace].
  pub fn add_file(
    &mut self,
    parent: NodeId,
    name: &str,
    source: FileSource,
    attributes: EntryAttributes,
  ) -> Result<NodeId> {
    let length = match &source {
      FileSource::Host(path) => std::fs::metadata(path)?.len(),
      FileSource::Memory(bytes) => bytes.len() as u64,
    };
    let data_length =
      u32::try_from(length).map_err(|_| Error::SizeOverflow { field: "file data length" })?;
    self.push_child(
      parent,
      Node {
        name: SourceName::from(name),
        attributes,
        mapped: None,
        payload: Payload::File { source, data_length },
      },
    )
  }

  fn push_child(&mut self, parent: NodeId, node: Node) -> Result<NodeId> {
    if !self.is_directory(parent) {
      return Err(Error::ModelInconsistent(format!(
        "{:?} is not a directory",
        self.node(parent).name.as_str()
      )));
    }
    let id = NodeId(
      u32::try_from(self.nodes.len()).map_err(|_| Error::SizeOverflow { field: "node count" })?,
    );
    self.nodes.push(node);
    if let Payload::Directory { children } = &mut self.nodes[parent.0 as usize].payload {
      children.push(id);
    }
    Ok(id)
  }

  pub(crate) fn node(&self, id: NodeId) -> &Node {
    &self.nodes[id.0 as usize]
  }

  pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
    &mut self.nodes[id.0 as usize]
  }

  pub(crate) fn children(&self, id: NodeId) -> &[NodeId] {
    match &self.node(id).payload {
      Payload::Directory { children } => children,
      Payload::File { .. } => &[],
    }
  }

  pub(crate) fn set_children(&mut self, id: NodeId, order: Vec<NodeId>) {
    if let Payload::Directory { children } = &mut self.node_mut(id).payload {
      *children = order;
    }
  }

  pub(crate) fn is_directory(&self, id: NodeId) -> bool {
    matches!(self.node(id).payload, Payload::Directory { .. })
  }

  pub(crate) fn mapped(&self, id: NodeId) -> Result<&MappedName> {
    self.node(id).mapped.as_ref().ok_or_else(|| {
      Error::BuilderState(format!(
        "{:?} has not been canonicalised",
        self.node(id).name.as_str()
      ))
    })
  }
}

impl Default for DirTree {
  fn default() -> Self {
    Self::new()
  }
}

/// Metadata recorded in a volume descriptor.
#[derive(Debug, Clone)]
pub struct VolumeProperties {
  pub system_identifier: String,
  pub volume_identifier: String,
  pub volume_set_identifier: String,
  pub publisher_identifier: String,
  pub data_preparer_identifier: String,
  pub application_identifier: String,
  pub copyright_file_identifier: String,
  pub abstract_file_identifier: String,
  pub bibliographic_file_identifier: String,
  pub creation_time: Option<chrono::DateTime<chrono::FixedOffset>>,
  pub modification_time: Option<chrono::DateTime<chrono::FixedOffset>>,
  pub expiration_time: Option<chrono::DateTime<chrono::FixedOffset>>,
  pub effective_time: Option<chrono::DateTime<chrono::FixedOffset>>,
  pub volume_set_size: u16,
  pub volume_sequence_number: u16,
  pub logical_block_size: u16,
}

impl Default for VolumeProperties {
  fn default() -> Self {
    Self {
      system_identifier: String::new(),
      volume_identifier: String::new(),
      volume_set_identifier: String::new(),
      publisher_identifier: String::new(),
      data_preparer_identifier: String::new(),
      application_identifier: "ISOFORGE".to_string(),
      copyright_file_identifier: String::new(),
      abstract_file_identifier: String::new(),
      bibliographic_file_identifier: String::new(),
      creation_time: None,
      modification_time: None,
      expiration_time: None,
      effective_time: None,
      volume_set_size: 1,
      volume_sequence_number: 1,
      logical_block_size: SECTOR_SIZE as u16,
    }
  }
}

/// A single volume: descriptor metadata plus a directory tree.
#[derive(Debug)]
pub struct Volume {
  pub properties: VolumeProperties,
  pub tree: DirTree,
}

impl Volume {
  pub fn new(volume_identifier: &str) -> Self {
    Self {
      properties: VolumeProperties {
        volume_identifier: volume_identifier.to_string(),
        ..Default::default()
      },
      tree: DirTree::new(),
    }
  }
}

/// Platform a boot catalog entry group targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlatformId {
  X86 = 0,
  PowerPc = 1,
  Mac = 2,
}

/// Media emulation requested for a boot image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BootMediaType {
  NoEmulation = 0,
  Diskette12 = 1,
  Diskette144 = 2,
  Diskette288 = 3,
  HardDisk = 4,
}

/// One boot image recorded in the catalog.
#[derive(Debug, Clone)]
pub struct BootEntry {
  pub bootable: bool,
  pub media_type: BootMediaType,
  /// Segment the BIOS loads the image at; 0 selects the default 0x07C0.
  pub load_segment: u16,
  pub system_type: u8,
  /// Count of 512-byte virtual sectors to load.
  pub sector_count: u16,
  pub data: Vec<u8>,
  /// Vendor-unique selection criteria, at most 19 bytes.
  pub selection_criteria: Option<Vec<u8>>,
}

impl BootEntry {
  /// Bootable no-emulation entry loading the whole image.
  pub fn no_emulation(data: Vec<u8>) -> Result<Self> {
    let sector_count = u16::try_from(data.len().div_ceil(512))
      .map_err(|_| Error::SizeOverflow { field: "boot image sector count" })?;
    Ok(Self {
      bootable: true,
      media_type: BootMediaType::NoEmulation,
      load_segment: 0,
      system_type: 0,
      sector_count,
      data,
      selection_criteria: None,
    })
  }
}

/// Additional platform section of a boot catalog.
#[derive(Debug, Clone)]
pub struct BootSection {
  pub platform_id: PlatformId,
  pub entries: Vec<BootEntry>,
}

/// El Torito boot catalog: the validation data, the mandatory initial entry
/// and any further platform sections.
#[derive(Debug, Clone)]
pub struct BootCatalog {
  pub platform_id: PlatformId,
  /// Manufacturer/developer string of the validation entry, at most 24 bytes.
  pub id_string: String,
  pub initial_entry: BootEntry,
  pub sections: Vec<BootSection>,
}

impl BootCatalog {
  pub fn new(platform_id: PlatformId, id_string: &str, initial_entry: BootEntry) -> Self {
    Self {
      platform_id,
      id_string: id_string.to_string(),
      initial_entry,
      sections: Vec::new(),
    }
  }
}
