//! Bootable ISO 9660 (ECMA-119) disk image builder with El Torito support.
//!
//! The crate turns an in-memory description of one or more volumes into a
//! finished disk image. Names are canonicalised to interchange-level
//! identifiers first, every structure is then assigned a sector, and the
//! emitter finally writes volume descriptors, path tables, directory
//! extents, file extents and the boot catalog with their cross-references
//! resolved.
//!
//! ```no_run
//! use isoforge::{EntryAttributes, FileSource, ImageBuilder, ImageOptions, Volume};
//!
//! # fn main() -> isoforge::Result<()> {
//! let mut volume = Volume::new("EXAMPLE");
//! let root = volume.tree.root();
//! volume.tree.add_file(
//!   root,
//!   "hello.txt",
//!   FileSource::Memory(b"hi".to_vec()),
//!   EntryAttributes::empty(),
//! )?;
//!
//! let mut builder = ImageBuilder::new(ImageOptions::default())?;
//! builder.set_primary(volume);
//! let file = std::fs::File::create("example.iso")?;
//! builder.build(std::io::BufWriter::new(file))?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
mod emit;
pub mod error;
mod layout;
pub mod model;
mod names;
pub mod scan;
pub mod spec;
pub mod writer;

pub use builder::{
  CompatibilityFlags, CompatibilityLevel, Extensions, ImageBuilder, ImageOptions, TrackMode,
};
pub use error::{Error, Result};
pub use model::{
  BootCatalog, BootEntry, BootMediaType, BootSection, DirTree, EntryAttributes, FileSource,
  NodeId, PlatformId, Volume, VolumeProperties,
};
pub use scan::scan_directory;
