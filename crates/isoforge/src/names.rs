//! Canonicalisation of host names into on-disk identifiers.
//!
//! Runs once per volume before anything is allocated. Each directory is
//! processed depth-first: non-associated entries derive and claim an
//! identifier (resolving collisions through `~N` aliases when allowed),
//! associated entries then borrow the identifier of their primary sibling,
//! and finally the children are ordered the way the directory extent and the
//! path table will record them.

use crate::builder::{CompatibilityFlags, CompatibilityLevel, ImageOptions};
use crate::error::{Error, Result};
use crate::model::{DirTree, EntryAttributes, MappedName, NodeId};
use std::collections::HashMap;

/// Longest name portion at interchange level 1.
const LEVEL1_NAME_MAX: usize = 8;
/// Longest extension portion at interchange level 1.
const LEVEL1_EXTENSION_MAX: usize = 3;
/// name + extension cap for files at every level.
const FILE_NAME_MAX: usize = 30;
/// Identifier cap for directories above level 1.
const DIRECTORY_IDENTIFIER_MAX: usize = 31;
/// Deepest directory level under LIMIT_DIRECTORIES; the root is level 1.
const DIRECTORY_LEVEL_LIMIT: u8 = 8;
/// Longest full path in bytes.
const PATH_MAX: usize = 255;
/// Largest file version a `;` suffix may carry.
const VERSION_MAX: u32 = 32767;

pub(crate) fn canonicalise_tree(tree: &mut DirTree, options: &ImageOptions) -> Result<()> {
  log::debug!("canonicalising names; records will be sorted by identifier (ECMA-119 9.3)");
  map_directory(tree, tree.root(), 0, 1, options)
}

fn map_directory(
  tree: &mut DirTree,
  dir: NodeId,
  parent_path_len: usize,
  level: u8,
  options: &ImageOptions,
) -> Result<()> {
  let children: Vec<NodeId> = tree.children(dir).to_vec();

  // Non-associated entries claim identifiers first.
  let mut taken: Vec<String> = Vec::with_capacity(children.len());
  for &child in &children {
    let node = tree.node(child);
    if node.attributes.contains(EntryAttributes::ASSOCIATED) {
      continue;
    }
    let derived = derive_name(node.name.as_str(), tree.is_directory(child), options)?;
    let text = resolve_conflict(node.name.as_str(), &derived, &taken, options)?;
    if parent_path_len + text.len() > PATH_MAX {
      return Err(Error::InvalidArgument {
        name: text,
        reason: format!("full path longer than {PATH_MAX} bytes"),
      });
    }
    taken.push(text.clone());
    tree.node_mut(child).mapped = Some(MappedName {
      identifier: text.clone().into_bytes(),
      text,
    });
  }

  // Associated entries borrow the identifier of the non-associated sibling
  // with the same source name.
  let mut primaries: HashMap<String, MappedName> = HashMap::new();
  for &child in &children {
    let node = tree.node(child);
    if !node.attributes.contains(EntryAttributes::ASSOCIATED) {
      if let Some(mapped) = &node.mapped {
        primaries.insert(node.name.as_str().to_string(), mapped.clone());
      }
    }
  }
  for &child in &children {
    let node = tree.node(child);
    if !node.attributes.contains(EntryAttributes::ASSOCIATED) {
      continue;
    }
    let mapped = primaries.get(node.name.as_str()).cloned().ok_or_else(|| {
      Error::ModelInconsistent(format!(
        "associated file {:?} has no primary sibling",
        node.name.as_str()
      ))
    })?;
    tree.node_mut(child).mapped = Some(mapped);
  }

  let has_subdirectories = children.iter().any(|&c| tree.is_directory(c));
  if has_subdirectories
    && level >= DIRECTORY_LEVEL_LIMIT
    && options.flags.contains(CompatibilityFlags::LIMIT_DIRECTORIES)
  {
    return Err(Error::DepthExceeded {
      name: tree.node(dir).name.as_str().to_string(),
      limit: DIRECTORY_LEVEL_LIMIT,
    });
  }

  sort_children(tree, dir);

  for &child in &children {
    if tree.is_directory(child) {
      let identifier_len = tree.mapped(child)?.identifier.len();
      map_directory(tree, child, parent_path_len + identifier_len + 1, level + 1, options)?;
    }
  }
  Ok(())
}

/// Derived pieces of an identifier before conflict resolution: the name
/// portion, the fixed suffix appended to every candidate, and the cap the
/// name portion must stay under.
struct DerivedName {
  base: String,
  suffix: String,
  name_max: usize,
}

fn derive_name(host: &str, is_directory: bool, options: &ImageOptions) -> Result<DerivedName> {
  let level1 = options.level == CompatibilityLevel::Level1;
  let fold = level1 && options.flags.contains(CompatibilityFlags::UPPER_CASE_FILE_NAMES);
  let strip_dots = options.flags.contains(CompatibilityFlags::STRIP_ILLEGAL_DOTS);
  let truncate = options.flags.contains(CompatibilityFlags::TRUNCATE_FILE_NAMES);

  let mut name = String::new();
  let mut extension = String::new();
  let mut version_digits = String::new();
  let mut seen_dot = false;
  let mut seen_semicolon = false;

  for ch in host.chars() {
    let ch = if fold { ch.to_ascii_uppercase() } else { ch };

    if ch == '.' && !seen_semicolon {
      if is_directory {
        if strip_dots {
          continue;
        }
        return Err(invalid(host, "directory names cannot contain '.'"));
      }
      if seen_dot {
        if !strip_dots {
          return Err(invalid(host, "more than one '.'"));
        }
        // Only the last dot separates the extension; fold the earlier
        // extension back into the name portion.
        name.push_str(&extension);
        extension.clear();
        continue;
      }
      seen_dot = true;
      continue;
    }

    if ch == ';' && !is_directory {
      if !seen_dot {
        return Err(invalid(host, "';' without a preceding '.'"));
      }
      if seen_semicolon {
        return Err(invalid(host, "more than one ';'"));
      }
      seen_semicolon = true;
      continue;
    }

    if seen_semicolon {
      version_digits.push(ch);
      continue;
    }

    if !accepts(ch, level1) {
      continue;
    }
    if seen_dot {
      extension.push(ch);
    } else {
      name.push(ch);
    }
  }

  let version = if seen_semicolon {
    let value: u32 = version_digits
      .parse()
      .map_err(|_| invalid(host, "version suffix is not a number"))?;
    if !(1..=VERSION_MAX).contains(&value) {
      return Err(invalid(host, "version suffix out of range"));
    }
    Some(value)
  } else {
    None
  };

  if name.is_empty() && extension.is_empty() {
    return Err(invalid(host, "no characters usable in an identifier"));
  }

  if level1 {
    if name.len() > LEVEL1_NAME_MAX {
      if !truncate {
        return Err(invalid(host, "name portion longer than 8 characters"));
      }
      name.truncate(LEVEL1_NAME_MAX);
    }
    if extension.len() > LEVEL1_EXTENSION_MAX {
      if !truncate {
        return Err(invalid(host, "extension longer than 3 characters"));
      }
      extension.truncate(LEVEL1_EXTENSION_MAX);
    }
  }

  if is_directory {
    let max = if level1 { LEVEL1_NAME_MAX } else { DIRECTORY_IDENTIFIER_MAX };
    if name.len() > max {
      if !truncate {
        return Err(invalid(host, "directory identifier too long"));
      }
      name.truncate(max);
    }
    return Ok(DerivedName {
      base: name,
      suffix: String::new(),
      name_max: max,
    });
  }

  if name.len() + extension.len() > FILE_NAME_MAX {
    if !truncate {
      return Err(invalid(host, "name and extension longer than 30 characters"));
    }
    if extension.len() >= FILE_NAME_MAX {
      extension.truncate(FILE_NAME_MAX);
      name.clear();
    } else {
      name.truncate(FILE_NAME_MAX - extension.len());
    }
  }

  let name_max = if level1 { LEVEL1_NAME_MAX } else { FILE_NAME_MAX - extension.len() };
  let suffix = format!(".{};{}", extension, version.unwrap_or(1));
  Ok(DerivedName { base: name, suffix, name_max })
}

fn accepts(ch: char, level1: bool) -> bool {
  if level1 {
    ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '_'
  } else {
    ch.is_ascii()
  }
}

fn invalid(host: &str, reason: &str) -> Error {
  Error::InvalidArgument {
    name: host.to_string(),
    reason: reason.to_string(),
  }
}

fn resolve_conflict(
  host: &str,
  derived: &DerivedName,
  taken: &[String],
  options: &ImageOptions,
) -> Result<String> {
  let acceptable = |base: &str| {
    let candidate = format!("{base}{}", derived.suffix);
    !taken.iter().any(|claimed| *claimed == candidate)
  };

  if acceptable(&derived.base) {
    return Ok(format!("{}{}", derived.base, derived.suffix));
  }
  if !options.flags.contains(CompatibilityFlags::RESOLVE_NAME_CONFLICTS) {
    return Err(Error::ConflictUnresolvable {
      name: host.to_string(),
    });
  }

  let kept = derived.base.len().min(derived.name_max.saturating_sub(2));
  for n in 1..=4u32 {
    let base = format!("{}~{}", &derived.base[..kept], n);
    if acceptable(&base) {
      log::debug!("mapped {host:?} through alias {base:?}");
      return Ok(format!("{base}{}", derived.suffix));
    }
  }

  // All four aliases taken; disambiguate with a digest of the original name.
  let digest = format!("{:04X}", short_hash(host));
  let kept = derived.base.len().min(derived.name_max.saturating_sub(6));
  for n in 1..=9u32 {
    let base = format!("{}{}~{}", &derived.base[..kept], digest, n);
    if acceptable(&base) {
      log::debug!("mapped {host:?} through alias {base:?}");
      return Ok(format!("{base}{}", derived.suffix));
    }
  }

  Err(Error::ConflictUnresolvable {
    name: host.to_string(),
  })
}

/// 16-bit digest of the original name used by the alias fallback.
fn short_hash(name: &str) -> u16 {
  let mut hash = 0u32;
  for byte in name.bytes() {
    hash = hash.wrapping_mul(31).wrapping_add(u32::from(byte));
  }
  (hash ^ (hash >> 16)) as u16
}

/// Orders children the way the directory extent and the path table record
/// them: by mapped identifier, with associated entries immediately before
/// their primary.
fn sort_children(tree: &mut DirTree, dir: NodeId) {
  let mut children = tree.children(dir).to_vec();
  children.sort_by(|&a, &b| {
    let node_a = tree.node(a);
    let node_b = tree.node(b);
    let id_a = node_a.mapped.as_ref().map(|m| m.identifier.as_slice()).unwrap_or(&[]);
    let id_b = node_b.mapped.as_ref().map(|m| m.identifier.as_slice()).unwrap_or(&[]);
    let assoc_a = !node_a.attributes.contains(EntryAttributes::ASSOCIATED);
    let assoc_b = !node_b.attributes.contains(EntryAttributes::ASSOCIATED);
    id_a.cmp(id_b).then(assoc_a.cmp(&assoc_b))
  });
  tree.set_children(dir, children);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::builder::ImageOptions;
  use crate::model::{DirTree, EntryAttributes, FileSource};

  fn options(level: CompatibilityLevel, flags: CompatibilityFlags) -> ImageOptions {
    ImageOptions {
      level,
      flags,
      ..Default::default()
    }
  }

  fn level1_relaxed() -> ImageOptions {
    options(
      CompatibilityLevel::Level1,
      CompatibilityFlags::TRUNCATE_FILE_NAMES
        | CompatibilityFlags::UPPER_CASE_FILE_NAMES
        | CompatibilityFlags::RESOLVE_NAME_CONFLICTS
        | CompatibilityFlags::STRIP_ILLEGAL_DOTS,
    )
  }

  fn add_file(tree: &mut DirTree, name: &str) -> crate::model::NodeId {
    let root = tree.root();
    tree
      .add_file(root, name, FileSource::Memory(vec![]), EntryAttributes::empty())
      .unwrap()
  }

  fn mapped_text(tree: &DirTree, id: crate::model::NodeId) -> String {
    tree.mapped(id).unwrap().text.clone()
  }

  #[test]
  fn level1_maps_to_upper_case_8_3() {
    let mut tree = DirTree::new();
    let file = add_file(&mut tree, "readme.txt");
    canonicalise_tree(&mut tree, &level1_relaxed()).unwrap();
    assert_eq!(mapped_text(&tree, file), "README.TXT;1");
  }

  #[test]
  fn explicit_version_is_kept() {
    let mut tree = DirTree::new();
    let file = add_file(&mut tree, "HELLO.TXT;1");
    canonicalise_tree(&mut tree, &level1_relaxed()).unwrap();
    assert_eq!(mapped_text(&tree, file), "HELLO.TXT;1");

    let mut tree = DirTree::new();
    let file = add_file(&mut tree, "HELLO.TXT;204");
    canonicalise_tree(&mut tree, &level1_relaxed()).unwrap();
    assert_eq!(mapped_text(&tree, file), "HELLO.TXT;204");
  }

  #[test]
  fn bad_versions_are_rejected() {
    for name in ["A.B;", "A.B;X", "A.B;0", "A.B;40000", "A;1", "A.B;1;2"] {
      let mut tree = DirTree::new();
      add_file(&mut tree, name);
      let err = canonicalise_tree(&mut tree, &level1_relaxed()).unwrap_err();
      assert!(
        matches!(err, Error::InvalidArgument { .. }),
        "{name} should be rejected"
      );
    }
  }

  #[test]
  fn surplus_dots_fold_into_the_name() {
    let mut tree = DirTree::new();
    let file = add_file(&mut tree, "a.b.c");
    canonicalise_tree(&mut tree, &level1_relaxed()).unwrap();
    assert_eq!(mapped_text(&tree, file), "AB.C;1");

    // without the strip flag a second dot is fatal
    let mut tree = DirTree::new();
    add_file(&mut tree, "a.b.c");
    let opts = options(
      CompatibilityLevel::Level1,
      CompatibilityFlags::UPPER_CASE_FILE_NAMES,
    );
    let err = canonicalise_tree(&mut tree, &opts).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
  }

  #[test]
  fn directory_dots_are_stripped_or_fatal() {
    let mut tree = DirTree::new();
    let root = tree.root();
    let dir = tree
      .add_directory(root, "my.dir", EntryAttributes::empty())
      .unwrap();
    canonicalise_tree(&mut tree, &level1_relaxed()).unwrap();
    assert_eq!(mapped_text(&tree, dir), "MYDIR");

    let mut tree = DirTree::new();
    let root = tree.root();
    tree
      .add_directory(root, "my.dir", EntryAttributes::empty())
      .unwrap();
    let opts = options(
      CompatibilityLevel::Level1,
      CompatibilityFlags::UPPER_CASE_FILE_NAMES,
    );
    assert!(canonicalise_tree(&mut tree, &opts).is_err());
  }

  #[test]
  fn long_names_truncate_only_when_allowed() {
    let mut tree = DirTree::new();
    let file = add_file(&mut tree, "My Long Document v2.final.txt");
    canonicalise_tree(&mut tree, &level1_relaxed()).unwrap();
    assert_eq!(mapped_text(&tree, file), "MYLONGDO.TXT;1");

    let mut tree = DirTree::new();
    add_file(&mut tree, "verylongname.txt");
    let opts = options(
      CompatibilityLevel::Level1,
      CompatibilityFlags::UPPER_CASE_FILE_NAMES,
    );
    assert!(canonicalise_tree(&mut tree, &opts).is_err());
  }

  #[test]
  fn level2_keeps_case_and_length_up_to_30() {
    let mut tree = DirTree::new();
    let file = add_file(&mut tree, "MixedCase_Name_123456789.data");
    let opts = options(CompatibilityLevel::Level2, CompatibilityFlags::empty());
    canonicalise_tree(&mut tree, &opts).unwrap();
    assert_eq!(mapped_text(&tree, file), "MixedCase_Name_123456789.data;1");
  }

  #[test]
  fn collisions_resolve_through_tilde_aliases() {
    let mut tree = DirTree::new();
    let first = add_file(&mut tree, "Readme.txt");
    let second = add_file(&mut tree, "README.TXT");
    canonicalise_tree(&mut tree, &level1_relaxed()).unwrap();
    assert_eq!(mapped_text(&tree, first), "README.TXT;1");
    assert_eq!(mapped_text(&tree, second), "README~1.TXT;1");
  }

  #[test]
  fn collisions_without_the_resolve_flag_are_fatal() {
    let mut tree = DirTree::new();
    add_file(&mut tree, "Readme.txt");
    add_file(&mut tree, "README.TXT");
    let opts = options(
      CompatibilityLevel::Level1,
      CompatibilityFlags::UPPER_CASE_FILE_NAMES | CompatibilityFlags::TRUNCATE_FILE_NAMES,
    );
    let err = canonicalise_tree(&mut tree, &opts).unwrap_err();
    assert!(matches!(err, Error::ConflictUnresolvable { .. }));
  }

  #[test]
  fn exhausted_tildes_fall_back_to_a_digest() {
    let mut tree = DirTree::new();
    let files: Vec<_> = (0..6)
      .map(|n| add_file(&mut tree, &format!("collision{n}.txt")))
      .collect();
    canonicalise_tree(&mut tree, &level1_relaxed()).unwrap();

    assert_eq!(mapped_text(&tree, files[0]), "COLLISIO.TXT;1");
    for (ix, &file) in files[1..5].iter().enumerate() {
      assert_eq!(mapped_text(&tree, file), format!("COLLIS~{}.TXT;1", ix + 1));
    }
    let digest_form = mapped_text(&tree, files[5]);
    assert!(digest_form.starts_with("CO"), "{digest_form}");
    assert!(digest_form.ends_with("~1.TXT;1"), "{digest_form}");
    assert_eq!(digest_form.len(), "CO0000~1.TXT;1".len());
  }

  #[test]
  fn digest_distinguishes_colliding_sources() {
    assert_ne!(short_hash("collision5.txt"), short_hash("collision6.txt"));
    assert_ne!(short_hash("aaaa"), short_hash("aaab"));
  }

  #[test]
  fn associated_files_share_their_primary_identifier() {
    let mut tree = DirTree::new();
    let root = tree.root();
    let primary = tree
      .add_file(root, "image.dat", FileSource::Memory(vec![]), EntryAttributes::empty())
      .unwrap();
    let associated = tree
      .add_file(
        root,
        "image.dat",
        FileSource::Memory(vec![]),
        EntryAttributes::ASSOCIATED,
      )
      .unwrap();
    canonicalise_tree(&mut tree, &level1_relaxed()).unwrap();
    assert_eq!(mapped_text(&tree, primary), mapped_text(&tree, associated));
    // associated entry sorts in front of its primary
    assert_eq!(tree.children(root), &[associated, primary]);
  }

  #[test]
  fn associated_file_without_a_primary_is_fatal() {
    let mut tree = DirTree::new();
    let root = tree.root();
    tree
      .add_file(
        root,
        "orphan.dat",
        FileSource::Memory(vec![]),
        EntryAttributes::ASSOCIATED,
      )
      .unwrap();
    let err = canonicalise_tree(&mut tree, &level1_relaxed()).unwrap_err();
    assert!(matches!(err, Error::ModelInconsistent(_)));
  }

  #[test]
  fn children_are_sorted_by_identifier() {
    let mut tree = DirTree::new();
    let root = tree.root();
    let b = add_file(&mut tree, "bbb.txt");
    let a = add_file(&mut tree, "aaa.txt");
    let d = tree
      .add_directory(root, "ccc", EntryAttributes::empty())
      .unwrap();
    canonicalise_tree(&mut tree, &level1_relaxed()).unwrap();
    assert_eq!(tree.children(root), &[a, b, d]);
  }

  #[test]
  fn nesting_depth_is_capped_at_eight() {
    let mut tree = DirTree::new();
    let mut parent = tree.root();
    for n in 0..9 {
      parent = tree
        .add_directory(parent, &format!("D{n}"), EntryAttributes::empty())
        .unwrap();
    }
    let opts = options(
      CompatibilityLevel::Level1,
      CompatibilityFlags::LIMIT_DIRECTORIES,
    );
    let err = canonicalise_tree(&mut tree, &opts).unwrap_err();
    assert!(matches!(err, Error::DepthExceeded { limit: 8, .. }));

    // eight levels are fine
    let mut tree = DirTree::new();
    let mut parent = tree.root();
    for n in 0..7 {
      parent = tree
        .add_directory(parent, &format!("D{n}"), EntryAttributes::empty())
        .unwrap();
    }
    canonicalise_tree(&mut tree, &opts).unwrap();
  }

  #[test]
  fn full_paths_are_capped_at_255_bytes() {
    let mut tree = DirTree::new();
    let mut parent = tree.root();
    let long = "D".repeat(31);
    for _ in 0..8 {
      parent = tree
        .add_directory(parent, &long, EntryAttributes::empty())
        .unwrap();
    }
    tree
      .add_file(parent, "A.TXT", FileSource::Memory(vec![]), EntryAttributes::empty())
      .unwrap();
    let opts = options(
      CompatibilityLevel::Level2,
      CompatibilityFlags::RESOLVE_NAME_CONFLICTS,
    );
    let err = canonicalise_tree(&mut tree, &opts).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
  }

  #[test]
  fn empty_identifiers_are_rejected() {
    let mut tree = DirTree::new();
    add_file(&mut tree, "????");
    let err = canonicalise_tree(&mut tree, &level1_relaxed()).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
  }
}
