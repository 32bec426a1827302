//! On-disk constants and value types of ECMA-119 and the El Torito extension.

use chrono::{Datelike, Offset, Timelike};

/// Logical sector size in bytes.
pub const SECTOR_SIZE: u64 = 2048;

/// Reserved sectors at the start of the image, left entirely zero.
pub const SYSTEM_AREA_SECTORS: u32 = 16;

/// Standard identifier carried by every volume descriptor.
pub const STANDARD_IDENTIFIER: &[u8; 5] = b"CD001";

/// Version byte shared by every descriptor type in this revision.
pub const DESCRIPTOR_VERSION: u8 = 1;

/// Volume descriptor type bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VolumeDescriptorType {
  BootRecord = 0,
  Primary = 1,
  Supplementary = 2,
  Terminator = 255,
}

bitflags::bitflags! {
  /// Directory record file flags.
  ///
  /// `EXISTENCE` has inverted meaning: a set bit marks the entry as hidden.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct FileFlags: u8 {
    const EXISTENCE = 1 << 0;
    const DIRECTORY = 1 << 1;
    const ASSOCIATED_FILE = 1 << 2;
    const RECORD = 1 << 3;
    const PROTECTION = 1 << 4;
    const MULTI_EXTENT = 1 << 7;
  }
}

/// Boot system identifier recorded in the El Torito boot record.
pub const EL_TORITO_SYSTEM_ID: &[u8; 23] = b"EL TORITO SPECIFICATION";

/// Header id opening the boot catalog validation entry.
pub const VALIDATION_HEADER_ID: u8 = 0x01;

/// Key bytes closing the validation entry.
pub const VALIDATION_KEY: [u8; 2] = [0x55, 0xAA];

/// Boot indicator of a bootable catalog entry.
pub const BOOT_INDICATOR_BOOTABLE: u8 = 0x88;

/// Boot indicator of a non-bootable catalog entry.
pub const BOOT_INDICATOR_NOT_BOOTABLE: u8 = 0x00;

/// Section header indicator when further headers follow.
pub const SECTION_HEADER_MORE: u8 = 0x90;

/// Section header indicator of the final header.
pub const SECTION_HEADER_FINAL: u8 = 0x91;

/// 17-byte digit-encoded date and time of a volume descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeTimestamp {
  pub year: u16,
  pub month: u8,
  pub day: u8,
  pub hour: u8,
  pub minute: u8,
  pub second: u8,
  pub hundredths: u8,
  /// Offset from GMT in 15-minute units.
  pub gmt_offset: i8,
}

impl<Tz: chrono::TimeZone> From<chrono::DateTime<Tz>> for VolumeTimestamp {
  fn from(dt: chrono::DateTime<Tz>) -> Self {
    Self {
      year: dt.year().clamp(0, 9999) as u16,
      month: dt.month() as u8,
      day: dt.day() as u8,
      hour: dt.hour() as u8,
      minute: dt.minute() as u8,
      second: dt.second() as u8,
      hundredths: (dt.timestamp_subsec_millis() / 10) as u8,
      gmt_offset: gmt_offset_quarters(&dt),
    }
  }
}

/// 7-byte numerical date and time of a directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTimestamp {
  pub years_since_1900: u8,
  pub month: u8,
  pub day: u8,
  pub hour: u8,
  pub minute: u8,
  pub second: u8,
  /// Offset from GMT in 15-minute units.
  pub gmt_offset: i8,
}

impl<Tz: chrono::TimeZone> From<chrono::DateTime<Tz>> for RecordTimestamp {
  fn from(dt: chrono::DateTime<Tz>) -> Self {
    Self {
      years_since_1900: (dt.year().clamp(1900, 2155) - 1900) as u8,
      month: dt.month() as u8,
      day: dt.day() as u8,
      hour: dt.hour() as u8,
      minute: dt.minute() as u8,
      second: dt.second() as u8,
      gmt_offset: gmt_offset_quarters(&dt),
    }
  }
}

/// Total minutes of (local - UTC) in 15-minute units, clamped to the range
/// the on-disk field can express.
fn gmt_offset_quarters<Tz: chrono::TimeZone>(dt: &chrono::DateTime<Tz>) -> i8 {
  let minutes = dt.offset().fix().local_minus_utc() / 60;
  (minutes / 15).clamp(-48, 52) as i8
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{FixedOffset, TimeZone};

  #[test]
  fn record_timestamp_counts_from_1900() {
    let dt = FixedOffset::east_opt(0)
      .unwrap()
      .with_ymd_and_hms(2024, 5, 1, 12, 30, 5)
      .unwrap();
    let ts = RecordTimestamp::from(dt);
    assert_eq!(ts.years_since_1900, 124);
    assert_eq!(ts.month, 5);
    assert_eq!(ts.day, 1);
    assert_eq!(ts.gmt_offset, 0);
  }

  #[test]
  fn gmt_offset_spans_hours_and_minutes() {
    let plus_one = FixedOffset::east_opt(3600)
      .unwrap()
      .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
      .unwrap();
    assert_eq!(RecordTimestamp::from(plus_one).gmt_offset, 4);

    let minus_three_thirty = FixedOffset::west_opt(3 * 3600 + 1800)
      .unwrap()
      .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
      .unwrap();
    assert_eq!(RecordTimestamp::from(minus_three_thirty).gmt_offset, -14);
  }

  #[test]
  fn file_flag_bits() {
    assert_eq!(FileFlags::EXISTENCE.bits(), 0x01);
    assert_eq!(FileFlags::DIRECTORY.bits(), 0x02);
    assert_eq!(FileFlags::ASSOCIATED_FILE.bits(), 0x04);
    assert_eq!(FileFlags::MULTI_EXTENT.bits(), 0x80);
  }
}
