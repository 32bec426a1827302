//! Positioned byte writer with the scalar and string encodings of ECMA-119.

use crate::error::{Error, Result};
use crate::spec::{RecordTimestamp, VolumeTimestamp, SECTOR_SIZE};
use std::io::{Seek, SeekFrom, Write};

/// Restricted alphabets for identifier fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterSet {
  /// `0-9 A-Z _`
  DCharacters,
  /// d-characters plus space and `!"%&'()*+,-./:;<=>?`
  ACharacters,
  /// d-characters plus `.` and `;`
  DSeparators,
}

impl CharacterSet {
  pub fn allows(self, byte: u8) -> bool {
    let d = byte.is_ascii_uppercase() || byte.is_ascii_digit() || byte == b'_';
    match self {
      CharacterSet::DCharacters => d,
      CharacterSet::ACharacters => {
        d || matches!(byte, b' ' | b'!' | b'"' | b'%'..=b'/' | b':'..=b'?')
      }
      CharacterSet::DSeparators => d || byte == b'.' || byte == b';',
    }
  }
}

/// Seekable byte sink the whole image is written through.
///
/// Keeps no shadow state of its own; the sector queries always reflect the
/// position of the underlying stream.
#[derive(Debug)]
pub struct ImageWriter<W> {
  inner: W,
}

impl<W: Write + Seek> ImageWriter<W> {
  pub fn new(inner: W) -> Self {
    Self { inner }
  }

  pub fn into_inner(self) -> W {
    self.inner
  }

  pub fn position(&mut self) -> Result<u64> {
    Ok(self.inner.stream_position()?)
  }

  pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
    Ok(self.inner.write_all(bytes)?)
  }

  pub fn write_u8(&mut self, value: u8) -> Result<()> {
    self.write_bytes(&[value])
  }

  pub fn write_i8(&mut self, value: i8) -> Result<()> {
    self.write_bytes(&[value as u8])
  }

  pub fn write_u16_le(&mut self, value: u16) -> Result<()> {
    self.write_bytes(&value.to_le_bytes())
  }

  pub fn write_u16_be(&mut self, value: u16) -> Result<()> {
    self.write_bytes(&value.to_be_bytes())
  }

  /// Little-endian form immediately followed by big-endian form.
  pub fn write_u16_both(&mut self, value: u16) -> Result<()> {
    self.write_u16_le(value)?;
    self.write_u16_be(value)
  }

  pub fn write_u32_le(&mut self, value: u32) -> Result<()> {
    self.write_bytes(&value.to_le_bytes())
  }

  pub fn write_u32_be(&mut self, value: u32) -> Result<()> {
    self.write_bytes(&value.to_be_bytes())
  }

  /// Little-endian form immediately followed by big-endian form.
  pub fn write_u32_both(&mut self, value: u32) -> Result<()> {
    self.write_u32_le(value)?;
    self.write_u32_be(value)
  }

  pub fn write_zeros(&mut self, count: u64) -> Result<()> {
    const ZEROS: [u8; 512] = [0; 512];
    let mut remaining = count;
    while remaining > 0 {
      let chunk = remaining.min(ZEROS.len() as u64) as usize;
      self.write_bytes(&ZEROS[..chunk])?;
      remaining -= chunk as u64;
    }
    Ok(())
  }

  /// Fixed-length string field padded with spaces.
  pub fn write_padded_str(&mut self, value: &str, length: usize, set: CharacterSet) -> Result<()> {
    self.write_padded_str_with(value, length, set, b' ')
  }

  /// Fixed-length string field with an explicit padding byte. Fails when the
  /// value is longer than the field or uses a character outside `set`.
  pub fn write_padded_str_with(
    &mut self,
    value: &str,
    length: usize,
    set: CharacterSet,
    pad: u8,
  ) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > length {
      return Err(Error::InvalidArgument {
        name: value.to_string(),
        reason: format!("longer than {length} bytes"),
      });
    }
    if let Some(&bad) = bytes.iter().find(|&&b| !set.allows(b)) {
      return Err(Error::InvalidArgument {
        name: value.to_string(),
        reason: format!("character {:?} not allowed in this field", bad as char),
      });
    }
    let mut field = vec![pad; length];
    field[..bytes.len()].copy_from_slice(bytes);
    self.write_bytes(&field)
  }

  /// File identifier field (d-characters plus separators).
  pub fn write_file_identifier(&mut self, value: &str, length: usize) -> Result<()> {
    self.write_padded_str(value, length, CharacterSet::DSeparators)
  }

  /// 17-byte digit form; an absent value is sixteen `'0'` digits and a zero
  /// offset byte.
  pub fn write_volume_timestamp(&mut self, ts: Option<&VolumeTimestamp>) -> Result<()> {
    match ts {
      Some(ts) => {
        let digits = format!(
          "{:04}{:02}{:02}{:02}{:02}{:02}{:02}",
          ts.year, ts.month, ts.day, ts.hour, ts.minute, ts.second, ts.hundredths
        );
        self.write_bytes(digits.as_bytes())?;
        self.write_i8(ts.gmt_offset)
      }
      None => {
        self.write_bytes(&[b'0'; 16])?;
        self.write_i8(0)
      }
    }
  }

  /// 7-byte numerical form of a directory record.
  pub fn write_record_timestamp(&mut self, ts: &RecordTimestamp) -> Result<()> {
    self.write_bytes(&[
      ts.years_since_1900,
      ts.month,
      ts.day,
      ts.hour,
      ts.minute,
      ts.second,
    ])?;
    self.write_i8(ts.gmt_offset)
  }

  pub fn current_sector(&mut self) -> Result<u32> {
    let sector = self.position()? / SECTOR_SIZE;
    u32::try_from(sector).map_err(|_| Error::SizeOverflow { field: "sector number" })
  }

  pub fn at_sector_start(&mut self) -> Result<bool> {
    Ok(self.position()? % SECTOR_SIZE == 0)
  }

  pub fn seek_to(&mut self, position: u64) -> Result<()> {
    self.inner.seek(SeekFrom::Start(position))?;
    Ok(())
  }

  pub fn seek_to_sector(&mut self, sector: u32) -> Result<()> {
    self.seek_to(u64::from(sector) * SECTOR_SIZE)
  }

  /// Rounds the position up to the next sector boundary; a position already
  /// on a boundary stays put.
  pub fn seek_to_next_sector(&mut self) -> Result<()> {
    let position = self.position()?;
    self.seek_to(position.div_ceil(SECTOR_SIZE) * SECTOR_SIZE)
  }

  pub fn advance_sectors(&mut self, count: u32) -> Result<()> {
    let position = self.position()?;
    let target = position
      .checked_add(u64::from(count) * SECTOR_SIZE)
      .ok_or(Error::SizeOverflow { field: "stream position" })?;
    self.seek_to(target)
  }

  pub fn seek_to_end(&mut self) -> Result<u64> {
    Ok(self.inner.seek(SeekFrom::End(0))?)
  }

  /// Runs `action` and restores the starting position afterwards, on both
  /// the success and the error path.
  pub fn preserving_location<T>(
    &mut self,
    action: impl FnOnce(&mut Self) -> Result<T>,
  ) -> Result<T> {
    let saved = self.position()?;
    let outcome = action(self);
    let restored = self.seek_to(saved);
    match outcome {
      Ok(value) => {
        restored?;
        Ok(value)
      }
      Err(err) => Err(err),
    }
  }
}
