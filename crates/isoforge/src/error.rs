//! Error type shared across the builder.

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("invalid name {name:?}: {reason}")]
  InvalidArgument { name: String, reason: String },
  #[error("cannot find an unused identifier for {name:?}")]
  ConflictUnresolvable { name: String },
  #[error("directory {name:?} exceeds the nesting limit of {limit} levels")]
  DepthExceeded { name: String, limit: u8 },
  #[error("unsupported configuration: {0}")]
  Unsupported(&'static str),
  #[error("inconsistent model: {0}")]
  ModelInconsistent(String),
  #[error("builder state error: {0}")]
  BuilderState(String),
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("walkdir error: {0}")]
  Walk(#[from] walkdir::Error),
  #[error("contents of {name:?} changed while the image was being written")]
  ContentRace { name: String },
  #[error("{field} does not fit its on-disk width")]
  SizeOverflow { field: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
