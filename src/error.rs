use super::*;

/// Fatal conditions that abort a trace load.
///
/// A load that fails with any of these returns no partial catalog. Recoverable
/// oddities in the token stream are counted in [`AnomalyCounts`] instead.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
  #[error("trace magic mismatch: found {found:#010x} in both byte orders")]
  BadMagic { found: u32 },

  #[error("unsupported trace version {0}")]
  UnsupportedVersion(u32),

  #[error("{table} table offset {offset} lies outside the {len} byte trace")]
  TableOutOfBounds {
    len: u64,
    offset: u64,
    table: &'static str,
  },

  #[error("unknown token type {token_type} at stream index {stream_index}")]
  UnknownTokenType { stream_index: u64, token_type: u8 },

  #[error("unknown token subtype {subtype} at stream index {stream_index}")]
  UnknownSubtype { stream_index: u64, subtype: u8 },

  #[error("trace asked for part {requested} but declares only {declared}")]
  TooManyParts { declared: u64, requested: u64 },

  #[error("failed to open trace part {index}")]
  MissingPart {
    index: u64,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  NameTable(#[from] NameTableError),

  #[error("i/o error while reading trace: {0}")]
  Io(#[from] io::Error),
}

impl LoadError {
  /// True when the error came from running out of bytes mid-record.
  #[must_use]
  pub fn is_truncated(&self) -> bool {
    matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn truncation_is_detected_from_io_kind() {
    let err = LoadError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
    assert!(err.is_truncated());
    assert!(!LoadError::UnsupportedVersion(9).is_truncated());
  }

  #[test]
  fn messages_carry_context() {
    let err = LoadError::TableOutOfBounds {
      len: 64,
      offset: 4096,
      table: "name",
    };

    assert_eq!(
      err.to_string(),
      "name table offset 4096 lies outside the 64 byte trace"
    );
  }
}
