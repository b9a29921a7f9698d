use super::*;

/// Byte order in which every multi-byte field of a trace is encoded.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize)]
pub enum Endianness {
  #[default]
  Little,
  Big,
}

impl Endianness {
  #[must_use]
  pub fn swapped(self) -> Self {
    match self {
      Self::Little => Self::Big,
      Self::Big => Self::Little,
    }
  }
}

/// Byte-order-aware primitive reader over one seekable trace part.
#[derive(Debug)]
pub struct TraceReader<R> {
  endianness: Endianness,
  inner: R,
  len: u64,
}

impl<R: Read + Seek> TraceReader<R> {
  /// Wraps `inner` and rewinds it to the first byte.
  ///
  /// # Errors
  ///
  /// Returns an error if the underlying source cannot be seeked.
  pub fn new(mut inner: R) -> io::Result<Self> {
    let len = inner.seek(SeekFrom::End(0))?;
    inner.seek(SeekFrom::Start(0))?;

    Ok(Self {
      endianness: Endianness::Little,
      inner,
      len,
    })
  }

  /// Wraps `inner` keeping a byte order detected on an earlier part.
  ///
  /// # Errors
  ///
  /// Returns an error if the underlying source cannot be seeked.
  pub fn with_endianness(
    inner: R,
    endianness: Endianness,
  ) -> io::Result<Self> {
    let mut reader = Self::new(inner)?;
    reader.endianness = endianness;
    Ok(reader)
  }

  #[must_use]
  pub fn endianness(&self) -> Endianness {
    self.endianness
  }

  #[must_use]
  pub fn len(&self) -> u64 {
    self.len
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// # Errors
  ///
  /// Returns an error if the current offset cannot be queried.
  pub fn position(&mut self) -> io::Result<u64> {
    self.inner.stream_position()
  }

  /// # Errors
  ///
  /// Returns an error if the value cannot be read.
  pub fn read_i32(&mut self) -> io::Result<i32> {
    match self.endianness {
      Endianness::Little => self.inner.read_i32::<LittleEndian>(),
      Endianness::Big => self.inner.read_i32::<BigEndian>(),
    }
  }

  /// Reads a length-prefixed string, trimming trailing NULs.
  ///
  /// The length is checked against the bytes left in the part before any
  /// buffer is allocated, so a corrupt prefix fails as truncation instead of
  /// a huge allocation.
  ///
  /// # Errors
  ///
  /// Returns an error if the prefix or the payload cannot be read.
  pub fn read_string(&mut self) -> io::Result<String> {
    let declared = u64::from(self.read_u32()?);
    let remaining = self.len.saturating_sub(self.position()?);

    if declared > remaining {
      return Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("string of {declared} bytes exceeds {remaining} remaining"),
      ));
    }

    let declared = usize::try_from(declared)
      .map_err(|_| io::Error::other("string length exceeds usize"))?;

    let mut buffer = vec![0; declared];
    self.inner.read_exact(&mut buffer)?;

    let trimmed = buffer
      .iter()
      .rposition(|byte| *byte != 0)
      .map_or(0, |last| last + 1);

    Ok(String::from_utf8_lossy(&buffer[..trimmed]).into_owned())
  }

  /// # Errors
  ///
  /// Returns an error if the value cannot be read.
  pub fn read_u32(&mut self) -> io::Result<u32> {
    match self.endianness {
      Endianness::Little => self.inner.read_u32::<LittleEndian>(),
      Endianness::Big => self.inner.read_u32::<BigEndian>(),
    }
  }

  /// # Errors
  ///
  /// Returns an error if the value cannot be read.
  pub fn read_u64(&mut self) -> io::Result<u64> {
    match self.endianness {
      Endianness::Little => self.inner.read_u64::<LittleEndian>(),
      Endianness::Big => self.inner.read_u64::<BigEndian>(),
    }
  }

  /// # Errors
  ///
  /// Returns an error if the value cannot be read.
  pub fn read_u8(&mut self) -> io::Result<u8> {
    self.inner.read_u8()
  }

  /// # Errors
  ///
  /// Returns an error if the seek fails.
  pub fn seek_to(&mut self, offset: u64) -> io::Result<()> {
    self.inner.seek(SeekFrom::Start(offset))?;
    Ok(())
  }

  pub fn set_endianness(&mut self, endianness: Endianness) {
    self.endianness = endianness;
  }
}

/// Opens the numbered parts of a multi-part recording.
///
/// Part 0 holds the header, the first run of tokens and every table. Later
/// parts hold nothing but tokens.
pub trait PartSource {
  type Part: Read + Seek;

  /// # Errors
  ///
  /// Returns an error if part `index` does not exist or cannot be opened.
  fn open_part(&mut self, index: u64) -> io::Result<Self::Part>;
}

/// Parts stored next to each other on disk as `trace.ext`, `trace.m1`, ...
#[derive(Debug, Clone)]
pub struct FileParts {
  base: PathBuf,
}

impl FileParts {
  #[must_use]
  pub fn new(base: impl Into<PathBuf>) -> Self {
    Self { base: base.into() }
  }

  #[must_use]
  pub fn part_path(&self, index: u64) -> PathBuf {
    if index == 0 {
      self.base.clone()
    } else {
      self.base.with_extension(format!("m{index}"))
    }
  }
}

impl PartSource for FileParts {
  type Part = Cursor<Mmap>;

  fn open_part(&mut self, index: u64) -> io::Result<Self::Part> {
    let path = self.part_path(index);
    let file = File::open(&path)?;

    // SAFETY: the mapping is read-only and the recording is not modified
    // while it is being loaded.
    let mmap = unsafe { Mmap::map(&file)? };

    debug!(
      part = index,
      path = %path.display(),
      bytes = mmap.len(),
      "mapped trace part"
    );

    Ok(Cursor::new(mmap))
  }
}

/// In-memory parts, used for buffers that were never written to disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryParts {
  parts: Vec<Arc<[u8]>>,
}

impl MemoryParts {
  #[must_use]
  pub fn new<I, B>(parts: I) -> Self
  where
    I: IntoIterator<Item = B>,
    B: Into<Arc<[u8]>>,
  {
    Self {
      parts: parts.into_iter().map(Into::into).collect(),
    }
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.parts.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.parts.is_empty()
  }
}

impl PartSource for MemoryParts {
  type Part = Cursor<Arc<[u8]>>;

  fn open_part(&mut self, index: u64) -> io::Result<Self::Part> {
    usize::try_from(index)
      .ok()
      .and_then(|index| self.parts.get(index))
      .map(|part| Cursor::new(Arc::clone(part)))
      .ok_or_else(|| {
        io::Error::new(
          io::ErrorKind::NotFound,
          format!("no in-memory trace part {index}"),
        )
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn reader(bytes: &[u8]) -> TraceReader<Cursor<Vec<u8>>> {
    TraceReader::new(Cursor::new(bytes.to_vec())).expect("seekable cursor")
  }

  #[test]
  fn reads_in_both_byte_orders() {
    let bytes = [0x01, 0x02, 0x03, 0x04];

    let mut little = reader(&bytes);
    assert_eq!(little.read_u32().expect("u32"), 0x0403_0201);

    let mut big = reader(&bytes);
    big.set_endianness(Endianness::Big);
    assert_eq!(big.read_u32().expect("u32"), 0x0102_0304);
  }

  #[test]
  fn strings_are_nul_trimmed() {
    let mut bytes = 6u32.to_le_bytes().to_vec();
    bytes.extend_from_slice(b"main\0\0");

    let mut reader = reader(&bytes);
    assert_eq!(reader.read_string().expect("string"), "main");
    assert_eq!(reader.position().expect("position"), 10);
  }

  #[test]
  fn oversized_string_prefix_is_truncation() {
    let mut bytes = u32::MAX.to_le_bytes().to_vec();
    bytes.extend_from_slice(b"abc");

    let err = reader(&bytes).read_string().expect_err("must fail");
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
  }

  #[test]
  fn part_paths_use_numbered_extensions() {
    let parts = FileParts::new("/captures/session.mprof");

    assert_eq!(parts.part_path(0), PathBuf::from("/captures/session.mprof"));
    assert_eq!(parts.part_path(1), PathBuf::from("/captures/session.m1"));
    assert_eq!(parts.part_path(12), PathBuf::from("/captures/session.m12"));
  }

  #[test]
  fn missing_memory_part_is_not_found() {
    let mut parts = MemoryParts::new([vec![1u8, 2, 3]]);

    assert!(parts.open_part(0).is_ok());
    let err = parts.open_part(1).expect_err("only one part");
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
  }
}
