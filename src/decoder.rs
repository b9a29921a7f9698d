use super::*;

/// Decodes one token at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenDecoder {
  script_fields: bool,
}

impl TokenDecoder {
  #[must_use]
  pub fn new(script_fields: bool) -> Self {
    Self { script_fields }
  }

  #[must_use]
  pub fn for_header(header: &TraceHeader) -> Self {
    Self::new(header.has_script_fields())
  }

  /// Reads exactly one token from `reader`.
  ///
  /// # Errors
  ///
  /// Returns [`LoadError::UnknownTokenType`] or [`LoadError::UnknownSubtype`]
  /// for bytes outside the format, and an i/o error on truncation.
  pub fn decode<R: Read + Seek>(
    &self,
    reader: &mut TraceReader<R>,
    stream_index: u64,
  ) -> Result<AllocationEvent, LoadError> {
    let token_type = reader.read_u8()?;

    let event = match TokenType::from_u8(token_type) {
      Some(TokenType::Malloc) => {
        let pointer = reader.read_u64()?;
        let size = reader.read_u32()?;
        let callstack = reader.read_u32()?;
        let pool = MemoryPools::from_bits_retain(reader.read_u8()?);
        let script = self.read_script(reader)?;

        AllocationEvent::Malloc {
          callstack,
          pointer,
          pool,
          script,
          size,
        }
      }
      Some(TokenType::Free) => AllocationEvent::Free {
        pointer: reader.read_u64()?,
      },
      Some(TokenType::Realloc) => {
        let old_pointer = reader.read_u64()?;
        let new_pointer = reader.read_u64()?;
        let size = reader.read_u32()?;
        let callstack = reader.read_u32()?;
        let pool = MemoryPools::from_bits_retain(reader.read_u8()?);
        let script = self.read_script(reader)?;

        AllocationEvent::Realloc {
          callstack,
          new_pointer,
          old_pointer,
          pool,
          script,
          size,
        }
      }
      Some(TokenType::Other) => {
        let subtype = reader.read_u8()?;
        let payload = reader.read_u64()?;

        let subtype = Subtype::from_u8(subtype).ok_or_else(|| {
          LoadError::UnknownSubtype {
            stream_index,
            subtype,
          }
        })?;

        decode_other(subtype, payload)
      }
      None => {
        return Err(LoadError::UnknownTokenType {
          stream_index,
          token_type,
        });
      }
    };

    Ok(event)
  }

  fn read_script<R: Read + Seek>(
    &self,
    reader: &mut TraceReader<R>,
  ) -> io::Result<ScriptContext> {
    if !self.script_fields {
      return Ok(ScriptContext::default());
    }

    let callstack = reader.read_i32()?;
    let object_type = reader.read_i32()?;

    Ok(ScriptContext::from_raw(callstack, object_type))
  }
}

fn decode_other(subtype: Subtype, payload: u64) -> AllocationEvent {
  match subtype {
    Subtype::EndOfStream => AllocationEvent::EndOfStream,
    Subtype::EndOfFile => AllocationEvent::EndOfFile,
    Subtype::FrameTimeMarker => AllocationEvent::FrameMarker {
      delta_seconds: f32::from_bits(low_bits(payload)),
    },
    Subtype::TextMarker => AllocationEvent::TextMarker {
      tag: low_bits(payload),
    },
    Subtype::Marker(kind) => AllocationEvent::SnapshotMarker {
      kind,
      tag: low_bits(payload),
    },
    Subtype::Stat(kind) => AllocationEvent::StatPayload {
      kind,
      value: payload,
    },
  }
}

fn low_bits(payload: u64) -> u32 {
  (payload & u64::from(u32::MAX)) as u32
}

/// Token sequence spanning every part of a recording.
///
/// The stream index grows by one per token, continuously across parts. An
/// `EndOfFile` token is yielded and then the next part is opened with the byte
/// order detected on part 0.
pub struct TokenStream<P: PartSource> {
  decoder: TokenDecoder,
  declared_parts: u64,
  finished: bool,
  next_part: u64,
  parts: P,
  reader: TraceReader<P::Part>,
  stream_index: u64,
}

impl<P: PartSource> TokenStream<P> {
  /// Positions `reader` (part 0) at the first token.
  ///
  /// # Errors
  ///
  /// Returns an error if the seek fails.
  pub fn new(
    parts: P,
    mut reader: TraceReader<P::Part>,
    header: &TraceHeader,
  ) -> Result<Self, LoadError> {
    reader.seek_to(header.token_stream_offset)?;

    Ok(Self {
      decoder: TokenDecoder::for_header(header),
      declared_parts: header.num_data_files,
      finished: false,
      next_part: 1,
      parts,
      reader,
      stream_index: 0,
    })
  }

  #[must_use]
  pub fn is_finished(&self) -> bool {
    self.finished
  }

  /// Decodes the next token, or `None` once `EndOfStream` has been yielded.
  ///
  /// # Errors
  ///
  /// Returns the first decode error, [`LoadError::TooManyParts`] when an
  /// `EndOfFile` asks for a part past the declared count, and
  /// [`LoadError::MissingPart`] when that part cannot be opened.
  pub fn next_token(
    &mut self,
  ) -> Result<Option<(u64, AllocationEvent)>, LoadError> {
    if self.finished {
      return Ok(None);
    }

    let stream_index = self.stream_index;
    let event = self.decoder.decode(&mut self.reader, stream_index)?;

    self.stream_index += 1;

    match event {
      AllocationEvent::EndOfFile => self.open_next_part(stream_index)?,
      AllocationEvent::EndOfStream => self.finished = true,
      _ => {}
    }

    Ok(Some((stream_index, event)))
  }

  fn open_next_part(&mut self, stream_index: u64) -> Result<(), LoadError> {
    let index = self.next_part;

    if index >= self.declared_parts {
      return Err(LoadError::TooManyParts {
        declared: self.declared_parts,
        requested: index,
      });
    }

    let part = self
      .parts
      .open_part(index)
      .map_err(|source| LoadError::MissingPart { index, source })?;

    self.reader = TraceReader::with_endianness(part, self.reader.endianness())?;
    self.next_part += 1;

    debug!(part = index, stream_index, "continuing in next trace part");

    Ok(())
  }

  /// Number of tokens decoded so far.
  #[must_use]
  pub fn stream_index(&self) -> u64 {
    self.stream_index
  }
}

impl<P: PartSource> Iterator for TokenStream<P> {
  type Item = Result<(u64, AllocationEvent), LoadError>;

  fn next(&mut self) -> Option<Self::Item> {
    let item = self.next_token().transpose();

    if matches!(item, Some(Err(_))) {
      self.finished = true;
    }

    item
  }
}
