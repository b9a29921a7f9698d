//! Synthetic trace writer.
//!
//! Produces byte-exact traces in any supported version and byte order. It is
//! what the test suite uses for fixtures, and it is handy for reproducing a
//! problematic capture by hand.

use {super::*, byteorder::ByteOrder, std::path::Path};

#[derive(Debug, Clone, Copy)]
struct AddressRecord {
  file: i32,
  function: i32,
  line: i32,
  program_counter: u64,
}

#[derive(Debug, Clone)]
enum TokenRecord {
  Event(AllocationEvent),
  Raw(Vec<u8>),
}

struct Encoder {
  bytes: Vec<u8>,
  endianness: Endianness,
}

impl Encoder {
  fn i32(&mut self, value: i32) {
    let mut buffer = [0; 4];
    match self.endianness {
      Endianness::Little => LittleEndian::write_i32(&mut buffer, value),
      Endianness::Big => BigEndian::write_i32(&mut buffer, value),
    }
    self.bytes.extend_from_slice(&buffer);
  }

  fn new(endianness: Endianness) -> Self {
    Self {
      bytes: Vec::new(),
      endianness,
    }
  }

  fn string(&mut self, value: &str) {
    self.u32(u32::try_from(value.len()).unwrap_or(u32::MAX));
    self.bytes.extend_from_slice(value.as_bytes());
  }

  fn u32(&mut self, value: u32) {
    let mut buffer = [0; 4];
    match self.endianness {
      Endianness::Little => LittleEndian::write_u32(&mut buffer, value),
      Endianness::Big => BigEndian::write_u32(&mut buffer, value),
    }
    self.bytes.extend_from_slice(&buffer);
  }

  fn u64(&mut self, value: u64) {
    let mut buffer = [0; 8];
    match self.endianness {
      Endianness::Little => LittleEndian::write_u64(&mut buffer, value),
      Endianness::Big => BigEndian::write_u64(&mut buffer, value),
    }
    self.bytes.extend_from_slice(&buffer);
  }

  fn u8(&mut self, value: u8) {
    self.bytes.push(value);
  }

  fn width(&mut self, wide: bool, value: u64) {
    if wide {
      self.u64(value);
    } else {
      self.u32(u32::try_from(value).unwrap_or(u32::MAX));
    }
  }
}

/// Builder for a complete multi-part trace.
#[derive(Debug, Clone)]
pub struct TraceWriter {
  addresses: Vec<AddressRecord>,
  callstacks: Vec<Vec<u32>>,
  declared_parts: Option<u32>,
  endianness: Endianness,
  executable_name: String,
  names: Vec<String>,
  parts: Vec<Vec<TokenRecord>>,
  platform: Platform,
  platform_name: String,
  script_callstacks: Vec<Vec<i32>>,
  script_names: Vec<String>,
  script_recording: bool,
  symbol_info: bool,
  version: u32,
}

impl Default for TraceWriter {
  fn default() -> Self {
    Self {
      addresses: Vec::new(),
      callstacks: Vec::new(),
      declared_parts: None,
      endianness: Endianness::Little,
      executable_name: String::new(),
      names: Vec::new(),
      parts: vec![Vec::new()],
      platform: Platform::Windows64,
      platform_name: "Windows64".to_string(),
      script_callstacks: Vec::new(),
      script_names: Vec::new(),
      script_recording: true,
      symbol_info: true,
      version: CURRENT_VERSION,
    }
  }
}

impl TraceWriter {
  /// Adds an address record, with its name indices in on-disk order.
  #[must_use]
  pub fn address(
    mut self,
    program_counter: u64,
    file: i32,
    function: i32,
    line: i32,
  ) -> Self {
    self.addresses.push(AddressRecord {
      file,
      function,
      line,
      program_counter,
    });
    self
  }

  /// Adds a callstack, leaf frame first.
  #[must_use]
  pub fn callstack<I>(mut self, addresses: I) -> Self
  where
    I: IntoIterator<Item = u32>,
  {
    self.callstacks.push(addresses.into_iter().collect());
    self
  }

  /// Overrides the part count written to the header, which otherwise
  /// matches the number of parts actually produced.
  #[must_use]
  pub fn declared_parts(mut self, parts: u32) -> Self {
    self.declared_parts = Some(parts);
    self
  }

  #[must_use]
  pub fn endianness(mut self, endianness: Endianness) -> Self {
    self.endianness = endianness;
    self
  }

  /// Closes the current part with an `EndOfFile` token.
  pub fn end_part(&mut self) {
    self.push(&AllocationEvent::EndOfFile);
    self.parts.push(Vec::new());
  }

  #[must_use]
  pub fn executable_name(mut self, name: impl Into<String>) -> Self {
    self.executable_name = name.into();
    self
  }

  /// Encodes every part. Part 0 carries the header and all tables.
  #[must_use]
  pub fn finish(self) -> Vec<Vec<u8>> {
    let header = self.header();

    let mut first = self.encode_header(&header);
    first.extend(self.encode_tokens(0));
    first.extend(self.encode_names());
    first.extend(self.encode_addresses());
    first.extend(self.encode_callstacks());

    if self.script_tables() {
      first.extend(self.encode_script_callstacks());
      first.extend(self.encode_script_names());
    }

    let mut parts = vec![first];
    parts.extend(
      (1..self.parts.len()).map(|index| self.encode_tokens(index)),
    );
    parts
  }

  /// The header [`TraceHeader::read`] will report for [`Self::finish`].
  #[must_use]
  pub fn header(&self) -> TraceHeader {
    let layout = self.layout();

    let num_data_files = if layout.part_count {
      let produced = u32::try_from(self.parts.len()).unwrap_or(u32::MAX);
      u64::from(self.declared_parts.unwrap_or(produced).max(1))
    } else {
      1
    };

    let mut header = TraceHeader {
      addresses: TableLocation {
        entries: self.addresses.len() as u64,
        offset: 0,
      },
      callstacks: TableLocation {
        entries: self.callstacks.len() as u64,
        offset: 0,
      },
      endianness: self.endianness,
      executable_name: self.executable_name.clone(),
      names: TableLocation {
        entries: self.names.len() as u64,
        offset: 0,
      },
      num_data_files,
      platform: self.platform,
      platform_name: self.platform_name.clone(),
      script_tables: self.script_tables().then(ScriptTables::default),
      serializes_symbol_info: self.symbol_info,
      token_stream_offset: 0,
      version: self.version,
    };

    header.token_stream_offset = self.encode_header(&header).len() as u64;

    let mut offset =
      header.token_stream_offset + self.encode_tokens(0).len() as u64;

    header.names.offset = offset;
    offset += self.encode_names().len() as u64;

    header.addresses.offset = offset;
    offset += self.encode_addresses().len() as u64;

    header.callstacks.offset = offset;
    offset += self.encode_callstacks().len() as u64;

    if let Some(script) = header.script_tables.as_mut() {
      script.callstack_table_offset = offset;
      offset += self.encode_script_callstacks().len() as u64;
      script.name_table_offset = offset;
    }

    header
  }

  /// Adds a name table entry.
  #[must_use]
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.names.push(name.into());
    self
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn platform(
    mut self,
    platform: Platform,
    name: impl Into<String>,
  ) -> Self {
    self.platform = platform;
    self.platform_name = name.into();
    self
  }

  /// Appends a token to the current part.
  pub fn push(&mut self, event: &AllocationEvent) {
    self.current_part().push(TokenRecord::Event(*event));
  }

  /// Appends raw bytes to the current part's token region.
  pub fn push_raw(&mut self, bytes: &[u8]) {
    self.current_part().push(TokenRecord::Raw(bytes.to_vec()));
  }

  /// Adds a script callstack of script-name indices.
  #[must_use]
  pub fn script_callstack<I>(mut self, frames: I) -> Self
  where
    I: IntoIterator<Item = i32>,
  {
    self.script_callstacks.push(frames.into_iter().collect());
    self
  }

  #[must_use]
  pub fn script_name(mut self, name: impl Into<String>) -> Self {
    self.script_names.push(name.into());
    self
  }

  /// Whether address records carry file, function and line.
  #[must_use]
  pub fn symbol_info(mut self, enabled: bool) -> Self {
    self.symbol_info = enabled;
    self
  }

  /// Versions outside the supported range are written with the current
  /// layout, which is how unreadable fixtures are produced.
  #[must_use]
  pub fn version(mut self, version: u32) -> Self {
    self.version = version;
    self
  }

  /// Writes unset script table offsets, the way a v3 or v4 capture taken
  /// without script callstacks does. Tokens then carry no script fields.
  #[must_use]
  pub fn without_script_callstacks(mut self) -> Self {
    self.script_recording = false;
    self
  }

  /// Writes every part next to `base`, named the way [`FileParts`] expects.
  ///
  /// # Errors
  ///
  /// Returns an error if any part cannot be written.
  pub fn write_files(self, base: impl AsRef<Path>) -> io::Result<Vec<PathBuf>> {
    let parts = FileParts::new(base.as_ref());

    self
      .finish()
      .into_iter()
      .zip(0u64..)
      .map(|(bytes, index)| {
        let path = parts.part_path(index);
        std::fs::write(&path, bytes)?;
        Ok(path)
      })
      .collect()
  }

  fn current_part(&mut self) -> &mut Vec<TokenRecord> {
    if self.parts.is_empty() {
      self.parts.push(Vec::new());
    }

    let last = self.parts.len() - 1;
    &mut self.parts[last]
  }

  fn encode_addresses(&self) -> Vec<u8> {
    let mut encoder = Encoder::new(self.endianness);

    for address in &self.addresses {
      encoder.u64(address.program_counter);

      if self.symbol_info {
        encoder.i32(address.file);
        encoder.i32(address.function);
        encoder.i32(address.line);
      }
    }

    encoder.bytes
  }

  fn encode_callstacks(&self) -> Vec<u8> {
    let mut encoder = Encoder::new(self.endianness);

    for callstack in &self.callstacks {
      encoder.u32(u32::try_from(callstack.len()).unwrap_or(u32::MAX));
      for address in callstack {
        encoder.u32(*address);
      }
    }

    encoder.bytes
  }

  fn encode_event(&self, encoder: &mut Encoder, event: &AllocationEvent) {
    encoder.u8(event.token_type().to_u8());

    match *event {
      AllocationEvent::Malloc {
        callstack,
        pointer,
        pool,
        script,
        size,
      } => {
        encoder.u64(pointer);
        encoder.u32(size);
        encoder.u32(callstack);
        encoder.u8(pool.bits());
        self.encode_script(encoder, script);
      }
      AllocationEvent::Free { pointer } => encoder.u64(pointer),
      AllocationEvent::Realloc {
        callstack,
        new_pointer,
        old_pointer,
        pool,
        script,
        size,
      } => {
        encoder.u64(old_pointer);
        encoder.u64(new_pointer);
        encoder.u32(size);
        encoder.u32(callstack);
        encoder.u8(pool.bits());
        self.encode_script(encoder, script);
      }
      other => {
        let payload = match other {
          AllocationEvent::FrameMarker { delta_seconds } => {
            u64::from(delta_seconds.to_bits())
          }
          AllocationEvent::SnapshotMarker { tag, .. }
          | AllocationEvent::TextMarker { tag } => u64::from(tag),
          AllocationEvent::StatPayload { value, .. } => value,
          _ => 0,
        };

        encoder.u8(other.subtype().map_or(0, Subtype::to_u8));
        encoder.u64(payload);
      }
    }
  }

  fn encode_header(&self, header: &TraceHeader) -> Vec<u8> {
    let layout = self.layout();
    let mut encoder = Encoder::new(self.endianness);

    encoder.u32(TRACE_MAGIC);
    encoder.u32(header.version);
    encoder.string(&header.platform_name);
    encoder.u32(header.platform.id());
    encoder.u32(u32::from(header.serializes_symbol_info));

    for table in [header.names, header.addresses, header.callstacks] {
      encoder.width(layout.wide_tables, table.offset);
      encoder.width(layout.wide_tables, table.entries);
    }

    if layout.part_count {
      encoder.u32(u32::try_from(header.num_data_files).unwrap_or(u32::MAX));
    }

    if layout.script_tables {
      match header.script_tables {
        Some(script) => {
          encoder.width(false, script.callstack_table_offset);
          encoder.width(false, script.name_table_offset);
        }
        None => {
          encoder.u32(NO_SCRIPT_TABLE);
          encoder.u32(NO_SCRIPT_TABLE);
        }
      }
    }

    encoder.string(&header.executable_name);

    encoder.bytes
  }

  fn encode_names(&self) -> Vec<u8> {
    let mut encoder = Encoder::new(self.endianness);

    for name in &self.names {
      encoder.string(name);
    }

    encoder.bytes
  }

  fn encode_script(&self, encoder: &mut Encoder, script: ScriptContext) {
    if self.script_tables() {
      let (callstack, object_type) = script.to_raw();
      encoder.i32(callstack);
      encoder.i32(object_type);
    }
  }

  fn encode_script_callstacks(&self) -> Vec<u8> {
    let mut encoder = Encoder::new(self.endianness);

    encoder.u32(u32::try_from(self.script_callstacks.len()).unwrap_or(0));

    for callstack in &self.script_callstacks {
      encoder.u32(u32::try_from(callstack.len()).unwrap_or(0));
      for frame in callstack {
        encoder.i32(*frame);
      }
    }

    encoder.bytes
  }

  fn encode_script_names(&self) -> Vec<u8> {
    let mut encoder = Encoder::new(self.endianness);

    encoder.u32(u32::try_from(self.script_names.len()).unwrap_or(0));

    for name in &self.script_names {
      encoder.string(name);
    }

    encoder.bytes
  }

  fn encode_tokens(&self, part: usize) -> Vec<u8> {
    let mut encoder = Encoder::new(self.endianness);

    for token in self.parts.get(part).into_iter().flatten() {
      match token {
        TokenRecord::Event(event) => self.encode_event(&mut encoder, event),
        TokenRecord::Raw(bytes) => encoder.bytes.extend_from_slice(bytes),
      }
    }

    encoder.bytes
  }

  fn layout(&self) -> HeaderLayout {
    HeaderLayout::for_version(self.version).unwrap_or(HeaderLayout {
      part_count: false,
      script_tables: false,
      wide_tables: true,
    })
  }

  fn script_tables(&self) -> bool {
    self.script_recording && self.layout().script_tables
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tables_follow_the_tokens_of_part_zero() {
    let mut writer = TraceWriter::new().name("main").callstack([0]);
    writer.push(&AllocationEvent::free(0x10));
    writer.push(&AllocationEvent::EndOfStream);

    let header = writer.header();

    assert_eq!(
      header.names.offset,
      header.token_stream_offset + 9 + 10,
      "free token is 9 bytes, end of stream is 10"
    );
    assert_eq!(header.addresses.offset, header.names.offset + 8);

    let parts = writer.finish();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].len() as u64, header.callstacks.offset + 8);
  }

  #[test]
  fn narrow_versions_write_the_part_count() {
    let mut writer = TraceWriter::new().version(1);
    writer.end_part();
    writer.end_part();

    assert_eq!(writer.header().num_data_files, 3);
    assert_eq!(writer.clone().declared_parts(7).header().num_data_files, 7);
    assert_eq!(writer.version(5).header().num_data_files, 1);
  }
}
