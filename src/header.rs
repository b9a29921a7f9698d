use super::*;

/// Magic number leading every trace, as read in the trace's own byte order.
pub const TRACE_MAGIC: u32 = 0xDA15_F7D8;

/// Oldest format version this crate reads.
pub const MIN_VERSION: u32 = 1;

/// Newest format version this crate reads and writes.
pub const CURRENT_VERSION: u32 = 5;

/// Script table offset written by captures taken without script callstacks.
pub const NO_SCRIPT_TABLE: u32 = u32::MAX;

/// Capture platform recorded in the header.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize)]
pub enum Platform {
  #[default]
  Unknown,
  Windows32,
  Windows64,
  Xbox360,
  Ps3,
  Linux,
  Mac,
  Ios,
  Android,
}

impl Platform {
  #[must_use]
  pub fn from_id(id: u32) -> Self {
    match id {
      1 => Self::Windows32,
      2 => Self::Windows64,
      3 => Self::Xbox360,
      4 => Self::Ps3,
      5 => Self::Linux,
      6 => Self::Mac,
      7 => Self::Ios,
      8 => Self::Android,
      _ => Self::Unknown,
    }
  }

  #[must_use]
  pub fn id(self) -> u32 {
    match self {
      Self::Unknown => 0,
      Self::Windows32 => 1,
      Self::Windows64 => 2,
      Self::Xbox360 => 3,
      Self::Ps3 => 4,
      Self::Linux => 5,
      Self::Mac => 6,
      Self::Ios => 7,
      Self::Android => 8,
    }
  }

  /// Whether addresses captured on this platform carry file and line.
  #[must_use]
  pub fn has_source_locations(self) -> bool {
    !matches!(self, Self::Ios | Self::Android)
  }
}

/// Absolute offset and entry count of one bulk table.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct TableLocation {
  pub entries: u64,
  pub offset: u64,
}

/// Offsets of the script tables carried by versions 3 and 4 when the
/// capture recorded script callstacks.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct ScriptTables {
  pub callstack_table_offset: u64,
  pub name_table_offset: u64,
}

/// Field layout selected purely by the format version.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HeaderLayout {
  /// `num_data_files` is stored on disk.
  pub part_count: bool,
  /// Script table offsets follow the part count. Tokens carry script fields
  /// only when both offsets are set.
  pub script_tables: bool,
  /// Table offsets and counts are 64 bits wide.
  pub wide_tables: bool,
}

impl HeaderLayout {
  #[must_use]
  pub fn for_version(version: u32) -> Option<Self> {
    match version {
      1 | 2 => Some(Self {
        part_count: true,
        script_tables: false,
        wide_tables: false,
      }),
      3 | 4 => Some(Self {
        part_count: true,
        script_tables: true,
        wide_tables: false,
      }),
      CURRENT_VERSION => Some(Self {
        part_count: false,
        script_tables: false,
        wide_tables: true,
      }),
      _ => None,
    }
  }
}

/// Parsed trace header.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct TraceHeader {
  pub addresses: TableLocation,
  pub callstacks: TableLocation,
  pub endianness: Endianness,
  pub executable_name: String,
  pub names: TableLocation,
  pub num_data_files: u64,
  pub platform: Platform,
  pub platform_name: String,
  pub script_tables: Option<ScriptTables>,
  pub serializes_symbol_info: bool,
  /// Byte offset of the first token in part 0.
  pub token_stream_offset: u64,
  pub version: u32,
}

impl TraceHeader {
  /// Reads the header from the start of part 0.
  ///
  /// The magic is tried little-endian first and, on mismatch, once more
  /// big-endian. The detected byte order is left set on `reader`.
  ///
  /// # Errors
  ///
  /// Returns [`LoadError::BadMagic`] when neither byte order matches,
  /// [`LoadError::UnsupportedVersion`] for versions outside 1..=5, and an
  /// i/o error when the header is truncated.
  pub fn read<R: Read + Seek>(
    reader: &mut TraceReader<R>,
  ) -> Result<Self, LoadError> {
    reader.seek_to(0)?;
    reader.set_endianness(Endianness::Little);

    let found = reader.read_u32()?;

    if found != TRACE_MAGIC {
      debug!(found, "magic mismatch, retrying big-endian");

      reader.seek_to(0)?;
      reader.set_endianness(Endianness::Big);

      if reader.read_u32()? != TRACE_MAGIC {
        return Err(LoadError::BadMagic { found });
      }
    }

    let version = reader.read_u32()?;

    let layout = HeaderLayout::for_version(version)
      .ok_or(LoadError::UnsupportedVersion(version))?;

    let platform_name = reader.read_string()?;
    let platform_id = reader.read_u32()?;
    let serializes_symbol_info = reader.read_u32()? != 0;

    let platform = Platform::from_id(platform_id);

    if platform == Platform::Unknown && platform_id != 0 {
      warn!(platform_id, "unrecognised platform id");
    }

    let names = read_table_location(reader, layout)?;
    let addresses = read_table_location(reader, layout)?;
    let callstacks = read_table_location(reader, layout)?;

    let num_data_files = if layout.part_count {
      u64::from(reader.read_u32()?).max(1)
    } else {
      1
    };

    let script_tables = if layout.script_tables {
      read_script_tables(reader)?
    } else {
      None
    };

    let executable_name = reader.read_string()?;
    let token_stream_offset = reader.position()?;

    Ok(Self {
      addresses,
      callstacks,
      endianness: reader.endianness(),
      executable_name,
      names,
      num_data_files,
      platform,
      platform_name,
      script_tables,
      serializes_symbol_info,
      token_stream_offset,
      version,
    })
  }

  /// Whether malloc and realloc tokens carry the two script fields.
  #[must_use]
  pub fn has_script_fields(&self) -> bool {
    self.script_tables.is_some()
  }

  #[must_use]
  pub fn layout(&self) -> Option<HeaderLayout> {
    HeaderLayout::for_version(self.version)
  }

  /// Rejects any declared table offset that lies outside part 0.
  ///
  /// # Errors
  ///
  /// Returns [`LoadError::TableOutOfBounds`] naming the first offending
  /// table.
  pub fn validate_tables(&self, len: u64) -> Result<(), LoadError> {
    let tables = [
      ("name", self.names),
      ("address", self.addresses),
      ("callstack", self.callstacks),
    ];

    for (table, location) in tables {
      let out_of_bounds = location.offset > len
        || (location.entries > 0 && location.offset >= len);

      if out_of_bounds {
        return Err(LoadError::TableOutOfBounds {
          len,
          offset: location.offset,
          table,
        });
      }
    }

    if let Some(script) = self.script_tables {
      let tables = [
        ("script callstack", script.callstack_table_offset),
        ("script name", script.name_table_offset),
      ];

      for (table, offset) in tables {
        if offset >= len {
          return Err(LoadError::TableOutOfBounds { len, offset, table });
        }
      }
    }

    Ok(())
  }
}

fn read_script_tables<R: Read + Seek>(
  reader: &mut TraceReader<R>,
) -> io::Result<Option<ScriptTables>> {
  let callstack_table_offset = reader.read_u32()?;
  let name_table_offset = reader.read_u32()?;

  if callstack_table_offset == NO_SCRIPT_TABLE
    || name_table_offset == NO_SCRIPT_TABLE
  {
    debug!("capture recorded no script callstacks");
    return Ok(None);
  }

  Ok(Some(ScriptTables {
    callstack_table_offset: u64::from(callstack_table_offset),
    name_table_offset: u64::from(name_table_offset),
  }))
}

fn read_table_location<R: Read + Seek>(
  reader: &mut TraceReader<R>,
  layout: HeaderLayout,
) -> io::Result<TableLocation> {
  let (offset, entries) = if layout.wide_tables {
    (reader.read_u64()?, reader.read_u64()?)
  } else {
    (u64::from(reader.read_u32()?), u64::from(reader.read_u32()?))
  };

  Ok(TableLocation { entries, offset })
}
