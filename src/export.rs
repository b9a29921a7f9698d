use super::*;

#[cfg(not(windows))]
use pprof::protos::{
  Function, Line, Location, Message, Profile, Sample, ValueType,
};

const UNKNOWN: &str = "<unknown>";

/// Errors that can occur when exporting or streaming snapshots.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
  #[error("i/o error during export: {0}")]
  Io(#[from] io::Error),
  #[error("failed to encode snapshot as json: {0}")]
  Json(#[from] serde_json::Error),
}

/// Which list of a snapshot a CSV export walks.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum CsvSource {
  #[default]
  Active,
  Lifetime,
}

/// Tables needed to render callstack frames.
#[derive(Debug, Clone, Copy)]
pub struct SymbolContext<'a> {
  pub catalog: &'a CallStackCatalog,
  pub names: &'a NameTable,
  /// Render `function @ file:line` instead of a bare function name.
  pub source_locations: bool,
}

#[derive(Serialize)]
struct FrameExport<'a> {
  file: Option<&'a str>,
  function: Option<&'a str>,
  line: i32,
  program_counter: u64,
}

#[derive(Serialize)]
struct EntryExport<'a> {
  callstack: CallStackIndex,
  count: i64,
  frames: Vec<FrameExport<'a>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  group: Option<GroupId>,
  size: i64,
}

#[derive(Serialize)]
struct SnapshotExport<'a> {
  active: Vec<EntryExport<'a>>,
  allocation_events: i64,
  identity: &'a SnapshotIdentity,
  is_diff_result: bool,
  live_bytes: i64,
  live_count: i64,
  stats: &'a MemoryStats,
}

impl<'a> SymbolContext<'a> {
  #[must_use]
  pub fn new(
    catalog: &'a CallStackCatalog,
    names: &'a NameTable,
    platform: Platform,
  ) -> Self {
    Self {
      catalog,
      names,
      source_locations: platform.has_source_locations(),
    }
  }

  /// Renders one address-table entry the way CSV rows show it.
  #[must_use]
  pub fn frame_label(&self, address: u32) -> String {
    let Some(address) = self.catalog.address(address) else {
      return UNKNOWN.to_string();
    };

    let function = self.name(address.function);

    if self.source_locations {
      format!("{function} @ {}:{}", self.name(address.file), address.line)
    } else {
      function.to_string()
    }
  }

  fn entry(&self, entry: &ActiveEntry) -> EntryExport<'a> {
    let callstack = self.catalog.get(entry.callstack);

    let frames = CallStackView::new(self.catalog, self.names, entry.callstack)
      .map(|view| {
        view
          .frames()
          .map(|frame| FrameExport {
            file: frame.file,
            function: frame.function,
            line: frame.line,
            program_counter: frame.program_counter,
          })
          .collect()
      })
      .unwrap_or_default();

    EntryExport {
      callstack: entry.callstack,
      count: entry.count,
      frames,
      group: callstack.and_then(CallStack::group),
      size: entry.size,
    }
  }

  fn name(&self, id: Option<NameId>) -> &'a str {
    id.and_then(|id| self.names.get(id)).unwrap_or(UNKNOWN)
  }

  fn write_rows<W, I>(&self, rows: I, mut writer: W) -> Result<(), ExportError>
  where
    W: Write,
    I: IntoIterator<Item = ActiveEntry>,
  {
    for row in rows {
      write!(writer, "{},{},", row.size, row.count)?;

      if let Some(callstack) = self.catalog.get(row.callstack) {
        for address in callstack.addresses() {
          write!(writer, "{},", self.frame_label(*address))?;
        }
      }

      writer.write_all(b"\n")?;
    }

    writer.flush()?;

    Ok(())
  }
}

impl Snapshot {
  /// Writes one CSV row per non-empty entry of `source`.
  ///
  /// # Errors
  ///
  /// Returns an error if the writer fails.
  pub fn export_csv<W: Write>(
    &self,
    source: CsvSource,
    symbols: &SymbolContext<'_>,
    writer: W,
  ) -> Result<(), ExportError> {
    match source {
      CsvSource::Active => {
        symbols.write_rows(self.active().iter().copied(), writer)
      }
      CsvSource::Lifetime => {
        let rows = self
          .lifetime()
          .iter()
          .enumerate()
          .filter(|(_, totals)| !totals.is_zero())
          .filter_map(|(index, totals)| {
            Some(ActiveEntry::new(
              CallStackIndex::try_from(index).ok()?,
              totals.size,
              totals.count,
            ))
          });

        symbols.write_rows(rows, writer)
      }
    }
  }

  /// Serialize the snapshot with resolved frames to JSON.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization to JSON fails.
  pub fn export_json<W: Write>(
    &self,
    symbols: &SymbolContext<'_>,
    writer: W,
  ) -> Result<(), ExportError> {
    serde_json::to_writer(writer, &self.document(symbols))?;
    Ok(())
  }

  /// Serialize the snapshot to the pprof proto format.
  ///
  /// # Errors
  ///
  /// Returns an error if the writer fails.
  #[cfg(not(windows))]
  pub fn export_pprof<W: Write>(
    &self,
    symbols: &SymbolContext<'_>,
    mut writer: W,
  ) -> Result<(), ExportError> {
    let profile = build_pprof_profile(self, symbols);
    writer.write_all(&profile.encode_to_vec())?;
    Ok(())
  }

  #[cfg(windows)]
  pub fn export_pprof<W: Write>(
    &self,
    _symbols: &SymbolContext<'_>,
    _writer: W,
  ) -> Result<(), ExportError> {
    Err(
      io::Error::new(
        io::ErrorKind::Unsupported,
        "pprof export is not available on Windows",
      )
      .into(),
    )
  }

  fn document<'a>(&'a self, symbols: &SymbolContext<'a>) -> SnapshotExport<'a> {
    SnapshotExport {
      active: self.active().iter().map(|entry| symbols.entry(entry)).collect(),
      allocation_events: i64::try_from(self.allocation_events())
        .unwrap_or(i64::MAX),
      identity: self.identity(),
      is_diff_result: false,
      live_bytes: self.live_bytes(),
      live_count: self.live_count(),
      stats: self.stats(),
    }
  }
}

impl SnapshotDiff {
  /// Writes one CSV row per changed callstack, with signed values.
  ///
  /// # Errors
  ///
  /// Returns an error if the writer fails.
  pub fn export_csv<W: Write>(
    &self,
    symbols: &SymbolContext<'_>,
    writer: W,
  ) -> Result<(), ExportError> {
    symbols.write_rows(self.active().iter().copied(), writer)
  }

  /// Serialize the diff with resolved frames to JSON.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization to JSON fails.
  pub fn export_json<W: Write>(
    &self,
    symbols: &SymbolContext<'_>,
    writer: W,
  ) -> Result<(), ExportError> {
    let document = SnapshotExport {
      active: self.active().iter().map(|entry| symbols.entry(entry)).collect(),
      allocation_events: self.allocation_events(),
      identity: self.identity(),
      is_diff_result: true,
      live_bytes: self.live_bytes(),
      live_count: self.live_count(),
      stats: self.stats(),
    };

    serde_json::to_writer(writer, &document)?;

    Ok(())
  }
}

/// Streaming interface for snapshot consumers.
pub trait SnapshotStreamWriter {
  /// # Errors
  ///
  /// Returns an `ExportError` if the snapshot cannot be serialized or if
  /// the underlying writer fails to persist the data.
  fn write_snapshot(
    &mut self,
    snapshot: &Snapshot,
    symbols: &SymbolContext<'_>,
  ) -> Result<(), ExportError>;
}

/// JSON lines exporter that writes one JSON object per snapshot.
pub struct JsonLinesWriter<W: Write> {
  writer: W,
}

impl<W: Write> SnapshotStreamWriter for JsonLinesWriter<W> {
  fn write_snapshot(
    &mut self,
    snapshot: &Snapshot,
    symbols: &SymbolContext<'_>,
  ) -> Result<(), ExportError> {
    serde_json::to_writer(&mut self.writer, &snapshot.document(symbols))?;
    self.writer.write_all(b"\n")?;
    Ok(())
  }
}

impl<W: Write> JsonLinesWriter<W> {
  pub fn into_inner(self) -> W {
    self.writer
  }

  pub fn new(writer: W) -> Self {
    Self { writer }
  }
}

#[cfg(not(windows))]
struct StringTable {
  entries: Vec<String>,
  index: HashMap<String, i64>,
}

#[cfg(not(windows))]
impl StringTable {
  fn intern(&mut self, value: &str) -> i64 {
    if let Some(index) = self.index.get(value) {
      return *index;
    }

    let index = i64::try_from(self.entries.len()).unwrap_or(i64::MAX);

    self.entries.push(value.to_string());
    self.index.insert(value.to_string(), index);

    index
  }

  fn into_vec(self) -> Vec<String> {
    self.entries
  }

  fn new() -> Self {
    Self {
      entries: vec![String::new()],
      index: HashMap::from([(String::new(), 0)]),
    }
  }
}

/// One sample per active entry, with locations keyed by address index.
#[cfg(not(windows))]
#[must_use]
pub fn build_pprof_profile(
  snapshot: &Snapshot,
  symbols: &SymbolContext<'_>,
) -> Profile {
  let mut string_table = StringTable::new();

  let sample_type = ValueType {
    ty: string_table.intern("space"),
    unit: string_table.intern("bytes"),
  };

  let count_type = ValueType {
    ty: string_table.intern("allocations"),
    unit: string_table.intern("count"),
  };

  let mut functions = Vec::new();
  let mut locations = Vec::new();
  let mut samples = Vec::new();

  let mut function_ids = HashMap::new();
  let mut location_ids: HashMap<u32, u64, BuildNoHashHasher<u32>> =
    HashMap::default();

  for entry in snapshot.active() {
    let addresses = symbols
      .catalog
      .get(entry.callstack)
      .map(CallStack::addresses)
      .unwrap_or_default();

    let mut stack_location_ids = Vec::with_capacity(addresses.len());

    for &address_index in addresses {
      let address = symbols.catalog.address(address_index);

      let location_id = *location_ids.entry(address_index).or_insert_with(|| {
        let name = string_table
          .intern(symbols.name(address.and_then(|a| a.function)));

        let filename =
          string_table.intern(symbols.name(address.and_then(|a| a.file)));

        let line = address.map_or(0, |a| i64::from(a.line));

        let function_id =
          *function_ids.entry((name, filename)).or_insert_with(|| {
            let id = functions.len() as u64 + 1;

            functions.push(Function {
              id,
              name,
              system_name: name,
              filename,
              start_line: 0,
            });

            id
          });

        let id = locations.len() as u64 + 1;

        locations.push(Location {
          id,
          mapping_id: 0,
          address: address.map_or(0, |a| a.program_counter),
          line: vec![Line { function_id, line }],
          is_folded: false,
        });

        id
      });

      stack_location_ids.push(location_id);
    }

    samples.push(Sample {
      location_id: stack_location_ids,
      value: vec![entry.size, entry.count],
      label: Vec::new(),
    });
  }

  Profile {
    sample_type: vec![sample_type, count_type],
    sample: samples,
    mapping: Vec::new(),
    location: locations,
    function: functions,
    string_table: string_table.into_vec(),
    drop_frames: 0,
    keep_frames: 0,
    time_nanos: 0,
    duration_nanos: 0,
    period_type: Some(ValueType { ty: 0, unit: 0 }),
    period: 1,
    comment: Vec::new(),
    default_sample_type: 0,
  }
}
