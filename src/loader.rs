use {
  super::*,
  crate::timer::ScopedTimer,
  std::sync::atomic::{self, AtomicBool},
  tracing::info_span,
};

/// Cooperative cancellation flag, checked between load phases and tokens.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
  cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
  pub fn cancel(&self) {
    self.cancelled.store(true, atomic::Ordering::Relaxed);
  }

  #[must_use]
  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(atomic::Ordering::Relaxed)
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }
}

/// Everything one load knows about its trace.
#[derive(Debug)]
pub struct TraceContext {
  pub catalog: CallStackCatalog,
  pub header: TraceHeader,
  pub names: SharedNameTable,
}

impl TraceContext {
  /// Runs `f` with frame rendering tables, holding the name table read lock.
  pub fn with_symbols<T>(&self, f: impl FnOnce(&SymbolContext<'_>) -> T) -> T {
    let names = self.names.read();
    f(&SymbolContext::new(&self.catalog, &names, self.header.platform))
  }
}

/// Stream index at which each frame began, and its delta time.
///
/// Frame 0 starts at stream index 0. Once the stream ends its final index is
/// appended, so `stream_indices` has one more entry than `delta_times`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameTimeline {
  delta_times: Vec<f32>,
  stream_indices: Vec<u64>,
}

impl Default for FrameTimeline {
  fn default() -> Self {
    Self {
      delta_times: vec![0.0],
      stream_indices: vec![0],
    }
  }
}

impl FrameTimeline {
  #[must_use]
  pub fn delta_times(&self) -> &[f32] {
    &self.delta_times
  }

  /// Number of frames seen so far, the open one included.
  #[must_use]
  pub fn frame_count(&self) -> usize {
    self.delta_times.len()
  }

  #[must_use]
  pub fn stream_indices(&self) -> &[u64] {
    &self.stream_indices
  }

  fn finish(&mut self, stream_index: u64) {
    self.stream_indices.push(stream_index);
  }

  fn push(&mut self, stream_index: u64, delta_seconds: f32) {
    self.stream_indices.push(stream_index);
    self.delta_times.push(delta_seconds);
  }
}

/// Result of a completed load.
#[derive(Debug)]
pub struct ProfileData {
  pub anomalies: AnomalyCounts,
  pub context: TraceContext,
  pub frames: FrameTimeline,
  /// Allocations still live per pool when the stream ended.
  pub pools: PoolUsage,
  pub resolution: Option<ResolutionSummary>,
  pub snapshots: Vec<Snapshot>,
  /// Callstacks that matched no pattern and took the fallback group.
  pub ungrouped: usize,
}

impl ProfileData {
  /// Snapshot at `index`, `None` when out of range.
  #[must_use]
  pub fn snapshot(&self, index: usize) -> Option<&Snapshot> {
    self.snapshots.get(index)
  }
}

#[derive(Debug)]
pub enum LoadOutcome {
  Cancelled,
  Completed(Box<ProfileData>),
}

impl LoadOutcome {
  #[must_use]
  pub fn into_profile(self) -> Option<ProfileData> {
    match self {
      Self::Cancelled => None,
      Self::Completed(profile) => Some(*profile),
    }
  }

  #[must_use]
  pub fn is_cancelled(&self) -> bool {
    matches!(self, Self::Cancelled)
  }
}

/// Thin builder that customizes a [`TraceLoader`] without exposing all
/// knobs up front.
#[derive(Default)]
pub struct TraceLoaderBuilder {
  cancellation: CancellationToken,
  fallback_group: GroupId,
  options: LoadOptions,
  patterns: Vec<Box<dyn CallStackPattern>>,
  resolver: Option<Box<dyn SymbolResolver>>,
}

impl TraceLoaderBuilder {
  #[must_use]
  pub fn cancellation(mut self, token: CancellationToken) -> Self {
    self.cancellation = token;
    self
  }

  /// Group assigned to callstacks no pattern matches.
  #[must_use]
  pub fn fallback_group(mut self, group: GroupId) -> Self {
    self.fallback_group = group;
    self
  }

  #[must_use]
  pub fn finish(self) -> TraceLoader {
    TraceLoader {
      cancellation: self.cancellation,
      fallback_group: self.fallback_group,
      options: self.options,
      patterns: self.patterns,
      resolver: self.resolver,
    }
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn options(mut self, options: LoadOptions) -> Self {
    self.options = options;
    self
  }

  /// Appends one pattern; earlier patterns win.
  #[must_use]
  pub fn pattern(mut self, pattern: impl CallStackPattern + 'static) -> Self {
    self.patterns.push(Box::new(pattern));
    self
  }

  #[must_use]
  pub fn patterns(mut self, patterns: Vec<Box<dyn CallStackPattern>>) -> Self {
    self.patterns.extend(patterns);
    self
  }

  #[must_use]
  pub fn resolver(mut self, resolver: impl SymbolResolver + 'static) -> Self {
    self.resolver = Some(Box::new(resolver));
    self
  }
}

/// Loads traces into [`ProfileData`].
pub struct TraceLoader {
  cancellation: CancellationToken,
  fallback_group: GroupId,
  options: LoadOptions,
  patterns: Vec<Box<dyn CallStackPattern>>,
  resolver: Option<Box<dyn SymbolResolver>>,
}

impl TraceLoader {
  #[must_use]
  pub fn builder() -> TraceLoaderBuilder {
    TraceLoaderBuilder::new()
  }

  /// A handle that cancels this loader's loads.
  #[must_use]
  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancellation.clone()
  }

  /// Loads a recording from `parts`.
  ///
  /// Returns [`LoadOutcome::Cancelled`] if the token fires before the load
  /// finishes; the partial state is dropped.
  ///
  /// # Errors
  ///
  /// Returns the first fatal [`LoadError`]. Nothing built so far is
  /// returned.
  pub fn load<P: PartSource>(
    &mut self,
    mut parts: P,
  ) -> Result<LoadOutcome, LoadError> {
    let _span = info_span!("load_trace").entered();
    let _timer = ScopedTimer::start("load");

    let mut reader = TraceReader::new(parts.open_part(0)?)?;

    let header = TraceHeader::read(&mut reader)?;
    header.validate_tables(reader.len())?;

    debug!(
      version = header.version,
      platform = %header.platform_name,
      endianness = ?header.endianness,
      parts = header.num_data_files,
      "read trace header"
    );

    let (names, mut catalog) = {
      let _span = info_span!("load_tables").entered();
      let _timer = ScopedTimer::start("tables");

      let names = NameTable::read(&mut reader, header.names)?;
      let catalog = CallStackCatalog::read(&mut reader, &header)?;

      (SharedNameTable::from(names), catalog)
    };

    if self.cancellation.is_cancelled() {
      return Ok(LoadOutcome::Cancelled);
    }

    let resolution = match self.resolver.as_deref_mut() {
      Some(resolver) => {
        let _span = info_span!("resolve_symbols").entered();
        let _timer = ScopedTimer::start("symbols");
        Some(resolve_symbols(&names, &mut catalog, resolver)?)
      }
      None => None,
    };

    if self.options.trim_profiler_frames {
      catalog.trim_profiler_frames(
        &names.read(),
        &self.options.profiler_frame_markers,
      );
    }

    if self.options.filter_script_vm_frames {
      catalog.filter_script_vm_frames(
        &names.read(),
        &self.options.script_vm_frame_markers,
      );
    }

    if self.cancellation.is_cancelled() {
      return Ok(LoadOutcome::Cancelled);
    }

    let Some(replay) =
      self.replay(parts, reader, &header, &mut catalog, &names, resolution)?
    else {
      debug!("load cancelled during replay");
      return Ok(LoadOutcome::Cancelled);
    };

    let ungrouped = {
      let _span = info_span!("classify").entered();
      let _timer = ScopedTimer::start("classify");

      catalog.classify(
        &names.read(),
        &self.patterns,
        self.fallback_group,
        &self.options.container_markers,
      )
    };

    let anomalies = replay.anomalies;

    if anomalies.total() > 0 {
      warn!(
        double_mallocs = anomalies.double_mallocs,
        unmatched_frees = anomalies.unmatched_frees,
        out_of_range_callstacks = anomalies.out_of_range_callstacks,
        cross_pool_callstacks = anomalies.cross_pool_callstacks,
        unresolved_symbols = anomalies.unresolved_symbols,
        "trace loaded with anomalies"
      );
    }

    debug!(
      snapshots = replay.snapshots.len(),
      callstacks = catalog.len(),
      ungrouped,
      "trace loaded"
    );

    Ok(LoadOutcome::Completed(Box::new(ProfileData {
      anomalies,
      context: TraceContext {
        catalog,
        header,
        names,
      },
      frames: replay.frames,
      pools: replay.pools,
      resolution,
      snapshots: replay.snapshots,
      ungrouped,
    })))
  }

  /// Loads `path` and its `.mN` sibling parts.
  ///
  /// # Errors
  ///
  /// See [`TraceLoader::load`].
  pub fn load_file(
    &mut self,
    path: impl Into<PathBuf>,
  ) -> Result<LoadOutcome, LoadError> {
    self.load(FileParts::new(path))
  }

  fn replay<P: PartSource>(
    &self,
    parts: P,
    reader: TraceReader<P::Part>,
    header: &TraceHeader,
    catalog: &mut CallStackCatalog,
    names: &SharedNameTable,
    resolution: Option<ResolutionSummary>,
  ) -> Result<Option<Replay>, LoadError> {
    let _span = info_span!("replay").entered();
    let _timer = ScopedTimer::start("replay");

    let mut stream = TokenStream::new(parts, reader, header)?;
    let mut state = ReplayState::new(&self.options);

    if let Some(resolution) = resolution {
      state.tracker.record_unresolved_symbols(resolution.failed);
    }

    loop {
      if self.cancellation.is_cancelled() {
        return Ok(None);
      }

      let Some((stream_index, event)) = stream.next_token()? else {
        break;
      };

      if !matches!(event, AllocationEvent::EndOfStream) {
        state.maybe_synthetic(catalog, stream_index);
      }

      match event {
        AllocationEvent::FrameMarker { delta_seconds } => {
          state.frames.push(stream_index, delta_seconds);
          state.current_time += f64::from(delta_seconds);
        }
        AllocationEvent::SnapshotMarker { kind, tag } => {
          state.on_marker(catalog, names, stream_index, kind, tag);
        }
        AllocationEvent::TextMarker { tag } => {
          debug!(stream_index, tag, "text marker");
        }
        AllocationEvent::EndOfStream => {
          state.capture(
            catalog,
            stream_index,
            SnapshotKind::End,
            "End".to_string(),
            None,
          );
        }
        AllocationEvent::EndOfFile => {}
        _ => state.tracker.apply(catalog, stream_index, &event),
      }
    }

    state.frames.finish(stream.stream_index());
    state.store.pad_lifetimes(catalog.len());

    Ok(Some(Replay {
      anomalies: state.tracker.anomalies(),
      frames: state.frames,
      pools: state.tracker.stats().pools,
      snapshots: state.store.into_snapshots(),
    }))
  }
}

struct Replay {
  anomalies: AnomalyCounts,
  frames: FrameTimeline,
  pools: PoolUsage,
  snapshots: Vec<Snapshot>,
}

struct ReplayState<'a> {
  current_time: f64,
  frames: FrameTimeline,
  last_snapshot_time: f64,
  marker_counts: [u64; SnapshotMarkerKind::ALL.len()],
  markers_seen: u64,
  next_synthetic: Option<u64>,
  options: &'a LoadOptions,
  store: SnapshotStore,
  tracker: AllocationTracker,
}

impl<'a> ReplayState<'a> {
  fn capture(
    &mut self,
    catalog: &CallStackCatalog,
    stream_index: u64,
    kind: SnapshotKind,
    description: String,
    marker_index: Option<u64>,
  ) {
    let identity = SnapshotIdentity {
      current_time: self.current_time,
      description,
      elapsed_time: self.current_time - self.last_snapshot_time,
      frame_number: self.frames.frame_count().saturating_sub(1) as u64,
      kind,
      marker_index,
      stream_index,
    };

    self.last_snapshot_time = self.current_time;

    let snapshot = self.store.capture(&self.tracker, catalog.len(), identity);

    debug!(
      description = snapshot.description(),
      stream_index,
      live_bytes = snapshot.live_bytes(),
      "captured snapshot"
    );
  }

  /// Runs ahead of each token, so the snapshot holds the state before the
  /// token at `stream_index` is applied.
  fn maybe_synthetic(&mut self, catalog: &CallStackCatalog, stream_index: u64) {
    let (Some(next), Some(interval)) =
      (self.next_synthetic, self.options.synthetic_snapshot_interval)
    else {
      return;
    };

    let events = self.tracker.event_count();

    if events < next {
      return;
    }

    self.next_synthetic = Some(events + interval);

    self.capture(
      catalog,
      stream_index,
      SnapshotKind::Synthetic,
      format!("Unnamed snapshot allocations: {events}"),
      None,
    );
  }

  fn new(options: &'a LoadOptions) -> Self {
    Self {
      current_time: 0.0,
      frames: FrameTimeline::default(),
      last_snapshot_time: 0.0,
      marker_counts: [0; SnapshotMarkerKind::ALL.len()],
      markers_seen: 0,
      next_synthetic: options.synthetic_snapshot_interval,
      options,
      store: SnapshotStore::new(),
      tracker: AllocationTracker::new(options.timeline_sample_interval),
    }
  }

  fn on_marker(
    &mut self,
    catalog: &CallStackCatalog,
    names: &SharedNameTable,
    stream_index: u64,
    kind: SnapshotMarkerKind,
    tag: NameId,
  ) {
    let marker_index = self.markers_seen;
    self.markers_seen += 1;

    if !self.options.marker_snapshots.enabled(kind) {
      debug!(stream_index, ?kind, "snapshot marker disabled");
      return;
    }

    let count = &mut self.marker_counts[kind.ordinal()];
    let ordinal = *count;
    *count += 1;

    let description = match names.read().get(tag).filter(|t| !t.is_empty()) {
      Some(tag) => format!("{} {ordinal}: {tag}", kind.label()),
      None => format!("{} {ordinal}", kind.label()),
    };

    self.capture(
      catalog,
      stream_index,
      SnapshotKind::Marker(kind),
      description,
      Some(marker_index),
    );
  }
}

#[cfg(test)]
mod tests {
  use {super::*, crate::writer::TraceWriter};

  fn load(writer: TraceWriter, options: LoadOptions) -> ProfileData {
    TraceLoader::builder()
      .options(options)
      .finish()
      .load(MemoryParts::new(writer.finish()))
      .expect("load")
      .into_profile()
      .expect("completed")
  }

  fn writer() -> TraceWriter {
    TraceWriter::new()
      .name("")
      .name("level loaded")
      .address(0x10, -1, -1, 0)
      .callstack([0])
      .callstack([0])
  }

  #[test]
  fn markers_produce_numbered_snapshots() {
    let mut writer = writer();

    for event in [
      AllocationEvent::malloc(0x1, 8, 0),
      AllocationEvent::snapshot_marker(SnapshotMarkerKind::Generic, 0),
      AllocationEvent::snapshot_marker(SnapshotMarkerKind::GcStart, 1),
      AllocationEvent::snapshot_marker(SnapshotMarkerKind::Generic, 99),
      AllocationEvent::EndOfStream,
    ] {
      writer.push(&event);
    }

    let profile = load(writer, LoadOptions::default());

    let descriptions = profile
      .snapshots
      .iter()
      .map(Snapshot::description)
      .collect::<Vec<_>>();

    assert_eq!(
      descriptions,
      ["Snapshot 0", "GC Start 0: level loaded", "Snapshot 1", "End"]
    );
    assert_eq!(profile.snapshots[2].identity().marker_index, Some(2));
    assert_eq!(profile.snapshots[3].identity().kind, SnapshotKind::End);
  }

  #[test]
  fn disabled_markers_still_advance_ordinals() {
    let mut writer = writer();

    for event in [
      AllocationEvent::snapshot_marker(SnapshotMarkerKind::LoadMapStart, 0),
      AllocationEvent::snapshot_marker(SnapshotMarkerKind::Generic, 0),
      AllocationEvent::EndOfStream,
    ] {
      writer.push(&event);
    }

    let options = LoadOptions::default()
      .with_marker_snapshots(MarkerSnapshots::generic_only());
    let profile = load(writer, options);

    assert_eq!(profile.snapshots.len(), 2);
    assert_eq!(profile.snapshots[0].description(), "Snapshot 0");
    assert_eq!(profile.snapshots[0].identity().marker_index, Some(1));
  }

  #[test]
  fn marker_numbers_count_per_kind_from_zero() {
    let mut writer = writer();

    for event in [
      AllocationEvent::snapshot_marker(SnapshotMarkerKind::GcStart, 0),
      AllocationEvent::snapshot_marker(SnapshotMarkerKind::GcEnd, 0),
      AllocationEvent::snapshot_marker(SnapshotMarkerKind::GcStart, 1),
      AllocationEvent::snapshot_marker(SnapshotMarkerKind::GcEnd, 1),
      AllocationEvent::EndOfStream,
    ] {
      writer.push(&event);
    }

    let profile = load(writer, LoadOptions::default());

    let descriptions = profile
      .snapshots
      .iter()
      .map(Snapshot::description)
      .collect::<Vec<_>>();

    assert_eq!(
      descriptions,
      [
        "GC Start 0",
        "GC End 0",
        "GC Start 1: level loaded",
        "GC End 1: level loaded",
        "End",
      ]
    );
  }

  #[test]
  fn synthetic_snapshots_capture_the_state_before_the_next_token() {
    let mut writer = writer();

    for pointer in 1..=5 {
      writer.push(&AllocationEvent::malloc(pointer, 4, 1));
    }
    writer.push(&AllocationEvent::EndOfStream);

    let profile =
      load(writer, LoadOptions::default().with_synthetic_snapshots(2));

    let descriptions = profile
      .snapshots
      .iter()
      .map(Snapshot::description)
      .collect::<Vec<_>>();

    assert_eq!(
      descriptions,
      [
        "Unnamed snapshot allocations: 2",
        "Unnamed snapshot allocations: 4",
        "End",
      ]
    );
    assert_eq!(profile.snapshots[0].live_bytes(), 8);
    assert_eq!(profile.snapshots[0].identity().stream_index, 2);
    assert_eq!(profile.snapshots[1].live_bytes(), 16);
    assert_eq!(profile.snapshots[1].identity().stream_index, 4);
  }

  #[test]
  fn frame_markers_build_the_timeline_and_clock() {
    let mut writer = writer();

    for event in [
      AllocationEvent::FrameMarker { delta_seconds: 0.5 },
      AllocationEvent::malloc(0x1, 8, 0),
      AllocationEvent::FrameMarker { delta_seconds: 0.25 },
      AllocationEvent::snapshot_marker(SnapshotMarkerKind::Generic, 0),
      AllocationEvent::EndOfStream,
    ] {
      writer.push(&event);
    }

    let profile = load(writer, LoadOptions::default());

    assert_eq!(profile.frames.stream_indices(), &[0, 0, 2, 5]);
    assert_eq!(profile.frames.delta_times(), &[0.0, 0.5, 0.25]);

    let identity = profile.snapshots[0].identity();
    assert_eq!(identity.frame_number, 2);
    assert!((identity.current_time - 0.75).abs() < f64::EPSILON);

    let end = profile.snapshots[1].identity();
    assert!(end.elapsed_time.abs() < f64::EPSILON);
  }

  #[test]
  fn cancelled_token_short_circuits_the_load() {
    let mut writer = writer();
    writer.push(&AllocationEvent::EndOfStream);

    let mut loader = TraceLoader::builder().finish();
    loader.cancellation_token().cancel();

    let outcome = loader
      .load(MemoryParts::new(writer.finish()))
      .expect("no fatal error");

    assert!(outcome.is_cancelled());
  }

  #[test]
  fn table_offsets_past_the_file_are_fatal() {
    let mut bytes = writer().finish().remove(0);

    let header = TraceWriter::new().header();
    let offset_position = 4 + 4 + 4 + header.platform_name.len() + 4 + 4;
    bytes[offset_position..offset_position + 8]
      .copy_from_slice(&u64::MAX.to_le_bytes());

    let error = TraceLoader::builder()
      .finish()
      .load(MemoryParts::new([bytes]))
      .expect_err("out of bounds");

    assert!(matches!(
      error,
      LoadError::TableOutOfBounds { table: "name", .. }
    ));
  }
}
