use {super::*, serde::Deserialize};

/// Which snapshot marker kinds produce a snapshot. Generic markers always do.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerSnapshots {
  pub gc_end: bool,
  pub gc_start: bool,
  pub level_stream_end: bool,
  pub level_stream_start: bool,
  pub load_map_end: bool,
  pub load_map_mid: bool,
  pub load_map_start: bool,
}

impl Default for MarkerSnapshots {
  fn default() -> Self {
    Self::all()
  }
}

impl MarkerSnapshots {
  #[must_use]
  pub fn all() -> Self {
    Self {
      gc_end: true,
      gc_start: true,
      level_stream_end: true,
      level_stream_start: true,
      load_map_end: true,
      load_map_mid: true,
      load_map_start: true,
    }
  }

  /// Only generic markers produce snapshots.
  #[must_use]
  pub fn generic_only() -> Self {
    Self {
      gc_end: false,
      gc_start: false,
      level_stream_end: false,
      level_stream_start: false,
      load_map_end: false,
      load_map_mid: false,
      load_map_start: false,
    }
  }

  #[must_use]
  pub fn enabled(&self, kind: SnapshotMarkerKind) -> bool {
    match kind {
      SnapshotMarkerKind::Generic => true,
      SnapshotMarkerKind::LoadMapStart => self.load_map_start,
      SnapshotMarkerKind::LoadMapMid => self.load_map_mid,
      SnapshotMarkerKind::LoadMapEnd => self.load_map_end,
      SnapshotMarkerKind::GcStart => self.gc_start,
      SnapshotMarkerKind::GcEnd => self.gc_end,
      SnapshotMarkerKind::LevelStreamStart => self.level_stream_start,
      SnapshotMarkerKind::LevelStreamEnd => self.level_stream_end,
    }
  }
}

/// Controls how a trace is replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
  /// Function-name substrings of container and template wrapper frames,
  /// skipped when locating a callstack's first non-container frame.
  pub container_markers: Vec<String>,
  /// Remove the script virtual machine's dispatch frames from callstacks.
  pub filter_script_vm_frames: bool,
  pub marker_snapshots: MarkerSnapshots,
  /// Function-name substrings of the profiler's own allocation frames.
  pub profiler_frame_markers: Vec<String>,
  /// Function-name substrings of script virtual machine dispatch frames.
  pub script_vm_frame_markers: Vec<String>,
  /// Take an unnamed snapshot every N allocation events when set.
  pub synthetic_snapshot_interval: Option<u64>,
  /// Allocation events between timeline samples; zero disables sampling.
  pub timeline_sample_interval: u64,
  pub trim_profiler_frames: bool,
}

impl Default for LoadOptions {
  fn default() -> Self {
    Self {
      container_markers: [
        "TArray",
        "TSparseArray",
        "TSet",
        "TMap",
        "FString",
        "FMemory::",
      ]
      .map(String::from)
      .into(),
      filter_script_vm_frames: false,
      marker_snapshots: MarkerSnapshots::default(),
      profiler_frame_markers: ["FMallocProfiler", "FMallocProxy"]
        .map(String::from)
        .into(),
      script_vm_frame_markers: [
        "UObject::exec",
        "UObject::CallFunction",
        "UObject::ProcessEvent",
      ]
      .map(String::from)
      .into(),
      synthetic_snapshot_interval: None,
      timeline_sample_interval: 5000,
      trim_profiler_frames: true,
    }
  }
}

impl LoadOptions {
  #[must_use]
  pub fn with_container_markers<I, S>(mut self, markers: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.container_markers = markers.into_iter().map(Into::into).collect();
    self
  }

  #[must_use]
  pub fn with_marker_snapshots(mut self, markers: MarkerSnapshots) -> Self {
    self.marker_snapshots = markers;
    self
  }

  #[must_use]
  pub fn with_script_vm_filtering(mut self) -> Self {
    self.filter_script_vm_frames = true;
    self
  }

  /// Builder-style helper to take an unnamed snapshot every `events`
  /// allocation events.
  #[must_use]
  pub fn with_synthetic_snapshots(mut self, events: u64) -> Self {
    self.synthetic_snapshot_interval = (events > 0).then_some(events);
    self
  }

  #[must_use]
  pub fn with_timeline_sample_interval(mut self, events: u64) -> Self {
    self.timeline_sample_interval = events;
    self
  }

  /// Explicitly keep the profiler's own frames in every callstack.
  #[must_use]
  pub fn without_frame_trimming(mut self) -> Self {
    self.trim_profiler_frames = false;
    self
  }
}
