use super::*;

/// Leading byte of every token in the stream.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TokenType {
  Malloc,
  Free,
  Realloc,
  Other,
}

impl TokenType {
  #[must_use]
  pub fn from_u8(value: u8) -> Option<Self> {
    match value {
      0 => Some(Self::Malloc),
      1 => Some(Self::Free),
      2 => Some(Self::Realloc),
      3 => Some(Self::Other),
      _ => None,
    }
  }

  #[must_use]
  pub fn to_u8(self) -> u8 {
    match self {
      Self::Malloc => 0,
      Self::Free => 1,
      Self::Realloc => 2,
      Self::Other => 3,
    }
  }
}

/// Which marker produced a snapshot.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize)]
pub enum SnapshotMarkerKind {
  Generic,
  LoadMapStart,
  LoadMapMid,
  LoadMapEnd,
  GcStart,
  GcEnd,
  LevelStreamStart,
  LevelStreamEnd,
}

impl SnapshotMarkerKind {
  pub const ALL: [Self; 8] = [
    Self::Generic,
    Self::LoadMapStart,
    Self::LoadMapMid,
    Self::LoadMapEnd,
    Self::GcStart,
    Self::GcEnd,
    Self::LevelStreamStart,
    Self::LevelStreamEnd,
  ];

  /// Position of this kind in [`Self::ALL`].
  #[must_use]
  pub fn ordinal(self) -> usize {
    match self {
      Self::Generic => 0,
      Self::LoadMapStart => 1,
      Self::LoadMapMid => 2,
      Self::LoadMapEnd => 3,
      Self::GcStart => 4,
      Self::GcEnd => 5,
      Self::LevelStreamStart => 6,
      Self::LevelStreamEnd => 7,
    }
  }

  #[must_use]
  pub fn label(self) -> &'static str {
    match self {
      Self::Generic => "Snapshot",
      Self::LoadMapStart => "LoadMap Start",
      Self::LoadMapMid => "LoadMap Mid",
      Self::LoadMapEnd => "LoadMap End",
      Self::GcStart => "GC Start",
      Self::GcEnd => "GC End",
      Self::LevelStreamStart => "LevelStream Start",
      Self::LevelStreamEnd => "LevelStream End",
    }
  }
}

/// Platform statistic carried by a stat payload token.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize)]
pub enum StatKind {
  TotalUsed,
  TotalAllocated,
  CpuUsed,
  CpuSlack,
  CpuWaste,
  GpuUsed,
  GpuSlack,
  GpuWaste,
  ImageSize,
  OsOverhead,
}

/// Second byte of an `Other` token.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Subtype {
  EndOfStream,
  EndOfFile,
  FrameTimeMarker,
  TextMarker,
  Marker(SnapshotMarkerKind),
  Stat(StatKind),
}

impl Subtype {
  #[must_use]
  pub fn from_u8(value: u8) -> Option<Self> {
    let subtype = match value {
      0 => Self::EndOfStream,
      1 => Self::EndOfFile,
      2 => Self::Marker(SnapshotMarkerKind::Generic),
      3 => Self::FrameTimeMarker,
      4 => Self::TextMarker,
      5 => Self::Stat(StatKind::TotalUsed),
      6 => Self::Stat(StatKind::TotalAllocated),
      7 => Self::Stat(StatKind::CpuUsed),
      8 => Self::Stat(StatKind::CpuSlack),
      9 => Self::Stat(StatKind::CpuWaste),
      10 => Self::Stat(StatKind::GpuUsed),
      11 => Self::Stat(StatKind::GpuSlack),
      12 => Self::Stat(StatKind::GpuWaste),
      13 => Self::Stat(StatKind::ImageSize),
      14 => Self::Stat(StatKind::OsOverhead),
      15 => Self::Marker(SnapshotMarkerKind::LoadMapStart),
      16 => Self::Marker(SnapshotMarkerKind::LoadMapMid),
      17 => Self::Marker(SnapshotMarkerKind::LoadMapEnd),
      18 => Self::Marker(SnapshotMarkerKind::GcStart),
      19 => Self::Marker(SnapshotMarkerKind::GcEnd),
      20 => Self::Marker(SnapshotMarkerKind::LevelStreamStart),
      21 => Self::Marker(SnapshotMarkerKind::LevelStreamEnd),
      _ => return None,
    };

    Some(subtype)
  }

  #[must_use]
  pub fn to_u8(self) -> u8 {
    match self {
      Self::EndOfStream => 0,
      Self::EndOfFile => 1,
      Self::Marker(SnapshotMarkerKind::Generic) => 2,
      Self::FrameTimeMarker => 3,
      Self::TextMarker => 4,
      Self::Stat(StatKind::TotalUsed) => 5,
      Self::Stat(StatKind::TotalAllocated) => 6,
      Self::Stat(StatKind::CpuUsed) => 7,
      Self::Stat(StatKind::CpuSlack) => 8,
      Self::Stat(StatKind::CpuWaste) => 9,
      Self::Stat(StatKind::GpuUsed) => 10,
      Self::Stat(StatKind::GpuSlack) => 11,
      Self::Stat(StatKind::GpuWaste) => 12,
      Self::Stat(StatKind::ImageSize) => 13,
      Self::Stat(StatKind::OsOverhead) => 14,
      Self::Marker(SnapshotMarkerKind::LoadMapStart) => 15,
      Self::Marker(SnapshotMarkerKind::LoadMapMid) => 16,
      Self::Marker(SnapshotMarkerKind::LoadMapEnd) => 17,
      Self::Marker(SnapshotMarkerKind::GcStart) => 18,
      Self::Marker(SnapshotMarkerKind::GcEnd) => 19,
      Self::Marker(SnapshotMarkerKind::LevelStreamStart) => 20,
      Self::Marker(SnapshotMarkerKind::LevelStreamEnd) => 21,
    }
  }
}

/// One decoded token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AllocationEvent {
  EndOfFile,
  EndOfStream,
  FrameMarker {
    delta_seconds: f32,
  },
  Free {
    pointer: u64,
  },
  Malloc {
    callstack: CallStackIndex,
    pointer: u64,
    pool: MemoryPools,
    script: ScriptContext,
    size: u32,
  },
  Realloc {
    callstack: CallStackIndex,
    new_pointer: u64,
    old_pointer: u64,
    pool: MemoryPools,
    script: ScriptContext,
    size: u32,
  },
  SnapshotMarker {
    kind: SnapshotMarkerKind,
    tag: NameId,
  },
  StatPayload {
    kind: StatKind,
    value: u64,
  },
  TextMarker {
    tag: NameId,
  },
}

impl AllocationEvent {
  /// Main-pool free of `pointer`.
  #[must_use]
  pub fn free(pointer: u64) -> Self {
    Self::Free { pointer }
  }

  /// Main-pool malloc without script context.
  #[must_use]
  pub fn malloc(pointer: u64, size: u32, callstack: CallStackIndex) -> Self {
    Self::Malloc {
      callstack,
      pointer,
      pool: MemoryPools::MAIN,
      script: ScriptContext::default(),
      size,
    }
  }

  /// Main-pool realloc without script context.
  #[must_use]
  pub fn realloc(
    old_pointer: u64,
    new_pointer: u64,
    size: u32,
    callstack: CallStackIndex,
  ) -> Self {
    Self::Realloc {
      callstack,
      new_pointer,
      old_pointer,
      pool: MemoryPools::MAIN,
      script: ScriptContext::default(),
      size,
    }
  }

  #[must_use]
  pub fn snapshot_marker(kind: SnapshotMarkerKind, tag: NameId) -> Self {
    Self::SnapshotMarker { kind, tag }
  }

  /// Replaces the pool of a malloc or realloc; other events pass through.
  #[must_use]
  pub fn with_pool(mut self, pool: MemoryPools) -> Self {
    if let Self::Malloc { pool: slot, .. } | Self::Realloc { pool: slot, .. } =
      &mut self
    {
      *slot = pool;
    }
    self
  }

  /// Replaces the script context of a malloc or realloc.
  #[must_use]
  pub fn with_script(mut self, script: ScriptContext) -> Self {
    if let Self::Malloc { script: slot, .. }
    | Self::Realloc { script: slot, .. } = &mut self
    {
      *slot = script;
    }
    self
  }

  /// The token type byte this event is encoded under.
  #[must_use]
  pub fn token_type(&self) -> TokenType {
    match self {
      Self::Malloc { .. } => TokenType::Malloc,
      Self::Free { .. } => TokenType::Free,
      Self::Realloc { .. } => TokenType::Realloc,
      _ => TokenType::Other,
    }
  }

  /// The subtype byte for `Other` tokens.
  #[must_use]
  pub fn subtype(&self) -> Option<Subtype> {
    match self {
      Self::EndOfFile => Some(Subtype::EndOfFile),
      Self::EndOfStream => Some(Subtype::EndOfStream),
      Self::FrameMarker { .. } => Some(Subtype::FrameTimeMarker),
      Self::SnapshotMarker { kind, .. } => Some(Subtype::Marker(*kind)),
      Self::StatPayload { kind, .. } => Some(Subtype::Stat(*kind)),
      Self::TextMarker { .. } => Some(Subtype::TextMarker),
      Self::Malloc { .. } | Self::Free { .. } | Self::Realloc { .. } => None,
    }
  }
}
