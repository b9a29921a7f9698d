//! Ingestion engine for memory profiler traces.
//!
//! A trace is a binary capture written by an instrumented runtime: a header,
//! a stream of allocation tokens, and bulk tables describing names, call-site
//! addresses and callstacks. Loading a trace replays every token against a
//! live-pointer index and yields an ordered list of immutable snapshots that
//! can be diffed and exported.

mod callstack;
mod classify;
mod config;
mod decoder;
mod error;
mod event;
mod export;
mod header;
mod loader;
mod names;
mod reader;
mod snapshot;
mod symbols;
mod timer;
mod tracker;
pub mod writer;

use {
  bitflags::bitflags,
  byteorder::{BigEndian, LittleEndian, ReadBytesExt},
  memmap2::Mmap,
  nohash_hasher::BuildNoHashHasher,
  serde::{Serialize, Serializer, ser::SerializeStruct},
  std::{
    cmp::Ordering,
    collections::HashMap,
    fs::File,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    path::PathBuf,
    sync::Arc,
  },
  tracing::{debug, warn},
};

pub use {
  callstack::{
    CallStack, CallStackAddress, CallStackCatalog, CallStackIndex,
    MemoryPools, ScriptCallStack, ScriptContext,
  },
  classify::{CallStackPattern, CallStackView, FrameView, GroupId},
  config::{LoadOptions, MarkerSnapshots},
  decoder::{TokenDecoder, TokenStream},
  error::LoadError,
  event::{AllocationEvent, SnapshotMarkerKind, StatKind, Subtype, TokenType},
  export::{
    CsvSource, ExportError, JsonLinesWriter, SnapshotStreamWriter,
    SymbolContext,
  },
  header::{
    CURRENT_VERSION, HeaderLayout, MIN_VERSION, NO_SCRIPT_TABLE, Platform,
    ScriptTables, TRACE_MAGIC, TableLocation, TraceHeader,
  },
  loader::{
    CancellationToken, FrameTimeline, LoadOutcome, ProfileData, TraceContext,
    TraceLoader, TraceLoaderBuilder,
  },
  names::{NameId, NameTable, NameTableError, SharedNameTable},
  reader::{Endianness, FileParts, MemoryParts, PartSource, TraceReader},
  snapshot::{
    ActiveEntry, Snapshot, SnapshotDiff, SnapshotIdentity, SnapshotKind,
    SnapshotStore,
  },
  symbols::{
    RESOLVE_BATCH_SIZE, ResolutionSummary, ResolvedSymbol, SymbolError,
    SymbolResolver, resolve_symbols,
  },
  tracker::{
    AllocationTotals, AllocationTracker, AnomalyCounts, MemorySlice,
    MemoryStats, PointerRecord, PoolUsage,
  },
};
