use {
  mprof::{
    ActiveEntry, AllocationEvent, AllocationTotals, CallStackPattern,
    CallStackView, CancellationToken, CsvSource, Endianness, GroupId,
    LoadError, LoadOptions, MemoryParts, MemoryPools, PartSource, Platform,
    ProfileData, ResolvedSymbol, ScriptContext, SnapshotMarkerKind,
    SnapshotStore, SymbolError, TraceLoader, writer::TraceWriter,
  },
  rstest::rstest,
  std::{fs, io, io::Cursor, sync::Arc},
};

fn load(writer: TraceWriter) -> ProfileData {
  load_with(TraceLoader::builder().finish(), writer)
}

fn load_with(mut loader: TraceLoader, writer: TraceWriter) -> ProfileData {
  loader
    .load(MemoryParts::new(writer.finish()))
    .expect("well formed trace")
    .into_profile()
    .expect("not cancelled")
}

fn load_error(writer: TraceWriter) -> LoadError {
  TraceLoader::builder()
    .finish()
    .load(MemoryParts::new(writer.finish()))
    .expect_err("fatal trace")
}

/// Names: 0 "Alloc", 1 "Tick", 2 "Engine.cpp". Six callstacks over three
/// addresses.
fn engine_trace() -> TraceWriter {
  TraceWriter::new()
    .name("Alloc")
    .name("Tick")
    .name("Engine.cpp")
    .address(0x1000, 2, 0, 10)
    .address(0x2000, 2, 1, 20)
    .address(0x3000, -1, -1, 0)
    .callstack([0, 1])
    .callstack([1])
    .callstack([2])
    .callstack([0, 2])
    .callstack([])
    .callstack([1, 2])
}

fn with_events(
  mut writer: TraceWriter,
  events: &[AllocationEvent],
) -> TraceWriter {
  for event in events {
    writer.push(event);
  }
  writer
}

#[rstest]
#[case::little_endian(Endianness::Little)]
#[case::big_endian(Endianness::Big)]
fn both_byte_orders_load_the_same_tables(#[case] endianness: Endianness) {
  let writer = with_events(
    engine_trace().endianness(endianness),
    &[AllocationEvent::malloc(0x10, 32, 1), AllocationEvent::EndOfStream],
  );

  let profile = load(writer);

  assert_eq!(profile.context.header.endianness, endianness);
  assert_eq!(profile.context.catalog.len(), 6);
  assert_eq!(profile.context.names.read().get(1), Some("Tick"));
  assert_eq!(
    profile.snapshots[0].active(),
    &[ActiveEntry::new(1, 32, 1)]
  );
}

#[test]
fn malloc_then_free_leaves_only_lifetime() {
  let profile = load(with_events(
    engine_trace(),
    &[
      AllocationEvent::malloc(0x1000, 128, 3),
      AllocationEvent::free(0x1000),
      AllocationEvent::EndOfStream,
    ],
  ));

  let end = &profile.snapshots[0];

  assert_eq!(end.description(), "End");
  assert!(end.active().iter().all(|entry| entry.callstack != 3));
  assert_eq!(end.lifetime()[3], AllocationTotals::new(128, 1));
  assert_eq!(end.lifetime().len(), 6);
}

#[test]
fn double_malloc_counts_one_anomaly() {
  let profile = load(with_events(
    engine_trace(),
    &[
      AllocationEvent::malloc(0x2000, 64, 5),
      AllocationEvent::malloc(0x2000, 64, 5),
      AllocationEvent::EndOfStream,
    ],
  ));

  assert_eq!(profile.anomalies.double_mallocs, 1);
  assert_eq!(profile.anomalies.total(), 1);

  let end = &profile.snapshots[0];
  assert_eq!(end.live_bytes(), 64);
  assert_eq!(end.live_count(), 1);
  assert_eq!(end.active(), &[ActiveEntry::new(5, 64, 1)]);
}

#[test]
fn marker_snapshots_diff_by_callstack() {
  let profile = load(with_events(
    engine_trace(),
    &[
      AllocationEvent::malloc(0x1, 100, 1),
      AllocationEvent::snapshot_marker(SnapshotMarkerKind::Generic, 0),
      AllocationEvent::malloc(0x2, 50, 1),
      AllocationEvent::malloc(0x3, 10, 2),
      AllocationEvent::snapshot_marker(SnapshotMarkerKind::Generic, 1),
      AllocationEvent::EndOfStream,
    ],
  ));

  let [first, second, end] = profile.snapshots.as_slice() else {
    panic!("expected three snapshots");
  };

  assert_eq!(first.description(), "Snapshot 0: Alloc");
  assert_eq!(second.description(), "Snapshot 1: Tick");
  assert_eq!(end.description(), "End");

  let diff = SnapshotStore::diff(first, second);

  assert_eq!(
    diff.active(),
    &[ActiveEntry::new(1, 50, 1), ActiveEntry::new(2, 10, 1)]
  );
  assert!(diff.is_diff_result());
  assert!(SnapshotStore::diff(second, second).is_empty());
}

#[test]
fn multi_part_recording_continues_in_sibling_files() {
  let dir = tempfile::tempdir().expect("tempdir");
  let base = dir.path().join("capture.mprof");

  let mut writer = engine_trace().version(2);
  writer.push(&AllocationEvent::malloc(0x10, 8, 0));
  writer.end_part();
  writer.push(&AllocationEvent::malloc(0x20, 16, 1));
  writer.end_part();
  writer.push(&AllocationEvent::free(0x10));
  writer.push(&AllocationEvent::EndOfStream);

  let paths = writer.write_files(&base).expect("write parts");

  assert_eq!(paths.len(), 3);
  assert_eq!(paths[1], dir.path().join("capture.m1"));
  assert_eq!(paths[2], dir.path().join("capture.m2"));

  let profile = TraceLoader::builder()
    .finish()
    .load_file(&base)
    .expect("three parts")
    .into_profile()
    .expect("completed");

  let end = &profile.snapshots[0];
  assert_eq!(end.identity().stream_index, 5);
  assert_eq!(end.active(), &[ActiveEntry::new(1, 16, 1)]);
  assert_eq!(profile.frames.stream_indices(), &[0, 6]);
}

#[test]
fn missing_sibling_part_is_fatal() {
  let dir = tempfile::tempdir().expect("tempdir");
  let base = dir.path().join("capture.mprof");

  let mut writer = engine_trace().version(1);
  writer.end_part();
  writer.push(&AllocationEvent::EndOfStream);

  let paths = writer.write_files(&base).expect("write parts");
  fs::remove_file(&paths[1]).expect("remove part 1");

  let error = TraceLoader::builder()
    .finish()
    .load_file(&base)
    .expect_err("part 1 is gone");

  assert!(matches!(error, LoadError::MissingPart { index: 1, .. }));
}

#[test]
fn parts_beyond_the_declared_count_are_fatal() {
  let mut writer = engine_trace().version(3).declared_parts(2);
  writer.end_part();
  writer.end_part();
  writer.push(&AllocationEvent::EndOfStream);

  assert!(matches!(
    load_error(writer),
    LoadError::TooManyParts {
      declared: 2,
      requested: 2
    }
  ));
}

#[test]
fn garbage_magic_is_fatal() {
  let mut loader = TraceLoader::builder().finish();

  let error = loader
    .load(MemoryParts::new([vec![0xAB; 64]]))
    .expect_err("not a trace");

  assert!(matches!(error, LoadError::BadMagic { found: 0xABAB_ABAB }));
}

#[test]
fn unknown_version_is_fatal() {
  let writer = with_events(engine_trace().version(9), &[]);
  assert!(matches!(load_error(writer), LoadError::UnsupportedVersion(9)));
}

#[test]
fn unknown_token_type_is_fatal() {
  let mut writer = engine_trace();
  writer.push(&AllocationEvent::malloc(0x1, 8, 0));
  writer.push_raw(&[9]);

  assert!(matches!(
    load_error(writer),
    LoadError::UnknownTokenType {
      stream_index: 1,
      token_type: 9
    }
  ));
}

#[test]
fn cancellation_returns_no_partial_result() {
  let writer = with_events(
    engine_trace(),
    &[AllocationEvent::malloc(0x1, 8, 0), AllocationEvent::EndOfStream],
  );

  let mut loader = TraceLoader::builder().finish();
  loader.cancellation_token().cancel();

  let outcome = loader
    .load(MemoryParts::new(writer.finish()))
    .expect("cancelled, not failed");

  assert!(outcome.is_cancelled());
  assert!(outcome.into_profile().is_none());
}

/// Fires the token as soon as the replay asks for part 1.
struct CancelOnSecondPart {
  parts: MemoryParts,
  token: CancellationToken,
}

impl PartSource for CancelOnSecondPart {
  type Part = Cursor<Arc<[u8]>>;

  fn open_part(&mut self, index: u64) -> io::Result<Self::Part> {
    if index == 1 {
      self.token.cancel();
    }
    self.parts.open_part(index)
  }
}

#[test]
fn cancellation_during_replay_stops_before_the_next_token() {
  let mut writer = engine_trace().version(2);
  writer.push(&AllocationEvent::malloc(0x1, 8, 0));
  writer.end_part();
  writer.push(&AllocationEvent::malloc(0x2, 8, 0));
  writer.end_part();
  writer.push(&AllocationEvent::EndOfStream);

  let mut parts = writer.finish();
  assert_eq!(parts.len(), 3);
  parts.truncate(2);

  let mut loader = TraceLoader::builder().finish();
  let token = loader.cancellation_token();

  let outcome = loader
    .load(CancelOnSecondPart {
      parts: MemoryParts::new(parts),
      token: token.clone(),
    })
    .expect("part 2 is never requested");

  assert!(token.is_cancelled());
  assert!(outcome.is_cancelled());
  assert!(outcome.into_profile().is_none());
}

#[test]
fn script_offsets_left_unset_load_without_script_context() {
  let writer = with_events(
    engine_trace().version(3).without_script_callstacks(),
    &[
      AllocationEvent::malloc(0x1, 10, 1),
      AllocationEvent::malloc(0x2, 20, 1),
      AllocationEvent::EndOfStream,
    ],
  );

  let profile = load(writer);

  assert_eq!(profile.context.header.script_tables, None);
  assert_eq!(profile.context.catalog.len(), 6);
  assert_eq!(
    profile.snapshots[0].active(),
    &[ActiveEntry::new(1, 30, 2)]
  );
}

#[test]
fn script_vm_frames_are_filtered_when_enabled() {
  let writer = with_events(
    TraceWriter::new()
      .name("UObject::ProcessEvent")
      .name("AActor::Tick")
      .address(0x10, -1, 0, 0)
      .address(0x20, -1, 1, 0)
      .callstack([1, 0, 1]),
    &[AllocationEvent::EndOfStream],
  );

  let keep = load(writer.clone());
  assert_eq!(
    keep.context.catalog.get(0).expect("callstack").addresses(),
    &[1, 0, 1]
  );

  let loader = TraceLoader::builder()
    .options(LoadOptions::default().with_script_vm_filtering())
    .finish();
  let filtered = load_with(loader, writer);

  assert_eq!(
    filtered.context.catalog.get(0).expect("callstack").addresses(),
    &[1, 1]
  );
}

#[test]
fn profile_reports_live_allocations_per_pool() {
  let profile = load(with_events(
    engine_trace(),
    &[
      AllocationEvent::malloc(0x1, 64, 0),
      AllocationEvent::malloc(0x2, 16, 1).with_pool(MemoryPools::LOCAL),
      AllocationEvent::snapshot_marker(SnapshotMarkerKind::Generic, 0),
      AllocationEvent::malloc(0x3, 8, 1).with_pool(MemoryPools::LOCAL),
      AllocationEvent::free(0x1),
      AllocationEvent::EndOfStream,
    ],
  ));

  assert_eq!(profile.pools.main, AllocationTotals::default());
  assert_eq!(profile.pools.local, AllocationTotals::new(24, 2));

  let [marker, end] = profile.snapshots.as_slice() else {
    panic!("expected two snapshots");
  };

  assert_eq!(marker.stats().pools.main, AllocationTotals::new(64, 1));
  assert_eq!(end.stats().pools, profile.pools);

  let diff = SnapshotStore::diff(marker, end);
  assert_eq!(diff.stats().pools.main, AllocationTotals::new(-64, -1));
  assert_eq!(diff.stats().pools.local, AllocationTotals::new(8, 1));
}

#[test]
fn shared_zero_realloc_pointer_suppresses_phantom_frees() {
  let zero = |pointer| AllocationEvent::realloc(0, pointer, 0, 0);

  let profile = load(with_events(
    engine_trace(),
    &[
      zero(0xF00),
      zero(0xF00),
      zero(0xF00),
      AllocationEvent::free(0xF00),
      AllocationEvent::free(0xF00),
      AllocationEvent::malloc(0x10, 24, 1),
      AllocationEvent::EndOfStream,
    ],
  ));

  assert_eq!(profile.anomalies.unmatched_frees, 0);

  let end = &profile.snapshots[0];
  assert_eq!(end.active(), &[ActiveEntry::new(1, 24, 1)]);
}

#[test]
fn script_contexts_reuse_one_virtual_callstack() {
  let script = ScriptContext::from_raw(0, 7);
  let other = ScriptContext::from_raw(0, 8);

  let writer = with_events(
    engine_trace()
      .version(4)
      .script_name("Actor.Tick")
      .script_callstack([0]),
    &[
      AllocationEvent::malloc(0x1, 10, 1).with_script(script),
      AllocationEvent::malloc(0x2, 10, 1).with_script(script),
      AllocationEvent::malloc(0x3, 10, 1).with_script(other),
      AllocationEvent::malloc(0x4, 10, 1),
      AllocationEvent::EndOfStream,
    ],
  );

  let profile = load(writer);
  let catalog = &profile.context.catalog;

  assert_eq!(catalog.native_len(), 6);
  assert_eq!(catalog.len(), 8);

  let virtual_stack = catalog.get(6).expect("virtual callstack");
  assert_eq!(virtual_stack.parent(), Some(1));
  assert_eq!(virtual_stack.script(), Some(script));
  assert_eq!(
    virtual_stack.addresses(),
    catalog.get(1).expect("base").addresses()
  );

  let names = profile.context.names.read();
  let view = CallStackView::new(catalog, &names, 6).expect("view");
  assert_eq!(view.script_frames().collect::<Vec<_>>(), ["Actor.Tick"]);

  let end = &profile.snapshots[0];
  assert_eq!(
    end.active(),
    &[
      ActiveEntry::new(1, 10, 1),
      ActiveEntry::new(6, 20, 2),
      ActiveEntry::new(7, 10, 1),
    ]
  );
  assert_eq!(end.lifetime().len(), 8);
}

#[test]
fn resolver_fills_names_before_frames_are_trimmed() {
  let writer = with_events(
    TraceWriter::new()
      .name("main")
      .symbol_info(false)
      .address(0xA, 0, 0, 0)
      .address(0xB, 0, 0, 0)
      .callstack([0, 1]),
    &[AllocationEvent::malloc(0x1, 4, 0), AllocationEvent::EndOfStream],
  );

  let resolver = |program_counter: u64| match program_counter {
    0xA => Ok(ResolvedSymbol {
      file: "Malloc.cpp".into(),
      function: "FMallocProfiler::Malloc".into(),
      line: 1,
    }),
    0xB => Ok(ResolvedSymbol {
      file: "Game.cpp".into(),
      function: "Spawn".into(),
      line: 77,
    }),
    other => Err(SymbolError::NotFound(other)),
  };

  let profile =
    load_with(TraceLoader::builder().resolver(resolver).finish(), writer);

  let resolution = profile.resolution.expect("resolver ran");
  assert_eq!(resolution.resolved, 2);
  assert_eq!(resolution.new_names, 4);

  let names = profile.context.names.read();
  assert_eq!(names.get(0), Some("main"));

  let catalog = &profile.context.catalog;
  assert_eq!(catalog.get(0).expect("callstack").addresses(), &[1]);

  let frames = CallStackView::new(catalog, &names, 0)
    .expect("view")
    .frames()
    .map(|frame| frame.function)
    .collect::<Vec<_>>();
  assert_eq!(frames, [Some("Spawn")]);
}

#[test]
fn csv_export_is_byte_exact() {
  let profile = load(with_events(
    engine_trace(),
    &[
      AllocationEvent::malloc(0x1, 100, 0),
      AllocationEvent::malloc(0x2, 28, 3),
      AllocationEvent::malloc(0x3, 4, 1),
      AllocationEvent::free(0x3),
      AllocationEvent::EndOfStream,
    ],
  ));

  let end = &profile.snapshots[0];

  let render = |source| {
    let mut buffer = Vec::new();
    profile
      .context
      .with_symbols(|symbols| end.export_csv(source, symbols, &mut buffer))
      .expect("csv");
    String::from_utf8(buffer).expect("utf-8")
  };

  assert_eq!(
    render(CsvSource::Active),
    "100,1,Alloc @ Engine.cpp:10,Tick @ Engine.cpp:20,\n\
     28,1,Alloc @ Engine.cpp:10,<unknown> @ <unknown>:0,\n"
  );

  assert_eq!(
    render(CsvSource::Lifetime),
    "100,1,Alloc @ Engine.cpp:10,Tick @ Engine.cpp:20,\n\
     4,1,Tick @ Engine.cpp:20,\n\
     28,1,Alloc @ Engine.cpp:10,<unknown> @ <unknown>:0,\n"
  );
}

#[test]
fn mobile_csv_rows_carry_function_names_only() {
  let profile = load(with_events(
    engine_trace().platform(Platform::Ios, "IPhone"),
    &[AllocationEvent::malloc(0x1, 100, 0), AllocationEvent::EndOfStream],
  ));

  let mut buffer = Vec::new();
  profile
    .context
    .with_symbols(|symbols| {
      profile.snapshots[0].export_csv(CsvSource::Active, symbols, &mut buffer)
    })
    .expect("csv");

  assert_eq!(
    String::from_utf8(buffer).expect("utf-8"),
    "100,1,Alloc,Tick,\n"
  );
}

struct Calls {
  group: GroupId,
  function: &'static str,
}

impl CallStackPattern for Calls {
  fn group(&self) -> GroupId {
    self.group
  }

  fn matches(&self, view: &CallStackView<'_>) -> bool {
    view.frames().any(|frame| frame.function == Some(self.function))
  }
}

#[test]
fn first_matching_pattern_assigns_the_group() {
  let writer = with_events(engine_trace(), &[AllocationEvent::EndOfStream]);

  let loader = TraceLoader::builder()
    .options(LoadOptions::default().with_container_markers(["Alloc"]))
    .pattern(Calls {
      group: GroupId(1),
      function: "Tick",
    })
    .pattern(Calls {
      group: GroupId(2),
      function: "Alloc",
    })
    .fallback_group(GroupId(9))
    .finish();

  let profile = load_with(loader, writer);
  let catalog = &profile.context.catalog;

  let groups = catalog
    .callstacks()
    .iter()
    .map(|callstack| callstack.group())
    .collect::<Vec<_>>();

  assert_eq!(
    groups,
    [
      Some(GroupId(1)),
      Some(GroupId(1)),
      Some(GroupId(9)),
      Some(GroupId(2)),
      Some(GroupId(9)),
      Some(GroupId(1)),
    ]
  );
  assert_eq!(profile.ungrouped, 2);

  let first = catalog.get(0).expect("callstack");
  assert_eq!(first.first_non_container(), Some(1));
  assert_eq!(catalog.get(4).expect("empty").first_non_container(), None);
}
