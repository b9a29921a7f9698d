use super::*;

/// Index into the callstack table, stable for the whole load.
pub type CallStackIndex = u32;

bitflags! {
  /// Allocator pools a callstack has been seen allocating from.
  #[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
  pub struct MemoryPools: u8 {
    const MAIN = 1;
    const LOCAL = 2;
    const HOST_DEFAULT = 4;
    const HOST_MOVIES = 8;
  }
}

impl Serialize for MemoryPools {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_u8(self.bits())
  }
}

/// One call-site address from the address table.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CallStackAddress {
  pub file: Option<NameId>,
  pub function: Option<NameId>,
  pub line: i32,
  pub program_counter: u64,
}

impl CallStackAddress {
  #[must_use]
  pub fn new(program_counter: u64) -> Self {
    Self {
      program_counter,
      ..Self::default()
    }
  }

  #[must_use]
  pub fn with_symbol(
    mut self,
    function: NameId,
    file: NameId,
    line: i32,
  ) -> Self {
    self.file = Some(file);
    self.function = Some(function);
    self.line = line;
    self
  }
}

/// Script call path that distinguishes a virtual callstack from its base.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct ScriptContext {
  pub callstack: Option<u32>,
  pub object_type: Option<u32>,
}

impl ScriptContext {
  /// Decodes the on-disk pair, where a negative value means absent.
  #[must_use]
  pub fn from_raw(callstack: i32, object_type: i32) -> Self {
    Self {
      callstack: u32::try_from(callstack).ok(),
      object_type: u32::try_from(object_type).ok(),
    }
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.callstack.is_none() && self.object_type.is_none()
  }

  /// The on-disk pair.
  #[must_use]
  pub fn to_raw(self) -> (i32, i32) {
    let encode =
      |value: Option<u32>| value.and_then(|v| i32::try_from(v).ok());
    (
      encode(self.callstack).unwrap_or(-1),
      encode(self.object_type).unwrap_or(-1),
    )
  }
}

/// Ordered script-name indices of one script callstack.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ScriptCallStack {
  pub frames: Vec<u32>,
}

/// One callstack node.
///
/// `addresses` is stored leaf first: element 0 is the frame nearest the
/// allocation call.
#[derive(Debug, Clone, Default)]
pub struct CallStack {
  addresses: Vec<u32>,
  children: HashMap<ScriptContext, CallStackIndex>,
  cross_pool: bool,
  pub(crate) first_non_container: Option<usize>,
  pub(crate) group: Option<GroupId>,
  parent: Option<CallStackIndex>,
  pools: MemoryPools,
  script: Option<ScriptContext>,
}

impl CallStack {
  #[must_use]
  pub fn new(addresses: Vec<u32>) -> Self {
    Self {
      addresses,
      ..Self::default()
    }
  }

  #[must_use]
  pub fn addresses(&self) -> &[u32] {
    &self.addresses
  }

  #[must_use]
  pub fn child(&self, script: &ScriptContext) -> Option<CallStackIndex> {
    self.children.get(script).copied()
  }

  #[must_use]
  pub fn first_non_container(&self) -> Option<usize> {
    self.first_non_container
  }

  #[must_use]
  pub fn group(&self) -> Option<GroupId> {
    self.group
  }

  #[must_use]
  pub fn is_cross_pool(&self) -> bool {
    self.cross_pool
  }

  #[must_use]
  pub fn is_virtual(&self) -> bool {
    self.parent.is_some()
  }

  #[must_use]
  pub fn parent(&self) -> Option<CallStackIndex> {
    self.parent
  }

  #[must_use]
  pub fn pools(&self) -> MemoryPools {
    self.pools
  }

  /// OR-accumulates `pool` into the mask.
  ///
  /// Returns true the first time a pool outside the existing non-empty mask
  /// shows up, i.e. when the callstack becomes cross-pool.
  pub fn record_pool(&mut self, pool: MemoryPools) -> bool {
    let prior = self.pools;
    self.pools |= pool;

    let newly_cross_pool =
      !self.cross_pool && !prior.is_empty() && !prior.contains(pool);

    if newly_cross_pool {
      self.cross_pool = true;
    }

    newly_cross_pool
  }

  #[must_use]
  pub fn script(&self) -> Option<ScriptContext> {
    self.script
  }
}

/// Address, callstack and script tables of one trace.
#[derive(Debug, Clone, Default)]
pub struct CallStackCatalog {
  addresses: Vec<CallStackAddress>,
  callstacks: Vec<CallStack>,
  native_count: usize,
  script_callstacks: Vec<ScriptCallStack>,
  script_names: Vec<String>,
}

impl CallStackCatalog {
  /// Builds a catalog from already-decoded tables.
  #[must_use]
  pub fn new<I>(addresses: Vec<CallStackAddress>, callstacks: I) -> Self
  where
    I: IntoIterator<Item = Vec<u32>>,
  {
    let callstacks = callstacks
      .into_iter()
      .map(CallStack::new)
      .collect::<Vec<_>>();

    Self {
      addresses,
      native_count: callstacks.len(),
      callstacks,
      script_callstacks: Vec::new(),
      script_names: Vec::new(),
    }
  }

  /// Bulk-loads every table the header declares.
  ///
  /// # Errors
  ///
  /// Returns an error if any table is truncated.
  pub fn read<R: Read + Seek>(
    reader: &mut TraceReader<R>,
    header: &TraceHeader,
  ) -> Result<Self, LoadError> {
    reader.seek_to(header.addresses.offset)?;

    let mut addresses = Vec::with_capacity(bounded(header.addresses.entries));

    for _ in 0..header.addresses.entries {
      let program_counter = reader.read_u64()?;

      let address = if header.serializes_symbol_info {
        let file = reader.read_i32()?;
        let function = reader.read_i32()?;
        let line = reader.read_i32()?;

        CallStackAddress {
          file: NameId::try_from(file).ok(),
          function: NameId::try_from(function).ok(),
          line,
          program_counter,
        }
      } else {
        CallStackAddress::new(program_counter)
      };

      addresses.push(address);
    }

    reader.seek_to(header.callstacks.offset)?;

    let mut callstacks = Vec::with_capacity(bounded(header.callstacks.entries));

    for _ in 0..header.callstacks.entries {
      let count = reader.read_u32()?;
      let mut frames = Vec::with_capacity(bounded(u64::from(count)));

      for _ in 0..count {
        frames.push(reader.read_u32()?);
      }

      callstacks.push(frames);
    }

    let mut catalog = Self::new(addresses, callstacks);

    if let Some(script) = header.script_tables {
      catalog.script_names = read_script_names(reader, script)?;
      catalog.script_callstacks = read_script_callstacks(reader, script)?;
    }

    debug!(
      addresses = catalog.addresses.len(),
      callstacks = catalog.callstacks.len(),
      script_callstacks = catalog.script_callstacks.len(),
      script_names = catalog.script_names.len(),
      "loaded callstack catalog"
    );

    Ok(catalog)
  }

  #[must_use]
  pub fn address(&self, index: u32) -> Option<&CallStackAddress> {
    self.addresses.get(index as usize)
  }

  #[must_use]
  pub fn addresses(&self) -> &[CallStackAddress] {
    &self.addresses
  }

  pub(crate) fn addresses_mut(&mut self) -> &mut [CallStackAddress] {
    &mut self.addresses
  }

  #[must_use]
  pub fn callstacks(&self) -> &[CallStack] {
    &self.callstacks
  }

  #[must_use]
  pub fn get(&self, index: CallStackIndex) -> Option<&CallStack> {
    self.callstacks.get(index as usize)
  }

  pub fn get_mut(&mut self, index: CallStackIndex) -> Option<&mut CallStack> {
    self.callstacks.get_mut(index as usize)
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.callstacks.is_empty()
  }

  /// Number of callstacks, virtual ones included.
  #[must_use]
  pub fn len(&self) -> usize {
    self.callstacks.len()
  }

  /// Number of callstacks loaded from the trace, before any virtualization.
  #[must_use]
  pub fn native_len(&self) -> usize {
    self.native_count
  }

  #[must_use]
  pub fn script_callstack(&self, index: u32) -> Option<&ScriptCallStack> {
    self.script_callstacks.get(index as usize)
  }

  #[must_use]
  pub fn script_name(&self, index: u32) -> Option<&str> {
    self.script_names.get(index as usize).map(String::as_str)
  }

  /// Installs script tables, replacing any already loaded.
  pub fn set_script_tables(
    &mut self,
    names: Vec<String>,
    callstacks: Vec<ScriptCallStack>,
  ) {
    self.script_names = names;
    self.script_callstacks = callstacks;
  }

  /// Drops every frame of the script virtual machine's dispatch functions,
  /// wherever it sits in the callstack. Returns the number of frames
  /// removed.
  pub fn filter_script_vm_frames(
    &mut self,
    names: &NameTable,
    markers: &[String],
  ) -> usize {
    if markers.is_empty() {
      return 0;
    }

    let addresses = &self.addresses;
    let mut removed = 0;

    for callstack in &mut self.callstacks {
      let before = callstack.addresses.len();

      callstack
        .addresses
        .retain(|address| !names_frame(addresses, names, *address, markers));

      removed += before - callstack.addresses.len();
    }

    debug!(removed, "filtered script vm frames");

    removed
  }

  /// Drops leaf-side frames whose function name contains any of `markers`.
  ///
  /// These are the profiler's own allocation wrapper frames. At least one
  /// frame is always kept. Returns the number of frames removed.
  pub fn trim_profiler_frames(
    &mut self,
    names: &NameTable,
    markers: &[String],
  ) -> usize {
    if markers.is_empty() {
      return 0;
    }

    let addresses = &self.addresses;
    let mut removed = 0;

    for callstack in &mut self.callstacks {
      let leading = callstack
        .addresses
        .iter()
        .take_while(|address| {
          names_frame(addresses, names, **address, markers)
        })
        .count()
        .min(callstack.addresses.len().saturating_sub(1));

      callstack.addresses.drain(..leading);
      removed += leading;
    }

    debug!(removed, "trimmed profiler frames");

    removed
  }

  /// Resolves the callstack an allocation is attributed to.
  ///
  /// Without script context this is `base`. Otherwise the child of `base`
  /// carrying the same context is returned, creating it on first use as a
  /// copy of `base` with the same addresses and pool mask. Returns `None`
  /// when `base` is out of range.
  pub fn virtualize(
    &mut self,
    base: CallStackIndex,
    script: ScriptContext,
  ) -> Option<CallStackIndex> {
    let parent = self.callstacks.get(base as usize)?;

    if script.is_empty() {
      return Some(base);
    }

    if let Some(child) = parent.child(&script) {
      return Some(child);
    }

    let index = CallStackIndex::try_from(self.callstacks.len()).ok()?;

    let child = CallStack {
      addresses: parent.addresses.clone(),
      children: HashMap::new(),
      cross_pool: false,
      first_non_container: None,
      group: None,
      parent: Some(base),
      pools: parent.pools,
      script: Some(script),
    };

    self.callstacks.push(child);

    if let Some(parent) = self.callstacks.get_mut(base as usize) {
      parent.children.insert(script, index);
    }

    Some(index)
  }
}

/// Whether the function at `address` contains any of `markers`.
pub(crate) fn names_frame(
  addresses: &[CallStackAddress],
  names: &NameTable,
  address: u32,
  markers: &[String],
) -> bool {
  addresses
    .get(address as usize)
    .and_then(|address| address.function)
    .and_then(|function| names.get(function))
    .is_some_and(|function| {
      markers.iter().any(|marker| function.contains(marker.as_str()))
    })
}

fn bounded(entries: u64) -> usize {
  usize::try_from(entries).unwrap_or(usize::MAX).min(1 << 16)
}

fn read_script_names<R: Read + Seek>(
  reader: &mut TraceReader<R>,
  tables: ScriptTables,
) -> Result<Vec<String>, LoadError> {
  reader.seek_to(tables.name_table_offset)?;

  let count = reader.read_u32()?;
  let mut names = Vec::with_capacity(bounded(u64::from(count)));

  for _ in 0..count {
    names.push(reader.read_string()?);
  }

  Ok(names)
}

fn read_script_callstacks<R: Read + Seek>(
  reader: &mut TraceReader<R>,
  tables: ScriptTables,
) -> Result<Vec<ScriptCallStack>, LoadError> {
  reader.seek_to(tables.callstack_table_offset)?;

  let count = reader.read_u32()?;
  let mut callstacks = Vec::with_capacity(bounded(u64::from(count)));

  for _ in 0..count {
    let frames = reader.read_u32()?;
    let mut callstack = ScriptCallStack {
      frames: Vec::with_capacity(bounded(u64::from(frames))),
    };

    for _ in 0..frames {
      if let Ok(frame) = u32::try_from(reader.read_i32()?) {
        callstack.frames.push(frame);
      }
    }

    callstacks.push(callstack);
  }

  Ok(callstacks)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn names(entries: &[&str]) -> NameTable {
    let mut table = NameTable::new();
    for entry in entries {
      table.append(*entry);
    }
    table
  }

  fn catalog() -> CallStackCatalog {
    CallStackCatalog::new(
      vec![
        CallStackAddress::new(0x10).with_symbol(0, 2, 1),
        CallStackAddress::new(0x20).with_symbol(1, 2, 7),
        CallStackAddress::new(0x30).with_symbol(3, 2, 9),
      ],
      [vec![0, 1, 2], vec![0], vec![1, 2]],
    )
  }

  #[test]
  fn virtualize_reuses_children_per_context() {
    let mut catalog = catalog();
    catalog
      .get_mut(2)
      .expect("callstack 2")
      .record_pool(MemoryPools::LOCAL);

    let script = ScriptContext::from_raw(4, 9);

    let first = catalog.virtualize(2, script).expect("in range");
    let again = catalog.virtualize(2, script).expect("in range");
    let other = catalog
      .virtualize(2, ScriptContext::from_raw(5, -1))
      .expect("in range");

    assert_eq!(first, 3);
    assert_eq!(again, first);
    assert_eq!(other, 4);
    assert_eq!(catalog.len(), 5);
    assert_eq!(catalog.native_len(), 3);

    let child = catalog.get(first).expect("child");
    assert_eq!(child.addresses(), &[1, 2]);
    assert_eq!(child.parent(), Some(2));
    assert_eq!(child.pools(), MemoryPools::LOCAL);
    assert_eq!(child.script(), Some(script));
    assert_eq!(child.group(), None);
  }

  #[test]
  fn virtualize_without_context_is_identity() {
    let mut catalog = catalog();

    assert_eq!(catalog.virtualize(1, ScriptContext::default()), Some(1));
    assert_eq!(catalog.virtualize(9, ScriptContext::from_raw(1, 1)), None);
    assert_eq!(catalog.len(), 3);
  }

  #[test]
  fn pools_flag_cross_pool_once() {
    let mut callstack = CallStack::new(vec![0]);

    assert!(!callstack.record_pool(MemoryPools::MAIN));
    assert!(!callstack.record_pool(MemoryPools::MAIN));
    assert!(callstack.record_pool(MemoryPools::LOCAL));
    assert!(!callstack.record_pool(MemoryPools::HOST_MOVIES));

    assert!(callstack.is_cross_pool());
    assert_eq!(
      callstack.pools(),
      MemoryPools::MAIN | MemoryPools::LOCAL | MemoryPools::HOST_MOVIES
    );
  }

  #[test]
  fn unknown_pool_bits_are_retained() {
    let pool = MemoryPools::from_bits_retain(0x41);

    assert!(pool.contains(MemoryPools::MAIN));
    assert_eq!(pool.bits(), 0x41);
  }

  #[test]
  fn trimming_keeps_the_last_frame() {
    let table =
      names(&["MallocProfiler::Malloc", "Tick", "engine.cpp", "Main"]);
    let mut catalog = CallStackCatalog::new(
      vec![
        CallStackAddress::new(0x10).with_symbol(0, 2, 1),
        CallStackAddress::new(0x20).with_symbol(1, 2, 7),
      ],
      [vec![0, 0, 1], vec![0], vec![1, 0]],
    );

    let removed =
      catalog.trim_profiler_frames(&table, &["MallocProfiler".to_string()]);

    assert_eq!(removed, 2);
    assert_eq!(catalog.get(0).expect("cs 0").addresses(), &[1]);
    assert_eq!(catalog.get(1).expect("cs 1").addresses(), &[0]);
    assert_eq!(catalog.get(2).expect("cs 2").addresses(), &[1, 0]);
  }

  #[test]
  fn script_vm_frames_are_removed_anywhere() {
    let table = names(&[
      "UObject::execVirtualFunction",
      "AActor::Tick",
      "UObject::ProcessEvent",
      "engine.cpp",
      "UObject::CallFunction",
    ]);
    let mut catalog = CallStackCatalog::new(
      vec![
        CallStackAddress::new(0x10).with_symbol(0, 3, 1),
        CallStackAddress::new(0x20).with_symbol(1, 3, 7),
        CallStackAddress::new(0x30).with_symbol(2, 3, 9),
        CallStackAddress::new(0x40).with_symbol(4, 3, 11),
      ],
      [vec![1, 0, 2, 1], vec![3, 0], vec![1]],
    );

    let markers = LoadOptions::default().script_vm_frame_markers;
    let removed = catalog.filter_script_vm_frames(&table, &markers);

    assert_eq!(removed, 4);
    assert_eq!(catalog.get(0).expect("cs 0").addresses(), &[1, 1]);
    assert!(catalog.get(1).expect("cs 1").addresses().is_empty());
    assert_eq!(catalog.get(2).expect("cs 2").addresses(), &[1]);
    assert_eq!(catalog.filter_script_vm_frames(&table, &[]), 0);
  }

  #[test]
  fn script_context_raw_round_trip() {
    let context = ScriptContext::from_raw(-1, 12);

    assert_eq!(context.callstack, None);
    assert_eq!(context.object_type, Some(12));
    assert_eq!(context.to_raw(), (-1, 12));
    assert!(ScriptContext::from_raw(-1, -1).is_empty());
  }
}
