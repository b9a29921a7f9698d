use super::*;

/// Size and count pair used for live totals, lifetime churn and diffs.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct AllocationTotals {
  pub count: i64,
  pub size: i64,
}

impl AllocationTotals {
  #[must_use]
  pub fn new(size: i64, count: i64) -> Self {
    Self { count, size }
  }

  pub fn add(&mut self, size: i64, count: i64) {
    self.count = self.count.saturating_add(count);
    self.size = self.size.saturating_add(size);
  }

  /// `self - older`, saturating.
  #[must_use]
  pub fn delta(self, older: Self) -> Self {
    Self {
      count: self.count.saturating_sub(older.count),
      size: self.size.saturating_sub(older.size),
    }
  }

  #[must_use]
  pub fn is_zero(&self) -> bool {
    self.count == 0 && self.size == 0
  }

  #[must_use]
  pub fn negated(self) -> Self {
    Self {
      count: self.count.saturating_neg(),
      size: self.size.saturating_neg(),
    }
  }
}

/// The live allocation behind one pointer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PointerRecord {
  pub callstack: CallStackIndex,
  pub pool: MemoryPools,
  pub size: u64,
}

/// Live size and count per memory pool.
///
/// A token names exactly one pool in practice. Masks with no known bit, or
/// with more than one, are accounted under `other`.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct PoolUsage {
  pub host_default: AllocationTotals,
  pub host_movies: AllocationTotals,
  pub local: AllocationTotals,
  pub main: AllocationTotals,
  pub other: AllocationTotals,
}

impl PoolUsage {
  pub fn add(&mut self, pool: MemoryPools, size: i64, count: i64) {
    self.slot_mut(pool).add(size, count);
  }

  #[must_use]
  pub fn delta(&self, older: &Self) -> Self {
    Self {
      host_default: self.host_default.delta(older.host_default),
      host_movies: self.host_movies.delta(older.host_movies),
      local: self.local.delta(older.local),
      main: self.main.delta(older.main),
      other: self.other.delta(older.other),
    }
  }

  #[must_use]
  pub fn get(&self, pool: MemoryPools) -> AllocationTotals {
    let mut copy = *self;
    *copy.slot_mut(pool)
  }

  fn slot_mut(&mut self, pool: MemoryPools) -> &mut AllocationTotals {
    let known = pool.intersection(MemoryPools::all());

    if known == MemoryPools::MAIN {
      &mut self.main
    } else if known == MemoryPools::LOCAL {
      &mut self.local
    } else if known == MemoryPools::HOST_DEFAULT {
      &mut self.host_default
    } else if known == MemoryPools::HOST_MOVIES {
      &mut self.host_movies
    } else {
      &mut self.other
    }
  }
}

/// Recoverable oddities observed while loading.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct AnomalyCounts {
  pub cross_pool_callstacks: u64,
  pub double_mallocs: u64,
  pub out_of_range_callstacks: u64,
  pub unmatched_frees: u64,
  pub unresolved_symbols: u64,
}

impl AnomalyCounts {
  #[must_use]
  pub fn total(&self) -> u64 {
    self
      .cross_pool_callstacks
      .saturating_add(self.double_mallocs)
      .saturating_add(self.out_of_range_callstacks)
      .saturating_add(self.unmatched_frees)
      .saturating_add(self.unresolved_symbols)
  }
}

/// Last platform statistics reported by the stream.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct MemoryStats {
  pub cpu_slack: i64,
  pub cpu_used: i64,
  pub cpu_waste: i64,
  pub gpu_slack: i64,
  pub gpu_used: i64,
  pub gpu_waste: i64,
  pub image_size: i64,
  pub os_overhead: i64,
  /// Live allocations per pool, kept by the replay rather than reported.
  pub pools: PoolUsage,
  pub total_allocated: i64,
  pub total_used: i64,
}

impl MemoryStats {
  pub fn apply(&mut self, kind: StatKind, value: u64) {
    let value = i64::try_from(value).unwrap_or(i64::MAX);

    let slot = match kind {
      StatKind::TotalUsed => &mut self.total_used,
      StatKind::TotalAllocated => &mut self.total_allocated,
      StatKind::CpuUsed => &mut self.cpu_used,
      StatKind::CpuSlack => &mut self.cpu_slack,
      StatKind::CpuWaste => &mut self.cpu_waste,
      StatKind::GpuUsed => &mut self.gpu_used,
      StatKind::GpuSlack => &mut self.gpu_slack,
      StatKind::GpuWaste => &mut self.gpu_waste,
      StatKind::ImageSize => &mut self.image_size,
      StatKind::OsOverhead => &mut self.os_overhead,
    };

    *slot = value;
  }

  #[must_use]
  pub fn delta(&self, older: &Self) -> Self {
    Self {
      cpu_slack: self.cpu_slack.saturating_sub(older.cpu_slack),
      cpu_used: self.cpu_used.saturating_sub(older.cpu_used),
      cpu_waste: self.cpu_waste.saturating_sub(older.cpu_waste),
      gpu_slack: self.gpu_slack.saturating_sub(older.gpu_slack),
      gpu_used: self.gpu_used.saturating_sub(older.gpu_used),
      gpu_waste: self.gpu_waste.saturating_sub(older.gpu_waste),
      image_size: self.image_size.saturating_sub(older.image_size),
      os_overhead: self.os_overhead.saturating_sub(older.os_overhead),
      pools: self.pools.delta(&older.pools),
      total_allocated: self
        .total_allocated
        .saturating_sub(older.total_allocated),
      total_used: self.total_used.saturating_sub(older.total_used),
    }
  }
}

/// One timeline sample.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct MemorySlice {
  pub live_bytes: i64,
  pub live_count: i64,
  /// Highest live byte count since the previous sample.
  pub peak_bytes: i64,
  pub stream_index: u64,
  pub total_used: i64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ZeroRealloc {
  Track,
  Suppress { newly_confirmed: bool },
}

/// Detects allocators that hand out one shared pointer for every
/// `realloc(null, 0)`.
///
/// The first such return is unreliable, so the second and third are
/// compared; a match confirms the sentinel. Frees of a pending candidate
/// while detecting undo its count.
#[derive(Debug, Clone, Copy)]
struct ReallocZeroDetector {
  confirmed: bool,
  detecting: bool,
  pending: u32,
  sentinel: u64,
}

impl Default for ReallocZeroDetector {
  fn default() -> Self {
    Self {
      confirmed: false,
      detecting: true,
      pending: 0,
      sentinel: 0,
    }
  }
}

impl ReallocZeroDetector {
  /// Returns true when the free must not touch the live index.
  fn on_free(&mut self, pointer: u64) -> bool {
    if self.detecting {
      if self.pending > 0 && pointer == self.sentinel {
        self.pending -= 1;
      }
      return false;
    }

    self.confirmed && pointer == self.sentinel
  }

  fn on_zero_realloc(&mut self, new_pointer: u64) -> ZeroRealloc {
    let mut newly_confirmed = false;

    if self.detecting {
      if self.pending > 1 {
        self.confirmed = new_pointer == self.sentinel;
        self.detecting = false;
        newly_confirmed = self.confirmed;

        debug!(
          sentinel = self.sentinel,
          confirmed = self.confirmed,
          "finished realloc(null, 0) sentinel detection"
        );
      } else {
        self.sentinel = new_pointer;
        self.pending += 1;
      }
    }

    if self.confirmed {
      ZeroRealloc::Suppress { newly_confirmed }
    } else {
      ZeroRealloc::Track
    }
  }
}

/// Replays allocation events against a live pointer index.
#[derive(Debug)]
pub struct AllocationTracker {
  anomalies: AnomalyCounts,
  event_count: u64,
  lifetime: Vec<AllocationTotals>,
  live: AllocationTotals,
  peak_bytes: i64,
  pointers: HashMap<u64, PointerRecord, BuildNoHashHasher<u64>>,
  realloc_zero: ReallocZeroDetector,
  sample_interval: u64,
  stats: MemoryStats,
  stream_index: u64,
  timeline: Vec<MemorySlice>,
}

impl Default for AllocationTracker {
  fn default() -> Self {
    Self::new(5000)
  }
}

impl AllocationTracker {
  /// Routes one event to the matching handler. Events that do not touch
  /// allocation state are ignored.
  pub fn apply(
    &mut self,
    catalog: &mut CallStackCatalog,
    stream_index: u64,
    event: &AllocationEvent,
  ) {
    self.stream_index = stream_index;

    match *event {
      AllocationEvent::Malloc {
        callstack,
        pointer,
        pool,
        script,
        size,
      } => self.on_malloc(catalog, pointer, size, callstack, pool, script),
      AllocationEvent::Free { pointer } => self.on_free(pointer),
      AllocationEvent::Realloc {
        callstack,
        new_pointer,
        old_pointer,
        pool,
        script,
        size,
      } => self.on_realloc(
        catalog,
        old_pointer,
        (new_pointer, size),
        callstack,
        pool,
        script,
      ),
      AllocationEvent::StatPayload { kind, value } => self.on_stat(kind, value),
      _ => {}
    }
  }

  #[must_use]
  pub fn anomalies(&self) -> AnomalyCounts {
    self.anomalies
  }

  /// Allocation bookkeeping events applied so far, frees included.
  #[must_use]
  pub fn event_count(&self) -> u64 {
    self.event_count
  }

  #[must_use]
  pub fn lifetime(&self) -> &[AllocationTotals] {
    &self.lifetime
  }

  #[must_use]
  pub fn live_record(&self, pointer: u64) -> Option<&PointerRecord> {
    self.pointers.get(&pointer)
  }

  pub fn live_records(&self) -> impl Iterator<Item = &PointerRecord> {
    self.pointers.values()
  }

  #[must_use]
  pub fn live_totals(&self) -> AllocationTotals {
    self.live
  }

  #[must_use]
  pub fn new(sample_interval: u64) -> Self {
    Self {
      anomalies: AnomalyCounts::default(),
      event_count: 0,
      lifetime: Vec::new(),
      live: AllocationTotals::default(),
      peak_bytes: 0,
      pointers: HashMap::default(),
      realloc_zero: ReallocZeroDetector::default(),
      sample_interval,
      stats: MemoryStats::default(),
      stream_index: 0,
      timeline: Vec::new(),
    }
  }

  pub fn on_free(&mut self, pointer: u64) {
    if pointer == 0 || self.realloc_zero.on_free(pointer) {
      return;
    }

    self.release(pointer);
  }

  pub fn on_malloc(
    &mut self,
    catalog: &mut CallStackCatalog,
    pointer: u64,
    size: u32,
    callstack: CallStackIndex,
    pool: MemoryPools,
    script: ScriptContext,
  ) {
    if pointer == 0 {
      return;
    }

    let in_range = (callstack as usize) < catalog.native_len();

    let Some(callstack) = in_range
      .then(|| catalog.virtualize(callstack, script))
      .flatten()
    else {
      self.anomalies.out_of_range_callstacks += 1;
      debug!(
        pointer,
        callstack,
        stream_index = self.stream_index,
        "allocation references an unknown callstack"
      );
      return;
    };

    if let Some(node) = catalog.get_mut(callstack)
      && node.record_pool(pool)
    {
      self.anomalies.cross_pool_callstacks += 1;
      debug!(
        callstack,
        pools = node.pools().bits(),
        "callstack allocates from more than one pool"
      );
    }

    let record = PointerRecord {
      callstack,
      pool,
      size: u64::from(size),
    };

    if let Some(previous) = self.pointers.insert(pointer, record) {
      self.anomalies.double_mallocs += 1;
      self.live.add(-signed(previous.size), -1);
      self.stats.pools.add(previous.pool, -signed(previous.size), -1);

      debug!(
        pointer,
        pool = pool.bits(),
        stream_index = self.stream_index,
        "same pointer allocated twice without a free"
      );
    }

    let index = callstack as usize;

    if self.lifetime.len() <= index {
      self.lifetime.resize(index + 1, AllocationTotals::default());
    }

    self.lifetime[index].add(i64::from(size), 1);
    self.live.add(i64::from(size), 1);
    self.stats.pools.add(pool, i64::from(size), 1);
    self.peak_bytes = self.peak_bytes.max(self.live.size);

    self.count_event();
  }

  /// `old_pointer` is freed first when non-null. A zero size is a pure free,
  /// except for `realloc(null, 0)` which goes through sentinel detection.
  pub fn on_realloc(
    &mut self,
    catalog: &mut CallStackCatalog,
    old_pointer: u64,
    (new_pointer, size): (u64, u32),
    callstack: CallStackIndex,
    pool: MemoryPools,
    script: ScriptContext,
  ) {
    if old_pointer != 0 {
      self.on_free(old_pointer);

      if size == 0 {
        return;
      }
    } else if size == 0 {
      match self.realloc_zero.on_zero_realloc(new_pointer) {
        ZeroRealloc::Track => {}
        ZeroRealloc::Suppress { newly_confirmed } => {
          if newly_confirmed {
            self.evict(new_pointer);
          }
          return;
        }
      }
    }

    if new_pointer != 0 {
      self.on_malloc(catalog, new_pointer, size, callstack, pool, script);
    }
  }

  pub fn on_stat(&mut self, kind: StatKind, value: u64) {
    self.stats.apply(kind, value);
  }

  /// Adds resolver failures to the anomaly counts.
  pub fn record_unresolved_symbols(&mut self, count: u64) {
    self.anomalies.unresolved_symbols += count;
  }

  #[must_use]
  pub fn stats(&self) -> MemoryStats {
    self.stats
  }

  #[must_use]
  pub fn stream_index(&self) -> u64 {
    self.stream_index
  }

  #[must_use]
  pub fn timeline(&self) -> &[MemorySlice] {
    &self.timeline
  }

  fn count_event(&mut self) {
    self.event_count += 1;

    if self.sample_interval > 0 && self.event_count % self.sample_interval == 0
    {
      self.timeline.push(MemorySlice {
        live_bytes: self.live.size,
        live_count: self.live.count,
        peak_bytes: self.peak_bytes,
        stream_index: self.stream_index,
        total_used: self.stats.total_used,
      });

      self.peak_bytes = self.live.size;
    }
  }

  /// Drops the sentinel's tracked record without counting a free.
  fn evict(&mut self, pointer: u64) {
    if let Some(record) = self.pointers.remove(&pointer) {
      self.live.add(-signed(record.size), -1);
      self.stats.pools.add(record.pool, -signed(record.size), -1);
    }
  }

  fn release(&mut self, pointer: u64) {
    let Some(record) = self.pointers.remove(&pointer) else {
      self.anomalies.unmatched_frees += 1;
      debug!(
        pointer,
        stream_index = self.stream_index,
        "free without a live allocation"
      );
      return;
    };

    self.live.add(-signed(record.size), -1);
    self.stats.pools.add(record.pool, -signed(record.size), -1);

    self.count_event();
  }
}

fn signed(size: u64) -> i64 {
  i64::try_from(size).unwrap_or(i64::MAX)
}
