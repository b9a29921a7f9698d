use super::*;

/// Live allocations attributed to one callstack.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct ActiveEntry {
  pub callstack: CallStackIndex,
  pub count: i64,
  pub size: i64,
}

impl ActiveEntry {
  #[must_use]
  pub fn new(callstack: CallStackIndex, size: i64, count: i64) -> Self {
    Self {
      callstack,
      count,
      size,
    }
  }

  #[must_use]
  pub fn is_zero(&self) -> bool {
    self.count == 0 && self.size == 0
  }

  fn delta(self, older: Self) -> Self {
    Self {
      callstack: self.callstack,
      count: self.count.saturating_sub(older.count),
      size: self.size.saturating_sub(older.size),
    }
  }

  fn negated(self) -> Self {
    Self {
      callstack: self.callstack,
      count: self.count.saturating_neg(),
      size: self.size.saturating_neg(),
    }
  }
}

/// What produced a snapshot.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub enum SnapshotKind {
  #[default]
  End,
  Marker(SnapshotMarkerKind),
  Synthetic,
}

/// Where in the stream a snapshot was taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SnapshotIdentity {
  /// Seconds since the first token, summed from frame markers.
  pub current_time: f64,
  pub description: String,
  /// Seconds since the previous snapshot.
  pub elapsed_time: f64,
  pub frame_number: u64,
  pub kind: SnapshotKind,
  /// Ordinal of the marker token among all marker tokens.
  pub marker_index: Option<u64>,
  pub stream_index: u64,
}

/// Immutable aggregate of allocation state at one point in the stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
  active: Vec<ActiveEntry>,
  allocation_events: u64,
  identity: SnapshotIdentity,
  lifetime: Vec<AllocationTotals>,
  live: AllocationTotals,
  stats: MemoryStats,
  timeline: Vec<MemorySlice>,
}

impl Serialize for Snapshot {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut state = serializer.serialize_struct("Snapshot", 8)?;
    state.serialize_field("identity", &self.identity)?;
    state.serialize_field("is_diff_result", &false)?;
    state.serialize_field("allocation_events", &self.allocation_events)?;
    state.serialize_field("live", &self.live)?;
    state.serialize_field("stats", &self.stats)?;
    state.serialize_field("active", &self.active)?;
    state.serialize_field("lifetime", &self.lifetime)?;
    state.serialize_field("timeline", &self.timeline)?;
    state.end()
  }
}

impl Snapshot {
  /// Non-zero live entries, strictly ascending by callstack.
  #[must_use]
  pub fn active(&self) -> &[ActiveEntry] {
    &self.active
  }

  #[must_use]
  pub fn allocation_events(&self) -> u64 {
    self.allocation_events
  }

  #[must_use]
  pub fn description(&self) -> &str {
    &self.identity.description
  }

  #[must_use]
  pub fn identity(&self) -> &SnapshotIdentity {
    &self.identity
  }

  #[must_use]
  pub fn is_diff_result(&self) -> bool {
    false
  }

  /// Lifetime churn indexed by callstack.
  #[must_use]
  pub fn lifetime(&self) -> &[AllocationTotals] {
    &self.lifetime
  }

  #[must_use]
  pub fn live_bytes(&self) -> i64 {
    self.live.size
  }

  #[must_use]
  pub fn live_count(&self) -> i64 {
    self.live.count
  }

  #[must_use]
  pub fn stats(&self) -> &MemoryStats {
    &self.stats
  }

  #[must_use]
  pub fn timeline(&self) -> &[MemorySlice] {
    &self.timeline
  }
}

/// Signed difference between two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
  active: Vec<ActiveEntry>,
  allocation_events: i64,
  identity: SnapshotIdentity,
  lifetime: Vec<AllocationTotals>,
  live: AllocationTotals,
  stats: MemoryStats,
  timeline: Vec<MemorySlice>,
}

impl Serialize for SnapshotDiff {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut state = serializer.serialize_struct("SnapshotDiff", 8)?;
    state.serialize_field("identity", &self.identity)?;
    state.serialize_field("is_diff_result", &true)?;
    state.serialize_field("allocation_events", &self.allocation_events)?;
    state.serialize_field("live", &self.live)?;
    state.serialize_field("stats", &self.stats)?;
    state.serialize_field("active", &self.active)?;
    state.serialize_field("lifetime", &self.lifetime)?;
    state.serialize_field("timeline", &self.timeline)?;
    state.end()
  }
}

impl SnapshotDiff {
  /// Entries whose live size or count changed, ascending by callstack.
  #[must_use]
  pub fn active(&self) -> &[ActiveEntry] {
    &self.active
  }

  #[must_use]
  pub fn allocation_events(&self) -> i64 {
    self.allocation_events
  }

  #[must_use]
  pub fn description(&self) -> &str {
    &self.identity.description
  }

  #[must_use]
  pub fn identity(&self) -> &SnapshotIdentity {
    &self.identity
  }

  #[must_use]
  pub fn is_diff_result(&self) -> bool {
    true
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.active.is_empty()
      && self.lifetime.iter().all(AllocationTotals::is_zero)
  }

  #[must_use]
  pub fn lifetime(&self) -> &[AllocationTotals] {
    &self.lifetime
  }

  #[must_use]
  pub fn live_bytes(&self) -> i64 {
    self.live.size
  }

  #[must_use]
  pub fn live_count(&self) -> i64 {
    self.live.count
  }

  #[must_use]
  pub fn stats(&self) -> &MemoryStats {
    &self.stats
  }

  /// Samples recorded after the older snapshot was taken.
  #[must_use]
  pub fn timeline(&self) -> &[MemorySlice] {
    &self.timeline
  }
}

/// Ordered snapshots of one load.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
  snapshots: Vec<Snapshot>,
}

impl SnapshotStore {
  /// Finalizes the tracker state and appends it.
  pub fn capture(
    &mut self,
    tracker: &AllocationTracker,
    callstack_count: usize,
    identity: SnapshotIdentity,
  ) -> &Snapshot {
    let index = self.snapshots.len();

    self
      .snapshots
      .push(Self::finalize(tracker, callstack_count, identity));

    &self.snapshots[index]
  }

  #[must_use]
  pub fn deep_copy(snapshot: &Snapshot) -> Snapshot {
    snapshot.clone()
  }

  /// `newer - older`, merging both active lists by callstack.
  #[must_use]
  pub fn diff(older: &Snapshot, newer: &Snapshot) -> SnapshotDiff {
    let mut active =
      Vec::with_capacity(older.active.len().max(newer.active.len()));

    let mut left = older.active.iter().peekable();
    let mut right = newer.active.iter().peekable();

    loop {
      let entry = match (left.peek().copied(), right.peek().copied()) {
        (Some(old), Some(new)) => match old.callstack.cmp(&new.callstack) {
          Ordering::Less => {
            left.next();
            Some(old.negated())
          }
          Ordering::Greater => {
            right.next();
            Some(*new)
          }
          Ordering::Equal => {
            left.next();
            right.next();
            Some(new.delta(*old)).filter(|entry| !entry.is_zero())
          }
        },
        (Some(old), None) => {
          left.next();
          Some(old.negated())
        }
        (None, Some(new)) => {
          right.next();
          Some(*new)
        }
        (None, None) => break,
      };

      if let Some(entry) = entry {
        debug_assert!(
          active
            .last()
            .is_none_or(|last: &ActiveEntry| last.callstack < entry.callstack),
          "diff output must be strictly ascending"
        );

        active.push(entry);
      }
    }

    let len = older.lifetime.len().max(newer.lifetime.len());

    let lifetime = (0..len)
      .map(|index| {
        let old = older.lifetime.get(index).copied().unwrap_or_default();
        let new = newer.lifetime.get(index).copied().unwrap_or_default();
        new.delta(old)
      })
      .collect();

    let timeline = newer
      .timeline
      .iter()
      .filter(|slice| slice.stream_index > older.identity.stream_index)
      .copied()
      .collect();

    let identity = SnapshotIdentity {
      current_time: newer.identity.current_time,
      description: format!(
        "{} -> {}",
        older.identity.description, newer.identity.description
      ),
      elapsed_time: newer.identity.current_time - older.identity.current_time,
      frame_number: newer.identity.frame_number,
      kind: newer.identity.kind,
      marker_index: newer.identity.marker_index,
      stream_index: newer.identity.stream_index,
    };

    SnapshotDiff {
      active,
      allocation_events: signed(newer.allocation_events)
        .saturating_sub(signed(older.allocation_events)),
      identity,
      lifetime,
      live: newer.live.delta(older.live),
      stats: newer.stats.delta(&older.stats),
      timeline,
    }
  }

  /// Groups the live index by callstack into a new snapshot.
  ///
  /// The lifetime array is padded to `callstack_count`.
  #[must_use]
  pub fn finalize(
    tracker: &AllocationTracker,
    callstack_count: usize,
    identity: SnapshotIdentity,
  ) -> Snapshot {
    let mut grouped: HashMap<
      CallStackIndex,
      ActiveEntry,
      BuildNoHashHasher<CallStackIndex>,
    > = HashMap::default();

    for record in tracker.live_records() {
      let entry = grouped
        .entry(record.callstack)
        .or_insert_with(|| ActiveEntry::new(record.callstack, 0, 0));

      entry.size = entry.size.saturating_add(signed(record.size));
      entry.count += 1;
    }

    let mut active = grouped
      .into_values()
      .filter(|entry| !entry.is_zero())
      .collect::<Vec<_>>();

    active.sort_unstable_by_key(|entry| entry.callstack);

    let mut lifetime = tracker.lifetime().to_vec();

    if lifetime.len() < callstack_count {
      lifetime.resize(callstack_count, AllocationTotals::default());
    }

    Snapshot {
      active,
      allocation_events: tracker.event_count(),
      identity,
      lifetime,
      live: tracker.live_totals(),
      stats: tracker.stats(),
      timeline: tracker.timeline().to_vec(),
    }
  }

  #[must_use]
  pub fn get(&self, index: usize) -> Option<&Snapshot> {
    self.snapshots.get(index)
  }

  #[must_use]
  pub fn into_snapshots(self) -> Vec<Snapshot> {
    self.snapshots
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.snapshots.is_empty()
  }

  #[must_use]
  pub fn last(&self) -> Option<&Snapshot> {
    self.snapshots.last()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.snapshots.len()
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Extends every lifetime array to `len` entries.
  pub fn pad_lifetimes(&mut self, len: usize) {
    for snapshot in &mut self.snapshots {
      if snapshot.lifetime.len() < len {
        snapshot.lifetime.resize(len, AllocationTotals::default());
      }
    }
  }

  #[must_use]
  pub fn snapshots(&self) -> &[Snapshot] {
    &self.snapshots
  }
}

fn signed(value: u64) -> i64 {
  i64::try_from(value).unwrap_or(i64::MAX)
}
