use {
  super::*,
  parking_lot::{RwLock, RwLockReadGuard},
};

/// Index into a [`NameTable`].
pub type NameId = u32;

#[derive(Debug, thiserror::Error)]
pub enum NameTableError {
  #[error(
    "replacement table with {replacement} names does not extend the current \
     {current}"
  )]
  NotAnExtension { current: usize, replacement: usize },
}

/// Interned string pool referenced by index from the address table.
///
/// Entries are never removed or reordered, so a [`NameId`] handed out once
/// stays valid for the whole load. Duplicate strings may exist when the
/// on-disk table carries them; lookups return the first index.
#[derive(Debug, Clone, Default)]
pub struct NameTable {
  entries: Vec<Arc<str>>,
  index: HashMap<Arc<str>, NameId>,
}

impl NameTable {
  /// Appends `name` and returns its index, even if it is already present.
  pub fn append(&mut self, name: impl Into<Arc<str>>) -> NameId {
    let name = name.into();
    let id = NameId::try_from(self.entries.len()).unwrap_or(NameId::MAX);

    self.index.entry(Arc::clone(&name)).or_insert(id);
    self.entries.push(name);

    id
  }

  #[must_use]
  pub fn find(&self, name: &str) -> Option<NameId> {
    self.index.get(name).copied()
  }

  #[must_use]
  pub fn get(&self, id: NameId) -> Option<&str> {
    self.entries.get(id as usize).map(AsRef::as_ref)
  }

  /// Looks `name` up, appending it when missing.
  pub fn intern(&mut self, name: &str) -> NameId {
    match self.find(name) {
      Some(id) => id,
      None => self.append(name),
    }
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Bulk-loads the on-disk name table, leaving the reader after its last
  /// entry.
  ///
  /// # Errors
  ///
  /// Returns an error if the table is truncated.
  pub fn read<R: Read + Seek>(
    reader: &mut TraceReader<R>,
    location: TableLocation,
  ) -> Result<Self, LoadError> {
    reader.seek_to(location.offset)?;

    let mut table = Self::new();

    for _ in 0..location.entries {
      table.append(reader.read_string()?);
    }

    debug!(names = table.len(), "loaded name table");

    Ok(table)
  }

  /// True when every entry of `self` sits at the same index in `other`.
  #[must_use]
  pub fn is_prefix_of(&self, other: &Self) -> bool {
    self.len() <= other.len()
      && self
        .entries
        .iter()
        .zip(&other.entries)
        .all(|(current, candidate)| current == candidate)
  }
}

/// A [`NameTable`] behind a single-writer, many-reader lock.
#[derive(Debug, Clone, Default)]
pub struct SharedNameTable {
  inner: Arc<RwLock<NameTable>>,
}

impl From<NameTable> for SharedNameTable {
  fn from(table: NameTable) -> Self {
    Self {
      inner: Arc::new(RwLock::new(table)),
    }
  }
}

impl SharedNameTable {
  pub fn read(&self) -> RwLockReadGuard<'_, NameTable> {
    self.inner.read()
  }

  /// Swaps in `replacement` under the write lock.
  ///
  /// # Errors
  ///
  /// Returns [`NameTableError::NotAnExtension`] when `replacement` drops or
  /// moves an existing entry; the current table is left untouched.
  pub fn replace(&self, replacement: NameTable) -> Result<(), NameTableError> {
    let mut guard = self.inner.write();

    if !guard.is_prefix_of(&replacement) {
      return Err(NameTableError::NotAnExtension {
        current: guard.len(),
        replacement: replacement.len(),
      });
    }

    *guard = replacement;

    Ok(())
  }

  /// Clones the current table out of the lock.
  #[must_use]
  pub fn snapshot(&self) -> NameTable {
    self.inner.read().clone()
  }
}
