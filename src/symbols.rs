use super::*;

/// Addresses handed to [`SymbolResolver::resolve_batch`] at once.
pub const RESOLVE_BATCH_SIZE: usize = 5000;

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ResolvedSymbol {
  pub file: String,
  pub function: String,
  pub line: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
  #[error("no symbol for program counter {0:#x}")]
  NotFound(u64),
  #[error("symbol service failed: {0}")]
  Service(String),
}

/// External symbol lookup service.
pub trait SymbolResolver {
  /// # Errors
  ///
  /// Returns an error when `program_counter` cannot be resolved.
  fn resolve(
    &mut self,
    program_counter: u64,
  ) -> Result<ResolvedSymbol, SymbolError>;

  /// Resolves a batch; one result per input, in order.
  fn resolve_batch(
    &mut self,
    program_counters: &[u64],
  ) -> Vec<Result<ResolvedSymbol, SymbolError>> {
    program_counters
      .iter()
      .map(|program_counter| self.resolve(*program_counter))
      .collect()
  }
}

impl<F> SymbolResolver for F
where
  F: FnMut(u64) -> Result<ResolvedSymbol, SymbolError>,
{
  fn resolve(
    &mut self,
    program_counter: u64,
  ) -> Result<ResolvedSymbol, SymbolError> {
    self(program_counter)
  }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct ResolutionSummary {
  pub failed: u64,
  pub new_names: usize,
  pub resolved: u64,
}

/// Resolves every address that carries no function name.
///
/// New strings are appended to a copy of the name table which is swapped in
/// once all batches finish, so existing ids never move. Failed addresses keep
/// their placeholder names.
///
/// # Errors
///
/// Returns [`NameTableError`] if the shared table changed underneath the
/// resolution in a way that is not an extension.
pub fn resolve_symbols(
  names: &SharedNameTable,
  catalog: &mut CallStackCatalog,
  resolver: &mut dyn SymbolResolver,
) -> Result<ResolutionSummary, NameTableError> {
  let mut table = names.snapshot();
  let before = table.len();

  let pending = catalog
    .addresses()
    .iter()
    .enumerate()
    .filter(|(_, address)| address.function.is_none())
    .map(|(index, _)| index)
    .collect::<Vec<_>>();

  let mut summary = ResolutionSummary::default();

  for batch in pending.chunks(RESOLVE_BATCH_SIZE) {
    let addresses = catalog.addresses_mut();

    let program_counters = batch
      .iter()
      .map(|index| addresses[*index].program_counter)
      .collect::<Vec<_>>();

    let mut results = resolver.resolve_batch(&program_counters).into_iter();

    for index in batch {
      let address = &mut addresses[*index];

      match results.next() {
        Some(Ok(symbol)) => {
          address.function = Some(table.intern(&symbol.function));
          address.file = Some(table.intern(&symbol.file));
          address.line = symbol.line;
          summary.resolved += 1;
        }
        Some(Err(error)) => {
          summary.failed += 1;
          debug!(
            program_counter = address.program_counter,
            %error,
            "symbol resolution failed"
          );
        }
        None => {
          summary.failed += 1;
          debug!(
            program_counter = address.program_counter,
            "resolver returned too few results"
          );
        }
      }
    }
  }

  summary.new_names = table.len() - before;

  names.replace(table)?;

  if summary.failed > 0 {
    warn!(
      failed = summary.failed,
      resolved = summary.resolved,
      "some addresses could not be symbolized"
    );
  } else {
    debug!(
      resolved = summary.resolved,
      new_names = summary.new_names,
      "resolved symbols"
    );
  }

  Ok(summary)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn appends_names_without_moving_existing_ids() {
    let mut names = NameTable::new();
    let existing = names.append("main");
    names.append("main.cpp");
    let names = SharedNameTable::from(names);

    let mut catalog = CallStackCatalog::new(
      vec![
        CallStackAddress::new(0x10).with_symbol(0, 1, 3),
        CallStackAddress::new(0x20),
        CallStackAddress::new(0x30),
      ],
      [vec![0, 1, 2]],
    );

    let mut resolver = |program_counter: u64| match program_counter {
      0x20 => Ok(ResolvedSymbol {
        file: "main.cpp".into(),
        function: "Tick".into(),
        line: 42,
      }),
      other => Err(SymbolError::NotFound(other)),
    };

    let summary = resolve_symbols(&names, &mut catalog, &mut resolver)
      .expect("extension");

    assert_eq!(
      summary,
      ResolutionSummary {
        failed: 1,
        new_names: 1,
        resolved: 1,
      }
    );

    let table = names.read();
    assert_eq!(table.get(existing), Some("main"));
    assert_eq!(table.len(), 3);

    let resolved = catalog.address(1).expect("address");
    assert_eq!(resolved.function.and_then(|id| table.get(id)), Some("Tick"));
    assert_eq!(resolved.file, Some(1));
    assert_eq!(resolved.line, 42);
    assert_eq!(catalog.address(2).expect("address").function, None);
  }

  struct ShortBatches;

  impl SymbolResolver for ShortBatches {
    fn resolve(&mut self, _: u64) -> Result<ResolvedSymbol, SymbolError> {
      Err(SymbolError::Service("offline".into()))
    }

    fn resolve_batch(
      &mut self,
      _: &[u64],
    ) -> Vec<Result<ResolvedSymbol, SymbolError>> {
      Vec::new()
    }
  }

  #[test]
  fn missing_batch_results_count_as_failures() {
    let names = SharedNameTable::default();
    let mut catalog = CallStackCatalog::new(
      vec![CallStackAddress::new(0x1), CallStackAddress::new(0x2)],
      [vec![0, 1]],
    );

    let summary = resolve_symbols(&names, &mut catalog, &mut ShortBatches)
      .expect("no names added");

    assert_eq!(summary.failed, 2);
    assert!(names.read().is_empty());
  }
}
