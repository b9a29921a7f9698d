use {super::*, crate::callstack::names_frame};

/// Classification group handed out by the caller's pattern list.
#[derive(
  Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize,
)]
pub struct GroupId(pub u32);

/// A resolved frame as seen by patterns.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameView<'a> {
  pub file: Option<&'a str>,
  pub function: Option<&'a str>,
  pub line: i32,
  pub program_counter: u64,
}

/// Read-only view of one callstack with its names resolved.
#[derive(Debug, Clone, Copy)]
pub struct CallStackView<'a> {
  callstack: &'a CallStack,
  catalog: &'a CallStackCatalog,
  index: CallStackIndex,
  names: &'a NameTable,
}

impl<'a> CallStackView<'a> {
  #[must_use]
  pub fn new(
    catalog: &'a CallStackCatalog,
    names: &'a NameTable,
    index: CallStackIndex,
  ) -> Option<Self> {
    Some(Self {
      callstack: catalog.get(index)?,
      catalog,
      index,
      names,
    })
  }

  #[must_use]
  pub fn callstack(self) -> &'a CallStack {
    self.callstack
  }

  /// Frames in stored order, leaf first. Address indices outside the
  /// address table are skipped.
  pub fn frames(self) -> impl Iterator<Item = FrameView<'a>> + 'a {
    let catalog = self.catalog;
    let names = self.names;

    self.callstack.addresses().iter().filter_map(move |address| {
      let address = catalog.address(*address)?;

      Some(FrameView {
        file: address.file.and_then(|id| names.get(id)),
        function: address.function.and_then(|id| names.get(id)),
        line: address.line,
        program_counter: address.program_counter,
      })
    })
  }

  #[must_use]
  pub fn index(self) -> CallStackIndex {
    self.index
  }

  /// Script frame names of a virtual callstack, in stored order.
  pub fn script_frames(self) -> impl Iterator<Item = &'a str> + 'a {
    let catalog = self.catalog;

    self
      .callstack
      .script()
      .and_then(|script| script.callstack)
      .and_then(|index| catalog.script_callstack(index))
      .into_iter()
      .flat_map(move |script| {
        script
          .frames
          .iter()
          .filter_map(move |frame| catalog.script_name(*frame))
      })
  }
}

/// External grouping rule.
pub trait CallStackPattern {
  fn group(&self) -> GroupId;

  fn matches(&self, view: &CallStackView<'_>) -> bool;
}

impl CallStackCatalog {
  /// Assigns every callstack a group and its first non-container frame.
  ///
  /// Patterns are tried in order and the first match wins; callstacks with
  /// no match, or no frames at all, get `fallback`. Returns how many
  /// callstacks fell back.
  pub fn classify(
    &mut self,
    names: &NameTable,
    patterns: &[Box<dyn CallStackPattern>],
    fallback: GroupId,
    container_markers: &[String],
  ) -> usize {
    let assignments = (0..self.len())
      .filter_map(|index| {
        let index = CallStackIndex::try_from(index).ok()?;
        let view = CallStackView::new(self, names, index)?;

        let first_non_container =
          view.callstack().addresses().iter().position(|&address| {
            let is_container =
              names_frame(self.addresses(), names, address, container_markers);
            self.address(address).is_some() && !is_container
          });

        let group = if view.callstack().addresses().is_empty() {
          None
        } else {
          patterns
            .iter()
            .find(|pattern| pattern.matches(&view))
            .map(|pattern| pattern.group())
        };

        Some((first_non_container, group))
      })
      .collect::<Vec<_>>();

    let mut fell_back = 0;

    for (index, (first_non_container, group)) in
      assignments.into_iter().enumerate()
    {
      let Some(callstack) = CallStackIndex::try_from(index)
        .ok()
        .and_then(|index| self.get_mut(index))
      else {
        continue;
      };

      if group.is_none() {
        fell_back += 1;
      }

      callstack.first_non_container = first_non_container;
      callstack.group = Some(group.unwrap_or(fallback));
    }

    debug!(
      callstacks = self.len(),
      fell_back,
      patterns = patterns.len(),
      "classified callstacks"
    );

    fell_back
  }
}
