use {super::*, std::time::Instant};

/// Logs how long a load phase took when dropped.
#[derive(Debug)]
pub(crate) struct ScopedTimer {
  label: &'static str,
  started: Instant,
}

impl ScopedTimer {
  #[must_use]
  pub(crate) fn start(label: &'static str) -> Self {
    Self {
      label,
      started: Instant::now(),
    }
  }
}

impl Drop for ScopedTimer {
  fn drop(&mut self) {
    debug!(
      phase = self.label,
      elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0,
      "phase finished"
    );
  }
}
