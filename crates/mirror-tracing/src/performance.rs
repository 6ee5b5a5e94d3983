//! Timing helpers for allocations and host/device transfers.
//!
//! ```rust
//! use mirror_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("push", Some(100));
//! // ... enqueue the copy ...
//! drop(span); // logged only if it took 100µs or more
//!
//! record_transfer(4096, "host-to-device", 250);
//! ```

use std::fmt;
use std::time::Instant;
use tracing::span::EnteredSpan;

/// RAII timer: logs its duration when dropped, optionally only above a threshold.
///
/// A span created by [`entered`](Self::entered) stays current until the timer
/// is dropped, so events emitted meanwhile carry its fields.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
    _guard: Option<EnteredSpan>,
}

impl PerformanceSpan {
    /// Start timing `name`. With `threshold_us = None` every drop is logged.
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = tracing::debug_span!("perf", name = %name);
        Self {
            name,
            threshold_us,
            start_time: Instant::now(),
            span,
            _guard: None,
        }
    }

    /// Start timing `name` inside `span`, entering it until drop.
    pub fn entered(name: impl Into<String>, threshold_us: Option<u64>, span: tracing::Span) -> Self {
        Self {
            name: name.into(),
            threshold_us,
            start_time: Instant::now(),
            _guard: Some(span.clone().entered()),
            span,
        }
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The span the completion event is recorded in.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Microseconds since construction.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter the underlying span.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            tracing::debug!(
                parent: &self.span,
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Bandwidth in MiB/s; zero when the duration rounds to zero.
pub fn bandwidth_mibps(bytes: usize, duration_us: u64) -> f64 {
    if duration_us == 0 {
        return 0.0;
    }
    (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
}

/// Record a host or device allocation.
pub fn record_allocation(size_bytes: usize, region: &str, alignment: usize, duration_us: u64) {
    tracing::debug!(
        event = "allocation",
        size_bytes,
        size_kib = size_bytes as f64 / 1024.0,
        region,
        alignment,
        duration_us,
        "memory_allocation"
    );
}

/// Record a host/device transfer with its bandwidth.
///
/// For asynchronous transfers `duration_us` only covers the enqueue.
pub fn record_transfer(bytes: usize, direction: impl fmt::Display, duration_us: u64) {
    let mibps = bandwidth_mibps(bytes, duration_us);
    tracing::debug!(
        event = "transfer",
        bytes,
        direction = %direction,
        duration_us,
        bandwidth_mibps = mibps,
        bandwidth_gibps = mibps / 1024.0,
        "data_transfer"
    );
}

/// Record a kernel launch over `elements` input elements.
pub fn record_launch(kernel: &str, groups: u32, threads_per_group: u32, elements: u64) {
    tracing::debug!(
        event = "launch",
        kernel,
        groups,
        threads_per_group,
        total_threads = groups as u64 * threads_per_group as u64,
        elements,
        "kernel_launch"
    );
}
