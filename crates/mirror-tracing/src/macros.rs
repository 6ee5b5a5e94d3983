//! Shorthands for the helpers in [`crate::performance`].

/// Create a [`PerformanceSpan`](crate::performance::PerformanceSpan), optionally with fields.
///
/// With fields, the span is entered and stays current until the returned
/// value is dropped.
///
/// ```rust
/// use mirror_tracing::perf_span;
///
/// {
///     let _span = perf_span!("push", bytes = 4096);
///     // ... enqueue the copy ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::performance::PerformanceSpan::entered(
            $name,
            None,
            tracing::debug_span!("perf", name = $name, $($field = $value),+),
        )
    }};
}

/// Run a block and return `(result, elapsed_microseconds)`.
///
/// ```rust
/// use mirror_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=10).sum::<u32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        tracing::trace!(operation = $name, duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}
