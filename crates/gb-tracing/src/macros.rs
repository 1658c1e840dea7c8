//! Convenience macros for performance tracing

/// Create a [`crate::performance::PerformanceSpan`] with optional fields.
///
/// ```rust
/// use gb_tracing::perf_span;
///
/// {
///     let _span = perf_span!("upload_pair_tables", width = 8, bytes = 2048);
///     // ... upload ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let name = $name;
        let span = tracing::debug_span!(
            "perf",
            name = %name,
            $($field = $value),+
        );
        $crate::performance::PerformanceSpan::from_span(name, span, None)
    }};
}

/// Emit a standardized debug-level performance event.
///
/// ```rust
/// use gb_tracing::perf_event;
///
/// perf_event!("layout_selected", width = 8, shared = true);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        tracing::debug!(
            event = $name,
            $($field = $value),+
        );
    };
}

/// Run a block and return `(result, seconds)`.
///
/// ```rust
/// use gb_tracing::timed_block;
///
/// let (sum, seconds) = timed_block!("sum", { (1..=100).sum::<i32>() });
/// assert_eq!(sum, 5050);
/// assert!(seconds >= 0.0);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let seconds = start.elapsed().as_secs_f64();
        tracing::debug!(operation = $name, seconds = seconds, "timed_block_complete");
        (result, seconds)
    }};
}
