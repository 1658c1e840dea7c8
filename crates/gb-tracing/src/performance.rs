//! Performance-focused tracing utilities
//!
//! Timing guards and standard events for device allocations, host/device
//! transfers and kernel compilation.
//!
//! ```rust
//! use gb_tracing::performance::{record_allocation, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("upload_tables", Some(100));
//! // ... work ...
//! drop(span); // logged only if it took at least 100μs
//!
//! record_allocation(4096, "lj1");
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;

static ENABLED: AtomicBool = AtomicBool::new(true);

// u64::MAX encodes "no global threshold".
static GLOBAL_THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Apply process-wide performance span settings.
///
/// Called by [`crate::init_global_tracing`]; spans created afterwards honour it.
pub fn configure(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    GLOBAL_THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

/// Whether performance spans currently emit events.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

fn global_threshold() -> Option<u64> {
    match GLOBAL_THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        t => Some(t),
    }
}

/// RAII guard that measures its own lifetime and logs it on drop.
///
/// The event is emitted only when performance tracing is enabled and the
/// duration reaches the span threshold (or the global one when the span has none).
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Create a debug-level span. `threshold_us = None` defers to the global threshold.
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    /// Create a span at an explicit tracing level.
    pub fn with_level(level: Level, name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };
        Self {
            name,
            threshold_us: threshold_us.or_else(global_threshold),
            start_time: Instant::now(),
            span,
        }
    }

    /// Wrap a span built by the caller, so extra fields ride on it.
    ///
    /// Used by [`crate::perf_span!`] when fields are given.
    pub fn from_span(name: impl Into<String>, span: tracing::Span, threshold_us: Option<u64>) -> Self {
        Self {
            name: name.into(),
            threshold_us: threshold_us.or_else(global_threshold),
            start_time: Instant::now(),
            span,
        }
    }

    /// The underlying tracing span.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Operation name this span measures.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Microseconds since the span was created.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Seconds since the span was created.
    pub fn elapsed_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Enter this span's context.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !is_enabled() {
            return;
        }
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record a device buffer allocation.
pub fn record_allocation(size_bytes: usize, label: &str) {
    tracing::debug!(
        event = "allocation",
        size_bytes = size_bytes,
        size_kb = size_bytes as f64 / 1024.0,
        label = label,
        "device_allocation"
    );
}

/// Record a host/device transfer with bandwidth.
///
/// `direction` is `"H2D"`, `"D2H"` or `"D2D"`.
pub fn record_transfer(bytes: usize, direction: &str, label: &str, duration_us: u64) {
    let bandwidth_mbps = if duration_us > 0 {
        (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
    } else {
        0.0
    };

    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        direction = direction,
        label = label,
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps,
        "data_transfer"
    );
}

/// Record a compiled device program and how many entry points it exposes.
pub fn record_compile(program: &str, entry_points: usize, duration_us: u64) {
    tracing::debug!(
        event = "compile",
        program = program,
        entry_points = entry_points,
        duration_us = duration_us,
        duration_ms = duration_us as f64 / 1000.0,
        "program_compiled"
    );
}
