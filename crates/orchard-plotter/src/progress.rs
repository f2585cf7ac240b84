//! Progress reporting.

/// Observer invoked synchronously throughout each phase.
///
/// Arguments are `(phase, n, max_n)`; `n / max_n` is monotone
/// non-decreasing within a phase.
pub type ProgressCallback = dyn Fn(u8, u64, u64) + Sync;

/// The no-op observer.
pub fn progress_none(_phase: u8, _n: u64, _max_n: u64) {}

/// An observer that logs overall percentage, one line per call.
pub fn progress_logged(phase: u8, n: u64, max_n: u64) {
    let p = (100.0 / 4.0) * ((phase as f64 - 1.0) + n as f64 / max_n as f64);
    tracing::info!("progress: {}%", p as u64);
}
