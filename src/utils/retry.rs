//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for opening shared resources at startup.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: 20
/// - Jitter enabled
pub fn startup_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(20)
        .with_jitter()
}

/// Backoff for writing to a full worker pipe.
///
/// Short: a reader that stays behind this long is dropped for that frame.
///
/// - Min delay: 1ms
/// - Max delay: 50ms
/// - Max attempts: 8
pub fn pipe_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(50))
        .with_max_times(8)
}
