//! Nidus kernel logging (`klog`).
//!
//! Lightweight logging macros shared by every kernel sub-crate. Messages are
//! filtered at runtime against a minimum level and handed to a sink that the
//! boot path registers once the console is up. Until a sink is registered,
//! all output is dropped.
//!
//! # Macro Overview
//!
//! | Macro | Filtered | Use case |
//! |-------|----------|----------|
//! | [`klog!`] | Yes | Operational logging with level filter |
//! | [`klog_always!`] | No | Boot banners, diagnostic dumps |
//!
//! The hot path is a single `Relaxed` atomic load plus an integer compare;
//! formatting only happens when the message passes the filter.

#![no_std]

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Once;

// ============================================================================
// Log Levels
// ============================================================================

/// Severity level for [`klog!`] messages.
///
/// Ordered from least severe ([`Trace`](Level::Trace)) to most severe
/// ([`Error`](Level::Error)). The runtime filter admits messages at or above
/// the configured minimum level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing.
    Trace = 0,
    /// Developer-oriented debug information.
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness.
    Error = 4,
}

/// Sentinel: all filtered output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Runtime minimum level. Messages with `level >= LOG_MIN_LEVEL` are emitted.
/// Initialised to disabled; the boot path calls [`set_level`].
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_DISABLED);

/// Set the minimum level admitted by [`klog!`].
///
/// Called once during early boot after the console driver is initialised.
/// Safe to call again to change verbosity at runtime.
#[inline]
pub fn set_level(level: Level) {
    LOG_MIN_LEVEL.store(level as u8, Ordering::Release);
}

/// Suppress all [`klog!`] output. [`klog_always!`] is unaffected.
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Check whether a message at `level` would be emitted.
#[inline]
pub fn enabled(level: Level) -> bool {
    (level as u8) >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

// ============================================================================
// Output Sink
// ============================================================================

/// Sink signature: receives fully formatted arguments.
pub type SinkFn = fn(fmt::Arguments);

/// The registered output sink. Console I/O lives outside this crate, so the
/// boot path injects a writer here instead of klog depending on a driver.
static SINK: Once<SinkFn> = Once::new();

/// Register the output sink. Only the first registration takes effect.
pub fn register_sink(sink: SinkFn) {
    SINK.call_once(|| sink);
}

/// Hand formatted arguments to the sink, if one is registered.
///
/// Not meant to be called directly; use the macros.
#[doc(hidden)]
pub fn emit(args: fmt::Arguments) {
    if let Some(sink) = SINK.get() {
        sink(args);
    }
}

/// Log a message at the given [`Level`], subject to the runtime filter.
///
/// ```ignore
/// klog!(Info, "cell {} granted {} cores", prio, granted);
/// ```
#[macro_export]
macro_rules! klog {
    ($level:ident, $($arg:tt)*) => {{
        if $crate::enabled($crate::Level::$level) {
            $crate::emit(format_args!($($arg)*));
        }
    }};
}

/// Log a message unconditionally (still requires a registered sink).
///
/// Reserved for boot banners and diagnostic dumps that must not be filtered.
#[macro_export]
macro_rules! klog_always {
    ($($arg:tt)*) => {{
        $crate::emit(format_args!($($arg)*));
    }};
}
