//! Namespacing helper for the "mq" logger (§6).
//!
//! Every log line emitted by this crate tree goes through these macros so
//! the `target` stays `"mq"` regardless of which module emitted it,
//! matching how downstream services filter/route logs by component.

#[macro_export]
macro_rules! mq_debug {
    ($($arg:tt)*) => { tracing::debug!(target: "mq", $($arg)*) };
}

#[macro_export]
macro_rules! mq_info {
    ($($arg:tt)*) => { tracing::info!(target: "mq", $($arg)*) };
}

#[macro_export]
macro_rules! mq_warn {
    ($($arg:tt)*) => { tracing::warn!(target: "mq", $($arg)*) };
}

#[macro_export]
macro_rules! mq_error {
    ($($arg:tt)*) => { tracing::error!(target: "mq", $($arg)*) };
}
