//! Shared building blocks of the Otaris update agent: capacity-bounded block
//! I/O, raw partition access, bootloader environment handling, streaming
//! delta decoding, and the on-disk key-value store.

pub mod blockdev;
pub mod boot;
pub mod bounded;
pub mod cancel;
pub mod delta;
pub mod store;

reportify::new_whatever_type! {
    /// System-level error of the update agent.
    SystemError
}

/// Result with a [`SystemError`] report.
pub type SystemResult<T> = Result<T, reportify::Report<SystemError>>;
