//! Metrics and observability infrastructure for tessera.
//!
//! - `events`: Internal event types and the `InternalEvent` trait
//! - `server`: Prometheus HTTP server and initialization

pub mod events;
pub mod server;

pub use server::init;

/// Emit an internal event.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding metric. Without an installed recorder this is a no-op.
///
/// # Example
///
/// ```ignore
/// use tessera::metrics::events::BytesRead;
///
/// emit!(BytesRead { bytes: 1024 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
