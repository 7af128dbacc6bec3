/*!
 * motorlink devices
 *
 * This crate provides the communication layer between a host and a fleet of
 * motor controllers sharing serial links: per-link transports, the device
 * router, discovery, and the per-motor state store.
 */

#![warn(missing_docs)]

// Re-export core types
pub use motorlink_core::prelude;

pub mod codec;
pub mod context;
pub mod discovery;
pub mod error;
pub mod link;
pub mod persist;
pub mod procedure;
pub mod record;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod transport;

pub use codec::{BasicCodec, Codec, Command, Request, Response};
pub use context::MotorContext;
pub use discovery::{DeviceDiscovery, DiscoveryReport};
pub use error::{DeviceError, ErrorCode};
pub use link::{Link, LinkProvider};
pub use persist::{JsonFileStore, MemoryStore, ParamDocument, ParamStore};
pub use procedure::ProcedureHandle;
pub use record::{ErrorEntry, MotorRecord};
pub use registry::MotorRegistry;
pub use router::DeviceRouter;
pub use scheduler::{Scheduler, TimerKey};
pub use transport::{ConnectionStatus, LinkTransport};

/// motorlink devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> Result<(), motorlink_core::error::Error> {
    tracing::info!("motorlink devices {} initialized", VERSION);
    Ok(())
}

/// Names of the link backends compiled in
pub fn available_backends() -> Vec<&'static str> {
    let mut backends = Vec::new();

    #[cfg(feature = "mock")]
    backends.push("memory");

    #[cfg(feature = "serial")]
    backends.push("serial");

    backends
}
