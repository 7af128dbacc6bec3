/*!
 * Physical link abstractions.
 *
 * A [`Link`] is one opened serial connection. It is exclusively owned by a
 * single transport drain loop (or by discovery while a probe runs). A
 * [`LinkProvider`] enumerates candidate links and opens them.
 */
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

#[cfg(feature = "mock")]
pub mod memory;

#[cfg(feature = "serial")]
pub mod serial;

#[cfg(feature = "mock")]
pub use memory::{MemoryLink, MemoryLinkProvider, MemoryPort, Responder};

#[cfg(feature = "serial")]
pub use serial::{SerialLink, SerialLinkProvider};

/// An opened physical link
#[async_trait]
pub trait Link: Send + Debug {
    /// Name of the link, e.g. `/dev/ttyUSB0`
    fn name(&self) -> &str;

    /// Write one encoded frame
    async fn write(&mut self, frame: &[u8]) -> Result<()>;

    /// Read whatever arrives within `timeout`
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn read(&mut self, timeout: Duration) -> Result<Option<Bytes>>;

    /// Release the link
    async fn close(&mut self) -> Result<()>;
}

/// Source of candidate links
#[async_trait]
pub trait LinkProvider: Send + Sync + Debug {
    /// Names of every link currently present
    fn available_links(&self) -> Vec<String>;

    /// Open a link at the given baud rate
    async fn open(&self, name: &str, baud_rate: u32) -> Result<Box<dyn Link>>;

    /// Whether a link is still present
    fn exists(&self, name: &str) -> bool {
        self.available_links().iter().any(|n| n == name)
    }
}
