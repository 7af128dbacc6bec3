/*!
 * Serial port link backend.
 *
 * `serialport` is blocking, so every port operation runs on the blocking
 * thread pool. The port handle is moved into the blocking task and handed
 * back when it completes.
 */
use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serialport::SerialPort;
use tokio::task;
use tracing::{debug, warn};

use motorlink_core::utils::{duration_to_millis, millis};

use super::{Link, LinkProvider};
use crate::error::{DeviceError, Result};

const READ_BUFFER_LEN: usize = 512;

/// Provider enumerating the host's serial ports
#[derive(Debug, Default, Clone)]
pub struct SerialLinkProvider {
    /// Only ports whose name starts with this prefix are candidates
    pub name_prefix: Option<String>,
}

impl SerialLinkProvider {
    /// Create a provider listing every serial port
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict candidates to names starting with `prefix`
    pub fn with_prefix<S: Into<String>>(prefix: S) -> Self {
        Self {
            name_prefix: Some(prefix.into()),
        }
    }
}

#[async_trait]
impl LinkProvider for SerialLinkProvider {
    fn available_links(&self) -> Vec<String> {
        match serialport::available_ports() {
            Ok(ports) => ports
                .into_iter()
                .map(|p| p.port_name)
                .filter(|name| {
                    self.name_prefix
                        .as_deref()
                        .map_or(true, |prefix| name.starts_with(prefix))
                })
                .collect(),
            Err(e) => {
                warn!("Failed to list serial ports: {}", e);
                Vec::new()
            }
        }
    }

    async fn open(&self, name: &str, baud_rate: u32) -> Result<Box<dyn Link>> {
        let port_name = name.to_string();
        let port = task::spawn_blocking(move || {
            serialport::new(&port_name, baud_rate)
                .timeout(Duration::from_millis(10))
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None)
                .open()
        })
        .await
        .map_err(|e| DeviceError::other(format!("open task failed: {}", e)))?
        .map_err(|e| DeviceError::link_unavailable(format!("Failed to open {}: {}", name, e)))?;

        debug!("Opened serial port {} at {} baud", name, baud_rate);
        Ok(Box::new(SerialLink {
            name: name.to_string(),
            port: Some(port),
        }))
    }
}

/// An opened serial port
pub struct SerialLink {
    name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("name", &self.name)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialLink {
    fn take_port(&mut self) -> Result<Box<dyn SerialPort>> {
        self.port
            .take()
            .ok_or_else(|| DeviceError::link_unavailable(format!("{} is closed", self.name)))
    }
}

#[async_trait]
impl Link for SerialLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        let mut port = self.take_port()?;
        let frame = frame.to_vec();
        let (port, result) = task::spawn_blocking(move || {
            let result = port.write_all(&frame).and_then(|_| port.flush());
            (port, result)
        })
        .await
        .map_err(|e| DeviceError::other(format!("write task failed: {}", e)))?;
        self.port = Some(port);
        result.map_err(DeviceError::from)
    }

    async fn read(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let mut port = self.take_port()?;
        let (port, result) = task::spawn_blocking(move || {
            let mut buf = vec![0u8; READ_BUFFER_LEN];
            let result = port
                .set_timeout(millis(duration_to_millis(timeout).max(1)))
                .map_err(std::io::Error::from)
                .and_then(|_| port.read(&mut buf))
                .map(|n| {
                    buf.truncate(n);
                    buf
                });
            (port, result)
        })
        .await
        .map_err(|e| DeviceError::other(format!("read task failed: {}", e)))?;
        self.port = Some(port);

        match result {
            Ok(buf) if buf.is_empty() => Ok(None),
            Ok(buf) => Ok(Some(Bytes::from(buf))),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(DeviceError::from(e)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.name);
        }
        Ok(())
    }
}
