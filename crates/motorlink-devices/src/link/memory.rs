/*!
 * In-memory link backend.
 *
 * Each [`MemoryPort`] simulates one serial port. An optional [`Responder`]
 * plays the device: it is called with every written frame and returns the
 * frames the device answers with. Ports can be unplugged, made to fail on
 * write, or made to refuse opening.
 */
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

use super::{Link, LinkProvider};
use crate::error::{DeviceError, Result};

/// Simulated device behavior: written frame in, answer frames out
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<Bytes> + Send + Sync>;

/// Shared state of one simulated port
pub struct MemoryPort {
    name: String,
    responder: Mutex<Option<Responder>>,
    written: Mutex<Vec<Bytes>>,
    inbox: Mutex<VecDeque<Bytes>>,
    arrived: Notify,
    present: AtomicBool,
    fail_writes: AtomicBool,
    fail_open: AtomicBool,
    opened: AtomicUsize,
    closed: AtomicUsize,
    last_baud: Mutex<Option<u32>>,
}

impl std::fmt::Debug for MemoryPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPort")
            .field("name", &self.name)
            .field("present", &self.present.load(Ordering::SeqCst))
            .field("fail_writes", &self.fail_writes.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryPort {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            responder: Mutex::new(None),
            written: Mutex::new(Vec::new()),
            inbox: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
            present: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            last_baud: Mutex::new(None),
        }
    }

    /// Name of the port
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the simulated device
    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock().unwrap_or_else(PoisonError::into_inner) = Some(responder);
    }

    /// Remove the simulated device, leaving a silent port
    pub fn clear_responder(&self) {
        *self.responder.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Every frame written to the port so far
    pub fn written(&self) -> Vec<Bytes> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the write log
    pub fn clear_written(&self) {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Push an unsolicited frame, as if the device sent it on its own
    pub fn inject(&self, frame: Bytes) {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(frame);
        self.arrived.notify_one();
    }

    /// Simulate pulling the cable
    pub fn unplug(&self) {
        self.present.store(false, Ordering::SeqCst);
        self.arrived.notify_one();
    }

    /// Simulate plugging the cable back in
    pub fn plug(&self) {
        self.present.store(true, Ordering::SeqCst);
    }

    /// Whether the port is present
    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    /// Make subsequent writes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent opens fail
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Number of successful opens
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of closes
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Baud rate of the most recent open
    pub fn last_baud_rate(&self) -> Option<u32> {
        *self.last_baud.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain_inbox(&self) -> Option<Bytes> {
        let mut inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
        match inbox.len() {
            0 => None,
            1 => inbox.pop_front(),
            _ => {
                let mut buf = BytesMut::new();
                for frame in inbox.drain(..) {
                    buf.extend_from_slice(&frame);
                }
                Some(buf.freeze())
            }
        }
    }
}

/// An opened handle onto a [`MemoryPort`]
#[derive(Debug)]
pub struct MemoryLink {
    port: Arc<MemoryPort>,
    open: bool,
}

#[async_trait]
impl Link for MemoryLink {
    fn name(&self) -> &str {
        self.port.name()
    }

    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        if !self.open || !self.port.is_present() {
            return Err(DeviceError::link_unavailable(format!(
                "{} is not present",
                self.port.name
            )));
        }
        if self.port.fail_writes.load(Ordering::SeqCst) {
            return Err(DeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("write to {} failed", self.port.name),
            )));
        }

        let frame = Bytes::copy_from_slice(frame);
        trace!("{} <- {:02X?}", self.port.name, &frame[..]);
        self.port
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.clone());

        let responder = self
            .port
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(responder) = responder {
            for answer in responder(&frame) {
                self.port.inject(answer);
            }
        }
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.port.drain_inbox() {
                return Ok(Some(frame));
            }
            if !self.port.is_present() {
                return Err(DeviceError::link_unavailable(format!(
                    "{} is not present",
                    self.port.name
                )));
            }
            if timeout_at(deadline, self.port.arrived.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.port.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Provider of simulated ports
#[derive(Debug, Default, Clone)]
pub struct MemoryLinkProvider {
    ports: Arc<Mutex<HashMap<String, Arc<MemoryPort>>>>,
}

impl MemoryLinkProvider {
    /// Create a provider with no ports
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a port, returning its shared state
    pub fn add_port(&self, name: &str) -> Arc<MemoryPort> {
        let port = Arc::new(MemoryPort::new(name));
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), port.clone());
        port
    }

    /// Add a port driven by a responder
    pub fn add_device(&self, name: &str, responder: Responder) -> Arc<MemoryPort> {
        let port = self.add_port(name);
        port.set_responder(responder);
        port
    }

    /// Look up a port
    pub fn port(&self, name: &str) -> Option<Arc<MemoryPort>> {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl LinkProvider for MemoryLinkProvider {
    fn available_links(&self) -> Vec<String> {
        let ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = ports
            .values()
            .filter(|p| p.is_present())
            .map(|p| p.name.clone())
            .collect();
        names.sort();
        names
    }

    async fn open(&self, name: &str, baud_rate: u32) -> Result<Box<dyn Link>> {
        let port = self
            .port(name)
            .filter(|p| p.is_present())
            .ok_or_else(|| DeviceError::UnknownLink(name.to_string()))?;
        if port.fail_open.load(Ordering::SeqCst) {
            return Err(DeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("cannot open {}", name),
            )));
        }

        *port.last_baud.lock().unwrap_or_else(PoisonError::into_inner) = Some(baud_rate);
        port.opened.fetch_add(1, Ordering::SeqCst);
        // Bytes left over from a previous owner are not ours
        port.drain_inbox();
        Ok(Box::new(MemoryLink { port, open: true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Responder {
        Arc::new(|frame: &[u8]| vec![Bytes::copy_from_slice(frame)])
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let provider = MemoryLinkProvider::new();
        let port = provider.add_device("ttyUSB0", echo());

        let mut link = provider.open("ttyUSB0", 115_200).await.unwrap();
        link.write(&[1, 2, 3]).await.unwrap();

        let read = link.read(Duration::from_millis(50)).await.unwrap();
        assert_eq!(read, Some(Bytes::from_static(&[1, 2, 3])));
        assert_eq!(port.written(), vec![Bytes::from_static(&[1, 2, 3])]);
        assert_eq!(port.last_baud_rate(), Some(115_200));
    }

    #[tokio::test]
    async fn test_read_times_out_on_silent_port() {
        let provider = MemoryLinkProvider::new();
        provider.add_port("ttyUSB1");

        let mut link = provider.open("ttyUSB1", 9600).await.unwrap();
        link.write(&[0xAA]).await.unwrap();
        assert_eq!(link.read(Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pending_frames_are_joined() {
        let provider = MemoryLinkProvider::new();
        let port = provider.add_port("ttyUSB2");
        let mut link = provider.open("ttyUSB2", 9600).await.unwrap();

        port.inject(Bytes::from_static(&[1]));
        port.inject(Bytes::from_static(&[2, 3]));
        let read = link.read(Duration::from_millis(10)).await.unwrap();
        assert_eq!(read, Some(Bytes::from_static(&[1, 2, 3])));
    }

    #[tokio::test]
    async fn test_unplug() {
        let provider = MemoryLinkProvider::new();
        let port = provider.add_port("ttyUSB3");
        let mut link = provider.open("ttyUSB3", 9600).await.unwrap();

        assert!(provider.exists("ttyUSB3"));
        port.unplug();
        assert!(!provider.exists("ttyUSB3"));
        assert!(link.write(&[1]).await.is_err());
        assert!(provider.open("ttyUSB3", 9600).await.is_err());
    }

    #[tokio::test]
    async fn test_failures() {
        let provider = MemoryLinkProvider::new();
        let port = provider.add_port("ttyUSB4");

        port.set_fail_open(true);
        assert!(provider.open("ttyUSB4", 9600).await.is_err());
        port.set_fail_open(false);

        let mut link = provider.open("ttyUSB4", 9600).await.unwrap();
        port.set_fail_writes(true);
        assert!(matches!(link.write(&[1]).await, Err(DeviceError::Io(_))));

        link.close().await.unwrap();
        link.close().await.unwrap();
        assert_eq!(port.close_count(), 1);
    }
}
