/*!
 * Link transport.
 *
 * A [`LinkTransport`] owns one physical link, keeps an outbound FIFO per
 * device, and runs a single drain loop that performs all I/O on the link.
 *
 * Producers only touch the queue state under a short lock; the drain loop
 * takes the next frame under that lock and releases it before writing. Across
 * devices sharing the link, frames are interleaved round-robin in ascending
 * device id order, one frame per device per turn.
 *
 * A failed transport refuses ordinary frames but keeps writing liveness
 * frames, so a device answer can prove the link works again.
 */
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

use motorlink_core::logging::component_span;
use motorlink_core::types::{DeviceId, LinkId};

use crate::error::{DeviceError, Result};
use crate::link::Link;

/// How long an idle drain loop waits before polling for unsolicited frames
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Connection status of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Not yet established
    Unknown,
    /// Accepting and draining frames
    Connected,
    /// Link I/O failed; queued frames are kept, only liveness frames are written
    Failed,
    /// The drain loop has finished
    Stopped,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Unknown => write!(f, "unknown"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Failed => write!(f, "failed"),
            ConnectionStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Event reported by a drain loop
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Bytes arrived on the link
    Response {
        /// Transport that read them
        link: LinkId,
        /// Device whose frame was written just before, `None` when unsolicited
        tag: Option<DeviceId>,
        /// Raw bytes as read
        frame: Bytes,
    },
    /// Writing or reading a device's frame failed
    Failed {
        /// Transport that failed
        link: LinkId,
        /// Device whose frame was being handled
        device: DeviceId,
        /// Failure description
        message: String,
    },
    /// The drain loop finished
    Finished {
        /// Transport that finished
        link: LinkId,
    },
}

/// Queue and status, guarded together
#[derive(Debug)]
struct QueueState {
    queues: BTreeMap<DeviceId, VecDeque<Bytes>>,
    /// Latest liveness frame per device, written while not connected
    liveness: BTreeMap<DeviceId, Bytes>,
    devices: BTreeSet<DeviceId>,
    status: ConnectionStatus,
    /// `Some(flush)` once a stop was requested
    stop: Option<bool>,
    /// Device served last
    cursor: Option<DeviceId>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            queues: BTreeMap::new(),
            liveness: BTreeMap::new(),
            devices: BTreeSet::new(),
            status: ConnectionStatus::Unknown,
            stop: None,
            cursor: None,
        }
    }

    fn has_pending(&self) -> bool {
        self.queues.values().any(|q| !q.is_empty())
    }
}

/// Take the next frame: the first non-empty queue after the cursor, wrapping
fn next_frame(state: &mut QueueState) -> Option<(DeviceId, Bytes)> {
    let mut ready = state
        .queues
        .iter()
        .filter(|(_, q)| !q.is_empty())
        .map(|(id, _)| *id);
    let first = ready.next()?;
    let pick = match state.cursor {
        Some(cursor) if first <= cursor => std::iter::once(first)
            .chain(ready)
            .find(|id| *id > cursor)
            .unwrap_or(first),
        _ => first,
    };

    let queue = state.queues.get_mut(&pick)?;
    let frame = queue.pop_front()?;
    if queue.is_empty() {
        state.queues.remove(&pick);
    }
    state.cursor = Some(pick);
    Some((pick, frame))
}

enum Step {
    Write {
        device: DeviceId,
        frame: Bytes,
        liveness: bool,
    },
    Idle { poll: bool },
    Stop { flush: bool },
}

/// Transport owning one physical link
pub struct LinkTransport {
    id: LinkId,
    name: String,
    baud_rate: u32,
    response_timeout: Duration,
    state: Mutex<QueueState>,
    wake: Notify,
    link: Mutex<Option<Box<dyn Link>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl fmt::Debug for LinkTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkTransport")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("baud_rate", &self.baud_rate)
            .field("status", &self.status())
            .finish()
    }
}

impl LinkTransport {
    /// Create a transport around an opened link
    ///
    /// The transport starts out `Connected` but does not drain until
    /// [`LinkTransport::start`] is called.
    pub fn new(
        id: LinkId,
        link: Box<dyn Link>,
        baud_rate: u32,
        response_timeout: Duration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let mut state = QueueState::new();
        state.status = ConnectionStatus::Connected;
        Self {
            id,
            name: link.name().to_string(),
            baud_rate,
            response_timeout,
            state: Mutex::new(state),
            wake: Notify::new(),
            link: Mutex::new(Some(link)),
            worker: Mutex::new(None),
            events,
        }
    }

    /// Identity of the transport
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Name of the underlying link
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Baud rate the link was opened at
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the drain loop
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let link = self
            .link
            .lock()
            .map_err(|_| DeviceError::other("Failed to acquire lock on transport link"))?
            .take()
            .ok_or_else(|| DeviceError::other(format!("{} already started", self.name)))?;

        let transport = Arc::clone(self);
        let span = component_span("transport", Some(&self.name));
        let handle = tokio::spawn(transport.drain(link).instrument(span));
        *self
            .worker
            .lock()
            .map_err(|_| DeviceError::other("Failed to acquire lock on transport worker"))? =
            Some(handle);
        info!("Started transport {} on {}", self.id, self.name);
        Ok(())
    }

    /// Queue a frame for a device
    pub fn send(&self, device: DeviceId, frame: Bytes) -> Result<()> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| DeviceError::other("Failed to acquire lock on transport queue"))?;
            if state.stop.is_some() {
                return Err(DeviceError::link_unavailable(format!(
                    "{} is stopping",
                    self.name
                )));
            }
            if state.status != ConnectionStatus::Connected {
                return Err(DeviceError::link_unavailable(format!(
                    "{} is {}",
                    self.name, state.status
                )));
            }
            state.queues.entry(device).or_default().push_back(frame);
        }
        trace!("Queued frame for device {} on {}", device, self.name);
        self.wake.notify_one();
        Ok(())
    }

    /// Queue a liveness frame for a device
    ///
    /// Accepted while `Failed` as well: only the newest frame per device is
    /// kept then, and the drain loop writes it despite the failure.
    pub fn send_liveness(&self, device: DeviceId, frame: Bytes) -> Result<()> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| DeviceError::other("Failed to acquire lock on transport queue"))?;
            if state.stop.is_some() || state.status == ConnectionStatus::Stopped {
                return Err(DeviceError::link_unavailable(format!(
                    "{} is stopping",
                    self.name
                )));
            }
            if state.status == ConnectionStatus::Connected {
                state.queues.entry(device).or_default().push_back(frame);
            } else {
                state.liveness.insert(device, frame);
            }
        }
        trace!("Queued liveness frame for device {} on {}", device, self.name);
        self.wake.notify_one();
        Ok(())
    }

    /// Whether any frame is still queued
    pub fn has_pending_data(&self) -> bool {
        self.lock_state().has_pending()
    }

    /// Number of frames queued for one device
    pub fn pending_for(&self, device: DeviceId) -> usize {
        self.lock_state().queues.get(&device).map_or(0, VecDeque::len)
    }

    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        self.lock_state().status
    }

    /// Set the status from an external liveness signal
    ///
    /// A stopped transport stays stopped.
    pub fn set_status(&self, status: ConnectionStatus) {
        {
            let mut state = self.lock_state();
            if state.status == ConnectionStatus::Stopped || status == ConnectionStatus::Stopped {
                return;
            }
            if state.status != status {
                debug!("{} status {} -> {}", self.name, state.status, status);
            }
            state.status = status;
            if status == ConnectionStatus::Connected {
                let waiting = std::mem::take(&mut state.liveness);
                for (device, frame) in waiting {
                    state.queues.entry(device).or_default().push_back(frame);
                }
            }
        }
        self.wake.notify_one();
    }

    /// Associate a device with this transport
    pub fn add_device(&self, device: DeviceId) {
        self.lock_state().devices.insert(device);
    }

    /// Drop a device and any frames still queued for it
    pub fn remove_device(&self, device: DeviceId) -> usize {
        let mut state = self.lock_state();
        state.devices.remove(&device);
        state.liveness.remove(&device);
        state.queues.remove(&device).map_or(0, |q| q.len())
    }

    /// Whether the device is associated with this transport
    pub fn contains_device(&self, device: DeviceId) -> bool {
        self.lock_state().devices.contains(&device)
    }

    /// Devices associated with this transport
    pub fn devices(&self) -> Vec<DeviceId> {
        self.lock_state().devices.iter().copied().collect()
    }

    /// Move a device's association and queued frames to a new id
    ///
    /// Frames queued under `old` stay ahead of anything already queued under
    /// `new`, so the device's stream keeps its order.
    pub fn rename_device(&self, old: DeviceId, new: DeviceId) {
        let mut state = self.lock_state();
        state.devices.remove(&old);
        state.devices.insert(new);
        if let Some(mut moved) = state.queues.remove(&old) {
            if let Some(existing) = state.queues.remove(&new) {
                moved.extend(existing);
            }
            state.queues.insert(new, moved);
        }
        if let Some(frame) = state.liveness.remove(&old) {
            state.liveness.insert(new, frame);
        }
        if state.cursor == Some(old) {
            state.cursor = Some(new);
        }
    }

    /// Stop the drain loop and wait for it to finish
    ///
    /// With `flush`, frames still queued are written best-effort first.
    pub async fn stop(&self, flush: bool) {
        {
            let mut state = self.lock_state();
            if state.stop.is_none() {
                state.stop = Some(flush);
            }
        }
        self.wake.notify_one();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!("Drain loop of {} ended abnormally: {}", self.name, e);
                }
            }
            None => {
                // Never started: release the link ourselves
                let link = self.link.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(mut link) = link {
                    let _ = link.close().await;
                }
                self.lock_state().status = ConnectionStatus::Stopped;
            }
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            trace!("No listener for events of {}", self.name);
        }
    }

    fn fail(&self, device: DeviceId, error: &DeviceError) {
        warn!("Transport {} failed on device {}: {}", self.name, device, error);
        {
            let mut state = self.lock_state();
            if state.status == ConnectionStatus::Connected {
                state.status = ConnectionStatus::Failed;
            }
        }
        self.emit(TransportEvent::Failed {
            link: self.id,
            device,
            message: error.to_string(),
        });
    }

    fn fail_write(&self, device: DeviceId, error: &DeviceError, liveness: bool) {
        // Already failed; the device simply stays silent
        if liveness && self.status() != ConnectionStatus::Connected {
            debug!("Liveness frame to device {} on {} failed: {}", device, self.name, error);
        } else {
            self.fail(device, error);
        }
    }

    fn next_step(&self) -> Step {
        let mut state = self.lock_state();
        if let Some(flush) = state.stop {
            return Step::Stop { flush };
        }
        if state.status != ConnectionStatus::Connected {
            return match state.liveness.pop_first() {
                Some((device, frame)) => Step::Write {
                    device,
                    frame,
                    liveness: true,
                },
                None => Step::Idle { poll: false },
            };
        }
        match next_frame(&mut state) {
            Some((device, frame)) => Step::Write {
                device,
                frame,
                liveness: false,
            },
            None => Step::Idle { poll: true },
        }
    }

    async fn drain(self: Arc<Self>, mut link: Box<dyn Link>) {
        debug!("Drain loop running");
        loop {
            match self.next_step() {
                Step::Write {
                    device,
                    frame,
                    liveness,
                } => {
                    if let Err(e) = link.write(&frame).await {
                        self.fail_write(device, &e, liveness);
                        continue;
                    }
                    match link.read(self.response_timeout).await {
                        Ok(Some(bytes)) => self.emit(TransportEvent::Response {
                            link: self.id,
                            tag: Some(device),
                            frame: bytes,
                        }),
                        Ok(None) => trace!("No response from device {}", device),
                        Err(e) => self.fail_write(device, &e, liveness),
                    }
                }
                Step::Idle { poll } => {
                    let woken = tokio::time::timeout(IDLE_POLL_INTERVAL, self.wake.notified())
                        .await
                        .is_ok();
                    if woken || !poll {
                        continue;
                    }
                    // Devices may stream without being asked (chart samples, errors)
                    match link.read(Duration::from_millis(1)).await {
                        Ok(Some(bytes)) => self.emit(TransportEvent::Response {
                            link: self.id,
                            tag: None,
                            frame: bytes,
                        }),
                        Ok(None) => {}
                        Err(e) => {
                            debug!("Idle read on {} failed: {}", self.name, e);
                            let mut state = self.lock_state();
                            if state.status == ConnectionStatus::Connected {
                                state.status = ConnectionStatus::Failed;
                            }
                        }
                    }
                }
                Step::Stop { flush } => {
                    if flush {
                        self.flush(&mut link).await;
                    }
                    break;
                }
            }
        }

        if let Err(e) = link.close().await {
            warn!("Failed to close {}: {}", self.name, e);
        }
        self.lock_state().status = ConnectionStatus::Stopped;
        info!("Transport {} on {} stopped", self.id, self.name);
        self.emit(TransportEvent::Finished { link: self.id });
    }

    async fn flush(&self, link: &mut Box<dyn Link>) {
        let mut flushed = 0usize;
        loop {
            let next = next_frame(&mut self.lock_state());
            let Some((device, frame)) = next else { break };
            if let Err(e) = link.write(&frame).await {
                let dropped = {
                    let mut state = self.lock_state();
                    let n = state.queues.values().map(VecDeque::len).sum::<usize>();
                    state.queues.clear();
                    n
                };
                warn!(
                    "Flush of {} stopped at device {}: {} ({} frames dropped)",
                    self.name, device, e, dropped
                );
                return;
            }
            flushed += 1;
        }
        debug!("Flushed {} frames on {}", flushed, self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: &'static str) -> Bytes {
        Bytes::from_static(tag.as_bytes())
    }

    fn state_with(queues: &[(u8, &[&'static str])]) -> QueueState {
        let mut state = QueueState::new();
        for (id, frames) in queues {
            let queue = state.queues.entry(DeviceId(*id)).or_default();
            queue.extend(frames.iter().map(|f| frame(f)));
        }
        state
    }

    fn drain_all(state: &mut QueueState) -> Vec<Bytes> {
        std::iter::from_fn(|| next_frame(state).map(|(_, f)| f)).collect()
    }

    #[test]
    fn test_round_robin_across_devices() {
        let mut state = state_with(&[(1, &["x1", "x2", "x3"]), (2, &["y1", "y2"])]);
        let order = drain_all(&mut state);
        assert_eq!(
            order,
            vec![frame("x1"), frame("y1"), frame("x2"), frame("y2"), frame("x3")]
        );
        assert!(!state.has_pending());
    }

    #[test]
    fn test_cursor_wraps_to_lowest_id() {
        let mut state = state_with(&[(3, &["a1", "a2"]), (7, &["b1"])]);
        state.cursor = Some(DeviceId(5));
        assert_eq!(next_frame(&mut state), Some((DeviceId(7), frame("b1"))));
        assert_eq!(next_frame(&mut state), Some((DeviceId(3), frame("a1"))));
        assert_eq!(next_frame(&mut state), Some((DeviceId(3), frame("a2"))));
        assert_eq!(next_frame(&mut state), None);
    }

    #[test]
    fn test_single_device_keeps_fifo() {
        let mut state = state_with(&[(4, &["c1", "c2", "c3"])]);
        assert_eq!(
            drain_all(&mut state),
            vec![frame("c1"), frame("c2"), frame("c3")]
        );
    }

    #[cfg(feature = "mock")]
    #[tokio::test]
    async fn test_failed_transport_still_writes_liveness_frames() {
        use crate::link::{LinkProvider, MemoryLinkProvider};

        let provider = MemoryLinkProvider::new();
        let port = provider.add_port("ttyA");
        let link = provider.open("ttyA", 9600).await.unwrap();
        let (events, mut rx) = mpsc::unbounded_channel();
        let transport = Arc::new(LinkTransport::new(
            LinkId(1),
            link,
            9600,
            Duration::from_millis(5),
            events,
        ));
        transport.start().unwrap();

        port.set_fail_writes(true);
        transport.send(DeviceId(1), frame("boom")).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Failed { device: DeviceId(1), .. })
        ));
        assert_eq!(transport.status(), ConnectionStatus::Failed);
        assert!(transport.send(DeviceId(1), frame("data")).is_err());

        // A failing liveness write is not reported again
        transport.send_liveness(DeviceId(1), frame("lost")).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());

        port.set_fail_writes(false);
        transport.send_liveness(DeviceId(1), frame("old")).unwrap();
        transport.send_liveness(DeviceId(1), frame("beat")).unwrap();
        for _ in 0..200 {
            if !port.written().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(port.written(), vec![frame("beat")]);
        assert_eq!(transport.status(), ConnectionStatus::Failed);

        transport.set_status(ConnectionStatus::Connected);
        transport.send(DeviceId(1), frame("data")).unwrap();
        transport.stop(true).await;
        assert_eq!(port.written(), vec![frame("beat"), frame("data")]);
    }
}
