/*!
 * Shared timer worker.
 *
 * Heartbeats, auto-poll, procedure step timeouts and discovery probe
 * deadlines are all entries of one [`TimerQueue`] served by a single worker
 * task. Fired keys are delivered on a channel, or to a one-shot waiter for
 * deadlines.
 */
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn, Instrument};

use motorlink_core::logging::component_span;
use motorlink_core::types::DeviceMac;

/// Identity of a timer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Heartbeat of one motor
    Heartbeat(DeviceMac),
    /// Auto-poll of one motor's actual values
    AutoPoll(DeviceMac),
    /// Step timeout of one motor's running procedure
    Procedure(DeviceMac),
    /// Probe deadline of one discovery candidate link
    Probe(String),
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKey::Heartbeat(mac) => write!(f, "heartbeat/{}", mac),
            TimerKey::AutoPoll(mac) => write!(f, "auto-poll/{}", mac),
            TimerKey::Procedure(mac) => write!(f, "procedure/{}", mac),
            TimerKey::Probe(link) => write!(f, "probe/{}", link),
        }
    }
}

/// Deadline-ordered timer entries with lazy cancellation
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, (TimerKey, Option<Duration>)>,
    by_key: HashMap<TimerKey, u64>,
    next_seq: u64,
}

impl TimerQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer, replacing any timer with the same key
    pub fn arm(&mut self, key: TimerKey, at: Instant, period: Option<Duration>) {
        self.cancel(&key);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((at, seq)));
        self.entries.insert(seq, (key.clone(), period));
        self.by_key.insert(key, seq);
    }

    /// Disarm a timer; returns whether it was armed
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.by_key.remove(key) {
            Some(seq) => {
                self.entries.remove(&seq);
                true
            }
            None => false,
        }
    }

    /// Whether a timer is armed
    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timer is armed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest live deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, seq))) = self.heap.peek().copied() {
            if self.entries.contains_key(&seq) {
                return Some(at);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop every timer due at `now`, re-arming repeating ones
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut fired = Vec::new();
        while let Some(Reverse((at, seq))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            let Some((key, period)) = self.entries.remove(&seq) else {
                continue;
            };
            self.by_key.remove(&key);
            if let Some(period) = period {
                // Skip missed periods instead of firing a burst
                let mut next = at + period;
                if next <= now {
                    next = now + period;
                }
                self.arm(key.clone(), next, Some(period));
            }
            fired.push(key);
        }
        fired
    }
}

enum TimerCommand {
    Arm {
        key: TimerKey,
        delay: Duration,
        period: Option<Duration>,
    },
    Cancel(TimerKey),
    Deadline {
        key: TimerKey,
        delay: Duration,
        waiter: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle onto the timer worker
#[derive(Debug, Clone)]
pub struct Scheduler {
    commands: mpsc::UnboundedSender<TimerCommand>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for TimerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerCommand::Arm { key, .. } => write!(f, "Arm({})", key),
            TimerCommand::Cancel(key) => write!(f, "Cancel({})", key),
            TimerCommand::Deadline { key, .. } => write!(f, "Deadline({})", key),
            TimerCommand::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl Scheduler {
    /// Spawn the worker
    ///
    /// Returns the handle and the channel fired keys are delivered on.
    pub fn start() -> (Self, mpsc::UnboundedReceiver<TimerKey>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(
            run_worker(command_rx, fired_tx).instrument(component_span("scheduler", None)),
        );
        let scheduler = Self {
            commands,
            worker: Arc::new(Mutex::new(Some(handle))),
        };
        (scheduler, fired_rx)
    }

    fn submit(&self, command: TimerCommand) {
        if let Err(e) = self.commands.send(command) {
            debug!("Scheduler stopped, dropping {:?}", e.0);
        }
    }

    /// Fire `key` every `period`, starting one period from now
    pub fn set_repeating(&self, key: TimerKey, period: Duration) {
        self.submit(TimerCommand::Arm {
            key,
            delay: period,
            period: Some(period),
        });
    }

    /// Fire `key` once after `delay`
    pub fn set_once(&self, key: TimerKey, delay: Duration) {
        self.submit(TimerCommand::Arm {
            key,
            delay,
            period: None,
        });
    }

    /// Disarm `key`
    pub fn cancel(&self, key: TimerKey) {
        self.submit(TimerCommand::Cancel(key));
    }

    /// Resolve the returned receiver once `delay` has elapsed
    ///
    /// Cancelling `key` drops the sender, so the receiver sees an error.
    pub fn deadline(&self, key: TimerKey, delay: Duration) -> oneshot::Receiver<()> {
        let (waiter, receiver) = oneshot::channel();
        self.submit(TimerCommand::Deadline { key, delay, waiter });
        receiver
    }

    /// Stop the worker and wait for it
    pub async fn shutdown(&self) {
        self.submit(TimerCommand::Shutdown);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Scheduler worker ended abnormally: {}", e);
            }
        }
    }
}

async fn run_worker(
    mut commands: mpsc::UnboundedReceiver<TimerCommand>,
    fired: mpsc::UnboundedSender<TimerKey>,
) {
    let mut queue = TimerQueue::new();
    let mut waiters: HashMap<TimerKey, oneshot::Sender<()>> = HashMap::new();
    debug!("Scheduler running");

    loop {
        let next = queue.next_deadline();
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(TimerCommand::Shutdown) => break,
                Some(TimerCommand::Arm { key, delay, period }) => {
                    waiters.remove(&key);
                    queue.arm(key, Instant::now() + delay, period);
                }
                Some(TimerCommand::Cancel(key)) => {
                    waiters.remove(&key);
                    queue.cancel(&key);
                }
                Some(TimerCommand::Deadline { key, delay, waiter }) => {
                    queue.arm(key.clone(), Instant::now() + delay, None);
                    waiters.insert(key, waiter);
                }
            },
            _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                for key in queue.pop_due(Instant::now()) {
                    trace!("Timer {} fired", key);
                    if let Some(waiter) = waiters.remove(&key) {
                        let _ = waiter.send(());
                    } else if fired.send(key).is_err() {
                        debug!("No consumer for fired timers");
                    }
                }
            }
        }
    }
    debug!("Scheduler stopped with {} timers armed", queue.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u32) -> DeviceMac {
        DeviceMac(n)
    }

    #[test]
    fn test_queue_orders_by_deadline() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.arm(TimerKey::Heartbeat(mac(1)), now + Duration::from_millis(30), None);
        queue.arm(TimerKey::AutoPoll(mac(1)), now + Duration::from_millis(10), None);

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(10)));
        assert_eq!(
            queue.pop_due(now + Duration::from_millis(10)),
            vec![TimerKey::AutoPoll(mac(1))]
        );
        assert_eq!(
            queue.pop_due(now + Duration::from_millis(40)),
            vec![TimerKey::Heartbeat(mac(1))]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_repeating_timer_rearms() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let period = Duration::from_millis(100);
        queue.arm(TimerKey::Heartbeat(mac(2)), now + period, Some(period));

        assert_eq!(queue.pop_due(now + period), vec![TimerKey::Heartbeat(mac(2))]);
        assert_eq!(queue.next_deadline(), Some(now + period * 2));

        // Late by several periods: fires once, next deadline is one period out
        let late = now + period * 7;
        assert_eq!(queue.pop_due(late).len(), 1);
        assert_eq!(queue.next_deadline(), Some(late + period));
    }

    #[test]
    fn test_cancel_and_rearm() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let key = TimerKey::Probe("ttyUSB0".into());
        queue.arm(key.clone(), now + Duration::from_millis(5), None);
        assert!(queue.cancel(&key));
        assert!(!queue.cancel(&key));
        assert_eq!(queue.next_deadline(), None);
        assert!(queue.pop_due(now + Duration::from_secs(1)).is_empty());

        queue.arm(key.clone(), now + Duration::from_millis(5), None);
        queue.arm(key.clone(), now + Duration::from_millis(50), None);
        assert_eq!(queue.len(), 1);
        assert!(queue.pop_due(now + Duration::from_millis(10)).is_empty());
        assert_eq!(queue.pop_due(now + Duration::from_millis(50)), vec![key]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_fires_and_resolves_deadlines() {
        let (scheduler, mut fired) = Scheduler::start();
        scheduler.set_once(TimerKey::AutoPoll(mac(3)), Duration::from_millis(20));
        let deadline = scheduler.deadline(TimerKey::Probe("ttyACM0".into()), Duration::from_millis(50));

        assert_eq!(fired.recv().await, Some(TimerKey::AutoPoll(mac(3))));
        assert!(deadline.await.is_ok());

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_deadline_reports_error() {
        let (scheduler, _fired) = Scheduler::start();
        let key = TimerKey::Probe("ttyACM1".into());
        let deadline = scheduler.deadline(key.clone(), Duration::from_secs(5));
        scheduler.cancel(key);
        assert!(deadline.await.is_err());
        scheduler.shutdown().await;
    }
}
