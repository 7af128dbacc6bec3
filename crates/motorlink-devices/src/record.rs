/*!
 * Per-motor record.
 *
 * A [`MotorRecord`] keeps two parallel tables with one slot per [`Attr`]:
 * the confirmed ("proxy") values reported by the device and the
 * user-requested values written optimistically. Every slot has its own lock,
 * so distinct attributes never contend.
 */
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use motorlink_core::types::{Attr, DeviceId, DeviceMac, MotorMode, Value};

use crate::procedure::Procedure;

/// One entry of a motor's error history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code reported by the device
    pub code: i64,
    /// When it was recorded
    pub at: DateTime<Utc>,
}

/// Online/offline change caused by a heartbeat outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The motor just came online
    CameOnline,
    /// The motor just went offline
    WentOffline,
}

#[derive(Debug, Default)]
struct HeartbeatState {
    failures: u32,
    outstanding: bool,
}

#[derive(Debug)]
struct AutoPollState {
    enabled: bool,
    interval: Duration,
}

/// State of one motor
#[derive(Debug)]
pub struct MotorRecord {
    mac: DeviceMac,
    confirmed: Box<[RwLock<Value>]>,
    requested: Box<[RwLock<Value>]>,
    pending_ack: Box<[AtomicBool]>,
    heartbeat: Mutex<HeartbeatState>,
    errors: Mutex<VecDeque<ErrorEntry>>,
    error_capacity: usize,
    auto_poll: Mutex<AutoPollState>,
    procedure: Mutex<Option<Procedure>>,
}

fn table() -> Box<[RwLock<Value>]> {
    (0..Attr::COUNT).map(|_| RwLock::new(Value::Null)).collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MotorRecord {
    /// Create a record for an identified motor
    ///
    /// The motor starts offline with every other slot empty.
    pub fn new(
        id: DeviceId,
        mac: DeviceMac,
        error_capacity: usize,
        auto_poll_interval: Duration,
    ) -> Self {
        let record = Self {
            mac,
            confirmed: table(),
            requested: table(),
            pending_ack: (0..Attr::COUNT).map(|_| AtomicBool::new(false)).collect(),
            heartbeat: Mutex::new(HeartbeatState::default()),
            errors: Mutex::new(VecDeque::with_capacity(error_capacity)),
            error_capacity: error_capacity.max(1),
            auto_poll: Mutex::new(AutoPollState {
                enabled: false,
                interval: auto_poll_interval,
            }),
            procedure: Mutex::new(None),
        };
        record.set_identity(id);
        record.write_both(Attr::MacId, Value::Integer(i64::from(mac.get())));
        record.write_both(Attr::OnlineStatus, Value::Integer(0));
        record
    }

    fn write_both(&self, attr: Attr, value: Value) {
        *self.slot(&self.confirmed, attr) = value.clone();
        *self.slot(&self.requested, attr) = value;
    }

    fn slot<'a>(
        &self,
        table: &'a [RwLock<Value>],
        attr: Attr,
    ) -> std::sync::RwLockWriteGuard<'a, Value> {
        table[attr.index()]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_slot(table: &[RwLock<Value>], attr: Attr) -> Value {
        table[attr.index()]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hardware address
    pub fn mac(&self) -> DeviceMac {
        self.mac
    }

    /// Current logical id
    pub fn device_id(&self) -> DeviceId {
        Self::read_slot(&self.confirmed, Attr::DeviceId)
            .as_integer()
            .and_then(|id| u8::try_from(id).ok())
            .map(DeviceId)
            .unwrap_or(DeviceId::BROADCAST)
    }

    /// Rewrite the identity slots after a remap
    pub(crate) fn set_identity(&self, id: DeviceId) {
        self.write_both(Attr::DeviceId, Value::Integer(i64::from(id.get())));
    }

    /// Confirmed value
    pub fn value(&self, attr: Attr) -> Value {
        Self::read_slot(&self.confirmed, attr)
    }

    /// User-requested value
    pub fn requested(&self, attr: Attr) -> Value {
        Self::read_slot(&self.requested, attr)
    }

    /// Write the user-requested slot
    pub fn set_requested(&self, attr: Attr, value: Value) {
        *self.slot(&self.requested, attr) = value;
    }

    /// Write the confirmed slot, returning whether the value changed
    ///
    /// Also clears the slot's pending acknowledgement.
    pub fn set_confirmed(&self, attr: Attr, value: Value) -> bool {
        self.pending_ack[attr.index()].store(false, Ordering::SeqCst);
        let mut slot = self.slot(&self.confirmed, attr);
        if *slot == value {
            false
        } else {
            *slot = value;
            true
        }
    }

    /// Mark a write to `attr` as awaiting acknowledgement
    pub fn mark_pending(&self, attr: Attr) {
        self.pending_ack[attr.index()].store(true, Ordering::SeqCst);
    }

    /// Whether a write to `attr` awaits acknowledgement
    pub fn is_pending(&self, attr: Attr) -> bool {
        self.pending_ack[attr.index()].load(Ordering::SeqCst)
    }

    /// Clear the pending flag, returning whether it was set
    pub fn take_pending(&self, attr: Attr) -> bool {
        self.pending_ack[attr.index()].swap(false, Ordering::SeqCst)
    }

    /// Copy the requested value into the confirmed table
    ///
    /// Returns the promoted value if it changed the confirmed slot.
    pub fn promote_requested(&self, attr: Attr) -> Option<Value> {
        let requested = self.requested(attr);
        if requested.is_null() {
            return None;
        }
        self.set_confirmed(attr, requested.clone())
            .then_some(requested)
    }

    /// Current operating mode
    pub fn mode(&self) -> MotorMode {
        self.value(Attr::ModeId)
            .as_integer()
            .and_then(|m| MotorMode::try_from(m).ok())
            .unwrap_or(MotorMode::None)
    }

    /// Whether the motor is online
    pub fn is_online(&self) -> bool {
        self.value(Attr::OnlineStatus).as_bool().unwrap_or(false)
    }

    fn set_online(&self, online: bool) {
        self.write_both(Attr::OnlineStatus, Value::Integer(i64::from(online)));
    }

    /// Mark online without a heartbeat, resetting the failure counter
    pub fn force_online(&self) -> Option<Liveness> {
        let mut heartbeat = lock(&self.heartbeat);
        heartbeat.failures = 0;
        heartbeat.outstanding = false;
        if self.is_online() {
            None
        } else {
            self.set_online(true);
            Some(Liveness::CameOnline)
        }
    }

    /// Mark offline without waiting for missed heartbeats
    pub fn force_offline(&self) -> Option<Liveness> {
        let mut heartbeat = lock(&self.heartbeat);
        heartbeat.outstanding = false;
        if self.is_online() {
            self.set_online(false);
            Some(Liveness::WentOffline)
        } else {
            None
        }
    }

    /// Record a heartbeat answer
    pub fn heartbeat_success(&self) -> Option<Liveness> {
        self.force_online()
    }

    /// Record a missed heartbeat
    ///
    /// Only the `threshold`-th consecutive miss takes the motor offline.
    pub fn heartbeat_failure(&self, threshold: u32) -> Option<Liveness> {
        let mut heartbeat = lock(&self.heartbeat);
        heartbeat.failures = heartbeat.failures.saturating_add(1);
        if heartbeat.failures >= threshold && self.is_online() {
            self.set_online(false);
            Some(Liveness::WentOffline)
        } else {
            None
        }
    }

    /// Note that a heartbeat was sent, returning whether the previous one is
    /// still unanswered
    pub fn heartbeat_sent(&self) -> bool {
        let mut heartbeat = lock(&self.heartbeat);
        std::mem::replace(&mut heartbeat.outstanding, true)
    }

    /// Consecutive missed heartbeats
    pub fn heartbeat_failures(&self) -> u32 {
        lock(&self.heartbeat).failures
    }

    /// Append to the error history, dropping the oldest entry when full
    pub fn push_error(&self, code: i64) -> ErrorEntry {
        let entry = ErrorEntry {
            code,
            at: Utc::now(),
        };
        let mut errors = lock(&self.errors);
        while errors.len() >= self.error_capacity {
            errors.pop_front();
        }
        errors.push_back(entry.clone());
        entry
    }

    /// Error history, oldest first
    pub fn error_history(&self) -> Vec<ErrorEntry> {
        lock(&self.errors).iter().cloned().collect()
    }

    /// Whether auto-poll is on
    pub fn auto_poll_enabled(&self) -> bool {
        lock(&self.auto_poll).enabled
    }

    /// Switch auto-poll, returning the previous setting
    pub fn set_auto_poll(&self, enabled: bool) -> bool {
        std::mem::replace(&mut lock(&self.auto_poll).enabled, enabled)
    }

    /// Auto-poll period
    pub fn auto_poll_interval(&self) -> Duration {
        lock(&self.auto_poll).interval
    }

    /// Change the auto-poll period
    pub fn set_auto_poll_interval(&self, interval: Duration) {
        lock(&self.auto_poll).interval = interval;
    }

    /// Running procedure slot
    pub(crate) fn procedure(&self) -> MutexGuard<'_, Option<Procedure>> {
        lock(&self.procedure)
    }

    /// Confirmed table as an attribute map
    pub fn snapshot(&self) -> BTreeMap<Attr, Value> {
        Attr::ALL
            .iter()
            .map(|attr| (*attr, self.value(*attr)))
            .collect()
    }

    /// Load persisted values into both tables
    ///
    /// Identity and liveness slots are never overwritten; null entries keep
    /// the current value.
    pub fn load(&self, params: &BTreeMap<Attr, Value>) -> usize {
        let mut loaded = 0;
        for (attr, value) in params {
            if attr.is_identity() || *attr == Attr::OnlineStatus || value.is_null() {
                continue;
            }
            self.write_both(*attr, value.clone());
            loaded += 1;
        }
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MotorRecord {
        MotorRecord::new(DeviceId(1), DeviceMac(0xA1), 3, Duration::from_millis(100))
    }

    #[test]
    fn test_identity_slots() {
        let record = record();
        assert_eq!(record.device_id(), DeviceId(1));
        assert_eq!(record.value(Attr::MacId), Value::Integer(0xA1));
        assert_eq!(record.requested(Attr::DeviceId), Value::Integer(1));
        assert!(!record.is_online());

        record.set_identity(DeviceId(9));
        assert_eq!(record.device_id(), DeviceId(9));
        assert_eq!(record.mac(), DeviceMac(0xA1));
    }

    #[test]
    fn test_dual_tables() {
        let record = record();
        record.set_requested(Attr::VelSet, Value::Float(10.0));
        assert_eq!(record.requested(Attr::VelSet), Value::Float(10.0));
        assert_eq!(record.value(Attr::VelSet), Value::Null);

        record.mark_pending(Attr::VelSet);
        assert!(record.set_confirmed(Attr::VelSet, Value::Float(9.5)));
        assert!(!record.is_pending(Attr::VelSet));
        assert!(!record.set_confirmed(Attr::VelSet, Value::Float(9.5)));
        assert_eq!(record.requested(Attr::VelSet), Value::Float(10.0));

        assert_eq!(record.promote_requested(Attr::VelSet), Some(Value::Float(10.0)));
        assert_eq!(record.promote_requested(Attr::VelSet), None);
        assert_eq!(record.promote_requested(Attr::PosSet), None);
    }

    #[test]
    fn test_heartbeat_debounce() {
        let record = record();
        assert_eq!(record.force_online(), Some(Liveness::CameOnline));

        assert_eq!(record.heartbeat_failure(3), None);
        assert_eq!(record.heartbeat_failure(3), None);
        assert!(record.is_online());
        // A success on failure K-1 resets the counter
        assert_eq!(record.heartbeat_success(), None);
        assert_eq!(record.heartbeat_failures(), 0);

        assert_eq!(record.heartbeat_failure(3), None);
        assert_eq!(record.heartbeat_failure(3), None);
        assert_eq!(record.heartbeat_failure(3), Some(Liveness::WentOffline));
        assert!(!record.is_online());
        assert_eq!(record.heartbeat_failure(3), None);

        assert_eq!(record.heartbeat_success(), Some(Liveness::CameOnline));
        assert!(record.is_online());
    }

    #[test]
    fn test_outstanding_heartbeat() {
        let record = record();
        assert!(!record.heartbeat_sent());
        assert!(record.heartbeat_sent());
        record.heartbeat_success();
        assert!(!record.heartbeat_sent());
    }

    #[test]
    fn test_error_ring_is_bounded() {
        let record = record();
        for code in 1..=5 {
            record.push_error(code);
        }
        let codes: Vec<i64> = record.error_history().iter().map(|e| e.code).collect();
        assert_eq!(codes, vec![3, 4, 5]);
    }

    #[test]
    fn test_load_skips_identity() {
        let record = record();
        let mut params = BTreeMap::new();
        params.insert(Attr::DeviceId, Value::Integer(42));
        params.insert(Attr::MacId, Value::Integer(7));
        params.insert(Attr::CurProportional, Value::Float(0.25));
        params.insert(Attr::PosSet, Value::Null);

        assert_eq!(record.load(&params), 1);
        assert_eq!(record.device_id(), DeviceId(1));
        assert_eq!(record.value(Attr::CurProportional), Value::Float(0.25));
        assert_eq!(record.requested(Attr::CurProportional), Value::Float(0.25));
    }

    #[test]
    fn test_mode_and_auto_poll() {
        let record = record();
        assert_eq!(record.mode(), MotorMode::None);
        record.set_confirmed(Attr::ModeId, Value::Integer(2));
        assert_eq!(record.mode(), MotorMode::Velocity);

        assert!(!record.set_auto_poll(true));
        assert!(record.auto_poll_enabled());
        assert_eq!(record.force_offline(), None);
        record.set_auto_poll_interval(Duration::from_millis(50));
        assert_eq!(record.auto_poll_interval(), Duration::from_millis(50));
    }
}
