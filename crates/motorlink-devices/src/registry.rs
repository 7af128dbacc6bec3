/*!
 * Motor registry.
 *
 * The registry owns every [`MotorRecord`], the canonical id to MAC map and
 * the history of id remaps. It turns user writes into requests for the
 * router, applies decoded responses to the confirmed tables, and drives the
 * heartbeat, auto-poll and procedure timers it arms on the shared scheduler.
 *
 * All operations are synchronous. Nothing here waits on a link.
 */
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use motorlink_core::config::MotorConfig;
use motorlink_core::event::{Notification, NotificationBus};
use motorlink_core::types::{Attr, DeviceId, DeviceMac, MotorMode, Value};

use crate::codec::{AckTarget, Codec, Command, Request, Response};
use crate::error::{DeviceError, ErrorCode, Result};
use crate::persist::{ParamDocument, ParamStore};
use crate::procedure::{Procedure, ProcedureHandle, Progress};
use crate::record::{ErrorEntry, Liveness, MotorRecord};
use crate::router::DeviceRouter;
use crate::scheduler::{Scheduler, TimerKey};
use crate::transport::ConnectionStatus;

#[derive(Debug, Default)]
struct RegistryInner {
    records: HashMap<DeviceId, Arc<MotorRecord>>,
    by_mac: HashMap<DeviceMac, DeviceId>,
    /// Old id to the id it was remapped to
    remapped: HashMap<DeviceId, DeviceId>,
}

impl RegistryInner {
    /// Follow the remap history from a stale id to the live one
    fn resolve_stale(&self, id: DeviceId) -> Option<DeviceId> {
        let mut current = self.remapped.get(&id).copied()?;
        // Chains are short; the bound guards against a cycle
        for _ in 0..self.remapped.len() {
            if self.records.contains_key(&current) {
                return Some(current);
            }
            match self.remapped.get(&current) {
                Some(next) => current = *next,
                None => break,
            }
        }
        Some(current)
    }
}

/// Registry of every known motor
#[derive(Debug)]
pub struct MotorRegistry {
    inner: RwLock<RegistryInner>,
    router: Arc<DeviceRouter>,
    codec: Arc<dyn Codec>,
    store: Arc<dyn ParamStore>,
    scheduler: Scheduler,
    bus: NotificationBus,
    config: MotorConfig,
}

impl MotorRegistry {
    /// Create an empty registry
    pub fn new(
        router: Arc<DeviceRouter>,
        codec: Arc<dyn Codec>,
        store: Arc<dyn ParamStore>,
        scheduler: Scheduler,
        bus: NotificationBus,
        config: MotorConfig,
    ) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            router,
            codec,
            store,
            scheduler,
            bus,
            config,
        }
    }

    /// Motor configuration in use
    pub fn config(&self) -> &MotorConfig {
        &self.config
    }

    /// Codec requests are encoded with
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Create records for a batch of identified motors
    ///
    /// Ids must be pairwise unique within the batch and must not belong to a
    /// different motor already registered. Any violation fails the whole
    /// batch and leaves the registry untouched. Pairs already registered are
    /// skipped. Persisted parameters are loaded before the record becomes
    /// visible. Returns the ids of the records created.
    pub fn register_batch(&self, batch: &[(DeviceId, DeviceMac)]) -> Result<Vec<DeviceId>> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| DeviceError::other("Failed to acquire write lock on motor registry"))?;

        let mut seen = HashSet::new();
        let mut seen_macs = HashSet::new();
        for (id, mac) in batch {
            if *id == DeviceId::BROADCAST {
                return Err(DeviceError::invalid_value(format!(
                    "{} is the broadcast address",
                    id
                )));
            }
            if !seen.insert(*id) {
                error!("Registration batch contains device id {} twice", id);
                return Err(DeviceError::DuplicateDeviceId(*id));
            }
            if !seen_macs.insert(*mac) {
                error!("Registration batch contains {} twice", mac);
                return Err(DeviceError::invalid_value(format!(
                    "MAC {} appears twice in the batch",
                    mac
                )));
            }
            if let Some(existing) = inner.records.get(id) {
                if existing.mac() != *mac {
                    error!(
                        "Device id {} is claimed by {} but belongs to {}",
                        id,
                        mac,
                        existing.mac()
                    );
                    return Err(DeviceError::DuplicateDeviceId(*id));
                }
            }
            if let Some(other) = inner.by_mac.get(mac) {
                if other != id {
                    return Err(DeviceError::invalid_value(format!(
                        "MAC {} is already registered as device {}",
                        mac, other
                    )));
                }
            }
        }

        let mut created = Vec::new();
        for (id, mac) in batch {
            if inner.records.contains_key(id) {
                continue;
            }
            let record = Arc::new(MotorRecord::new(
                *id,
                *mac,
                self.config.error_history_len,
                self.config.auto_poll_interval(),
            ));
            match self.store.load(*mac) {
                Ok(Some(doc)) => {
                    let loaded = record.load(&doc.params);
                    debug!("Loaded {} persisted params for {}", loaded, mac);
                }
                Ok(None) => {}
                Err(e) => warn!("Ignoring persisted params of {}: {}", mac, e),
            }
            inner.records.insert(*id, record);
            inner.by_mac.insert(*mac, *id);
            inner.remapped.remove(id);
            self.scheduler
                .set_repeating(TimerKey::Heartbeat(*mac), self.config.heartbeat_interval());
            info!("Registered motor {} ({})", id, mac);
            created.push(*id);
        }
        Ok(created)
    }

    /// Mark freshly routed motors online and ask for their values
    pub fn activate(&self, ids: &[DeviceId]) -> Result<()> {
        for id in ids {
            let record = self.record(*id)?;
            if let Some(change) = record.force_online() {
                self.publish_liveness(*id, &record, change);
            }
            if self.config.request_all_on_register {
                if let Err(e) = self.request_all_values(*id) {
                    warn!("Could not request values of motor {}: {}", id, e);
                }
            }
        }
        Ok(())
    }

    /// Record of a motor
    ///
    /// Fails with `StaleDeviceId` for an id that was remapped away.
    pub fn record(&self, id: DeviceId) -> Result<Arc<MotorRecord>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| DeviceError::other("Failed to acquire read lock on motor registry"))?;
        if let Some(record) = inner.records.get(&id) {
            return Ok(record.clone());
        }
        match inner.resolve_stale(id) {
            Some(new) => Err(DeviceError::StaleDeviceId { old: id, new }),
            None => Err(DeviceError::UnknownDevice(id)),
        }
    }

    fn record_by_mac(&self, mac: DeviceMac) -> Option<(DeviceId, Arc<MotorRecord>)> {
        let inner = self.inner.read().ok()?;
        let id = *inner.by_mac.get(&mac)?;
        inner.records.get(&id).map(|r| (id, r.clone()))
    }

    /// Resolve a response tag, following remaps for frames sent before one
    fn record_for_tag(&self, tag: DeviceId) -> Option<(DeviceId, Arc<MotorRecord>)> {
        match self.record(tag) {
            Ok(record) => Some((tag, record)),
            Err(DeviceError::StaleDeviceId { new, .. }) => {
                self.record(new).ok().map(|record| (new, record))
            }
            Err(_) => None,
        }
    }

    /// Whether a live record exists for the id
    pub fn contains(&self, id: DeviceId) -> bool {
        self.inner
            .read()
            .map(|inner| inner.records.contains_key(&id))
            .unwrap_or(false)
    }

    /// Live ids in ascending order
    pub fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .inner
            .read()
            .map(|inner| inner.records.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Canonical id to MAC map
    pub fn motors_map(&self) -> BTreeMap<DeviceId, DeviceMac> {
        self.inner
            .read()
            .map(|inner| inner.by_mac.iter().map(|(mac, id)| (*id, *mac)).collect())
            .unwrap_or_default()
    }

    /// The id a motor had before its most recent remap
    pub fn previous_id(&self, id: DeviceId) -> Option<DeviceId> {
        self.inner.read().ok().and_then(|inner| {
            inner
                .remapped
                .iter()
                .find(|(_, new)| **new == id)
                .map(|(old, _)| *old)
        })
    }

    /// Confirmed value
    pub fn get_value(&self, id: DeviceId, attr: Attr) -> Result<Value> {
        Ok(self.record(id)?.value(attr))
    }

    /// User-requested value
    pub fn get_user_request_value(&self, id: DeviceId, attr: Attr) -> Result<Value> {
        Ok(self.record(id)?.requested(attr))
    }

    /// Whether a motor is online
    pub fn is_online(&self, id: DeviceId) -> Result<bool> {
        Ok(self.record(id)?.is_online())
    }

    /// Error history, oldest first
    pub fn error_history(&self, id: DeviceId) -> Result<Vec<ErrorEntry>> {
        Ok(self.record(id)?.error_history())
    }

    /// Encode and route a request
    ///
    /// Writes also land in the user-requested table and await an
    /// acknowledgement.
    fn dispatch(&self, id: DeviceId, record: &MotorRecord, request: &Request) -> Result<()> {
        if let Request::Write { attr, value } = request {
            record.set_requested(*attr, value.clone());
            record.mark_pending(*attr);
        }
        let frame = self.codec.encode(id, request)?;
        self.router.send(id, frame)
    }

    /// Write the user-requested table, optionally forwarding to the motor
    ///
    /// The request is not retried; a failed send leaves the optimistic value
    /// in place.
    pub fn set_value_by_user(
        &self,
        id: DeviceId,
        attr: Attr,
        value: Value,
        send_to_device: bool,
    ) -> Result<()> {
        if attr.is_identity() {
            return Err(DeviceError::ReadOnlyAttribute(attr));
        }
        let record = self.record(id)?;
        if send_to_device {
            self.dispatch(id, &record, &Request::Write { attr, value })
        } else {
            record.set_requested(attr, value);
            Ok(())
        }
    }

    /// Write the same value to several motors
    ///
    /// Every motor is attempted; the first failure is returned.
    pub fn set_value_in_batch(&self, ids: &[DeviceId], attr: Attr, value: Value) -> Result<()> {
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.set_value_by_user(*id, attr, value.clone(), true) {
                warn!("Batch write of {} to motor {} failed: {}", attr, id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Switch several motors into a mode
    pub fn activate_mode_in_batch(&self, ids: &[DeviceId], mode: MotorMode) -> Result<()> {
        self.set_value_in_batch(ids, Attr::ModeId, Value::from(mode))
    }

    /// Write the demand matching the motor's current mode
    pub fn change_demand(&self, id: DeviceId, value: Value) -> Result<()> {
        let mode = self.record(id)?.mode();
        let attr = mode
            .demand_attr()
            .ok_or_else(|| DeviceError::InvalidMode(format!("{:?} takes no demand", mode)))?;
        self.set_value_by_user(id, attr, value, true)
    }

    /// Ask a motor to take a new logical id
    ///
    /// The registry remaps once the motor confirms the new id.
    pub fn change_device_id(&self, id: DeviceId, new: DeviceId) -> Result<()> {
        if new == DeviceId::BROADCAST {
            return Err(DeviceError::invalid_value(format!(
                "{} is the broadcast address",
                new
            )));
        }
        if new != id && self.contains(new) {
            return Err(DeviceError::DuplicateDeviceId(new));
        }
        let record = self.record(id)?;
        self.dispatch(
            id,
            &record,
            &Request::Write {
                attr: Attr::DeviceId,
                value: Value::Integer(i64::from(new.get())),
            },
        )
    }

    /// Ask for one value
    pub fn request_value(&self, id: DeviceId, attr: Attr) -> Result<()> {
        let record = self.record(id)?;
        self.dispatch(id, &record, &Request::Read(attr))
    }

    /// Ask for every value
    pub fn request_all_values(&self, id: DeviceId) -> Result<()> {
        let record = self.record(id)?;
        for attr in Attr::ALL {
            self.dispatch(id, &record, &Request::Read(*attr))?;
        }
        debug!("Requested all values of motor {}", id);
        Ok(())
    }

    /// Send a device command
    pub fn send_command(&self, id: DeviceId, command: Command) -> Result<()> {
        let record = self.record(id)?;
        self.dispatch(id, &record, &Request::Command(command))
    }

    /// Clear the motor's active error
    pub fn clear_error(&self, id: DeviceId) -> Result<()> {
        self.record(id)?.set_requested(Attr::ErrorId, Value::Integer(0));
        self.send_command(id, Command::ClearError)
    }

    /// Store every parameter into the motor's flash
    pub fn save_params_to_device(&self, id: DeviceId) -> Result<()> {
        self.send_command(id, Command::SaveAllParams)
    }

    /// Forget the stored homing result
    pub fn clear_homing_info(&self, id: DeviceId) -> Result<()> {
        self.send_command(id, Command::ClearHomingInfo)
    }

    /// Start streaming a chart channel
    pub fn open_chart_channel(&self, id: DeviceId, channel: u8) -> Result<()> {
        self.send_command(id, Command::OpenChartChannel(channel))
    }

    /// Stop streaming a chart channel
    pub fn close_chart_channel(&self, id: DeviceId, channel: u8) -> Result<()> {
        self.send_command(id, Command::CloseChartChannel(channel))
    }

    /// Switch every chart channel
    pub fn switch_chart_all_channels(&self, id: DeviceId, on: bool) -> Result<()> {
        self.send_command(id, Command::SwitchChartAllChannels(on))
    }

    /// Select the calibration velocity preset
    pub fn switch_calibration_velocity(&self, id: DeviceId, preset: u8) -> Result<()> {
        self.send_command(id, Command::SwitchCalibrationVelocity(preset))
    }

    /// Revive the motor's transport and fetch everything again
    pub fn reconnect(&self, id: DeviceId) -> Result<()> {
        let link = self
            .router
            .link_of(id)
            .ok_or(DeviceError::UnknownDevice(id))?;
        self.router
            .set_connection_status(link, ConnectionStatus::Connected)?;
        self.request_all_values(id)
    }

    /// Apply a confirmed value reported by a motor
    pub fn set_value_by_proxy(&self, id: DeviceId, code: u8, value: Value) -> Result<()> {
        let attr = self
            .codec
            .attr_for_code(code)
            .ok_or_else(|| DeviceError::codec(format!("unknown attribute code {}", code)))?;
        let record = self.record(id)?;
        self.apply_value(id, &record, attr, value)
    }

    fn apply_value(
        &self,
        id: DeviceId,
        record: &MotorRecord,
        attr: Attr,
        value: Value,
    ) -> Result<()> {
        match attr {
            Attr::DeviceId => {
                let new = value
                    .as_integer()
                    .and_then(|v| u8::try_from(v).ok())
                    .map(DeviceId)
                    .ok_or_else(|| DeviceError::invalid_value(format!("device id {}", value)))?;
                record.take_pending(attr);
                if new != id {
                    self.remap(id, new)?;
                }
                return Ok(());
            }
            Attr::MacId => {
                trace!("Ignoring MAC report of motor {}", id);
                return Ok(());
            }
            Attr::OnlineStatus => {
                // Liveness is decided by heartbeats alone
                trace!("Ignoring online report of motor {}", id);
                return Ok(());
            }
            Attr::ErrorId => {
                let active = record.value(Attr::ErrorId).as_integer();
                if let Some(code) = value
                    .as_integer()
                    .filter(|c| *c != 0 && Some(*c) != active)
                {
                    record.push_error(code);
                    warn!("Motor {} reported error {}", id, code);
                    self.bus.error_occurred(
                        id,
                        ErrorCode::DeviceFault.code(),
                        format!("device error {}", code),
                    );
                }
            }
            _ => {}
        }
        record.set_confirmed(attr, value.clone());
        self.bus.data_changed(id, attr, value);
        Ok(())
    }

    /// Apply one decoded response tagged with the device it answers
    pub fn handle_response(&self, tag: DeviceId, response: Response) {
        let Some((id, record)) = self.record_for_tag(tag) else {
            debug!("Dropping response for unknown device {}: {:?}", tag, response);
            return;
        };

        match &response {
            Response::Value { code, value } => {
                if let Err(e) = self.set_value_by_proxy(id, *code, value.clone()) {
                    warn!("Bad value from motor {}: {}", id, e);
                }
            }
            Response::Ack { target, ok } => self.handle_ack(id, &record, *target, *ok),
            Response::Heartbeat => self.response_heart(id),
            Response::Identity { .. } => trace!("Ignoring identity answer of motor {}", id),
            Response::Samples { mode, values } => {
                self.bus.publish(Notification::Samples {
                    device: id,
                    mode: *mode,
                    values: values.clone(),
                });
            }
        }

        // A remap may have happened above
        let id = record.device_id();
        let codec = self.codec.clone();
        self.drive_procedure(id, &record, |p| {
            p.on_response(&response, |code| codec.attr_for_code(code))
        });
    }

    fn handle_ack(&self, id: DeviceId, record: &MotorRecord, target: AckTarget, ok: bool) {
        match target {
            AckTarget::Attr(attr) => {
                record.take_pending(attr);
                if !ok {
                    warn!("Motor {} rejected write of {}", id, attr);
                    self.bus.error_occurred(
                        id,
                        ErrorCode::WriteRejected.code(),
                        format!("write of {} rejected", attr),
                    );
                    return;
                }
                if attr == Attr::DeviceId {
                    let requested = record.requested(Attr::DeviceId);
                    if let Err(e) = self.apply_value(id, record, attr, requested) {
                        warn!("Could not apply id change of motor {}: {}", id, e);
                    }
                } else if let Some(value) = record.promote_requested(attr) {
                    self.bus.data_changed(id, attr, value);
                }
            }
            AckTarget::Command(kind) => {
                if !ok {
                    warn!("Motor {} rejected command {:?}", id, kind);
                    self.bus.error_occurred(
                        id,
                        ErrorCode::WriteRejected.code(),
                        format!("command {:?} rejected", kind),
                    );
                }
            }
        }
    }

    /// Move a motor to a new logical id
    ///
    /// The record keeps its contents; lookups by `old` fail with
    /// `StaleDeviceId` from now on.
    pub fn remap(&self, old: DeviceId, new: DeviceId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        {
            let mut inner = self
                .inner
                .write()
                .map_err(|_| DeviceError::other("Failed to acquire write lock on motor registry"))?;
            if inner.records.contains_key(&new) {
                return Err(DeviceError::DuplicateDeviceId(new));
            }
            if !inner.records.contains_key(&old) {
                return Err(match inner.resolve_stale(old) {
                    Some(current) => DeviceError::StaleDeviceId { old, new: current },
                    None => DeviceError::UnknownDevice(old),
                });
            }

            match self.router.remap(old, new) {
                Ok(()) | Err(DeviceError::UnknownDevice(_)) => {}
                Err(e) => return Err(e),
            }

            let record = inner
                .records
                .remove(&old)
                .ok_or(DeviceError::UnknownDevice(old))?;
            record.set_identity(new);
            inner.by_mac.insert(record.mac(), new);
            inner.records.insert(new, record);
            inner.remapped.remove(&new);
            inner.remapped.insert(old, new);
        }
        info!("Motor {} is now {}", old, new);
        self.bus
            .data_changed(new, Attr::DeviceId, Value::Integer(i64::from(new.get())));
        Ok(())
    }

    /// A heartbeat answer arrived
    pub fn response_heart(&self, id: DeviceId) {
        let Ok(record) = self.record(id) else {
            return;
        };
        self.revive_link(id);
        if let Some(change) = record.heartbeat_success() {
            self.publish_liveness(id, &record, change);
        }
    }

    /// Heartbeat timer of a motor fired
    ///
    /// An unanswered previous heartbeat counts as one failure.
    pub fn heartbeat_tick(&self, mac: DeviceMac) {
        let Some((id, record)) = self.record_by_mac(mac) else {
            self.scheduler.cancel(TimerKey::Heartbeat(mac));
            return;
        };
        if record.heartbeat_sent() {
            if let Some(change) = record.heartbeat_failure(self.config.heartbeat_failure_threshold)
            {
                self.publish_liveness(id, &record, change);
            }
        }
        let sent = self
            .codec
            .encode(id, &Request::Command(Command::Heartbeat))
            .and_then(|frame| self.router.send_liveness(id, frame));
        if let Err(e) = sent {
            debug!("Heartbeat to motor {} not sent: {}", id, e);
        }
    }

    /// An answer over a failed link shows the link works again
    fn revive_link(&self, id: DeviceId) {
        let Some(link) = self.router.link_of(id) else {
            return;
        };
        let Ok(transport) = self.router.transport(link) else {
            return;
        };
        if transport.status() == ConnectionStatus::Failed {
            info!("{} answers again", transport.name());
            transport.set_status(ConnectionStatus::Connected);
        }
    }

    fn publish_liveness(&self, id: DeviceId, record: &MotorRecord, change: Liveness) {
        match change {
            Liveness::CameOnline => {
                info!("Motor {} is online", id);
                self.revive_link(id);
                self.bus.data_changed(id, Attr::OnlineStatus, Value::Integer(1));
            }
            Liveness::WentOffline => {
                warn!(
                    "Motor {} is offline after {} missed heartbeats",
                    id,
                    record.heartbeat_failures()
                );
                self.bus.data_changed(id, Attr::OnlineStatus, Value::Integer(0));
                self.drive_procedure(id, record, |p| p.on_offline());
            }
        }
    }

    /// Take motors offline whose link disappeared
    pub fn handle_link_lost(&self, ids: &[DeviceId]) {
        for id in ids {
            let Ok(record) = self.record(*id) else {
                continue;
            };
            if let Some(change) = record.force_offline() {
                self.publish_liveness(*id, &record, change);
            }
        }
    }

    /// Switch periodic requests of the actual values
    pub fn switch_auto_request_actual(&self, id: DeviceId, on: bool) -> Result<()> {
        let record = self.record(id)?;
        record.set_auto_poll(on);
        let key = TimerKey::AutoPoll(record.mac());
        if on {
            self.scheduler
                .set_repeating(key, record.auto_poll_interval());
        } else {
            self.scheduler.cancel(key);
        }
        debug!("Auto-poll of motor {} {}", id, if on { "on" } else { "off" });
        Ok(())
    }

    /// Change the auto-poll period
    pub fn set_auto_request_interval(&self, id: DeviceId, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(DeviceError::invalid_value("auto-poll interval must be non-zero"));
        }
        let record = self.record(id)?;
        record.set_auto_poll_interval(interval);
        if record.auto_poll_enabled() {
            self.scheduler
                .set_repeating(TimerKey::AutoPoll(record.mac()), interval);
        }
        Ok(())
    }

    /// Auto-poll timer of a motor fired
    pub fn auto_poll_tick(&self, mac: DeviceMac) {
        let Some((id, record)) = self.record_by_mac(mac) else {
            self.scheduler.cancel(TimerKey::AutoPoll(mac));
            return;
        };
        if !record.auto_poll_enabled() {
            self.scheduler.cancel(TimerKey::AutoPoll(mac));
            return;
        }
        for attr in Attr::ACTUALS {
            if let Err(e) = self.dispatch(id, &record, &Request::Read(attr)) {
                debug!("Auto-poll of motor {} not sent: {}", id, e);
                break;
            }
        }
    }

    /// Start encoder calibration
    pub fn start_calibration(&self, id: DeviceId) -> Result<ProcedureHandle> {
        self.start_procedure(id, Procedure::calibration())
    }

    /// Start homing with the given strategy
    pub fn start_homing(&self, id: DeviceId, operation_mode: u8) -> Result<ProcedureHandle> {
        self.start_procedure(id, Procedure::homing(operation_mode))
    }

    fn start_procedure(
        &self,
        id: DeviceId,
        (procedure, handle): (Procedure, ProcedureHandle),
    ) -> Result<ProcedureHandle> {
        let record = self.record(id)?;
        let mut slot = record.procedure();
        if slot.is_some() {
            return Err(DeviceError::ProcedureBusy(id));
        }
        if !record.is_online() {
            return Err(match procedure.on_offline() {
                Progress::Aborted(e) => e,
                _ => DeviceError::other("procedure refused"),
            });
        }
        if let Some(request) = procedure.first_request() {
            if let Err(e) = self.dispatch(id, &record, &request) {
                return Err(match procedure.on_send_failure(&e) {
                    Progress::Aborted(e) => e,
                    _ => e,
                });
            }
        }
        info!("Motor {} started {}", id, procedure.kind());
        *slot = Some(procedure);
        self.scheduler.set_once(
            TimerKey::Procedure(record.mac()),
            self.config.procedure_step_timeout(),
        );
        Ok(handle)
    }

    /// Procedure step timer of a motor fired
    pub fn procedure_timeout(&self, mac: DeviceMac) {
        if let Some((id, record)) = self.record_by_mac(mac) {
            self.drive_procedure(id, &record, |p| p.on_timeout());
        }
    }

    /// Whether a procedure is running on the motor
    pub fn procedure_running(&self, id: DeviceId) -> Result<bool> {
        Ok(self.record(id)?.procedure().is_some())
    }

    fn drive_procedure(
        &self,
        id: DeviceId,
        record: &MotorRecord,
        event: impl FnOnce(&mut Procedure) -> Progress,
    ) {
        let mut slot = record.procedure();
        let Some(procedure) = slot.as_mut() else {
            return;
        };
        let mut progress = event(procedure);

        if let Progress::Advance(request) = &progress {
            debug!("Motor {} {} at step {}", id, procedure.kind(), procedure.current_step());
            self.scheduler.set_once(
                TimerKey::Procedure(record.mac()),
                self.config.procedure_step_timeout(),
            );
            let request = request.clone();
            if let Some(request) = &request {
                if let Err(e) = self.dispatch(id, record, request) {
                    progress = procedure.on_send_failure(&e);
                }
            }
        }

        let result = match progress {
            Progress::Pending | Progress::Advance(_) => return,
            Progress::Completed => Ok(()),
            Progress::Aborted(e) => Err(e),
        };
        let Some(procedure) = slot.take() else {
            return;
        };
        drop(slot);

        self.scheduler.cancel(TimerKey::Procedure(record.mac()));
        let kind = procedure.kind();
        let failure = result.as_ref().err().map(ToString::to_string);
        match &failure {
            None => info!("Motor {} finished {}", id, kind),
            Some(reason) => {
                warn!("Motor {}: {}", id, reason);
                self.bus
                    .error_occurred(id, ErrorCode::SequenceAborted.code(), reason.clone());
            }
        }
        self.bus.publish(Notification::ProcedureFinished {
            device: id,
            kind,
            failure,
        });
        procedure.finish(result);
    }

    /// Save a motor's confirmed table
    pub fn save_params(&self, id: DeviceId) -> Result<()> {
        let record = self.record(id)?;
        let doc = ParamDocument {
            device_id: id,
            mac: record.mac(),
            params: record.snapshot(),
        };
        self.store.save(&doc)?;
        info!("Saved params of motor {}", id);
        Ok(())
    }

    /// Save every motor's confirmed table
    pub fn save_all_params(&self) -> Result<()> {
        for id in self.ids() {
            self.save_params(id)?;
        }
        Ok(())
    }

    /// Cancel every timer this registry armed
    pub fn stop_timers(&self) {
        let macs: Vec<DeviceMac> = self
            .inner
            .read()
            .map(|inner| inner.by_mac.keys().copied().collect())
            .unwrap_or_default();
        for mac in macs {
            self.scheduler.cancel(TimerKey::Heartbeat(mac));
            self.scheduler.cancel(TimerKey::AutoPoll(mac));
            self.scheduler.cancel(TimerKey::Procedure(mac));
        }
    }
}
