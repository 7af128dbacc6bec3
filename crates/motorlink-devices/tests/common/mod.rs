//! Simulated motors and helpers shared by the integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::Instant;

use motorlink_core::config::Config;
use motorlink_core::event::Notification;
use motorlink_core::types::{Attr, DeviceId, DeviceMac, Value};
use motorlink_devices::codec::{AckTarget, BasicCodec, Command, Request, Response};
use motorlink_devices::link::{MemoryLinkProvider, Responder};

/// One simulated motor
#[derive(Debug, Clone)]
pub struct SimMotor {
    pub id: DeviceId,
    pub mac: DeviceMac,
    pub values: HashMap<Attr, Value>,
}

#[derive(Debug, Default)]
struct SimState {
    motors: Vec<SimMotor>,
    silent: bool,
    rejected: HashSet<Attr>,
}

/// A bus of simulated motors answering through a memory port
#[derive(Debug, Default)]
pub struct Simulator {
    state: Mutex<SimState>,
    codec: BasicCodec,
}

impl Simulator {
    pub fn new(motors: &[(u8, u32)]) -> Arc<Self> {
        let sim = Self::default();
        sim.state.lock().unwrap().motors = motors
            .iter()
            .map(|(id, mac)| SimMotor {
                id: DeviceId(*id),
                mac: DeviceMac(*mac),
                values: HashMap::new(),
            })
            .collect();
        Arc::new(sim)
    }

    pub fn responder(self: &Arc<Self>) -> Responder {
        let sim = Arc::clone(self);
        Arc::new(move |frame: &[u8]| sim.answer(frame))
    }

    /// Stop answering heartbeats
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    /// Negatively acknowledge writes of `attr`
    pub fn reject(&self, attr: Attr) {
        self.state.lock().unwrap().rejected.insert(attr);
    }

    pub fn set_value(&self, id: DeviceId, attr: Attr, value: Value) {
        let mut state = self.state.lock().unwrap();
        if let Some(motor) = state.motors.iter_mut().find(|m| m.id == id) {
            motor.values.insert(attr, value);
        }
    }

    pub fn value(&self, id: DeviceId, attr: Attr) -> Option<Value> {
        let state = self.state.lock().unwrap();
        state
            .motors
            .iter()
            .find(|m| m.id == id)
            .and_then(|m| m.values.get(&attr).cloned())
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.state.lock().unwrap().motors.iter().map(|m| m.id).collect()
    }

    fn answer(&self, frame: &[u8]) -> Vec<Bytes> {
        let requests = match self.codec.decode_request(frame) {
            Ok(requests) => requests,
            Err(_) => return Vec::new(),
        };
        let mut state = self.state.lock().unwrap();
        let mut answers = Vec::new();

        for (device, request) in requests {
            if request == Request::Probe {
                for motor in &state.motors {
                    answers.push((
                        motor.id,
                        Response::Identity {
                            id: motor.id,
                            mac: motor.mac,
                        },
                    ));
                }
                continue;
            }

            let silent = state.silent;
            let rejected = state.rejected.clone();
            let Some(motor) = state.motors.iter_mut().find(|m| m.id == device) else {
                continue;
            };
            match request {
                Request::Write { attr, value } => {
                    let ok = !rejected.contains(&attr);
                    if ok {
                        if attr == Attr::DeviceId {
                            if let Some(new) = value.as_integer() {
                                motor.id = DeviceId(new as u8);
                            }
                        }
                        motor.values.insert(attr, value);
                    }
                    answers.push((
                        device,
                        Response::Ack {
                            target: AckTarget::Attr(attr),
                            ok,
                        },
                    ));
                }
                Request::Read(attr) => {
                    let value = match attr {
                        Attr::DeviceId => Value::Integer(i64::from(motor.id.get())),
                        Attr::MacId => Value::Integer(i64::from(motor.mac.get())),
                        Attr::OnlineStatus => Value::Integer(1),
                        _ => motor.values.get(&attr).cloned().unwrap_or(Value::Integer(0)),
                    };
                    answers.push((
                        device,
                        Response::Value {
                            code: attr.index() as u8,
                            value,
                        },
                    ));
                }
                Request::Command(Command::Heartbeat) => {
                    if !silent {
                        answers.push((device, Response::Heartbeat));
                    }
                }
                Request::Command(command) => {
                    answers.push((
                        device,
                        Response::Ack {
                            target: AckTarget::Command(command.kind()),
                            ok: true,
                        },
                    ));
                    let finished = match command {
                        Command::StartCalibration => Some((Attr::CalibrationAngle, 42.5)),
                        Command::SetHomingOperationMode(_) => Some((Attr::PosHoming, -3.25)),
                        _ => None,
                    };
                    if let Some((attr, value)) = finished {
                        motor.values.insert(attr, Value::Float(value));
                        answers.push((
                            device,
                            Response::Value {
                                code: attr.index() as u8,
                                value: Value::Float(value),
                            },
                        ));
                    }
                }
                Request::Probe => {}
            }
        }

        answers
            .into_iter()
            .filter_map(|(device, response)| self.codec.encode_response(device, &response).ok())
            .collect()
    }
}

/// Provider with one simulated bus per port name
pub fn provider_with(buses: &[(&str, &Arc<Simulator>)]) -> MemoryLinkProvider {
    let provider = MemoryLinkProvider::new();
    for (name, sim) in buses {
        provider.add_device(name, sim.responder());
    }
    provider
}

/// Configuration with short timeouts and parameters stored under `dir`
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.link.response_timeout_ms = 20;
    config.discovery.probe_timeout_ms = 150;
    config.discovery.max_attempts = 2;
    config.motor.heartbeat_interval_ms = 60_000;
    config.motor.heartbeat_failure_threshold = 3;
    config.motor.procedure_step_timeout_ms = 2_000;
    config.motor.params_dir = dir.join("params").to_string_lossy().into_owned();
    config
}

/// Poll `condition` until it holds, panicking after a few seconds
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Receive notifications until one matches
pub async fn next_matching<F>(
    rx: &mut broadcast::Receiver<Notification>,
    matches: F,
) -> Notification
where
    F: Fn(&Notification) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(notification)) if matches(&notification) => return notification,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("notification bus closed"),
            Err(_) => panic!("no matching notification arrived"),
        }
    }
}

/// Drain whatever is already buffered
pub fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(notification) => out.push(notification),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return out,
        }
    }
}
