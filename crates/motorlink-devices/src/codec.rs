/*!
 * Wire codec boundary.
 *
 * The device layer never looks inside a frame. It builds [`Request`]s, hands
 * them to a [`Codec`] for encoding, and receives decoded [`Reply`]s back.
 * [`BasicCodec`] is a small framed codec used by the in-memory link and the
 * test suites; a production protocol plugs in through the same trait.
 */
use std::fmt::Debug;

use bytes::{BufMut, Bytes, BytesMut};

use motorlink_core::types::{Attr, DeviceId, DeviceMac, MotorMode, Value};

use crate::error::{DeviceError, Result};

/// Device-level command without attribute semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Liveness probe
    Heartbeat,
    /// Store every parameter into device flash
    SaveAllParams,
    /// Forget the stored homing result
    ClearHomingInfo,
    /// Select the homing strategy and start homing
    SetHomingOperationMode(u8),
    /// Start streaming one chart channel
    OpenChartChannel(u8),
    /// Stop streaming one chart channel
    CloseChartChannel(u8),
    /// Switch every chart channel on or off
    SwitchChartAllChannels(bool),
    /// Select the calibration velocity preset
    SwitchCalibrationVelocity(u8),
    /// Start encoder calibration
    StartCalibration,
    /// Clear the active error
    ClearError,
}

/// Command identity without arguments, used to match acknowledgements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    /// See [`Command::Heartbeat`]
    Heartbeat = 0x01,
    /// See [`Command::SaveAllParams`]
    SaveAllParams = 0x02,
    /// See [`Command::ClearHomingInfo`]
    ClearHomingInfo = 0x03,
    /// See [`Command::SetHomingOperationMode`]
    SetHomingOperationMode = 0x04,
    /// See [`Command::OpenChartChannel`]
    OpenChartChannel = 0x05,
    /// See [`Command::CloseChartChannel`]
    CloseChartChannel = 0x06,
    /// See [`Command::SwitchChartAllChannels`]
    SwitchChartAllChannels = 0x07,
    /// See [`Command::SwitchCalibrationVelocity`]
    SwitchCalibrationVelocity = 0x08,
    /// See [`Command::StartCalibration`]
    StartCalibration = 0x09,
    /// See [`Command::ClearError`]
    ClearError = 0x0A,
}

impl CommandKind {
    const ALL: [CommandKind; 10] = [
        CommandKind::Heartbeat,
        CommandKind::SaveAllParams,
        CommandKind::ClearHomingInfo,
        CommandKind::SetHomingOperationMode,
        CommandKind::OpenChartChannel,
        CommandKind::CloseChartChannel,
        CommandKind::SwitchChartAllChannels,
        CommandKind::SwitchCalibrationVelocity,
        CommandKind::StartCalibration,
        CommandKind::ClearError,
    ];

    /// Wire code of the command
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a command kind by wire code
    pub fn from_code(code: u8) -> Option<CommandKind> {
        Self::ALL.iter().copied().find(|k| k.code() == code)
    }
}

impl Command {
    /// Identity of the command
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Heartbeat => CommandKind::Heartbeat,
            Command::SaveAllParams => CommandKind::SaveAllParams,
            Command::ClearHomingInfo => CommandKind::ClearHomingInfo,
            Command::SetHomingOperationMode(_) => CommandKind::SetHomingOperationMode,
            Command::OpenChartChannel(_) => CommandKind::OpenChartChannel,
            Command::CloseChartChannel(_) => CommandKind::CloseChartChannel,
            Command::SwitchChartAllChannels(_) => CommandKind::SwitchChartAllChannels,
            Command::SwitchCalibrationVelocity(_) => CommandKind::SwitchCalibrationVelocity,
            Command::StartCalibration => CommandKind::StartCalibration,
            Command::ClearError => CommandKind::ClearError,
        }
    }

    fn argument(&self) -> Option<u8> {
        match self {
            Command::SetHomingOperationMode(a)
            | Command::OpenChartChannel(a)
            | Command::CloseChartChannel(a)
            | Command::SwitchCalibrationVelocity(a) => Some(*a),
            Command::SwitchChartAllChannels(on) => Some(u8::from(*on)),
            _ => None,
        }
    }

    fn from_parts(kind: CommandKind, arg: Option<u8>) -> Command {
        let arg = arg.unwrap_or_default();
        match kind {
            CommandKind::Heartbeat => Command::Heartbeat,
            CommandKind::SaveAllParams => Command::SaveAllParams,
            CommandKind::ClearHomingInfo => Command::ClearHomingInfo,
            CommandKind::SetHomingOperationMode => Command::SetHomingOperationMode(arg),
            CommandKind::OpenChartChannel => Command::OpenChartChannel(arg),
            CommandKind::CloseChartChannel => Command::CloseChartChannel(arg),
            CommandKind::SwitchChartAllChannels => Command::SwitchChartAllChannels(arg != 0),
            CommandKind::SwitchCalibrationVelocity => Command::SwitchCalibrationVelocity(arg),
            CommandKind::StartCalibration => Command::StartCalibration,
            CommandKind::ClearError => Command::ClearError,
        }
    }
}

/// Outbound request to a device
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Write an attribute
    Write {
        /// Target attribute
        attr: Attr,
        /// New value
        value: Value,
    },
    /// Ask for the current value of an attribute
    Read(Attr),
    /// Issue a device command
    Command(Command),
    /// Broadcast identification probe
    Probe,
}

/// What an acknowledgement refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckTarget {
    /// An attribute write
    Attr(Attr),
    /// A device command
    Command(CommandKind),
}

/// Decoded response payload
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Confirmed value of an attribute, keyed by its wire code
    Value {
        /// Attribute wire code
        code: u8,
        /// The value
        value: Value,
    },
    /// Acknowledgement of a write or command
    Ack {
        /// What was acknowledged
        target: AckTarget,
        /// Whether the device accepted it
        ok: bool,
    },
    /// Heartbeat answer
    Heartbeat,
    /// Identification answer to a probe
    Identity {
        /// Logical id of the device
        id: DeviceId,
        /// Hardware address of the device
        mac: DeviceMac,
    },
    /// Chart samples
    Samples {
        /// Mode the samples were taken in
        mode: MotorMode,
        /// Ordered samples
        values: Vec<f64>,
    },
}

/// A decoded response with the address it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Sender address as written in the frame
    pub device: DeviceId,
    /// Payload
    pub response: Response,
}

/// Encode/decode boundary between the device layer and the wire
pub trait Codec: Send + Sync + Debug {
    /// Encode a request addressed to `device`
    fn encode(&self, device: DeviceId, request: &Request) -> Result<Bytes>;

    /// Decode every response contained in `frame`
    fn decode(&self, frame: &[u8]) -> Result<Vec<Reply>>;

    /// Attribute for a wire code
    fn attr_for_code(&self, code: u8) -> Option<Attr>;

    /// Wire code for an attribute
    fn code_for_attr(&self, attr: Attr) -> u8;
}

const START: u8 = 0xAA;
const HEADER_LEN: usize = 5;

const OP_WRITE: u8 = 0x01;
const OP_READ: u8 = 0x02;
const OP_COMMAND: u8 = 0x03;
const OP_PROBE: u8 = 0x04;

const OP_VALUE: u8 = 0x81;
const OP_ACK_WRITE: u8 = 0x82;
const OP_ACK_COMMAND: u8 = 0x83;
const OP_HEARTBEAT: u8 = 0x84;
const OP_IDENTITY: u8 = 0x85;
const OP_SAMPLES: u8 = 0x86;

/// Reference framed codec
///
/// Frame layout: `[0xAA, device, op, code, len, payload.., xor]` where `xor`
/// is the XOR of every preceding byte. Values travel as little-endian `f64`,
/// samples as little-endian `f32`. An attribute's wire code is its table index.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicCodec;

impl BasicCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }

    fn frame(device: DeviceId, op: u8, code: u8, payload: &[u8]) -> Result<Bytes> {
        let len = u8::try_from(payload.len())
            .map_err(|_| DeviceError::codec(format!("payload of {} bytes", payload.len())))?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len() + 1);
        buf.put_u8(START);
        buf.put_u8(device.get());
        buf.put_u8(op);
        buf.put_u8(code);
        buf.put_u8(len);
        buf.put_slice(payload);
        let checksum = buf.iter().fold(0u8, |acc, b| acc ^ b);
        buf.put_u8(checksum);
        Ok(buf.freeze())
    }

    fn value_payload(attr: Attr, value: &Value) -> Result<[u8; 8]> {
        let number = match value {
            Value::String(_) | Value::Null => None,
            other => other.as_float(),
        };
        number
            .map(f64::to_le_bytes)
            .ok_or_else(|| DeviceError::invalid_value(format!("{} cannot carry {}", attr, value)))
    }

    /// Encode a response, as a device would send it
    pub fn encode_response(&self, device: DeviceId, response: &Response) -> Result<Bytes> {
        match response {
            Response::Value { code, value } => {
                let attr = self
                    .attr_for_code(*code)
                    .ok_or_else(|| DeviceError::codec(format!("unknown attribute code {}", code)))?;
                Self::frame(device, OP_VALUE, *code, &Self::value_payload(attr, value)?)
            }
            Response::Ack { target, ok } => match target {
                AckTarget::Attr(attr) => Self::frame(
                    device,
                    OP_ACK_WRITE,
                    self.code_for_attr(*attr),
                    &[u8::from(*ok)],
                ),
                AckTarget::Command(kind) => {
                    Self::frame(device, OP_ACK_COMMAND, kind.code(), &[u8::from(*ok)])
                }
            },
            Response::Heartbeat => Self::frame(device, OP_HEARTBEAT, 0, &[]),
            Response::Identity { id, mac } => {
                Self::frame(device, OP_IDENTITY, id.get(), &mac.get().to_le_bytes())
            }
            Response::Samples { mode, values } => {
                let payload: Vec<u8> = values
                    .iter()
                    .flat_map(|v| (*v as f32).to_le_bytes())
                    .collect();
                Self::frame(device, OP_SAMPLES, *mode as u8, &payload)
            }
        }
    }

    /// Decode a request, as a device would receive it
    pub fn decode_request(&self, frame: &[u8]) -> Result<Vec<(DeviceId, Request)>> {
        split_frames(frame)?
            .into_iter()
            .map(|(device, op, code, payload)| {
                let request = match op {
                    OP_WRITE => {
                        let attr = self.attr_for_code(code).ok_or_else(|| {
                            DeviceError::codec(format!("unknown attribute code {}", code))
                        })?;
                        Request::Write {
                            attr,
                            value: decode_value(attr, payload)?,
                        }
                    }
                    OP_READ => Request::Read(self.attr_for_code(code).ok_or_else(|| {
                        DeviceError::codec(format!("unknown attribute code {}", code))
                    })?),
                    OP_COMMAND => {
                        let kind = CommandKind::from_code(code).ok_or_else(|| {
                            DeviceError::codec(format!("unknown command code {}", code))
                        })?;
                        Request::Command(Command::from_parts(kind, payload.first().copied()))
                    }
                    OP_PROBE => Request::Probe,
                    other => {
                        return Err(DeviceError::codec(format!("unexpected request op {:#04x}", other)))
                    }
                };
                Ok((device, request))
            })
            .collect()
    }
}

impl Codec for BasicCodec {
    fn encode(&self, device: DeviceId, request: &Request) -> Result<Bytes> {
        match request {
            Request::Write { attr, value } => Self::frame(
                device,
                OP_WRITE,
                self.code_for_attr(*attr),
                &Self::value_payload(*attr, value)?,
            ),
            Request::Read(attr) => Self::frame(device, OP_READ, self.code_for_attr(*attr), &[]),
            Request::Command(command) => {
                let arg = command.argument();
                Self::frame(
                    device,
                    OP_COMMAND,
                    command.kind().code(),
                    arg.as_ref().map(std::slice::from_ref).unwrap_or(&[]),
                )
            }
            Request::Probe => Self::frame(DeviceId::BROADCAST, OP_PROBE, 0, &[]),
        }
    }

    fn decode(&self, frame: &[u8]) -> Result<Vec<Reply>> {
        split_frames(frame)?
            .into_iter()
            .map(|(device, op, code, payload)| {
                let response = match op {
                    OP_VALUE => {
                        let value = match self.attr_for_code(code) {
                            Some(attr) => decode_value(attr, payload)?,
                            None => Value::Float(read_f64(payload)?),
                        };
                        Response::Value { code, value }
                    }
                    OP_ACK_WRITE => {
                        let attr = self.attr_for_code(code).ok_or_else(|| {
                            DeviceError::codec(format!("ack for unknown attribute code {}", code))
                        })?;
                        Response::Ack {
                            target: AckTarget::Attr(attr),
                            ok: payload.first().copied().unwrap_or(0) != 0,
                        }
                    }
                    OP_ACK_COMMAND => {
                        let kind = CommandKind::from_code(code).ok_or_else(|| {
                            DeviceError::codec(format!("ack for unknown command code {}", code))
                        })?;
                        Response::Ack {
                            target: AckTarget::Command(kind),
                            ok: payload.first().copied().unwrap_or(0) != 0,
                        }
                    }
                    OP_HEARTBEAT => Response::Heartbeat,
                    OP_IDENTITY => {
                        let raw: [u8; 4] = payload
                            .try_into()
                            .map_err(|_| DeviceError::codec("identity payload must be 4 bytes"))?;
                        Response::Identity {
                            id: DeviceId(code),
                            mac: DeviceMac(u32::from_le_bytes(raw)),
                        }
                    }
                    OP_SAMPLES => {
                        let mode = MotorMode::try_from(i64::from(code))
                            .map_err(|m| DeviceError::codec(format!("unknown sample mode {}", m)))?;
                        if payload.len() % 4 != 0 {
                            return Err(DeviceError::codec("sample payload is not a multiple of 4"));
                        }
                        let values = payload
                            .chunks_exact(4)
                            .map(|c| f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                            .collect();
                        Response::Samples { mode, values }
                    }
                    other => {
                        return Err(DeviceError::codec(format!("unexpected response op {:#04x}", other)))
                    }
                };
                Ok(Reply { device, response })
            })
            .collect()
    }

    fn attr_for_code(&self, code: u8) -> Option<Attr> {
        Attr::from_index(usize::from(code))
    }

    fn code_for_attr(&self, attr: Attr) -> u8 {
        // The table has fewer than 256 entries
        attr.index() as u8
    }
}

fn read_f64(payload: &[u8]) -> Result<f64> {
    let raw: [u8; 8] = payload
        .try_into()
        .map_err(|_| DeviceError::codec(format!("value payload of {} bytes", payload.len())))?;
    Ok(f64::from_le_bytes(raw))
}

fn decode_value(attr: Attr, payload: &[u8]) -> Result<Value> {
    let number = read_f64(payload)?;
    if attr.is_integral() {
        Ok(Value::Integer(number.round() as i64))
    } else {
        Ok(Value::Float(number))
    }
}

/// Split a buffer into `(device, op, code, payload)` frames
fn split_frames(buf: &[u8]) -> Result<Vec<(DeviceId, u8, u8, &[u8])>> {
    let mut frames = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        if rest[0] != START {
            return Err(DeviceError::codec(format!("bad start byte {:#04x}", rest[0])));
        }
        if rest.len() < HEADER_LEN + 1 {
            return Err(DeviceError::codec("truncated frame header"));
        }
        let len = usize::from(rest[4]);
        let total = HEADER_LEN + len + 1;
        if rest.len() < total {
            return Err(DeviceError::codec("truncated frame payload"));
        }
        let checksum = rest[..total - 1].iter().fold(0u8, |acc, b| acc ^ b);
        if checksum != rest[total - 1] {
            return Err(DeviceError::codec("checksum mismatch"));
        }
        frames.push((
            DeviceId(rest[1]),
            rest[2],
            rest[3],
            &rest[HEADER_LEN..HEADER_LEN + len],
        ));
        rest = &rest[total..];
    }
    Ok(frames)
}
