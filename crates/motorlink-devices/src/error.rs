/*!
 * Error types for the device layer.
 *
 * Every [`DeviceError`] maps onto a stable [`ErrorCode`], which is the `code`
 * carried by `ErrorOccurred` and `ConnectionError` notifications.
 */
use thiserror::Error;

use motorlink_core::error::Error as CoreError;
use motorlink_core::event::ProcedureKind;
use motorlink_core::types::{Attr, DeviceId};

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The transport is not connected or is stopping
    #[error("Link unavailable: {0}")]
    LinkUnavailable(String),

    /// No routing entry or record exists for the device
    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),

    /// The device id was remapped away
    #[error("Device id {old} is stale, the device is now {new}")]
    StaleDeviceId {
        /// The id used for the lookup
        old: DeviceId,
        /// The id the device now answers to
        new: DeviceId,
    },

    /// A registration batch contains ambiguous device ids
    #[error("Duplicate device id {0} in registration batch")]
    DuplicateDeviceId(DeviceId),

    /// Link I/O failed
    #[error("Transport error on device {device}: {message}")]
    Transport {
        /// The device whose frame was being written
        device: DeviceId,
        /// Failure description
        message: String,
    },

    /// No identification response arrived on a link
    #[error("Probe timed out on link {0}")]
    ProbeTimeout(String),

    /// A calibration or homing step failed
    #[error("{kind} aborted at step {step}: {reason}")]
    SequenceAborted {
        /// Which procedure
        kind: ProcedureKind,
        /// Name of the failing step
        step: &'static str,
        /// Why it failed
        reason: String,
    },

    /// The attribute cannot be written directly
    #[error("Attribute {0} is read-only")]
    ReadOnlyAttribute(Attr),

    /// The value does not fit the attribute
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The motor mode is unknown or not valid for the operation
    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    /// A procedure is already running on the device
    #[error("Device {0} is already running a procedure")]
    ProcedureBusy(DeviceId),

    /// Another discovery pass is running
    #[error("Discovery already in progress")]
    DiscoveryInProgress,

    /// No transport with the given identity
    #[error("Unknown link: {0}")]
    UnknownLink(String),

    /// Frame encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Parameter persistence failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Stable numeric codes carried by notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// See [`DeviceError::LinkUnavailable`]
    LinkUnavailable = 1,
    /// See [`DeviceError::UnknownDevice`]
    UnknownDevice = 2,
    /// See [`DeviceError::StaleDeviceId`]
    StaleDeviceId = 3,
    /// See [`DeviceError::DuplicateDeviceId`]
    DuplicateDeviceId = 4,
    /// See [`DeviceError::Transport`]
    Transport = 5,
    /// See [`DeviceError::ProbeTimeout`]
    ProbeTimeout = 6,
    /// See [`DeviceError::SequenceAborted`]
    SequenceAborted = 7,
    /// The link serving a device disappeared
    LinkLost = 8,
    /// The device refused a write
    WriteRejected = 9,
    /// The device reported an error code of its own
    DeviceFault = 10,
    /// Anything else
    Other = 99,
}

impl ErrorCode {
    /// Numeric value of the code
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl DeviceError {
    /// Create a new transport error
    pub fn transport<S: AsRef<str>>(device: DeviceId, msg: S) -> Self {
        DeviceError::Transport {
            device,
            message: msg.as_ref().to_string(),
        }
    }

    /// Create a new link unavailable error
    pub fn link_unavailable<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::LinkUnavailable(msg.as_ref().to_string())
    }

    /// Create a new codec error
    pub fn codec<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Codec(msg.as_ref().to_string())
    }

    /// Create a new persistence error
    pub fn persistence<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Persistence(msg.as_ref().to_string())
    }

    /// Create a new invalid value error
    pub fn invalid_value<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::InvalidValue(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Other(msg.as_ref().to_string())
    }

    /// Notification code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            DeviceError::LinkUnavailable(_) => ErrorCode::LinkUnavailable,
            DeviceError::UnknownDevice(_) => ErrorCode::UnknownDevice,
            DeviceError::StaleDeviceId { .. } => ErrorCode::StaleDeviceId,
            DeviceError::DuplicateDeviceId(_) => ErrorCode::DuplicateDeviceId,
            DeviceError::Transport { .. } => ErrorCode::Transport,
            DeviceError::ProbeTimeout(_) => ErrorCode::ProbeTimeout,
            DeviceError::SequenceAborted { .. } => ErrorCode::SequenceAborted,
            _ => ErrorCode::Other,
        }
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Persistence(err.to_string())
    }
}
