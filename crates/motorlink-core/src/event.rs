/*!
 * Notification bus for motorlink.
 *
 * Every outward-facing signal of the device layer (value changes, device
 * errors, link errors, chart samples, procedure and discovery outcomes) is
 * published as a [`Notification`] on a broadcast channel.
 */
use std::fmt;

use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{Attr, DeviceId, DeviceMac, MotorMode, Value};

/// Maximum number of notifications buffered per subscriber
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Kind of multi-step procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureKind {
    /// Encoder calibration
    Calibration,
    /// Homing run
    Homing,
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureKind::Calibration => write!(f, "calibration"),
            ProcedureKind::Homing => write!(f, "homing"),
        }
    }
}

/// A notification published by the device layer
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A confirmed value changed
    DataChanged {
        /// The device
        device: DeviceId,
        /// The attribute
        attr: Attr,
        /// The new confirmed value
        value: Value,
    },
    /// A device reported or caused an error
    ErrorOccurred {
        /// The device
        device: DeviceId,
        /// Numeric error code
        code: u16,
        /// Human readable description
        message: String,
    },
    /// The link serving a device failed or vanished
    ConnectionError {
        /// The device
        device: DeviceId,
        /// Numeric error code
        code: u16,
        /// Human readable description
        message: String,
    },
    /// High-rate chart samples, never persisted
    Samples {
        /// The device
        device: DeviceId,
        /// Mode the samples were taken in
        mode: MotorMode,
        /// Ordered batch of samples
        values: Vec<f64>,
    },
    /// A calibration or homing sequence ended
    ProcedureFinished {
        /// The device
        device: DeviceId,
        /// Which procedure
        kind: ProcedureKind,
        /// `None` on success, otherwise the reason it was aborted
        failure: Option<String>,
    },
    /// A discovery pass ended
    DiscoveryFinished {
        /// Devices found during the pass
        found: Vec<(DeviceId, DeviceMac)>,
        /// Links that stayed unclassified
        unclassified: Vec<String>,
    },
}

impl Notification {
    /// Device this notification concerns, if any
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Notification::DataChanged { device, .. }
            | Notification::ErrorOccurred { device, .. }
            | Notification::ConnectionError { device, .. }
            | Notification::Samples { device, .. }
            | Notification::ProcedureFinished { device, .. } => Some(*device),
            Notification::DiscoveryFinished { .. } => None,
        }
    }
}

/// Broadcast bus for notifications
///
/// Cloning the bus yields another handle onto the same channel.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<Notification>,
}

impl NotificationBus {
    /// Create a new notification bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new notification bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a notification, returning the number of subscribers reached
    pub fn publish(&self, notification: Notification) -> usize {
        match self.sender.send(notification) {
            Ok(n) => {
                trace!("Published notification to {} receivers", n);
                n
            }
            // No subscriber is not an error for the publisher
            Err(_) => 0,
        }
    }

    /// Publish a `DataChanged` notification
    pub fn data_changed(&self, device: DeviceId, attr: Attr, value: Value) {
        self.publish(Notification::DataChanged {
            device,
            attr,
            value,
        });
    }

    /// Publish an `ErrorOccurred` notification
    pub fn error_occurred<S: Into<String>>(&self, device: DeviceId, code: u16, message: S) {
        self.publish(Notification::ErrorOccurred {
            device,
            code,
            message: message.into(),
        });
    }

    /// Publish a `ConnectionError` notification
    pub fn connection_error<S: Into<String>>(&self, device: DeviceId, code: u16, message: S) {
        self.publish(Notification::ConnectionError {
            device,
            code,
            message: message.into(),
        });
    }

    /// Subscribe to notifications
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Number of active subscribers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
