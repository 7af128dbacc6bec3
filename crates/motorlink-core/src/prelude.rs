/*!
 * Prelude module for motorlink core.
 *
 * This module re-exports commonly used types and functions from the core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Attr, DeviceId, DeviceMac, LinkId, MotorMode, Value};

// Re-export event types
pub use crate::event::{Notification, NotificationBus, ProcedureKind};

// Re-export config types
pub use crate::config::{
    Config, ConfigBuilder, DiscoveryConfig, LinkConfig, LoggingConfig, MotorConfig, SharedConfig,
};

// Re-export utility functions
pub use crate::utils::{duration_to_millis, millis, spawn_and_log, with_timeout};

// Re-export logging helpers
pub use crate::logging::{component_span, operation_span};
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
