/*!
 * Core data types for motorlink.
 *
 * This module defines the identifiers, the value type and the closed set of
 * motor attribute kinds shared by every motorlink crate.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical identifier of a motor on its link
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u8);

impl DeviceId {
    /// Broadcast address used by identification probes
    pub const BROADCAST: DeviceId = DeviceId(0xFF);

    /// Get the raw identifier
    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for DeviceId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

/// Stable hardware address of a motor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceMac(pub u32);

impl DeviceMac {
    /// Get the raw address
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl From<u32> for DeviceMac {
    fn from(mac: u32) -> Self {
        Self(mac)
    }
}

/// Identity of a link transport inside a router
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// A parameter value exchanged with a motor
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// No value received yet
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Integer(i64),
    /// Floating-point value
    Float(f64),
    /// String value
    String(String),
}

impl Value {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if the value is numeric (integer or float)
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    /// Try to get a boolean value
    ///
    /// Integers are treated as switches: zero is `false`, anything else `true`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Try to get an integer value
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Float(f) if *f == (*f as i64) as f64 => Some(*f as i64),
            _ => None,
        }
    }

    /// Try to get a float value
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Try to get a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<u8> for Value {
    fn from(i: u8) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::Float(f64::from(f))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<MotorMode> for Value {
    fn from(mode: MotorMode) -> Self {
        Value::Integer(mode as i64)
    }
}

macro_rules! attribute_kinds {
    ($($(#[$doc:meta])* $variant:ident),+ $(,)?) => {
        /// Closed set of motor attribute kinds
        ///
        /// Every motor record holds exactly one slot per kind, in declaration order.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum Attr {
            $($(#[$doc])* $variant),+
        }

        impl Attr {
            /// All attribute kinds in table order
            pub const ALL: &'static [Attr] = &[$(Attr::$variant),+];
        }
    };
}

attribute_kinds! {
    /// Quadrature current set point
    CurIqSet,
    /// Current loop proportional gain
    CurProportional,
    /// Current loop integral gain
    CurIntegral,
    /// Direct current set point
    CurIdSet,
    /// Current lower limit
    CurMinimal,
    /// Current upper limit
    CurMaximum,
    /// Nominal current
    CurNominal,
    /// Current loop output
    CurOutput,
    /// Maximum speed in current mode
    CurMaxSpeed,
    /// Measured current
    CurActual,
    /// Current demand
    CurDemand,
    /// Velocity set point
    VelSet,
    /// Velocity loop proportional gain
    VelProportional,
    /// Velocity loop integral gain
    VelIntegral,
    /// Velocity lower limit
    VelMinimal,
    /// Velocity upper limit
    VelMaximum,
    /// Measured velocity
    VelActual,
    /// Velocity demand
    VelDemand,
    /// Position set point
    PosSet,
    /// Position loop proportional gain
    PosProportional,
    /// Position loop integral gain
    PosIntegral,
    /// Position loop differential gain
    PosDifferential,
    /// Position loop output lower limit
    PosMinimal,
    /// Position loop output upper limit
    PosMaximum,
    /// Position step increment
    PosStepAdd,
    /// Lowest reachable position
    PosMinPos,
    /// Highest reachable position
    PosMaxPos,
    /// Homing position
    PosHoming,
    /// Measured position
    PosActual,
    /// Position demand
    PosDemand,
    /// Profile position maximum speed
    ProfilePosMaxSpeed,
    /// Profile position acceleration
    ProfilePosAcc,
    /// Profile position deceleration
    ProfilePosDec,
    /// Profile velocity maximum speed
    ProfileVelMaxSpeed,
    /// Profile velocity acceleration
    ProfileVelAcc,
    /// Profile velocity deceleration
    ProfileVelDec,
    /// Chart sampling frequency
    ChartFrequency,
    /// Chart trigger threshold
    ChartThreshold,
    /// Chart streaming switch
    ChartSwitch,
    /// Position offset
    PosOffset,
    /// Supply voltage
    Voltage,
    /// Homing limit switch
    HomingLimit,
    /// Homing current upper bound
    HomingCurMax,
    /// Homing current lower bound
    HomingCurMin,
    /// Current scale factor
    CurrentScale,
    /// Velocity scale factor
    VelocityScale,
    /// Current filter switch
    FilterCStatus,
    /// Current filter bandwidth
    FilterCValue,
    /// Velocity filter switch
    FilterVStatus,
    /// Velocity filter bandwidth
    FilterVValue,
    /// Position filter switch
    FilterPStatus,
    /// Position filter bandwidth
    FilterPValue,
    /// Load inertia
    Inertia,
    /// Lock energy
    LockEnergy,
    /// Motor temperature
    TempMotor,
    /// Inverter temperature
    TempInverter,
    /// Over-temperature protection threshold
    TempProtect,
    /// Over-temperature recovery threshold
    TempRecovery,
    /// Calibration switch
    CalibrationSwitch,
    /// Calibration angle
    CalibrationAngle,
    /// Motor enable switch
    MotorSwitch,
    /// Firmware version
    MotorVersion,
    /// Online status
    OnlineStatus,
    /// Logical device id
    DeviceId,
    /// Hardware MAC address
    MacId,
    /// Operating mode
    ModeId,
    /// Current error code
    ErrorId,
    /// Reserved slot
    Reserve0,
    /// Reserved slot
    Reserve1,
    /// Reserved slot
    Reserve2,
    /// Reserved slot
    Reserve3,
}

impl Attr {
    /// Number of attribute kinds
    pub const COUNT: usize = Attr::ALL.len();

    /// Fast-changing attributes requested by auto-poll
    pub const ACTUALS: [Attr; 3] = [Attr::CurActual, Attr::VelActual, Attr::PosActual];

    /// Position of this attribute in a parameter table
    pub fn index(self) -> usize {
        self as usize
    }

    /// Look up an attribute by table position
    pub fn from_index(index: usize) -> Option<Attr> {
        Attr::ALL.get(index).copied()
    }

    /// Whether values of this attribute are integral (ids, switches, codes)
    pub fn is_integral(self) -> bool {
        matches!(
            self,
            Attr::ChartSwitch
                | Attr::HomingLimit
                | Attr::FilterCStatus
                | Attr::FilterVStatus
                | Attr::FilterPStatus
                | Attr::CalibrationSwitch
                | Attr::MotorSwitch
                | Attr::MotorVersion
                | Attr::OnlineStatus
                | Attr::DeviceId
                | Attr::MacId
                | Attr::ModeId
                | Attr::ErrorId
        )
    }

    /// Whether the attribute may only change through registry bookkeeping
    pub fn is_identity(self) -> bool {
        matches!(self, Attr::DeviceId | Attr::MacId)
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Operating mode of a motor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MotorMode {
    /// No mode active
    None = 0,
    /// Current control
    Current = 1,
    /// Velocity control
    Velocity = 2,
    /// Position control
    Position = 3,
    /// Teaching (hand guiding)
    Teaching = 4,
    /// Profile position
    ProfilePosition = 6,
    /// Profile velocity
    ProfileVelocity = 7,
    /// Homing
    Homing = 8,
}

impl TryFrom<i64> for MotorMode {
    type Error = i64;

    fn try_from(raw: i64) -> std::result::Result<Self, Self::Error> {
        match raw {
            0 => Ok(MotorMode::None),
            1 => Ok(MotorMode::Current),
            2 => Ok(MotorMode::Velocity),
            3 => Ok(MotorMode::Position),
            4 => Ok(MotorMode::Teaching),
            6 => Ok(MotorMode::ProfilePosition),
            7 => Ok(MotorMode::ProfileVelocity),
            8 => Ok(MotorMode::Homing),
            other => Err(other),
        }
    }
}

impl MotorMode {
    /// Attribute that carries the demand in this mode, if any
    pub fn demand_attr(self) -> Option<Attr> {
        match self {
            MotorMode::Current => Some(Attr::CurIqSet),
            MotorMode::Velocity | MotorMode::ProfileVelocity => Some(Attr::VelSet),
            MotorMode::Position | MotorMode::ProfilePosition => Some(Attr::PosSet),
            _ => None,
        }
    }
}
