//! Register catalog.
//!
//! Every addressable point on a station (job inputs, status words, sensors,
//! the liveness counter) is one variant of [`MpsRegister`]. The catalog is
//! pure data: direction, value kind and node path are fixed at compile time.
//!
//! Each station exposes two job lanes with the same register layout:
//!
//! - [`JobLane::In`] - station-specific jobs (dispense, mount, deliver, ...)
//! - [`JobLane::Basic`] - lights, conveyor, reset and type assignment

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use std::fmt;

/// Number of registers in the catalog.
pub const REGISTER_COUNT: usize = 25;

/// Direction of a register as seen from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterDirection {
    /// Physical sensor reported by the station.
    SensorRead,
    /// Status word or flag reported by the station controller.
    StatusRead,
    /// Job slot written by the engine.
    ActuatorWrite,
}

/// Kind of value carried by a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Single flag.
    Boolean,
    /// Unsigned 16-bit word.
    Word,
}

/// Job lane of a station controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobLane {
    /// Station-specific jobs.
    In,
    /// Lights, conveyor, reset and identification.
    Basic,
}

impl JobLane {
    /// Register receiving the command code.
    pub const fn action_id(self) -> MpsRegister {
        match self {
            JobLane::In => MpsRegister::ActionIdIn,
            JobLane::Basic => MpsRegister::ActionIdBasic,
        }
    }

    /// Registers receiving the two payload words.
    pub const fn data(self) -> [MpsRegister; 2] {
        match self {
            JobLane::In => [MpsRegister::Data0In, MpsRegister::Data1In],
            JobLane::Basic => [MpsRegister::Data0Basic, MpsRegister::Data1Basic],
        }
    }

    /// Enable flag that starts a job.
    pub const fn enable(self) -> MpsRegister {
        match self {
            JobLane::In => MpsRegister::StatusEnableIn,
            JobLane::Basic => MpsRegister::StatusEnableBasic,
        }
    }

    /// Error code written back by the controller.
    pub const fn error(self) -> MpsRegister {
        match self {
            JobLane::In => MpsRegister::ErrorIn,
            JobLane::Basic => MpsRegister::ErrorBasic,
        }
    }

    /// Flag raised while a job runs.
    pub const fn busy(self) -> MpsRegister {
        match self {
            JobLane::In => MpsRegister::StatusBusyIn,
            JobLane::Basic => MpsRegister::StatusBusyBasic,
        }
    }

    /// Flag raised when the lane accepts the next job.
    pub const fn ready(self) -> MpsRegister {
        match self {
            JobLane::In => MpsRegister::StatusReadyIn,
            JobLane::Basic => MpsRegister::StatusReadyBasic,
        }
    }

    /// Flag raised when the last job failed.
    pub const fn fault(self) -> MpsRegister {
        match self {
            JobLane::In => MpsRegister::StatusErrorIn,
            JobLane::Basic => MpsRegister::StatusErrorBasic,
        }
    }
}

impl fmt::Display for JobLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobLane::In => f.write_str("in"),
            JobLane::Basic => f.write_str("basic"),
        }
    }
}

/// Static description of one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpec {
    /// Symbolic name.
    pub name: &'static str,
    /// Node path on node-based transports.
    pub node_path: &'static str,
    /// Direction.
    pub direction: RegisterDirection,
    /// Value kind.
    pub kind: ValueKind,
}

/// Addressable device point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MpsRegister {
    ActionIdIn,
    Data0In,
    Data1In,
    StatusEnableIn,
    ErrorIn,
    StatusBusyIn,
    StatusReadyIn,
    StatusErrorIn,
    SlideCountIn,
    BarcodeIn,
    ActionIdBasic,
    Data0Basic,
    Data1Basic,
    StatusEnableBasic,
    ErrorBasic,
    StatusBusyBasic,
    StatusReadyBasic,
    StatusErrorBasic,
    SlideCountBasic,
    BarcodeBasic,
    SensorInput,
    SensorMiddle,
    SensorOutput,
    LineEmpty,
    Heartbeat,
}

assert_eq_size!(MpsRegister, u8);

const fn spec(
    name: &'static str,
    node_path: &'static str,
    direction: RegisterDirection,
    kind: ValueKind,
) -> RegisterSpec {
    RegisterSpec {
        name,
        node_path,
        direction,
        kind,
    }
}

impl MpsRegister {
    /// Every register, in catalog order.
    pub const ALL: [MpsRegister; REGISTER_COUNT] = [
        MpsRegister::ActionIdIn,
        MpsRegister::Data0In,
        MpsRegister::Data1In,
        MpsRegister::StatusEnableIn,
        MpsRegister::ErrorIn,
        MpsRegister::StatusBusyIn,
        MpsRegister::StatusReadyIn,
        MpsRegister::StatusErrorIn,
        MpsRegister::SlideCountIn,
        MpsRegister::BarcodeIn,
        MpsRegister::ActionIdBasic,
        MpsRegister::Data0Basic,
        MpsRegister::Data1Basic,
        MpsRegister::StatusEnableBasic,
        MpsRegister::ErrorBasic,
        MpsRegister::StatusBusyBasic,
        MpsRegister::StatusReadyBasic,
        MpsRegister::StatusErrorBasic,
        MpsRegister::SlideCountBasic,
        MpsRegister::BarcodeBasic,
        MpsRegister::SensorInput,
        MpsRegister::SensorMiddle,
        MpsRegister::SensorOutput,
        MpsRegister::LineEmpty,
        MpsRegister::Heartbeat,
    ];

    /// Static description of this register.
    pub const fn spec(self) -> RegisterSpec {
        use RegisterDirection::*;
        use ValueKind::*;

        match self {
            MpsRegister::ActionIdIn => spec("ActionIdIn", "G.In.p.ActionId", ActuatorWrite, Word),
            MpsRegister::Data0In => spec("Data0In", "G.In.p.Data[0]", ActuatorWrite, Word),
            MpsRegister::Data1In => spec("Data1In", "G.In.p.Data[1]", ActuatorWrite, Word),
            MpsRegister::StatusEnableIn => {
                spec("StatusEnableIn", "G.In.p.Status.Enable", ActuatorWrite, Boolean)
            }
            MpsRegister::ErrorIn => spec("ErrorIn", "G.In.p.Error", StatusRead, Word),
            MpsRegister::StatusBusyIn => spec("StatusBusyIn", "G.In.p.Status.Busy", StatusRead, Boolean),
            MpsRegister::StatusReadyIn => {
                spec("StatusReadyIn", "G.In.p.Status.Ready", StatusRead, Boolean)
            }
            MpsRegister::StatusErrorIn => {
                spec("StatusErrorIn", "G.In.p.Status.Error", StatusRead, Boolean)
            }
            MpsRegister::SlideCountIn => spec("SlideCountIn", "G.In.p.SlideCnt", StatusRead, Word),
            MpsRegister::BarcodeIn => spec("BarcodeIn", "G.In.p.BarCode", SensorRead, Word),
            MpsRegister::ActionIdBasic => {
                spec("ActionIdBasic", "G.Basic.p.ActionId", ActuatorWrite, Word)
            }
            MpsRegister::Data0Basic => spec("Data0Basic", "G.Basic.p.Data[0]", ActuatorWrite, Word),
            MpsRegister::Data1Basic => spec("Data1Basic", "G.Basic.p.Data[1]", ActuatorWrite, Word),
            MpsRegister::StatusEnableBasic => {
                spec("StatusEnableBasic", "G.Basic.p.Status.Enable", ActuatorWrite, Boolean)
            }
            MpsRegister::ErrorBasic => spec("ErrorBasic", "G.Basic.p.Error", StatusRead, Word),
            MpsRegister::StatusBusyBasic => {
                spec("StatusBusyBasic", "G.Basic.p.Status.Busy", StatusRead, Boolean)
            }
            MpsRegister::StatusReadyBasic => {
                spec("StatusReadyBasic", "G.Basic.p.Status.Ready", StatusRead, Boolean)
            }
            MpsRegister::StatusErrorBasic => {
                spec("StatusErrorBasic", "G.Basic.p.Status.Error", StatusRead, Boolean)
            }
            MpsRegister::SlideCountBasic => {
                spec("SlideCountBasic", "G.Basic.p.SlideCnt", StatusRead, Word)
            }
            MpsRegister::BarcodeBasic => spec("BarcodeBasic", "G.Basic.p.BarCode", SensorRead, Word),
            MpsRegister::SensorInput => spec("SensorInput", "G.Sensors.Input", SensorRead, Boolean),
            MpsRegister::SensorMiddle => spec("SensorMiddle", "G.Sensors.Middle", SensorRead, Boolean),
            MpsRegister::SensorOutput => spec("SensorOutput", "G.Sensors.Output", SensorRead, Boolean),
            MpsRegister::LineEmpty => spec("LineEmpty", "G.Sensors.LineEmpty", SensorRead, Boolean),
            MpsRegister::Heartbeat => spec("Heartbeat", "G.Heartbeat", StatusRead, Word),
        }
    }

    /// Symbolic name.
    pub const fn name(self) -> &'static str {
        self.spec().name
    }

    /// Node path on node-based transports.
    pub const fn node_path(self) -> &'static str {
        self.spec().node_path
    }

    /// Direction.
    pub const fn direction(self) -> RegisterDirection {
        self.spec().direction
    }

    /// Value kind.
    pub const fn kind(self) -> ValueKind {
        self.spec().kind
    }

    /// Job lane this register belongs to, if any.
    pub const fn lane(self) -> Option<JobLane> {
        match self as u8 {
            0..=9 => Some(JobLane::In),
            10..=19 => Some(JobLane::Basic),
            _ => None,
        }
    }

    /// True for registers the engine may write.
    pub const fn is_writable(self) -> bool {
        matches!(self.direction(), RegisterDirection::ActuatorWrite)
    }

    /// Look a register up by symbolic name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.name() == name)
    }
}

impl fmt::Display for MpsRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterValue {
    /// Boolean flag.
    Bool(bool),
    /// 16-bit word.
    Word(u16),
}

impl RegisterValue {
    /// Kind of this value.
    pub const fn kind(&self) -> ValueKind {
        match self {
            RegisterValue::Bool(_) => ValueKind::Boolean,
            RegisterValue::Word(_) => ValueKind::Word,
        }
    }

    /// Boolean view; a word is true when non-zero.
    pub const fn as_bool(&self) -> bool {
        match *self {
            RegisterValue::Bool(b) => b,
            RegisterValue::Word(w) => w != 0,
        }
    }

    /// Word view; a flag maps to 0 or 1.
    pub const fn as_word(&self) -> u16 {
        match *self {
            RegisterValue::Bool(b) => b as u16,
            RegisterValue::Word(w) => w,
        }
    }

    /// True if the value kind matches the register's declared kind.
    pub fn fits(&self, register: MpsRegister) -> bool {
        self.kind() == register.kind()
    }

    /// Zero value of the register's kind.
    pub const fn zero_for(register: MpsRegister) -> Self {
        match register.kind() {
            ValueKind::Boolean => RegisterValue::Bool(false),
            ValueKind::Word => RegisterValue::Word(0),
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Bool(b) => write!(f, "{b}"),
            RegisterValue::Word(w) => write!(f, "{w}"),
        }
    }
}

impl From<bool> for RegisterValue {
    fn from(value: bool) -> Self {
        RegisterValue::Bool(value)
    }
}

impl From<u16> for RegisterValue {
    fn from(value: u16) -> Self {
        RegisterValue::Word(value)
    }
}
