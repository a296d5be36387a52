//! MPS Common Library
//!
//! Behaviour-free types shared by the machine control engine and its tools.
//!
//! # Module Structure
//!
//! - [`register`] - Register catalog and register values
//! - [`machine`] - Machine types, per-type tables and Modbus address maps
//! - [`instruction`] - Instruction value object and outcomes
//! - [`error`] - Engine error type
//! - [`config`] - Configuration loading traits and types
//! - [`consts`] - Command codes and timing defaults
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use mps_common::prelude::*;
//!
//! let identify = MachineType::RingStation.identify_instruction();
//! assert_eq!(identify.payload[0], 300);
//! ```

pub mod config;
pub mod consts;
pub mod error;
pub mod instruction;
pub mod machine;
pub mod prelude;
pub mod register;
