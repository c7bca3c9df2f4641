//! Running bundle actions.
//!
//! - [`parameters`] applies value precedence and coercion.
//! - [`driver`] defines the runtime driver contract and the built-in drivers.
//! - [`executor`] drives one action end to end and records its history.

pub mod driver;
pub mod executor;
pub mod parameters;

pub use driver::{
    ActionArguments, CommandDriver, DebugDriver, DriverOutput, DriverRegistry, RuntimeDriver,
};
pub use executor::{
    ActionExecutor, BundleBuilder, ExecuteOptions, ExecutionRecord, PreparedAction,
};
