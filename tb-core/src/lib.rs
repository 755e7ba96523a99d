// Copyright (c) Facebook, Inc. and its affiliates.

//! Closed-loop resource control testbed.
//!
//! An `AppExperiment` starts a workload against an `Application` through a
//! `WorkloadDriver` and, while the workload is running, periodically calls
//! `sample()` and `control()` on an `AppManager`. A `SystemExperiment` runs
//! several application experiments side by side.
//!
//! Everything is built either directly or from a `TestbedConfig` through
//! `setup::build_system()`.
use tb_intf::AppPerfCategory;

/// Shorthand for bailing out with `TestbedError::InvalidArgument`.
#[macro_export]
macro_rules! invalid_arg {
    ($($arg:tt)*) => {
        return Err($crate::TestbedError::InvalidArgument(format!($($arg)*)).into())
    };
}

pub mod application;
pub mod driver;
pub mod estimator;
pub mod experiment;
pub mod manager;
pub mod sensor;
pub mod setup;
pub mod signal;
pub mod smoother;
pub mod vm;

pub use application::Application;
pub use driver::WorkloadDriver;
pub use estimator::Estimator;
pub use experiment::{
    AppExperiment, ExperimentHandle, ExperimentOutcome, SystemExperiment, SystemHandle,
};
pub use manager::AppManager;
pub use sensor::{Observation, Sensor};
pub use signal::SignalGenerator;
pub use smoother::Smoother;
pub use vm::{Registry, VirtualMachine, VmManager};

/// Precondition failures which callers may want to tell apart. They travel
/// inside `anyhow::Error` and can be recovered with `downcast_ref()`.
#[derive(Debug, thiserror::Error)]
pub enum TestbedError {
    #[error("{0} not set")]
    NotSet(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no {what} registered for {category}")]
    UnknownCategory {
        what: &'static str,
        category: AppPerfCategory,
    },
    #[error("unknown VM manager {0:?}")]
    UnknownVmm(String),
    #[error("unknown VM {vm:?} on VM manager {vmm:?}")]
    UnknownVm { vmm: String, vm: String },
}
