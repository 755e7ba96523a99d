// Copyright (c) Facebook, Inc. and its affiliates.
pub mod args;
pub mod category;
pub mod config;
pub mod report;

pub use args::Args;
pub use category::AppPerfCategory;
pub use config::{
    DriverSpec, EstimatorSpec, ExperimentSpec, ManagerKind, ManagerSpec, SensorFormat,
    SensorSpec, SignalSpec, SloCmp, SloSpec, SmootherSpec, TargetSpec, TestbedConfig, VmRef,
    VmSpec, VmmSpec,
};
pub use report::{ExperimentReport, ExperimentState, Report};

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
}
