// Copyright (c) Facebook, Inc. and its affiliates.

//! Turns a `TestbedConfig` into a runnable `SystemExperiment`.
use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;
use tb_intf::{ExperimentSpec, TestbedConfig};
use tb_util::*;

use super::application::Application;
use super::driver::build_driver;
use super::experiment::{AppExperiment, SystemExperiment};
use super::manager::build_manager;
use super::sensor::build_sensor;
use super::vm::{Registry, SimVmManager};

pub fn build_registry(cfg: &TestbedConfig) -> Result<Registry> {
    let mut reg = Registry::new();
    for spec in cfg.vmms.iter() {
        let vmm = SimVmManager::from_spec(spec)
            .with_context(|| format!("failed to set up VM manager {:?}", &spec.id))?;
        reg.add_vmm(Arc::new(vmm))?;
    }
    Ok(reg)
}

/// Every experiment gets its own seed derived from `seed` so that random
/// signals differ between experiments but stay reproducible.
pub fn build_experiment(
    spec: &ExperimentSpec,
    reg: &Registry,
    seed: Option<u64>,
) -> Result<AppExperiment> {
    let mut vms = vec![];
    for vref in spec.vms.iter() {
        vms.push(reg.vm(&vref.vmm, &vref.vm)?);
    }
    let app = Arc::new(Application::new(&spec.name, vms));

    for sspec in spec.sensors.iter() {
        app.register_sensor(sspec.category, build_sensor(sspec)?);
    }
    for slo in spec.slos.iter() {
        let slo = slo.clone();
        app.set_slo(slo.category, move |v| slo.check(v));
    }

    let driver = build_driver(&spec.driver)?;
    let manager = build_manager(&spec.manager, seed)?;
    Ok(AppExperiment::with_parts(app, driver, manager))
}

pub fn build_system(cfg: &TestbedConfig) -> Result<SystemExperiment> {
    let reg = build_registry(cfg)?;
    let poll_intv = secs_to_duration(cfg.poll_interval)?;

    let mut sys = SystemExperiment::new();
    for (idx, spec) in cfg.experiments.iter().enumerate() {
        let seed = cfg.rng_seed.map(|s| s.wrapping_add(idx as u64));
        let mut exp = build_experiment(spec, &reg, seed)
            .with_context(|| format!("failed to set up experiment {:?}", &spec.name))?;
        exp.set_poll_interval(poll_intv);
        info!(
            "setup: Experiment {:?} on {} VMs with {:?} manager",
            &spec.name,
            spec.vms.len(),
            spec.manager.kind
        );
        sys.add_experiment(exp);
    }
    Ok(sys)
}
