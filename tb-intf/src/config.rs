// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use enum_iterator::IntoEnumIterator;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::AppPerfCategory;
use tb_util::*;

const CONFIG_DOC: &str = "\
//
// testbed experiment configuration
//
// Each experiment drives a workload against one application running on a set
// of VMs. Once the workload driver reports ready, the application manager is
// sampled every `sampling_interval` and asked to control every
// `control_interval` until the driver reports done. All experiments run
// concurrently.
//
// All durations are in seconds. Shares and caps are fractions in [0, 1].
//
//  poll_interval: How often driver readiness and completion are checked
//  rng_seed: Seed for random signal generators, random if null
//  vmms[]: Simulated VM managers
//    id: VM manager identifier referenced by experiments[].vms[].vmm
//    hostname: Host the VM manager represents
//    max_vcpus: Maximum number of vCPUs a VM can have
//    vms[]: VMs (id, name, vcpus, cpu_cap, cpu_share, memory_cap, memory_share)
//  experiments[]: Application experiments
//    name: Application name
//    vms[]: Application tiers, {\"vmm\": VMM_ID, \"vm\": VM_ID}
//    sensors[]: {category, format, path}
//      category: response-time, throughput
//      format: rain-response-time, ycsb-throughput
//      path: File the workload generator appends observations to
//    slos[]: {category, cmp, threshold}, cmp is \"le\" or \"ge\"
//    driver: Workload driver
//      {\"type\": \"command\", program, args, ready_file, warmup}
//      {\"type\": \"timed\", ready_after, done_after}
//    manager: Application manager
//      kind: monitor, sysid
//      sampling_interval, control_interval: Loop periods
//      targets[]: {category, value} reference values
//      estimator: most-recent, mean, quantile (prob), ewma-quantile (prob, alpha)
//      reset_estimators: Start every control interval with empty estimators,
//                        turn off for ewma-quantile to keep its history
//      smoother: pass-through, brown-single (alpha), brown-double (alpha),
//                holt-winters (alpha, beta), holt-winters-delta (delta)
//      data_file: CSV file recording every control step, optional
//      signal: sysid excitation signal, one of constant (values),
//              square (low, high), sawtooth (low, high, incr),
//              sinusoidal and sinusoidal-mesh (amplitude, period, phase, offset),
//              periods and phases are in control steps,
//              uniform (min, max), gaussian (mean, sd)
//      signal_lower_bound, signal_upper_bound: Clamps applied to every generated
//                                              value, optional
//      initial_shares: CPU shares applied on reset, 1.0 for every VM if null
//
";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSpec {
    pub id: String,
    pub name: String,
    pub vcpus: u32,
    pub cpu_cap: f64,
    pub cpu_share: f64,
    pub memory_cap: f64,
    pub memory_share: f64,
}

impl Default for VmSpec {
    fn default() -> Self {
        Self {
            id: "".into(),
            name: "".into(),
            vcpus: 1,
            cpu_cap: 1.0,
            cpu_share: 1.0,
            memory_cap: 1.0,
            memory_share: 1.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmmSpec {
    pub id: String,
    #[serde(default = "VmmSpec::dfl_hostname")]
    pub hostname: String,
    #[serde(default = "VmmSpec::dfl_max_vcpus")]
    pub max_vcpus: u32,
    pub vms: Vec<VmSpec>,
}

impl VmmSpec {
    fn dfl_hostname() -> String {
        "localhost".into()
    }

    fn dfl_max_vcpus() -> u32 {
        8
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmRef {
    pub vmm: String,
    pub vm: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SensorFormat {
    RainResponseTime,
    YcsbThroughput,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorSpec {
    pub category: AppPerfCategory,
    pub format: SensorFormat,
    pub path: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SloCmp {
    Le,
    Ge,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SloSpec {
    pub category: AppPerfCategory,
    pub cmp: SloCmp,
    pub threshold: f64,
}

impl SloSpec {
    pub fn check(&self, value: f64) -> bool {
        match self.cmp {
            SloCmp::Le => value <= self.threshold,
            SloCmp::Ge => value >= self.threshold,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DriverSpec {
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        ready_file: Option<String>,
        #[serde(default)]
        warmup: f64,
    },
    Timed {
        ready_after: f64,
        done_after: f64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerKind {
    #[serde(rename = "monitor")]
    Monitor,
    #[serde(rename = "sysid")]
    SysId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetSpec {
    pub category: AppPerfCategory,
    pub value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EstimatorSpec {
    MostRecent,
    Mean,
    Quantile {
        prob: f64,
    },
    EwmaQuantile {
        prob: f64,
        #[serde(default = "EstimatorSpec::dfl_ewma_alpha")]
        alpha: f64,
    },
}

impl EstimatorSpec {
    pub fn dfl_ewma_alpha() -> f64 {
        0.7
    }
}

impl Default for EstimatorSpec {
    fn default() -> Self {
        Self::Mean
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SmootherSpec {
    PassThrough,
    BrownSingle { alpha: f64 },
    BrownDouble { alpha: f64 },
    HoltWinters { alpha: f64, beta: f64 },
    HoltWintersDelta { delta: f64 },
}

impl Default for SmootherSpec {
    fn default() -> Self {
        Self::BrownSingle { alpha: 0.7 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalSpec {
    Constant {
        values: Vec<f64>,
    },
    Square {
        low: Vec<f64>,
        high: Vec<f64>,
    },
    Sawtooth {
        low: Vec<f64>,
        high: Vec<f64>,
        incr: Vec<f64>,
    },
    Sinusoidal {
        amplitude: Vec<f64>,
        period: Vec<u64>,
        phase: Vec<u64>,
        offset: Vec<f64>,
    },
    SinusoidalMesh {
        amplitude: Vec<f64>,
        period: Vec<u64>,
        phase: Vec<u64>,
        offset: Vec<f64>,
    },
    Uniform {
        min: Vec<f64>,
        max: Vec<f64>,
    },
    Gaussian {
        mean: Vec<f64>,
        sd: Vec<f64>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSpec {
    pub kind: ManagerKind,
    pub sampling_interval: f64,
    pub control_interval: f64,
    pub targets: Vec<TargetSpec>,
    pub estimator: EstimatorSpec,
    pub reset_estimators: bool,
    pub smoother: SmootherSpec,
    pub data_file: Option<String>,
    pub signal: Option<SignalSpec>,
    pub signal_lower_bound: Option<f64>,
    pub signal_upper_bound: Option<f64>,
    pub initial_shares: Option<Vec<f64>>,
}

impl Default for ManagerSpec {
    fn default() -> Self {
        Self {
            kind: ManagerKind::Monitor,
            sampling_interval: 10.0,
            control_interval: 30.0,
            targets: vec![],
            estimator: Default::default(),
            reset_estimators: true,
            smoother: Default::default(),
            data_file: None,
            signal: None,
            signal_lower_bound: None,
            signal_upper_bound: None,
            initial_shares: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub name: String,
    pub vms: Vec<VmRef>,
    #[serde(default)]
    pub sensors: Vec<SensorSpec>,
    #[serde(default)]
    pub slos: Vec<SloSpec>,
    pub driver: DriverSpec,
    #[serde(default)]
    pub manager: ManagerSpec,
}

impl ExperimentSpec {
    fn validate(&self, vmms: &[VmmSpec]) -> Result<()> {
        if self.name.len() == 0 {
            bail!("experiment name is empty");
        }
        if self.vms.len() == 0 {
            bail!("{}: no VM specified", &self.name);
        }
        for vref in self.vms.iter() {
            let vmm = match vmms.iter().find(|vmm| vmm.id == vref.vmm) {
                Some(v) => v,
                None => bail!("{}: unknown VM manager {:?}", &self.name, &vref.vmm),
            };
            if !vmm.vms.iter().any(|vm| vm.id == vref.vm) {
                bail!(
                    "{}: unknown VM {:?} on {:?}",
                    &self.name,
                    &vref.vm,
                    &vref.vmm
                );
            }
        }

        for cat in AppPerfCategory::into_enum_iter() {
            if self.sensors.iter().filter(|s| s.category == cat).count() > 1 {
                bail!("{}: duplicate {} sensors", &self.name, cat);
            }
        }

        let mgr = &self.manager;
        secs_to_duration(mgr.sampling_interval)?;
        secs_to_duration(mgr.control_interval)?;
        if mgr.sampling_interval == 0.0 || mgr.control_interval == 0.0 {
            bail!("{}: manager intervals must be positive", &self.name);
        }
        for tgt in mgr.targets.iter() {
            if !self.sensors.iter().any(|s| s.category == tgt.category) {
                bail!("{}: no sensor for {} target", &self.name, tgt.category);
            }
        }
        if mgr.kind == ManagerKind::SysId && mgr.signal.is_none() {
            bail!("{}: sysid manager requires a signal", &self.name);
        }

        match &self.driver {
            DriverSpec::Command {
                program, warmup, ..
            } => {
                if program.len() == 0 {
                    bail!("{}: driver program is empty", &self.name);
                }
                secs_to_duration(*warmup)?;
            }
            DriverSpec::Timed {
                ready_after,
                done_after,
            } => {
                secs_to_duration(*ready_after)?;
                secs_to_duration(*done_after)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TestbedConfig {
    pub poll_interval: f64,
    pub rng_seed: Option<u64>,
    pub vmms: Vec<VmmSpec>,
    pub experiments: Vec<ExperimentSpec>,
}

impl TestbedConfig {
    pub const DFL_POLL_INTERVAL: f64 = 5.0;
}

impl Default for TestbedConfig {
    fn default() -> Self {
        Self {
            poll_interval: Self::DFL_POLL_INTERVAL,
            rng_seed: None,
            vmms: vec![VmmSpec {
                id: "sim".into(),
                hostname: VmmSpec::dfl_hostname(),
                max_vcpus: VmmSpec::dfl_max_vcpus(),
                vms: vec![
                    VmSpec {
                        id: "vm0".into(),
                        name: "web".into(),
                        vcpus: 2,
                        ..Default::default()
                    },
                    VmSpec {
                        id: "vm1".into(),
                        name: "db".into(),
                        vcpus: 2,
                        ..Default::default()
                    },
                ],
            }],
            experiments: vec![ExperimentSpec {
                name: "olio".into(),
                vms: vec![
                    VmRef {
                        vmm: "sim".into(),
                        vm: "vm0".into(),
                    },
                    VmRef {
                        vmm: "sim".into(),
                        vm: "vm1".into(),
                    },
                ],
                sensors: vec![SensorSpec {
                    category: AppPerfCategory::ResponseTime,
                    format: SensorFormat::RainResponseTime,
                    path: "/tmp/testbed/olio-metrics.log".into(),
                }],
                slos: vec![SloSpec {
                    category: AppPerfCategory::ResponseTime,
                    cmp: SloCmp::Le,
                    threshold: 200.0,
                }],
                driver: DriverSpec::Timed {
                    ready_after: 5.0,
                    done_after: 60.0,
                },
                manager: ManagerSpec {
                    targets: vec![TargetSpec {
                        category: AppPerfCategory::ResponseTime,
                        value: 150.0,
                    }],
                    ..Default::default()
                },
            }],
        }
    }
}

impl JsonLoad for TestbedConfig {
    fn loaded(&mut self) -> Result<()> {
        secs_to_duration(self.poll_interval)?;
        if self.poll_interval == 0.0 {
            bail!("poll_interval must be positive");
        }
        if self.experiments.len() == 0 {
            bail!("no experiment configured");
        }

        let mut vmm_ids = HashSet::new();
        for vmm in self.vmms.iter() {
            if vmm.id.len() == 0 || !vmm_ids.insert(&vmm.id) {
                bail!("VM manager id {:?} is empty or duplicate", &vmm.id);
            }
            let mut vm_ids = HashSet::new();
            for vm in vmm.vms.iter() {
                if vm.id.len() == 0 || !vm_ids.insert(&vm.id) {
                    bail!("{}: VM id {:?} is empty or duplicate", &vmm.id, &vm.id);
                }
                if vm.vcpus == 0 || vm.vcpus > vmm.max_vcpus {
                    bail!(
                        "{}/{}: vcpus {} out of range [1, {}]",
                        &vmm.id,
                        &vm.id,
                        vm.vcpus,
                        vmm.max_vcpus
                    );
                }
            }
        }

        for exp in self.experiments.iter() {
            exp.validate(&self.vmms)?;
        }
        Ok(())
    }
}

impl JsonSave for TestbedConfig {
    fn preamble() -> Option<String> {
        Some(CONFIG_DOC.to_string())
    }
}
