// Copyright (c) Facebook, Inc. and its affiliates.

//! Application managers.
//!
//! An experiment calls `sample()` every `sampling_time()` and `control()`
//! every `control_time()` from two different threads but never
//! concurrently. `sample()` feeds sensor observations into per-category
//! estimators, `control()` consumes the estimates and may change the VM
//! allocations.
//!
//! Both managers here keep a CSV trace of every control step in an
//! optional data file which is truncated on `reset()`.
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tb_intf::{AppPerfCategory, ManagerKind, ManagerSpec};
use tb_util::*;

use super::application::Application;
use super::estimator::{build_estimator, Estimator};
use super::signal::{build_signal, SignalGenerator};
use super::smoother::{build_smoother, Smoother};
use super::TestbedError;

const SHARE_EPSILON: f64 = 1e-9;

pub trait AppManager: Send {
    fn app(&mut self, app: Arc<Application>);
    fn reset(&mut self) -> Result<()>;
    fn sample(&mut self) -> Result<()>;
    fn control(&mut self) -> Result<()>;
    fn sampling_time(&self) -> Duration;
    fn control_time(&self) -> Duration;
}

/// Normalized distance of `measured` from `target`, positive when the
/// application does better than required.
pub fn relative_gain(cat: AppPerfCategory, measured: f64, target: f64) -> f64 {
    match cat {
        AppPerfCategory::ResponseTime => (target - measured) / target,
        AppPerfCategory::Throughput => (measured - target) / target,
    }
}

fn fmt_val(v: f64) -> String {
    match v.is_nan() {
        true => "na".into(),
        false => format!("{}", v),
    }
}

struct Target {
    value: f64,
    estimator: Box<dyn Estimator>,
    smoother: Box<dyn Smoother>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlCounts {
    pub controls: u64,
    pub skips: u64,
    pub fails: u64,
}

/// State shared by all managers.
pub struct ManagerCore {
    app: Option<Arc<Application>>,
    sampling_time: Duration,
    control_time: Duration,
    targets: BTreeMap<AppPerfCategory, Target>,
    reset_estimators: bool,
    data_path: Option<PathBuf>,
    data_file: Option<BufWriter<fs::File>>,
    pub counts: ControlCounts,
}

impl ManagerCore {
    pub fn new(sampling_time: Duration, control_time: Duration) -> Self {
        Self {
            app: None,
            sampling_time,
            control_time,
            targets: BTreeMap::new(),
            reset_estimators: true,
            data_path: None,
            data_file: None,
            counts: Default::default(),
        }
    }

    pub fn add_target(
        &mut self,
        cat: AppPerfCategory,
        value: f64,
        estimator: Box<dyn Estimator>,
        smoother: Box<dyn Smoother>,
    ) -> Result<()> {
        if !value.is_finite() || value == 0.0 {
            invalid_arg!("{} target {} must be finite and non-zero", cat, value);
        }
        self.targets.insert(
            cat,
            Target {
                value,
                estimator,
                smoother,
            },
        );
        Ok(())
    }

    pub fn set_reset_estimators(&mut self, reset: bool) {
        self.reset_estimators = reset;
    }

    pub fn set_data_path<P: Into<PathBuf>>(&mut self, path: P) {
        self.data_path = Some(path.into());
    }

    pub fn bound_app(&self) -> Result<Arc<Application>> {
        match self.app.as_ref() {
            Some(app) => Ok(app.clone()),
            None => Err(TestbedError::NotSet("manager application").into()),
        }
    }

    fn reset_core(&mut self, header: &[String]) -> Result<()> {
        self.bound_app()?;
        for tgt in self.targets.values_mut() {
            tgt.estimator.reset();
            tgt.smoother.reset();
        }
        self.counts = Default::default();

        self.data_file = None;
        if let Some(path) = self.data_path.as_ref() {
            let file = fs::File::create(path)
                .with_context(|| format!("failed to create data file {:?}", path))?;
            self.data_file = Some(BufWriter::new(file));
            self.write_row(header)?;
        }
        Ok(())
    }

    fn write_row(&mut self, fields: &[String]) -> Result<()> {
        if let Some(file) = self.data_file.as_mut() {
            writeln!(file, "{}", fields.join(","))?;
            file.flush()?;
        }
        Ok(())
    }

    /// Poll the sensor of every target category and feed what came in to
    /// its estimator.
    fn sample_targets(&mut self) -> Result<()> {
        let app = self.bound_app()?;
        for (cat, tgt) in self.targets.iter_mut() {
            let sensor = app.sensor(*cat)?;
            let mut sensor = sensor.lock().unwrap();
            sensor.sense();
            for ob in sensor.observations().iter() {
                tgt.estimator.collect(ob.value);
            }
            debug!(
                "manager[{}]: {} collected {} observations",
                app.name(),
                cat,
                tgt.estimator.count()
            );
        }
        Ok(())
    }

    fn targets_have_data(&self) -> bool {
        self.targets.values().all(|tgt| tgt.estimator.count() > 0)
    }

    fn finish_control(&mut self) {
        if self.reset_estimators {
            for tgt in self.targets.values_mut() {
                tgt.estimator.reset();
            }
        }
    }

    fn count_fields(&self) -> Vec<String> {
        vec![
            format!("{}", self.counts.controls),
            format!("{}", self.counts.skips),
            format!("{}", self.counts.fails),
        ]
    }
}

/// Watches the application without ever touching its allocations.
pub struct MonitorManager {
    core: ManagerCore,
}

impl MonitorManager {
    pub fn new(core: ManagerCore) -> Self {
        Self { core }
    }

    pub fn counts(&self) -> ControlCounts {
        self.core.counts
    }

    fn do_control(&mut self) -> Result<()> {
        let app = self.core.bound_app()?;
        if !self.core.targets_have_data() {
            debug!("manager[{}]: No observation since the last control, skipping", app.name());
            self.core.counts.skips += 1;
            return Ok(());
        }

        let mut row = vec![format!("{}", unix_now())];
        for vm in app.vms().iter() {
            row.push(fmt_val(vm.cpu_cap()?));
            row.push(fmt_val(vm.cpu_share()?));
        }
        for (cat, tgt) in self.core.targets.iter_mut() {
            let raw = tgt.estimator.estimate();
            let yh = tgt.smoother.smooth(raw);
            let yr = tgt.value;
            info!(
                "manager[{}]: {} estimate={:.3} smoothed={:.3} target={:.3} gain={:.3} slo={}",
                app.name(),
                cat,
                raw,
                yh,
                yr,
                relative_gain(*cat, yh, yr),
                match app.slo(*cat, yh) {
                    true => "met",
                    false => "violated",
                }
            );
            row.push(fmt_val(yh));
            row.push(fmt_val(yh / yr));
            row.push(fmt_val(yr));
        }
        row.extend(self.core.count_fields());
        self.core.write_row(&row)?;
        self.core.finish_control();
        Ok(())
    }
}

impl AppManager for MonitorManager {
    fn app(&mut self, app: Arc<Application>) {
        self.core.app = Some(app);
    }

    fn reset(&mut self) -> Result<()> {
        let app = self.core.bound_app()?;
        let mut header = vec!["\"ts\"".to_string()];
        for vm in app.vms().iter() {
            header.push(format!("\"Cap_{{{}}}\"", vm.id()));
            header.push(format!("\"Share_{{{}}}\"", vm.id()));
        }
        for cat in self.core.targets.keys() {
            header.push(format!("\"y_{{{}}}\"", cat));
            header.push(format!("\"yn_{{{}}}\"", cat));
            header.push(format!("\"r_{{{}}}\"", cat));
        }
        header.extend(
            ["\"# Controls\"", "\"# Skip Controls\"", "\"# Fail Controls\""]
                .iter()
                .map(|s| s.to_string()),
        );
        self.core.reset_core(&header)
    }

    fn sample(&mut self) -> Result<()> {
        self.core.sample_targets()
    }

    fn control(&mut self) -> Result<()> {
        self.core.counts.controls += 1;
        let res = self.do_control();
        if res.is_err() {
            self.core.counts.fails += 1;
        }
        res
    }

    fn sampling_time(&self) -> Duration {
        self.core.sampling_time
    }

    fn control_time(&self) -> Duration {
        self.core.control_time
    }
}

/// Excites the CPU shares of the application's VMs with a signal and
/// records how the application responds.
pub struct SysIdManager {
    core: ManagerCore,
    signal: Box<dyn SignalGenerator>,
    initial_shares: Vec<f64>,
}

impl SysIdManager {
    pub fn new(core: ManagerCore, signal: Box<dyn SignalGenerator>) -> Self {
        Self {
            core,
            signal,
            initial_shares: vec![],
        }
    }

    /// Shares applied on `reset()`. VMs past the end of `shares` get 1.0.
    pub fn initial_shares(mut self, shares: Vec<f64>) -> Self {
        self.initial_shares = shares;
        self
    }

    pub fn counts(&self) -> ControlCounts {
        self.core.counts
    }

    fn do_control(&mut self) -> Result<()> {
        let app = self.core.bound_app()?;
        let vms = app.vms();
        let new_shares = self.signal.generate();
        if new_shares.len() != vms.len() {
            invalid_arg!(
                "signal generated {} shares for {} VMs",
                new_shares.len(),
                vms.len()
            );
        }

        let mut row = vec![format!("{}", unix_now())];
        for (vm, share) in vms.iter().zip(new_shares.iter()) {
            let old = vm.cpu_share()?;
            if (old - share).abs() > SHARE_EPSILON {
                vm.set_cpu_share(*share)?;
            }
            debug!(
                "manager[{}]: {} CPU share {:.3} -> {:.3}",
                app.name(),
                vm.name(),
                old,
                share
            );
            row.push(fmt_val(old));
        }
        for tgt in self.core.targets.values_mut() {
            let est = match tgt.estimator.count() {
                0 => f64::NAN,
                _ => tgt.estimator.estimate(),
            };
            row.push(fmt_val(est));
        }
        row.extend(self.core.count_fields());
        self.core.write_row(&row)?;
        self.core.finish_control();
        Ok(())
    }
}

impl AppManager for SysIdManager {
    fn app(&mut self, app: Arc<Application>) {
        self.core.app = Some(app);
    }

    fn reset(&mut self) -> Result<()> {
        let app = self.core.bound_app()?;
        let vms = app.vms();
        for (i, vm) in vms.iter().enumerate() {
            let share = self.initial_shares.get(i).copied().unwrap_or(1.0);
            vm.set_cpu_share(share)
                .with_context(|| format!("failed to set initial CPU share of {}", vm.id()))?;
        }
        self.signal.reset();

        let mut header = vec!["\"ts\"".to_string()];
        for vm in vms.iter() {
            header.push(format!("\"{} CPU Share\"", vm.name()));
        }
        for cat in self.core.targets.keys() {
            header.push(format!("\"y_{{{}}}\"", cat));
        }
        header.extend(
            ["\"# Controls\"", "\"# Skip Controls\"", "\"# Fail Controls\""]
                .iter()
                .map(|s| s.to_string()),
        );
        self.core.reset_core(&header)
    }

    fn sample(&mut self) -> Result<()> {
        self.core.sample_targets()
    }

    fn control(&mut self) -> Result<()> {
        self.core.counts.controls += 1;
        let res = self.do_control();
        if let Err(e) = res.as_ref() {
            warn!("manager: sysid control failed ({:#})", e);
            self.core.counts.fails += 1;
        }
        res
    }

    fn sampling_time(&self) -> Duration {
        self.core.sampling_time
    }

    fn control_time(&self) -> Duration {
        self.core.control_time
    }
}

pub fn build_manager(spec: &ManagerSpec, seed: Option<u64>) -> Result<Box<dyn AppManager>> {
    let mut core = ManagerCore::new(
        secs_to_duration(spec.sampling_interval)?,
        secs_to_duration(spec.control_interval)?,
    );
    for tgt in spec.targets.iter() {
        core.add_target(
            tgt.category,
            tgt.value,
            build_estimator(&spec.estimator)?,
            build_smoother(&spec.smoother)?,
        )?;
    }
    core.set_reset_estimators(spec.reset_estimators);
    if let Some(path) = spec.data_file.as_ref() {
        core.set_data_path(path);
    }

    let mgr: Box<dyn AppManager> = match spec.kind {
        ManagerKind::Monitor => Box::new(MonitorManager::new(core)),
        ManagerKind::SysId => {
            let sig_spec = match spec.signal.as_ref() {
                Some(v) => v,
                None => return Err(TestbedError::NotSet("sysid signal").into()),
            };
            let mut signal = build_signal(sig_spec, seed)?;
            if let Some(v) = spec.signal_lower_bound {
                signal.set_lower_bound(v)?;
            }
            if let Some(v) = spec.signal_upper_bound {
                signal.set_upper_bound(v)?;
            }
            let mut mgr = SysIdManager::new(core, signal);
            if let Some(shares) = spec.initial_shares.as_ref() {
                mgr = mgr.initial_shares(shares.clone());
            }
            Box::new(mgr)
        }
    };
    Ok(mgr)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::estimator::Mean;
    use crate::sensor::{Observation, Sensor};
    use crate::signal::Constant;
    use crate::smoother::PassThrough;
    use crate::vm::tests::sim_registry;
    use std::collections::VecDeque;

    /// Hands out one pre-loaded batch per `sense()`.
    pub(crate) struct ScriptedSensor {
        batches: VecDeque<Vec<f64>>,
        cur: Vec<Observation>,
    }

    impl ScriptedSensor {
        pub(crate) fn new(batches: Vec<Vec<f64>>) -> Self {
            Self {
                batches: batches.into_iter().collect(),
                cur: vec![],
            }
        }
    }

    impl Sensor for ScriptedSensor {
        fn sense(&mut self) {
            self.cur = match self.batches.pop_front() {
                Some(vals) => vals
                    .into_iter()
                    .enumerate()
                    .map(|(i, value)| Observation {
                        timestamp: i as i64,
                        label: "op".into(),
                        value,
                    })
                    .collect(),
                None => vec![],
            };
        }

        fn observations(&self) -> &[Observation] {
            &self.cur
        }

        fn reset(&mut self) {
            self.cur.clear();
        }
    }

    fn rt_core() -> ManagerCore {
        let mut core = ManagerCore::new(Duration::from_secs(1), Duration::from_secs(3));
        core.add_target(
            AppPerfCategory::ResponseTime,
            150.0,
            Box::new(Mean::default()),
            Box::new(PassThrough::new()),
        )
        .unwrap();
        core
    }

    #[test]
    fn test_relative_gain() {
        let _ = ::env_logger::try_init();
        assert_eq!(relative_gain(AppPerfCategory::ResponseTime, 100.0, 200.0), 0.5);
        assert_eq!(relative_gain(AppPerfCategory::ResponseTime, 300.0, 200.0), -0.5);
        assert_eq!(relative_gain(AppPerfCategory::Throughput, 300.0, 200.0), 0.5);
    }

    #[test]
    fn test_monitor_manager() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::TempDir::new().unwrap();
        let data = dir.path().join("monitor.csv");

        let mut core = rt_core();
        core.set_data_path(&data);
        let mut mgr = MonitorManager::new(core);
        let err = mgr.reset().err().unwrap();
        assert!(matches!(
            err.downcast_ref::<TestbedError>(),
            Some(TestbedError::NotSet(_))
        ));

        let reg = sim_registry(2);
        let app = Arc::new(Application::new(
            "olio",
            vec![reg.vm("sim", "vm0").unwrap(), reg.vm("sim", "vm1").unwrap()],
        ));
        app.register_sensor(
            AppPerfCategory::ResponseTime,
            Box::new(ScriptedSensor::new(vec![vec![100.0, 200.0], vec![], vec![90.0]])),
        );
        mgr.app(app.clone());
        mgr.reset().unwrap();
        assert_eq!(mgr.sampling_time(), Duration::from_secs(1));
        assert_eq!(mgr.control_time(), Duration::from_secs(3));

        mgr.sample().unwrap();
        mgr.control().unwrap();
        // Nothing new came in and the estimator was reset.
        mgr.sample().unwrap();
        mgr.control().unwrap();
        mgr.sample().unwrap();
        mgr.control().unwrap();
        assert_eq!(
            mgr.counts(),
            ControlCounts {
                controls: 3,
                skips: 1,
                fails: 0
            }
        );

        // Allocations are left alone.
        assert_eq!(app.vms()[0].cpu_share().unwrap(), 1.0);

        let content = fs::read_to_string(&data).unwrap();
        println!("{}", &content);
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("\"ts\",\"Cap_{vm0}\",\"Share_{vm0}\""));
        assert!(lines[0].contains("\"y_{response-time}\""));
        let row: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(&row[5..], &["150", "1", "150", "1", "0", "0"]);
        let row: Vec<&str> = lines[2].split(',').collect();
        assert_eq!(&row[5..], &["90", "0.6", "150", "3", "1", "0"]);

        // A reset truncates the data file.
        mgr.reset().unwrap();
        assert_eq!(fs::read_to_string(&data).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_monitor_missing_sensor() {
        let _ = ::env_logger::try_init();
        let mut mgr = MonitorManager::new(rt_core());
        mgr.app(Arc::new(Application::new("bare", vec![])));
        mgr.reset().unwrap();
        let err = mgr.sample().err().unwrap();
        assert!(matches!(
            err.downcast_ref::<TestbedError>(),
            Some(TestbedError::UnknownCategory { .. })
        ));
    }

    #[test]
    fn test_sysid_manager() {
        let _ = ::env_logger::try_init();
        let reg = sim_registry(2);
        let app = Arc::new(Application::new(
            "olio",
            vec![reg.vm("sim", "vm0").unwrap(), reg.vm("sim", "vm1").unwrap()],
        ));
        app.register_sensor(
            AppPerfCategory::ResponseTime,
            Box::new(ScriptedSensor::new(vec![vec![10.0]])),
        );
        let vm0 = reg.vm("sim", "vm0").unwrap();
        let vm1 = reg.vm("sim", "vm1").unwrap();
        vm1.set_cpu_share(0.1).unwrap();

        let signal = Box::new(Constant::new(vec![0.5, 0.25]).unwrap());
        let mut mgr = SysIdManager::new(rt_core(), signal).initial_shares(vec![0.8]);
        mgr.app(app.clone());
        mgr.reset().unwrap();
        assert_eq!(vm0.cpu_share().unwrap(), 0.8);
        assert_eq!(vm1.cpu_share().unwrap(), 1.0);

        mgr.sample().unwrap();
        mgr.control().unwrap();
        assert_eq!(vm0.cpu_share().unwrap(), 0.5);
        assert_eq!(vm1.cpu_share().unwrap(), 0.25);

        let mut bad = SysIdManager::new(rt_core(), Box::new(Constant::new(vec![0.5]).unwrap()));
        bad.app(app);
        bad.reset().unwrap();
        assert!(bad.control().is_err());
        assert_eq!(
            bad.counts(),
            ControlCounts {
                controls: 1,
                skips: 0,
                fails: 1
            }
        );
    }

    #[test]
    fn test_build_manager() {
        let _ = ::env_logger::try_init();
        let mut spec = ManagerSpec::default();
        spec.sampling_interval = 0.5;
        let mgr = build_manager(&spec, None).unwrap();
        assert_eq!(mgr.sampling_time(), Duration::from_millis(500));
        assert_eq!(mgr.control_time(), Duration::from_secs(30));

        spec.kind = ManagerKind::SysId;
        assert!(build_manager(&spec, None).is_err());
        spec.signal = Some(tb_intf::SignalSpec::Uniform {
            min: vec![0.2],
            max: vec![0.9],
        });
        spec.signal_lower_bound = Some(0.5);
        assert!(build_manager(&spec, Some(7)).is_ok());
        spec.signal_upper_bound = Some(0.1);
        assert!(build_manager(&spec, Some(7)).is_err());
    }
}
