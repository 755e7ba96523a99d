// Copyright (c) Facebook, Inc. and its affiliates.

//! Experiment orchestration.
//!
//! `AppExperiment::run()` walks one application through
//!
//!   Idle -> Starting -> WaitingReady -> Active -> Draining -> Done
//!
//! or ends up in `Failed`. While `Active`, a sampler thread and a
//! controller thread call into the manager, which lives behind a single
//! mutex so that `sample()` and `control()` never overlap. The
//! orchestrating thread keeps polling the driver and tears everything down
//! once the workload is done or a stop is requested through an
//! `ExperimentHandle`.
//!
//! `SystemExperiment` runs a set of application experiments, each on its
//! own thread. Whatever happens inside one of them, including panics, stays
//! contained there.
use anyhow::{anyhow, Result};
use chrono::prelude::*;
use log::{debug, error, info, warn};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{spawn, JoinHandle};
use std::time::Duration;
use tb_intf::{ExperimentReport, ExperimentState, Report};
use tb_util::*;

use super::application::Application;
use super::driver::WorkloadDriver;
use super::manager::AppManager;
use super::TestbedError;

pub const DFL_POLL_INTERVAL: Duration = Duration::from_secs(5);

static NEXT_EXP_ID: AtomicU64 = AtomicU64::new(0);

type SharedManager = Arc<Mutex<Box<dyn AppManager>>>;
pub type ExperimentListener = Box<dyn Fn(&ExperimentHandle) + Send>;
pub type SystemListener = Box<dyn Fn() + Send>;

fn lock_manager(mgr: &SharedManager) -> MutexGuard<Box<dyn AppManager>> {
    // A panicking loop leaves the lock poisoned, the manager is still usable.
    mgr.lock().unwrap_or_else(|e| e.into_inner())
}

fn panic_msg(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Sampler,
    Controller,
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Sampler => f.write_str("sampler"),
            Self::Controller => f.write_str("controller"),
        }
    }
}

struct StopState {
    token: CancelToken,
    requested: bool,
}

impl StopState {
    fn new() -> Self {
        Self {
            token: CancelToken::new(),
            requested: false,
        }
    }
}

struct Shared {
    status: Mutex<ExperimentReport>,
    stop: Mutex<StopState>,
}

/// Cloneable view of an experiment which stays valid while the experiment
/// is running on another thread.
#[derive(Clone)]
pub struct ExperimentHandle {
    shared: Arc<Shared>,
}

impl ExperimentHandle {
    fn new(id: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                status: Mutex::new(ExperimentReport {
                    id,
                    ..Default::default()
                }),
                stop: Mutex::new(StopState::new()),
            }),
        }
    }

    fn status(&self) -> MutexGuard<ExperimentReport> {
        self.shared.status.lock().unwrap()
    }

    pub fn id(&self) -> u64 {
        self.status().id
    }

    pub fn name(&self) -> String {
        self.status().name.clone()
    }

    pub fn state(&self) -> ExperimentState {
        self.status().state
    }

    pub fn report(&self) -> ExperimentReport {
        self.status().clone()
    }

    /// Ask the experiment to wind down as if the workload finished. A stop
    /// requested before `run()` makes the next run end right after start.
    pub fn stop(&self) {
        let mut stop = self.shared.stop.lock().unwrap();
        stop.requested = true;
        stop.token.cancel();
    }

    fn token(&self) -> CancelToken {
        self.shared.stop.lock().unwrap().token.clone()
    }

    fn set_state(&self, state: ExperimentState) {
        let mut st = self.status();
        debug!("exp[{}]: {} -> {}", st.id, st.state, state);
        st.state = state;
    }

    fn begin(&self, name: &str) {
        let mut st = self.status();
        let id = st.id;
        *st = ExperimentReport {
            id,
            name: name.to_string(),
            state: ExperimentState::Starting,
            started_at: Some(Local::now()),
            ..Default::default()
        };
    }

    fn end(&self, error: Option<String>) {
        let mut st = self.status();
        st.state = match error {
            Some(_) => ExperimentState::Failed,
            None => ExperimentState::Done,
        };
        if st.error.is_none() {
            st.error = error;
        }
        st.ended_at = Some(Local::now());
    }

    /// Close the run and re-arm the stop token. If `consumed` is false, a
    /// stop requested while the run was already winding down is kept for
    /// the next run.
    fn finish(&self, error: Option<String>, consumed: bool) {
        let mut stop = self.shared.stop.lock().unwrap();
        self.end(error);
        if consumed || !stop.requested {
            *stop = StopState::new();
        } else {
            debug!("exp[{}]: Keeping late stop request", self.id());
        }
    }

    /// Record the first failure of a run. Later ones are only logged.
    fn fail(&self, msg: String) {
        let mut st = self.status();
        if st.error.is_none() {
            st.error = Some(msg);
        }
    }

    fn failed(&self) -> Option<String> {
        self.status().error.clone()
    }

    fn count(&self, kind: LoopKind, ok: bool) {
        let mut st = self.status();
        match kind {
            LoopKind::Sampler => {
                st.nr_samples += 1;
                if !ok {
                    st.nr_sample_errors += 1;
                }
            }
            LoopKind::Controller => {
                st.nr_controls += 1;
                if !ok {
                    st.nr_control_errors += 1;
                }
            }
        }
    }
}

fn run_loop(kind: LoopKind, handle: &ExperimentHandle, mgr: &SharedManager, token: &CancelToken) {
    let interval = {
        let mgr = lock_manager(mgr);
        match kind {
            LoopKind::Sampler => mgr.sampling_time(),
            LoopKind::Controller => mgr.control_time(),
        }
    };
    debug!("exp[{}]: {} loop started, interval {:?}", handle.id(), kind, interval);

    while !token.is_cancelled() {
        let res = {
            let mut mgr = lock_manager(mgr);
            match kind {
                LoopKind::Sampler => mgr.sample(),
                LoopKind::Controller => mgr.control(),
            }
        };
        if let Err(e) = res.as_ref() {
            warn!("exp[{}]: {} failed ({:#})", handle.id(), kind, e);
        }
        handle.count(kind, res.is_ok());

        if token.wait(interval) {
            break;
        }
    }
    debug!("exp[{}]: {} loop exiting", handle.id(), kind);
}

fn spawn_loop(
    kind: LoopKind,
    handle: ExperimentHandle,
    mgr: SharedManager,
    token: CancelToken,
) -> JoinHandle<()> {
    spawn(move || {
        if let Err(e) = panic::catch_unwind(AssertUnwindSafe(|| {
            run_loop(kind, &handle, &mgr, &token)
        })) {
            let msg = format!("{} panicked ({})", kind, panic_msg(&e));
            error!("exp[{}]: {}", handle.id(), &msg);
            handle.fail(msg);
            token.cancel();
        }
    })
}

/// Cancels and joins the control loops when dropped, unwinding included.
struct LoopGuard<'a> {
    id: u64,
    token: &'a CancelToken,
    jhs: Vec<JoinHandle<()>>,
}

impl<'a> Drop for LoopGuard<'a> {
    fn drop(&mut self) {
        self.token.cancel();
        for jh in self.jhs.drain(..) {
            if let Err(e) = jh.join() {
                error!("exp[{}]: Failed to join loop ({})", self.id, panic_msg(&e));
            }
        }
    }
}

/// One application driven by one workload under one manager.
pub struct AppExperiment {
    handle: ExperimentHandle,
    app: Option<Arc<Application>>,
    driver: Option<Box<dyn WorkloadDriver>>,
    manager: Option<SharedManager>,
    poll_interval: Duration,
    on_start: Vec<ExperimentListener>,
    on_stop: Vec<ExperimentListener>,
}

impl AppExperiment {
    pub fn new() -> Self {
        Self {
            handle: ExperimentHandle::new(NEXT_EXP_ID.fetch_add(1, Ordering::Relaxed)),
            app: None,
            driver: None,
            manager: None,
            poll_interval: DFL_POLL_INTERVAL,
            on_start: vec![],
            on_stop: vec![],
        }
    }

    pub fn with_parts(
        app: Arc<Application>,
        driver: Box<dyn WorkloadDriver>,
        manager: Box<dyn AppManager>,
    ) -> Self {
        let mut exp = Self::new();
        exp.set_app(app);
        exp.set_driver(driver);
        exp.set_manager(manager);
        exp
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn name(&self) -> &str {
        match self.app.as_ref() {
            Some(app) => app.name(),
            None => "",
        }
    }

    pub fn handle(&self) -> ExperimentHandle {
        self.handle.clone()
    }

    pub fn set_app(&mut self, app: Arc<Application>) {
        self.app = Some(app);
    }

    pub fn set_driver(&mut self, driver: Box<dyn WorkloadDriver>) {
        self.driver = Some(driver);
    }

    pub fn set_manager(&mut self, manager: Box<dyn AppManager>) {
        self.manager = Some(Arc::new(Mutex::new(manager)));
    }

    pub fn set_poll_interval(&mut self, intv: Duration) {
        self.poll_interval = intv;
    }

    pub fn add_on_start<F: Fn(&ExperimentHandle) + Send + 'static>(&mut self, f: F) {
        self.on_start.push(Box::new(f));
    }

    pub fn add_on_stop<F: Fn(&ExperimentHandle) + Send + 'static>(&mut self, f: F) {
        self.on_stop.push(Box::new(f));
    }

    /// Run the experiment to completion. Returns an error if a part is
    /// missing, if the workload or the manager fails to start or if anything
    /// panicked along the way. Errors from individual `sample()` and
    /// `control()` calls are only counted.
    pub fn run(&mut self) -> Result<()> {
        let app = match self.app.clone() {
            Some(v) => v,
            None => return Err(TestbedError::NotSet("application").into()),
        };
        let mgr = match self.manager.clone() {
            Some(v) => v,
            None => return Err(TestbedError::NotSet("application manager").into()),
        };
        let mut driver = match self.driver.take() {
            Some(v) => v,
            None => return Err(TestbedError::NotSet("workload driver").into()),
        };

        let token = self.handle.token();
        self.handle.begin(app.name());
        info!("exp[{}]: Starting {:?}", self.id(), app.name());

        let (res, consumed) = match panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_inner(&app, &mut *driver, &mgr, &token)
        })) {
            Ok(Ok(stopped)) => (Ok(()), stopped),
            Ok(Err(e)) => (Err(e), token.is_cancelled()),
            Err(e) => {
                let msg = format!("panicked ({})", panic_msg(&e));
                error!("exp[{}]: Orchestrator {}", self.id(), &msg);
                match panic::catch_unwind(AssertUnwindSafe(|| driver.stop())) {
                    Ok(Ok(())) => (),
                    Ok(Err(e)) => {
                        warn!("exp[{}]: Failed to stop the workload ({:#})", self.id(), &e)
                    }
                    Err(e) => error!(
                        "exp[{}]: Workload stop panicked ({})",
                        self.id(),
                        panic_msg(&e)
                    ),
                }
                (Err(anyhow!(msg)), true)
            }
        };
        self.driver = Some(driver);

        let error = match (res.as_ref(), self.handle.failed()) {
            (Err(e), _) => Some(format!("{:#}", e)),
            (Ok(()), Some(msg)) => Some(msg),
            (Ok(()), None) => None,
        };
        self.handle.finish(error.clone(), consumed);

        match error {
            Some(msg) => {
                error!("exp[{}]: Failed ({})", self.id(), &msg);
                match res {
                    Err(e) => Err(e),
                    Ok(()) => Err(anyhow!(msg)),
                }
            }
            None => {
                info!("exp[{}]: Done", self.id());
                Ok(())
            }
        }
    }

    fn run_inner(
        &mut self,
        app: &Arc<Application>,
        driver: &mut dyn WorkloadDriver,
        mgr: &SharedManager,
        token: &CancelToken,
    ) -> Result<bool> {
        {
            let mut mgr = lock_manager(mgr);
            mgr.app(app.clone());
            mgr.reset()?;
        }
        driver.app(app.clone());
        driver.reset();

        for listener in self.on_start.iter() {
            listener(&self.handle);
        }

        let res = match driver.start() {
            Ok(()) => Ok(self.drive(driver, mgr, token)),
            Err(e) => Err(e),
        };

        for listener in self.on_stop.iter() {
            listener(&self.handle);
        }
        res
    }

    fn wait_ready(&self, driver: &mut dyn WorkloadDriver, token: &CancelToken) -> bool {
        self.handle.set_state(ExperimentState::WaitingReady);
        loop {
            if token.is_cancelled() || driver.done() {
                return false;
            }
            if driver.ready() {
                return true;
            }
            if token.wait(self.poll_interval) {
                return false;
            }
        }
    }

    /// Returns whether the run ended because its token was cancelled.
    fn drive(
        &self,
        driver: &mut dyn WorkloadDriver,
        mgr: &SharedManager,
        token: &CancelToken,
    ) -> bool {
        let mut loops = LoopGuard {
            id: self.id(),
            token,
            jhs: vec![],
        };

        if self.wait_ready(driver, token) {
            self.handle.set_state(ExperimentState::Active);
            info!("exp[{}]: Workload ready, starting the control loops", self.id());
            for kind in [LoopKind::Sampler, LoopKind::Controller].iter() {
                loops.jhs.push(spawn_loop(
                    *kind,
                    self.handle.clone(),
                    mgr.clone(),
                    token.clone(),
                ));
            }
            while !driver.done() {
                if token.wait(self.poll_interval) {
                    break;
                }
            }
        } else {
            info!("exp[{}]: Finished before the workload became ready", self.id());
        }

        let stopped = token.is_cancelled();
        self.handle.set_state(ExperimentState::Draining);
        drop(loops);
        if let Err(e) = driver.stop() {
            warn!("exp[{}]: Failed to stop the workload ({:#})", self.id(), &e);
        }
        stopped
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentOutcome {
    pub id: u64,
    pub name: String,
    pub state: ExperimentState,
    pub error: Option<String>,
}

impl From<ExperimentReport> for ExperimentOutcome {
    fn from(rep: ExperimentReport) -> Self {
        Self {
            id: rep.id,
            name: rep.name,
            state: rep.state,
            error: rep.error,
        }
    }
}

#[derive(Clone)]
pub struct SystemHandle {
    running: Arc<AtomicBool>,
    exps: Vec<ExperimentHandle>,
}

impl SystemHandle {
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn experiments(&self) -> &[ExperimentHandle] {
        &self.exps
    }

    pub fn stop(&self) {
        for exp in self.exps.iter() {
            exp.stop();
        }
    }

    pub fn report(&self) -> Report {
        Report {
            timestamp: Local::now(),
            running: self.running(),
            experiments: self.exps.iter().map(|exp| exp.report()).collect(),
        }
    }
}

/// Runs application experiments concurrently, one thread each.
pub struct SystemExperiment {
    exps: Vec<AppExperiment>,
    running: Arc<AtomicBool>,
    on_start: Vec<SystemListener>,
    on_stop: Vec<SystemListener>,
}

impl SystemExperiment {
    pub fn new() -> Self {
        Self {
            exps: vec![],
            running: Arc::new(AtomicBool::new(false)),
            on_start: vec![],
            on_stop: vec![],
        }
    }

    pub fn add_experiment(&mut self, exp: AppExperiment) {
        self.exps.push(exp);
    }

    pub fn num_experiments(&self) -> usize {
        self.exps.len()
    }

    pub fn add_on_start<F: Fn() + Send + 'static>(&mut self, f: F) {
        self.on_start.push(Box::new(f));
    }

    pub fn add_on_stop<F: Fn() + Send + 'static>(&mut self, f: F) {
        self.on_stop.push(Box::new(f));
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Experiments added after this call aren't covered by the handle.
    pub fn handle(&self) -> SystemHandle {
        SystemHandle {
            running: self.running.clone(),
            exps: self.exps.iter().map(|exp| exp.handle()).collect(),
        }
    }

    pub fn run(&mut self) -> Vec<ExperimentOutcome> {
        for listener in self.on_start.iter() {
            listener();
        }
        self.running.store(true, Ordering::Relaxed);

        let mut workers = vec![];
        for mut exp in self.exps.drain(..) {
            let handle = exp.handle();
            let jh = spawn(move || {
                let res = panic::catch_unwind(AssertUnwindSafe(|| exp.run()));
                (exp, res)
            });
            workers.push((handle, jh));
        }

        let mut outcomes = vec![];
        for (handle, jh) in workers.into_iter() {
            match jh.join() {
                Ok((exp, res)) => {
                    match res {
                        Ok(Ok(())) => (),
                        Ok(Err(e)) => {
                            warn!("system: Experiment {} failed ({:#})", handle.id(), &e)
                        }
                        Err(e) => {
                            let msg = format!("panicked ({})", panic_msg(&e));
                            error!("system: Experiment {} {}", handle.id(), &msg);
                            handle.finish(Some(msg), true);
                        }
                    }
                    self.exps.push(exp);
                }
                Err(e) => {
                    let msg = format!("worker thread failed ({})", panic_msg(&e));
                    error!("system: Experiment {} {}", handle.id(), &msg);
                    handle.finish(Some(msg), true);
                }
            }
            outcomes.push(ExperimentOutcome::from(handle.report()));
        }

        self.running.store(false, Ordering::Relaxed);
        for listener in self.on_stop.iter() {
            listener();
        }
        outcomes
    }
}
