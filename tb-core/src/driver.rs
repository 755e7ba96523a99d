// Copyright (c) Facebook, Inc. and its affiliates.

//! Workload drivers.
//!
//! A driver starts the workload generator hitting an application and tells
//! the experiment when the workload is warmed up (`ready()`) and when it
//! has finished (`done()`). Both are polled and must not block.
use anyhow::{Context, Result};
use crossbeam::channel;
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::spawn;
use std::time::{Duration, Instant};
use tb_intf::DriverSpec;
use tb_util::*;

use super::application::Application;

pub trait WorkloadDriver: Send {
    fn app(&mut self, app: Arc<Application>);
    fn reset(&mut self);
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn ready(&mut self) -> bool;
    fn done(&mut self) -> bool;
}

fn app_name(app: &Option<Arc<Application>>) -> &str {
    match app {
        Some(app) => app.name(),
        None => "-",
    }
}

struct RunningChild {
    child: Child,
    started_at: Instant,
    exited: bool,
}

/// Runs an external workload generator. Its stdout and stderr are
/// forwarded to the log.
pub struct CommandDriver {
    program: String,
    args: Vec<String>,
    ready_file: Option<PathBuf>,
    warmup: Duration,
    app: Option<Arc<Application>>,
    running: Option<RunningChild>,
}

impl CommandDriver {
    pub fn new(program: &str, args: &[String]) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
            ready_file: None,
            warmup: Duration::from_secs(0),
            app: None,
            running: None,
        }
    }

    /// The workload is ready once `path` exists and isn't empty.
    pub fn ready_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.ready_file = Some(path.into());
        self
    }

    /// Without a ready file, the workload is ready `warmup` after start.
    pub fn warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    fn forward_output(&self, child: &mut Child) {
        let name = format!("driver[{}]", app_name(&self.app));
        let (tx, rx) = channel::unbounded::<String>();
        if let Some(stdout) = child.stdout.take() {
            let (name, tx) = (name.clone(), tx.clone());
            spawn(move || child_reader_thread(name, stdout, tx));
        }
        if let Some(stderr) = child.stderr.take() {
            let (name, tx) = (name.clone(), tx.clone());
            spawn(move || child_reader_thread(name, stderr, tx));
        }
        drop(tx);
        spawn(move || {
            for line in rx.iter() {
                info!("{}: {}", &name, &line);
            }
        });
    }
}

impl WorkloadDriver for CommandDriver {
    fn app(&mut self, app: Arc<Application>) {
        self.app = Some(app);
    }

    fn reset(&mut self) {
        if let Err(e) = self.stop() {
            warn!("driver[{}]: Failed to stop ({:#})", app_name(&self.app), &e);
        }
        self.running = None;
    }

    fn start(&mut self) -> Result<()> {
        if let Some(rc) = self.running.as_ref() {
            if !rc.exited {
                invalid_arg!("{:?} is already running", &self.program);
            }
        }
        if let Some(path) = self.ready_file.as_ref() {
            match fs::remove_file(path) {
                Ok(()) => debug!("driver: Removed stale ready file {:?}", path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => (),
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to remove {:?}", path))
                }
            }
        }

        info!(
            "driver[{}]: Starting {:?} {:?}",
            app_name(&self.app),
            &self.program,
            &self.args
        );
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start {:?}", &self.program))?;
        self.forward_output(&mut child);

        self.running = Some(RunningChild {
            child,
            started_at: Instant::now(),
            exited: false,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let rc = match self.running.as_mut() {
            Some(v) if !v.exited => v,
            _ => return Ok(()),
        };
        debug!("driver[{}]: Killing {:?}", app_name(&self.app), &self.program);
        rc.exited = true;
        if let Err(e) = rc.child.kill() {
            // already reaped or exited on its own
            debug!("driver: kill failed ({:?})", &e);
        }
        let status = rc
            .child
            .wait()
            .with_context(|| format!("failed to reap {:?}", &self.program))?;
        debug!("driver[{}]: {:?} {}", app_name(&self.app), &self.program, status);
        Ok(())
    }

    fn ready(&mut self) -> bool {
        if self.done() {
            return false;
        }
        let rc = match self.running.as_ref() {
            Some(v) => v,
            None => return false,
        };
        match self.ready_file.as_ref() {
            Some(path) => match fs::metadata(path) {
                Ok(md) => md.len() > 0,
                Err(_) => false,
            },
            None => rc.started_at.elapsed() >= self.warmup,
        }
    }

    fn done(&mut self) -> bool {
        let rc = match self.running.as_mut() {
            Some(v) => v,
            None => return true,
        };
        if rc.exited {
            return true;
        }
        match rc.child.try_wait() {
            Ok(Some(status)) => {
                info!("driver[{}]: {:?} finished ({})", app_name(&self.app), &self.program, status);
                rc.exited = true;
            }
            Ok(None) => (),
            Err(e) => {
                warn!("driver[{}]: Failed to wait for {:?} ({:?})", app_name(&self.app), &self.program, &e);
                rc.exited = true;
            }
        }
        rc.exited
    }
}

impl Drop for CommandDriver {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("driver: Failed to stop {:?} ({:#})", &self.program, &e);
        }
    }
}

/// No workload at all. Becomes ready and done after fixed delays from
/// `start()`.
pub struct TimedDriver {
    ready_after: Duration,
    done_after: Duration,
    started_at: Option<Instant>,
    stopped: bool,
}

impl TimedDriver {
    pub fn new(ready_after: Duration, done_after: Duration) -> Self {
        Self {
            ready_after,
            done_after,
            started_at: None,
            stopped: false,
        }
    }
}

impl WorkloadDriver for TimedDriver {
    fn app(&mut self, _app: Arc<Application>) {}

    fn reset(&mut self) {
        self.started_at = None;
        self.stopped = false;
    }

    fn start(&mut self) -> Result<()> {
        self.started_at = Some(Instant::now());
        self.stopped = false;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stopped = true;
        Ok(())
    }

    fn ready(&mut self) -> bool {
        match self.started_at {
            Some(at) => !self.stopped && at.elapsed() >= self.ready_after,
            None => false,
        }
    }

    fn done(&mut self) -> bool {
        match self.started_at {
            Some(at) => self.stopped || at.elapsed() >= self.done_after,
            None => true,
        }
    }
}

pub fn build_driver(spec: &DriverSpec) -> Result<Box<dyn WorkloadDriver>> {
    let driver: Box<dyn WorkloadDriver> = match spec {
        DriverSpec::Command {
            program,
            args,
            ready_file,
            warmup,
        } => {
            let mut driver =
                CommandDriver::new(program, args).warmup(secs_to_duration(*warmup)?);
            if let Some(path) = ready_file.as_ref() {
                driver = driver.ready_file(path);
            }
            Box::new(driver)
        }
        DriverSpec::Timed {
            ready_after,
            done_after,
        } => Box::new(TimedDriver::new(
            secs_to_duration(*ready_after)?,
            secs_to_duration(*done_after)?,
        )),
    };
    Ok(driver)
}
