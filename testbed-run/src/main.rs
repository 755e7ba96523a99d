// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use std::process::exit;
use std::thread::spawn;

use tb_core::setup::build_system;
use tb_core::SystemHandle;
use tb_intf::{Args, ExperimentState, Report, TestbedConfig};
use tb_util::*;

const MIN_REPORT_INTV: f64 = 0.1;

fn report_tick(rf: &mut JsonReportFile<Report>, sys: &SystemHandle) {
    rf.data = sys.report();
    if let Err(e) = rf.commit() {
        warn!("Failed to update report file {:?} ({:#})", &rf.path, &e);
    }
}

fn summarize(report: &Report) -> bool {
    let mut all_done = true;
    for exp in report.experiments.iter() {
        let dur = match (exp.started_at, exp.ended_at) {
            (Some(s), Some(e)) => (e - s).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };
        info!(
            "[{}] {:?}: {} after {} samples={} ({} failed) controls={} ({} failed)",
            exp.id,
            &exp.name,
            exp.state,
            format_duration(dur),
            exp.nr_samples,
            exp.nr_sample_errors,
            exp.nr_controls,
            exp.nr_control_errors
        );
        if exp.state != ExperimentState::Done {
            all_done = false;
            if let Some(err) = exp.error.as_ref() {
                error!("[{}] {:?}: {}", exp.id, &exp.name, err);
            }
        }
    }
    all_done
}

fn run() -> Result<i32> {
    let args_file = Args::init_args_and_logging()?;
    let args = &args_file.data;
    debug!("arguments: {:#?}", args);

    let mut cfg_file = JsonConfigFile::<TestbedConfig>::load_or_create(args.config.as_ref())?;
    if let Some(intv) = args.poll_interval {
        cfg_file.data.poll_interval = intv;
        cfg_file.data.loaded().context("invalid --poll-interval")?;
    }
    let cfg = &cfg_file.data;

    let mut sys = build_system(cfg).context("Failed to set up experiments")?;
    if args.check {
        info!(
            "Configuration OK, {} experiment(s) on {} VM manager(s)",
            sys.num_experiments(),
            cfg.vmms.len()
        );
        return Ok(0);
    }

    setup_prog_state()?;
    let handle = sys.handle();
    let mut report_file = JsonReportFile::<Report>::new(args.report.as_ref());
    report_tick(&mut report_file, &handle);

    let report_intv = secs_to_duration(args.interval.max(MIN_REPORT_INTV))?;
    let watcher = {
        let handle = handle.clone();
        spawn(move || {
            loop {
                let state = wait_prog_state(report_intv);
                report_tick(&mut report_file, &handle);
                if state == ProgState::Exiting {
                    handle.stop();
                    break;
                }
            }
            report_file
        })
    };

    info!(
        "Starting {} experiment(s), poll interval {}",
        sys.num_experiments(),
        format_duration(cfg.poll_interval)
    );
    sys.run();

    // Wakes up the watcher if it's still waiting.
    set_prog_exiting();
    let mut report_file = watcher
        .join()
        .map_err(|_| anyhow!("report thread panicked"))?;
    report_tick(&mut report_file, &handle);

    match summarize(&report_file.data) {
        true => Ok(0),
        false => Ok(2),
    }
}

fn main() {
    match run() {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{:#}", &e);
            exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tb_intf::ExperimentReport;

    #[test]
    fn test_summarize() {
        let _ = ::env_logger::try_init();
        let mut report = Report::default();
        report.experiments.push(ExperimentReport {
            id: 0,
            name: "olio".into(),
            state: ExperimentState::Done,
            ..Default::default()
        });
        assert!(summarize(&report));

        report.experiments.push(ExperimentReport {
            id: 1,
            name: "rubis".into(),
            state: ExperimentState::Failed,
            error: Some("failed to start".into()),
            ..Default::default()
        });
        assert!(!summarize(&report));
    }
}
