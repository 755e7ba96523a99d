// Copyright (c) Facebook, Inc. and its affiliates.
use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::UNIX_EPOCH;

use tb_util::*;

/// Lifecycle of an application experiment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExperimentState {
    Idle,
    Starting,
    WaitingReady,
    Active,
    Draining,
    Done,
    Failed,
}

impl ExperimentState {
    pub fn finished(&self) -> bool {
        match self {
            Self::Done | Self::Failed => true,
            _ => false,
        }
    }
}

impl Default for ExperimentState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::WaitingReady => "waiting-ready",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

const REPORT_DOC: &str = "\
//
// testbed report
//
//  timestamp: When this report was generated
//  running: Whether the experiments are still running
//  experiments[]: Per-experiment status
//    state: idle, starting, waiting-ready, active, draining, done, failed
//    nr_samples, nr_controls: Completed sample() and control() calls
//    nr_sample_errors, nr_control_errors: Failed sample() and control() calls
//    error: Why the experiment failed
//
";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub id: u64,
    pub name: String,
    pub state: ExperimentState,
    pub nr_samples: u64,
    pub nr_controls: u64,
    pub nr_sample_errors: u64,
    pub nr_control_errors: u64,
    pub started_at: Option<DateTime<Local>>,
    pub ended_at: Option<DateTime<Local>>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Report {
    pub timestamp: DateTime<Local>,
    pub running: bool,
    pub experiments: Vec<ExperimentReport>,
}

impl Default for Report {
    fn default() -> Self {
        Self {
            timestamp: DateTime::from(UNIX_EPOCH),
            running: false,
            experiments: vec![],
        }
    }
}

impl JsonLoad for Report {}

impl JsonSave for Report {
    fn preamble() -> Option<String> {
        Some(REPORT_DOC.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_file() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("report.json");

        let mut rf = JsonReportFile::<Report>::new(Some(&path));
        rf.data.running = true;
        rf.data.experiments.push(ExperimentReport {
            id: 3,
            name: "olio".into(),
            state: ExperimentState::WaitingReady,
            ..Default::default()
        });
        rf.commit().unwrap();

        let loaded = Report::load(&path).unwrap();
        assert!(loaded.running);
        assert_eq!(loaded.experiments[0].state, ExperimentState::WaitingReady);
        assert!(loaded.experiments[0].started_at.is_none());
        assert!(!loaded.experiments[0].state.finished());
        assert_eq!(format!("{}", ExperimentState::WaitingReady), "waiting-ready");
    }
}
