// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use crossbeam::channel::Sender;
use log::{info, warn};
use simplelog as sl;
use std::collections::HashMap;
use std::io::prelude::*;
use std::io::BufReader;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, UNIX_EPOCH};

pub mod cancel;
pub mod json_file;
pub mod tailer;

pub use cancel::CancelToken;
pub use json_file::{JsonArgs, JsonArgsHelper, JsonConfigFile, JsonLoad, JsonReportFile, JsonSave};
pub use tailer::FileTailer;

pub const NSEC_TO_MSEC: f64 = 0.000_001;

fn format_duration_internal(dur: f64, zero: &str) -> String {
    let format_nsecs_helper = |nsecs: u64, unit: u64, max: u64, suffix: &str| -> Option<String> {
        if nsecs == 0 {
            Some(zero.to_string())
        } else if (nsecs as f64 / unit as f64) < 99.95 {
            Some(format!(
                "{:.1}{}",
                (nsecs as f64 / unit as f64).max(0.1),
                suffix
            ))
        } else if (nsecs as f64 / unit as f64) < max as f64 {
            Some(format!("{:.0}{}", nsecs as f64 / unit as f64, suffix))
        } else {
            None
        }
    };

    let nsecs = (dur * 1_000_000_000.0).round() as u64;

    format_nsecs_helper(nsecs, 10_u64.pow(0), 1000, "n")
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(3), 1000, "u"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(6), 1000, "m"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9), 60, "s"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60, 60, "M"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60 * 60, 24, "H"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60 * 60 * 24, 365, "D"))
        .unwrap_or_else(|| "INF".into())
}

pub fn format_duration(dur: f64) -> String {
    format_duration_internal(dur, "0")
}

pub fn parse_duration(input: &str) -> Result<f64> {
    lazy_static::lazy_static! {
        static ref UNITS: HashMap<char, f64> = [
            ('n', 0.000_000_001),
            ('u', 0.000_001),
            ('m', 0.001),
            ('s', 1.0),
            ('M', 60.0),
            ('H', 3600.0),
            ('D', 3600.0 * 24.0),
        ]
            .iter()
            .cloned()
            .collect();
    }

    let mut num = String::new();
    let mut sum = 0.0;
    for ch in input.chars() {
        match ch {
            '_' => continue,
            ch if UNITS.contains_key(&ch) => {
                sum += num.trim().parse::<f64>()? * UNITS[&ch];
                num.clear();
            }
            ch => num.push(ch),
        }
    }
    if num.trim().len() > 0 {
        sum += num.trim().parse::<f64>()?;
    }
    if sum < 0.0 {
        bail!("duration {:?} is negative", input);
    }
    Ok(sum)
}

/// Converts configuration seconds into a `Duration`, rejecting negative and
/// non-finite values.
pub fn secs_to_duration(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        bail!("invalid duration {}s", secs);
    }
    Ok(Duration::from_secs_f64(secs))
}

pub fn unix_now() -> u64 {
    UNIX_EPOCH.elapsed().map(|d| d.as_secs()).unwrap_or(0)
}

pub fn init_logging(verbosity: u32) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    } else {
        let sl_level = match verbosity {
            0 | 1 => sl::LevelFilter::Info,
            2 => sl::LevelFilter::Debug,
            _ => sl::LevelFilter::Trace,
        };
        let mut lcfg = sl::ConfigBuilder::new();
        lcfg.set_time_level(sl::LevelFilter::Off)
            .set_location_level(sl::LevelFilter::Off)
            .set_target_level(sl::LevelFilter::Off)
            .set_thread_level(sl::LevelFilter::Off);
        if !console::user_attended_stderr()
            || sl::TermLogger::init(
                sl_level,
                lcfg.build(),
                sl::TerminalMode::Stderr,
                sl::ColorChoice::Auto,
            )
            .is_err()
        {
            let _ = sl::SimpleLogger::init(sl_level, lcfg.build());
        }
    }
}

/// Forwards the lines read from a child's output pipe to `tx` until either
/// side goes away.
pub fn child_reader_thread<R: Read>(name: String, out: R, tx: Sender<String>) {
    let reader = BufReader::new(out);
    for line in reader.lines() {
        match line {
            Ok(line) => {
                if let Err(e) = tx.send(line) {
                    info!("{}: Reader thread terminating ({:?})", &name, &e);
                    break;
                }
            }
            Err(e) => {
                warn!("{}: Failed to read child output ({:?})", &name, &e);
                break;
            }
        }
    }
}

lazy_static::lazy_static! {
    static ref PROG_EXITING: Mutex<bool> = Mutex::new(false);
    static ref PROG_WAITQ: Condvar = Condvar::new();
}

pub fn setup_prog_state() -> Result<()> {
    ctrlc::set_handler(move || {
        info!("SIGINT/TERM received, exiting...");
        set_prog_exiting();
    })?;
    Ok(())
}

pub fn set_prog_exiting() {
    *PROG_EXITING.lock().unwrap() = true;
    PROG_WAITQ.notify_all();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgState {
    Running,
    Exiting,
}

pub fn wait_prog_state(dur: Duration) -> ProgState {
    let exiting = PROG_EXITING.lock().unwrap();
    let (exiting, _) = PROG_WAITQ
        .wait_timeout_while(exiting, dur, |exiting| !*exiting)
        .unwrap();
    match *exiting {
        true => ProgState::Exiting,
        false => ProgState::Running,
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_format_duration() {
        for pair in &[
            (0.000003932, "3.9u"),
            (0.00448, "4.5m"),
            (0.3, "300m"),
            (5.0, "5.0s"),
            (2042.0, "34.0M"),
            (3456000.0, "40.0D"),
        ] {
            let result = super::format_duration(pair.0);
            assert_eq!(&result, pair.1);
            println!("{} -> {} ({})", pair.0, &result, pair.1);
        }
    }

    #[test]
    fn test_parse_duration() {
        for pair in &[
            (0.0000039, "3.9u"),
            (0.0044, "4.4m"),
            (0.3, "300m"),
            (2040.0, "34.0M"),
            (3456000.0, "40.0D"),
            (1.27, "1.27"),
            (1.37, "100m1.27"),
            (90.5, "1M_30s_500m"),
        ] {
            let result = super::parse_duration(pair.1).unwrap();
            assert_eq!(pair.0, result);
            println!("{} -> {} ({})", pair.1, result, pair.0);
        }
        assert!(super::parse_duration("-3s").is_err());
        assert!(super::parse_duration("3x").is_err());
    }

    #[test]
    fn test_secs_to_duration() {
        assert_eq!(
            super::secs_to_duration(1.5).unwrap(),
            std::time::Duration::from_millis(1500)
        );
        assert!(super::secs_to_duration(-1.0).is_err());
        assert!(super::secs_to_duration(f64::NAN).is_err());
    }
}
