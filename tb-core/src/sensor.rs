// Copyright (c) Facebook, Inc. and its affiliates.

//! Performance sensors.
//!
//! A sensor is polled with `sense()` which never blocks. Each poll replaces
//! the buffered observations with the ones which appeared since the
//! previous poll. `TailSensor` follows a workload's metrics log through
//! `FileTailer` and turns every new line into an `Observation` with a
//! pluggable `LineFormat`.
use anyhow::Result;
use log::{trace, warn};
use scan_fmt::scan_fmt;
use std::path::Path;
use tb_intf::{SensorFormat, SensorSpec};
use tb_util::*;

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub timestamp: i64,
    pub label: String,
    pub value: f64,
}

pub trait Sensor: Send {
    /// Poll the source and buffer whatever is new.
    fn sense(&mut self);

    fn has_observations(&self) -> bool {
        self.observations().len() > 0
    }

    /// Observations buffered by the last `sense()`.
    fn observations(&self) -> &[Observation];

    /// Drop the buffer and start over from the beginning of the source.
    fn reset(&mut self);
}

pub trait LineFormat: Send {
    fn parse(&self, line: &str) -> Option<Observation>;
}

fn leading<F: Fn(char) -> bool>(field: &str, pred: F) -> &str {
    let end = field.find(|c: char| !pred(c)).unwrap_or(field.len());
    &field[..end]
}

/// RAIN metrics log. Whitespace separated, the second field is the
/// timestamp in seconds, the third the operation and the fourth the
/// response time in nanoseconds. Values are in milliseconds.
#[derive(Debug, Clone, Default)]
pub struct RainResponseTime;

impl LineFormat for RainResponseTime {
    fn parse(&self, line: &str) -> Option<Observation> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return None;
        }
        let timestamp = leading(fields[1], |c| c.is_ascii_digit()).parse::<i64>().ok()?;
        let label = leading(fields[2], |c| c.is_ascii_alphabetic());
        let nsecs = fields[3].parse::<f64>().ok()?;
        Some(Observation {
            timestamp,
            label: label.to_string(),
            value: nsecs * NSEC_TO_MSEC,
        })
    }
}

/// YCSB status output, `<secs> sec: <ops> operations; ...`. Values are
/// average operations per second since the beginning of the run.
#[derive(Debug, Clone, Default)]
pub struct YcsbThroughput;

impl LineFormat for YcsbThroughput {
    fn parse(&self, line: &str) -> Option<Observation> {
        let (secs, nops) = scan_fmt!(line.trim_start(), "{d} sec: {d} operations", i64, u64).ok()?;
        if secs <= 0 {
            return None;
        }
        Some(Observation {
            timestamp: secs,
            label: "<no-name>".into(),
            value: nops as f64 / secs as f64,
        })
    }
}

pub struct TailSensor<F: LineFormat> {
    tailer: FileTailer,
    format: F,
    obs: Vec<Observation>,
}

impl<F: LineFormat> TailSensor<F> {
    pub fn new<P: AsRef<Path>>(path: P, format: F) -> Self {
        Self {
            tailer: FileTailer::new(path),
            format,
            obs: vec![],
        }
    }

    pub fn cursor(&self) -> u64 {
        self.tailer.cursor()
    }
}

impl<F: LineFormat> Sensor for TailSensor<F> {
    fn sense(&mut self) {
        self.obs.clear();
        let lines = match self.tailer.read_lines() {
            Ok(v) => v,
            Err(e) => {
                warn!("sensor: Failed to read {:?} ({:#})", self.tailer.path(), &e);
                return;
            }
        };
        for line in lines.iter() {
            match self.format.parse(line) {
                Some(ob) => self.obs.push(ob),
                None => trace!("sensor: Skipping {:?}", line),
            }
        }
    }

    fn observations(&self) -> &[Observation] {
        &self.obs
    }

    fn reset(&mut self) {
        self.obs.clear();
        self.tailer.reset();
    }
}

pub fn build_sensor(spec: &SensorSpec) -> Result<Box<dyn Sensor>> {
    if spec.path.len() == 0 {
        invalid_arg!("{} sensor path is empty", spec.category);
    }
    let sensor: Box<dyn Sensor> = match spec.format {
        SensorFormat::RainResponseTime => Box::new(TailSensor::new(&spec.path, RainResponseTime)),
        SensorFormat::YcsbThroughput => Box::new(TailSensor::new(&spec.path, YcsbThroughput)),
    };
    Ok(sensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn append(path: &Path, data: &str) {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(data.as_bytes()).unwrap();
    }

    fn ob(timestamp: i64, label: &str, value: f64) -> Observation {
        Observation {
            timestamp,
            label: label.into(),
            value,
        }
    }

    #[test]
    fn test_rain_format() {
        let _ = ::env_logger::try_init();
        let fmt = RainResponseTime;
        assert_eq!(
            fmt.parse("x 1 GET 500000 x x"),
            Some(ob(1, "GET", 0.5))
        );
        assert_eq!(
            fmt.parse("[RAIN] 1613000000s PostEvent1 2000000"),
            Some(ob(1613000000, "PostEvent", 2.0))
        );
        assert_eq!(fmt.parse("x 1 GET"), None);
        assert_eq!(fmt.parse("x y GET 500000"), None);
        assert_eq!(fmt.parse("x 1 GET fast"), None);
        assert_eq!(fmt.parse(""), None);
    }

    #[test]
    fn test_ycsb_format() {
        let _ = ::env_logger::try_init();
        let fmt = YcsbThroughput;
        assert_eq!(
            fmt.parse("10 sec: 5000 operations; 500 current ops/sec; [READ: Count=10]"),
            Some(ob(10, "<no-name>", 500.0))
        );
        assert_eq!(
            fmt.parse(" 4 sec: 10 operations;"),
            Some(ob(4, "<no-name>", 2.5))
        );
        assert_eq!(fmt.parse("0 sec: 0 operations;"), None);
        assert_eq!(fmt.parse("Loading workload..."), None);
    }

    #[test]
    fn test_incremental_sense() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("metrics.log");
        let mut sensor = TailSensor::new(&path, RainResponseTime);

        sensor.sense();
        assert!(!sensor.has_observations());

        append(&path, "x 1 GET 500000 x x\n");
        sensor.sense();
        println!("first: {:?}", sensor.observations());
        assert_eq!(sensor.observations(), &[ob(1, "GET", 0.5)]);

        append(&path, "x 2 POST 250000 x x\n");
        sensor.sense();
        println!("second: {:?}", sensor.observations());
        assert_eq!(sensor.observations(), &[ob(2, "POST", 0.25)]);

        // Nothing new, the buffer is cleared.
        sensor.sense();
        assert!(!sensor.has_observations());
    }

    #[test]
    fn test_partial_and_malformed_lines() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("metrics.log");
        let mut sensor = TailSensor::new(&path, RainResponseTime);

        append(&path, "garbage\nx 3 GET 1000000 x\nx 4 PUT 2000");
        sensor.sense();
        assert_eq!(sensor.observations(), &[ob(3, "GET", 1.0)]);
        let cursor = sensor.cursor();

        sensor.sense();
        assert!(!sensor.has_observations());
        assert_eq!(sensor.cursor(), cursor);

        append(&path, "000 x\n");
        sensor.sense();
        assert_eq!(sensor.observations(), &[ob(4, "PUT", 2.0)]);
        assert!(sensor.cursor() > cursor);
    }

    #[test]
    fn test_reset_redelivers() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ycsb.out");
        append(&path, "10 sec: 100 operations;\n20 sec: 400 operations;\n");

        let spec = SensorSpec {
            category: tb_intf::AppPerfCategory::Throughput,
            format: SensorFormat::YcsbThroughput,
            path: path.to_string_lossy().into_owned(),
        };
        let mut sensor = build_sensor(&spec).unwrap();
        sensor.sense();
        assert_eq!(sensor.observations().len(), 2);
        sensor.sense();
        assert_eq!(sensor.observations().len(), 0);

        sensor.reset();
        assert!(!sensor.has_observations());
        sensor.sense();
        assert_eq!(
            sensor.observations(),
            &[ob(10, "<no-name>", 10.0), ob(20, "<no-name>", 20.0)]
        );
    }
}
