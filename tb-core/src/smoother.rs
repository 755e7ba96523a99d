// Copyright (c) Facebook, Inc. and its affiliates.

//! Exponential smoothing filters.
//!
//! A smoother is created empty, gets seeded by its first one or two samples
//! and from then on tracks a level (and possibly a trend) which can be
//! projected `h` steps ahead with `forecast()`. `forecast(0)` is always the
//! current smoothed value.
use anyhow::Result;
use tb_intf::SmootherSpec;

pub trait Smoother: Send {
    /// Feed one sample and return the new smoothed value.
    fn smooth(&mut self, value: f64) -> f64;

    /// Forecast `horizon` steps ahead. Doesn't change the state.
    fn forecast(&self, horizon: u32) -> f64;

    fn reset(&mut self);

    /// Whether enough samples have been seen for the output to be meaningful.
    fn ready(&self) -> bool;

    /// Feed `values` in order and return the resulting smoothed value.
    fn smooth_all(&mut self, values: &[f64]) -> f64 {
        for v in values.iter() {
            self.smooth(*v);
        }
        self.value()
    }

    fn value(&self) -> f64 {
        self.forecast(0)
    }
}

/// Remembers the last sample.
#[derive(Debug, Clone)]
pub struct PassThrough {
    level: f64,
}

impl PassThrough {
    pub fn new() -> Self {
        Self { level: f64::NAN }
    }
}

impl Smoother for PassThrough {
    fn smooth(&mut self, value: f64) -> f64 {
        self.level = value;
        self.level
    }

    fn forecast(&self, _horizon: u32) -> f64 {
        self.level
    }

    fn reset(&mut self) {
        self.level = f64::NAN;
    }

    fn ready(&self) -> bool {
        !self.level.is_nan()
    }
}

/// Brown's single exponential smoothing, a flat forecast of the level.
#[derive(Debug, Clone)]
pub struct BrownSingle {
    alpha: f64,
    level: f64,
    seeded: bool,
}

impl BrownSingle {
    pub fn new(alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            invalid_arg!("brown-single alpha {} not in (0, 1]", alpha);
        }
        Ok(Self {
            alpha,
            level: f64::NAN,
            seeded: false,
        })
    }
}

impl Smoother for BrownSingle {
    fn smooth(&mut self, value: f64) -> f64 {
        if self.seeded {
            self.level = self.alpha * value + (1.0 - self.alpha) * self.level;
        } else {
            self.level = value;
            self.seeded = true;
        }
        self.level
    }

    fn forecast(&self, _horizon: u32) -> f64 {
        self.level
    }

    fn reset(&mut self) {
        self.level = f64::NAN;
        self.seeded = false;
    }

    fn ready(&self) -> bool {
        self.seeded
    }
}

/// Holt-Winters double exponential smoothing with separate level and trend
/// factors.
#[derive(Debug, Clone)]
pub struct HoltWinters {
    alpha: f64,
    beta: f64,
    level: f64,
    trend: f64,
    nr_samples: u32,
}

impl HoltWinters {
    pub fn new(alpha: f64, beta: f64) -> Result<Self> {
        if !(alpha >= 0.0 && alpha <= 1.0) || !(beta >= 0.0 && beta <= 1.0) {
            invalid_arg!(
                "holt-winters alpha {} and beta {} must be in [0, 1]",
                alpha,
                beta
            );
        }
        Ok(Self {
            alpha,
            beta,
            level: f64::NAN,
            trend: 0.0,
            nr_samples: 0,
        })
    }

    /// Single parameter variant, `alpha = 1 - (1 - delta)^2` and
    /// `beta = delta^2 / alpha`.
    pub fn with_delta(delta: f64) -> Result<Self> {
        if !(delta > 0.0 && delta <= 1.0) {
            invalid_arg!("holt-winters delta {} not in (0, 1]", delta);
        }
        let alpha = 1.0 - (1.0 - delta) * (1.0 - delta);
        Self::new(alpha, delta * delta / alpha)
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }
}

impl Smoother for HoltWinters {
    fn smooth(&mut self, value: f64) -> f64 {
        match self.nr_samples {
            0 => self.level = value,
            1 => self.trend = value - self.level,
            _ => {
                let prev = self.level;
                self.level = self.alpha * value + (1.0 - self.alpha) * (prev + self.trend);
                self.trend = self.beta * (self.level - prev) + (1.0 - self.beta) * self.trend;
            }
        }
        self.nr_samples = self.nr_samples.saturating_add(1);
        self.level
    }

    fn forecast(&self, horizon: u32) -> f64 {
        self.level + horizon as f64 * self.trend
    }

    fn reset(&mut self) {
        self.level = f64::NAN;
        self.trend = 0.0;
        self.nr_samples = 0;
    }

    fn ready(&self) -> bool {
        self.nr_samples >= 2
    }
}

/// Brown's double exponential smoothing, linear forecast from two cascaded
/// single smoothers.
#[derive(Debug, Clone)]
pub struct BrownDouble {
    alpha: f64,
    s1: f64,
    s2: f64,
    seeded: bool,
}

impl BrownDouble {
    pub fn new(alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha < 1.0) {
            invalid_arg!("brown-double alpha {} not in (0, 1)", alpha);
        }
        Ok(Self {
            alpha,
            s1: f64::NAN,
            s2: f64::NAN,
            seeded: false,
        })
    }

    fn level(&self) -> f64 {
        2.0 * self.s1 - self.s2
    }

    fn trend(&self) -> f64 {
        self.alpha / (1.0 - self.alpha) * (self.s1 - self.s2)
    }
}

impl Smoother for BrownDouble {
    fn smooth(&mut self, value: f64) -> f64 {
        if self.seeded {
            self.s1 = self.alpha * value + (1.0 - self.alpha) * self.s1;
            self.s2 = self.alpha * self.s1 + (1.0 - self.alpha) * self.s2;
        } else {
            self.s1 = value;
            self.s2 = value;
            self.seeded = true;
        }
        self.level()
    }

    fn forecast(&self, horizon: u32) -> f64 {
        self.level() + horizon as f64 * self.trend()
    }

    fn reset(&mut self) {
        self.s1 = f64::NAN;
        self.s2 = f64::NAN;
        self.seeded = false;
    }

    fn ready(&self) -> bool {
        self.seeded
    }
}

pub fn build_smoother(spec: &SmootherSpec) -> Result<Box<dyn Smoother>> {
    let smoother: Box<dyn Smoother> = match spec {
        SmootherSpec::PassThrough => Box::new(PassThrough::new()),
        SmootherSpec::BrownSingle { alpha } => Box::new(BrownSingle::new(*alpha)?),
        SmootherSpec::BrownDouble { alpha } => Box::new(BrownDouble::new(*alpha)?),
        SmootherSpec::HoltWinters { alpha, beta } => Box::new(HoltWinters::new(*alpha, *beta)?),
        SmootherSpec::HoltWintersDelta { delta } => Box::new(HoltWinters::with_delta(*delta)?),
    };
    Ok(smoother)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestbedError;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_brown_single() {
        let _ = ::env_logger::try_init();
        let mut sm = BrownSingle::new(0.5).unwrap();
        assert!(!sm.ready());
        let out: Vec<f64> = [10.0, 20.0, 30.0].iter().map(|v| sm.smooth(*v)).collect();
        println!("brown-single: {:?}", &out);
        assert_eq!(out, vec![10.0, 15.0, 22.5]);
        assert!(sm.ready());
        assert_eq!(sm.forecast(0), 22.5);
        assert_eq!(sm.forecast(5), 22.5);

        sm.reset();
        assert!(!sm.ready());
        assert_eq!(sm.smooth_all(&[4.0, 8.0]), 6.0);
    }

    #[test]
    fn test_pass_through() {
        let _ = ::env_logger::try_init();
        let mut sm = PassThrough::new();
        assert!(!sm.ready());
        assert!(sm.value().is_nan());
        assert_eq!(sm.smooth_all(&[1.0, 7.0, 3.0]), 3.0);
        assert!(sm.ready());
        assert_eq!(sm.forecast(0), 3.0);
        sm.reset();
        assert!(sm.value().is_nan());
    }

    #[test]
    fn test_holt_winters() {
        let _ = ::env_logger::try_init();
        let mut sm = HoltWinters::new(0.5, 0.5).unwrap();
        assert_eq!(sm.smooth(10.0), 10.0);
        assert!(!sm.ready());
        // Second sample only seeds the trend.
        assert_eq!(sm.smooth(12.0), 10.0);
        assert!(sm.ready());
        assert_eq!(sm.forecast(1), 12.0);

        // level = 0.5 * 16 + 0.5 * (10 + 2) = 14, trend = 0.5 * 4 + 0.5 * 2 = 3
        assert_eq!(sm.smooth(16.0), 14.0);
        assert_eq!(sm.forecast(0), 14.0);
        assert_eq!(sm.forecast(2), 20.0);

        let hw = HoltWinters::with_delta(0.5).unwrap();
        assert_close(hw.alpha(), 0.75);
        assert_close(hw.beta(), 1.0 / 3.0);
    }

    #[test]
    fn test_brown_double() {
        let _ = ::env_logger::try_init();
        let mut sm = BrownDouble::new(0.5).unwrap();
        assert_eq!(sm.smooth(10.0), 10.0);
        assert!(sm.ready());
        assert_eq!(sm.forecast(3), 10.0);

        // s1 = 15, s2 = 12.5, a = 17.5, b = 2.5
        assert_eq!(sm.smooth(20.0), 17.5);
        assert_eq!(sm.forecast(0), 17.5);
        assert_eq!(sm.forecast(2), 22.5);
    }

    #[test]
    fn test_forecast_zero_is_last_value() {
        let _ = ::env_logger::try_init();
        let specs = vec![
            SmootherSpec::PassThrough,
            SmootherSpec::BrownSingle { alpha: 0.3 },
            SmootherSpec::BrownDouble { alpha: 0.3 },
            SmootherSpec::HoltWinters {
                alpha: 0.3,
                beta: 0.6,
            },
            SmootherSpec::HoltWintersDelta { delta: 0.2 },
        ];
        for spec in specs.iter() {
            let mut sm = build_smoother(spec).unwrap();
            for v in [3.0, 9.0, 4.0, 11.0, 7.5].iter() {
                let last = sm.smooth(*v);
                assert_eq!(sm.forecast(0), last, "{:?}", spec);
            }
        }
    }

    #[test]
    fn test_invalid_params() {
        let _ = ::env_logger::try_init();
        for spec in vec![
            SmootherSpec::BrownSingle { alpha: 0.0 },
            SmootherSpec::BrownDouble { alpha: 1.0 },
            SmootherSpec::HoltWinters {
                alpha: 1.2,
                beta: 0.1,
            },
            SmootherSpec::HoltWintersDelta { delta: 0.0 },
        ]
        .iter()
        {
            let err = build_smoother(spec).err().unwrap();
            println!("{:?}: {}", spec, &err);
            assert!(matches!(
                err.downcast_ref::<TestbedError>(),
                Some(TestbedError::InvalidArgument(_))
            ));
        }
    }
}
