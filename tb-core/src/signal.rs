// Copyright (c) Facebook, Inc. and its affiliates.

//! Excitation signals for system identification.
//!
//! Every `generate()` call returns one value per controlled VM. All the
//! vectors a generator is built from must have the same length. Generated
//! values are clamped into `[lower_bound, upper_bound]`, which default to
//! the whole real line.
use anyhow::Result;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};
use std::f64::consts::PI;
use tb_intf::SignalSpec;

pub trait SignalGenerator: Send {
    fn generate(&mut self) -> Vec<f64>;
    fn reset(&mut self);
    fn set_upper_bound(&mut self, v: f64) -> Result<()>;
    fn set_lower_bound(&mut self, v: f64) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Bounds {
    lower: f64,
    upper: f64,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }
}

impl Bounds {
    fn set_upper(&mut self, v: f64) -> Result<()> {
        if v.is_nan() || v < self.lower {
            invalid_arg!("upper bound {} below lower bound {}", v, self.lower);
        }
        self.upper = v;
        Ok(())
    }

    fn set_lower(&mut self, v: f64) -> Result<()> {
        if v.is_nan() || v > self.upper {
            invalid_arg!("lower bound {} above upper bound {}", v, self.upper);
        }
        self.lower = v;
        Ok(())
    }

    fn clamp(&self, mut u: Vec<f64>) -> Vec<f64> {
        for v in u.iter_mut() {
            *v = v.max(self.lower).min(self.upper);
        }
        u
    }
}

fn check_sizes(what: &str, lens: &[usize]) -> Result<()> {
    if lens[0] == 0 {
        invalid_arg!("{}: empty signal", what);
    }
    if lens.iter().any(|len| *len != lens[0]) {
        invalid_arg!("{}: vector sizes differ {:?}", what, lens);
    }
    Ok(())
}

fn rng_from_seed(seed: Option<u64>) -> SmallRng {
    match seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    }
}

/// Always the same values. Bounds aren't applied but validated against the
/// values instead.
pub struct Constant {
    values: Vec<f64>,
}

impl Constant {
    pub fn new(values: Vec<f64>) -> Result<Self> {
        check_sizes("constant", &[values.len()])?;
        Ok(Self { values })
    }
}

impl SignalGenerator for Constant {
    fn generate(&mut self) -> Vec<f64> {
        self.values.clone()
    }

    fn reset(&mut self) {}

    fn set_upper_bound(&mut self, v: f64) -> Result<()> {
        if self.values.iter().any(|u| *u > v) {
            invalid_arg!("constant: upper bound {} below {:?}", v, &self.values);
        }
        Ok(())
    }

    fn set_lower_bound(&mut self, v: f64) -> Result<()> {
        if self.values.iter().any(|u| *u < v) {
            invalid_arg!("constant: lower bound {} above {:?}", v, &self.values);
        }
        Ok(())
    }
}

/// Alternates between `low` and `high`, starting with `low`.
pub struct Square {
    low: Vec<f64>,
    high: Vec<f64>,
    next_high: bool,
    bounds: Bounds,
}

impl Square {
    pub fn new(low: Vec<f64>, high: Vec<f64>) -> Result<Self> {
        check_sizes("square", &[low.len(), high.len()])?;
        Ok(Self {
            low,
            high,
            next_high: false,
            bounds: Default::default(),
        })
    }
}

impl SignalGenerator for Square {
    fn generate(&mut self) -> Vec<f64> {
        let u = match self.next_high {
            true => self.high.clone(),
            false => self.low.clone(),
        };
        self.next_high = !self.next_high;
        self.bounds.clamp(u)
    }

    fn reset(&mut self) {
        self.next_high = false;
    }

    fn set_upper_bound(&mut self, v: f64) -> Result<()> {
        self.bounds.set_upper(v)
    }

    fn set_lower_bound(&mut self, v: f64) -> Result<()> {
        self.bounds.set_lower(v)
    }
}

/// Ramps from `low` by `incr` per step and wraps back to `low` once past
/// `high`.
pub struct Sawtooth {
    low: Vec<f64>,
    high: Vec<f64>,
    incr: Vec<f64>,
    u: Vec<f64>,
    bounds: Bounds,
}

impl Sawtooth {
    pub fn new(low: Vec<f64>, high: Vec<f64>, incr: Vec<f64>) -> Result<Self> {
        check_sizes("sawtooth", &[low.len(), high.len(), incr.len()])?;
        for i in 0..low.len() {
            if low[i] > high[i] || !(incr[i] > 0.0) {
                invalid_arg!(
                    "sawtooth: component {} needs low <= high and incr > 0 ({}, {}, {})",
                    i,
                    low[i],
                    high[i],
                    incr[i]
                );
            }
        }
        Ok(Self {
            u: low.clone(),
            low,
            high,
            incr,
            bounds: Default::default(),
        })
    }
}

impl SignalGenerator for Sawtooth {
    fn generate(&mut self) -> Vec<f64> {
        for i in 0..self.u.len() {
            self.u[i] += self.incr[i];
            if self.u[i] > self.high[i] {
                self.u[i] = self.low[i];
            }
        }
        self.bounds.clamp(self.u.clone())
    }

    fn reset(&mut self) {
        self.u = self.low.clone();
    }

    fn set_upper_bound(&mut self, v: f64) -> Result<()> {
        self.bounds.set_upper(v)
    }

    fn set_lower_bound(&mut self, v: f64) -> Result<()> {
        self.bounds.set_lower(v)
    }
}

/// `u[i] = amplitude[i] * sin(2π (k[i] + phase[i]) / period[i]) + offset[i]`
/// where `k[i]` counts steps. In mesh mode only one component advances at a
/// time and the next one takes over after a full period.
pub struct Sinusoidal {
    amplitude: Vec<f64>,
    period: Vec<u64>,
    phase: Vec<u64>,
    offset: Vec<f64>,
    k: Vec<u64>,
    mesh: bool,
    cur: usize,
    bounds: Bounds,
}

impl Sinusoidal {
    fn new_internal(
        amplitude: Vec<f64>,
        period: Vec<u64>,
        phase: Vec<u64>,
        offset: Vec<f64>,
        mesh: bool,
    ) -> Result<Self> {
        check_sizes(
            "sinusoidal",
            &[amplitude.len(), period.len(), phase.len(), offset.len()],
        )?;
        if period.iter().any(|p| *p == 0) {
            invalid_arg!("sinusoidal: zero period in {:?}", &period);
        }
        Ok(Self {
            k: vec![0; amplitude.len()],
            amplitude,
            period,
            phase,
            offset,
            mesh,
            cur: 0,
            bounds: Default::default(),
        })
    }

    pub fn new(
        amplitude: Vec<f64>,
        period: Vec<u64>,
        phase: Vec<u64>,
        offset: Vec<f64>,
    ) -> Result<Self> {
        Self::new_internal(amplitude, period, phase, offset, false)
    }

    pub fn new_mesh(
        amplitude: Vec<f64>,
        period: Vec<u64>,
        phase: Vec<u64>,
        offset: Vec<f64>,
    ) -> Result<Self> {
        Self::new_internal(amplitude, period, phase, offset, true)
    }
}

impl SignalGenerator for Sinusoidal {
    fn generate(&mut self) -> Vec<f64> {
        let n = self.amplitude.len();
        if self.mesh && self.k[self.cur] == self.period[self.cur] {
            self.k[self.cur] = 0;
            self.cur = (self.cur + 1) % n;
        }

        let mut u = Vec::with_capacity(n);
        for i in 0..n {
            let x = 2.0 * PI * (self.k[i] + self.phase[i]) as f64 / self.period[i] as f64;
            u.push(self.amplitude[i] * x.sin() + self.offset[i]);
            if !self.mesh || i == self.cur {
                self.k[i] += 1;
            }
        }
        self.bounds.clamp(u)
    }

    fn reset(&mut self) {
        for k in self.k.iter_mut() {
            *k = 0;
        }
        self.cur = 0;
    }

    fn set_upper_bound(&mut self, v: f64) -> Result<()> {
        self.bounds.set_upper(v)
    }

    fn set_lower_bound(&mut self, v: f64) -> Result<()> {
        self.bounds.set_lower(v)
    }
}

/// Independent uniform draws from `[min[i], max[i]]`.
pub struct UniformNoise {
    dists: Vec<Uniform<f64>>,
    seed: Option<u64>,
    rng: SmallRng,
    bounds: Bounds,
}

impl UniformNoise {
    pub fn new(min: Vec<f64>, max: Vec<f64>, seed: Option<u64>) -> Result<Self> {
        check_sizes("uniform", &[min.len(), max.len()])?;
        let mut dists = vec![];
        for (lo, hi) in min.iter().zip(max.iter()) {
            if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
                invalid_arg!("uniform: invalid range [{}, {}]", lo, hi);
            }
            dists.push(Uniform::new_inclusive(*lo, *hi));
        }
        Ok(Self {
            dists,
            seed,
            rng: rng_from_seed(seed),
            bounds: Default::default(),
        })
    }
}

impl SignalGenerator for UniformNoise {
    fn generate(&mut self) -> Vec<f64> {
        let rng = &mut self.rng;
        let u = self.dists.iter().map(|d| d.sample(rng)).collect();
        self.bounds.clamp(u)
    }

    fn reset(&mut self) {
        self.rng = rng_from_seed(self.seed);
    }

    fn set_upper_bound(&mut self, v: f64) -> Result<()> {
        self.bounds.set_upper(v)
    }

    fn set_lower_bound(&mut self, v: f64) -> Result<()> {
        self.bounds.set_lower(v)
    }
}

/// Independent normal draws with `mean[i]` and standard deviation `sd[i]`.
pub struct GaussianNoise {
    dists: Vec<Normal<f64>>,
    seed: Option<u64>,
    rng: SmallRng,
    bounds: Bounds,
}

impl GaussianNoise {
    pub fn new(mean: Vec<f64>, sd: Vec<f64>, seed: Option<u64>) -> Result<Self> {
        check_sizes("gaussian", &[mean.len(), sd.len()])?;
        let mut dists = vec![];
        for (m, s) in mean.iter().zip(sd.iter()) {
            match Normal::new(*m, *s) {
                Ok(v) => dists.push(v),
                Err(e) => invalid_arg!("gaussian: mean {} sd {} ({})", m, s, &e),
            }
        }
        Ok(Self {
            dists,
            seed,
            rng: rng_from_seed(seed),
            bounds: Default::default(),
        })
    }
}

impl SignalGenerator for GaussianNoise {
    fn generate(&mut self) -> Vec<f64> {
        let rng = &mut self.rng;
        let u = self.dists.iter().map(|d| d.sample(rng)).collect();
        self.bounds.clamp(u)
    }

    fn reset(&mut self) {
        self.rng = rng_from_seed(self.seed);
    }

    fn set_upper_bound(&mut self, v: f64) -> Result<()> {
        self.bounds.set_upper(v)
    }

    fn set_lower_bound(&mut self, v: f64) -> Result<()> {
        self.bounds.set_lower(v)
    }
}

pub fn build_signal(spec: &SignalSpec, seed: Option<u64>) -> Result<Box<dyn SignalGenerator>> {
    let sig: Box<dyn SignalGenerator> = match spec.clone() {
        SignalSpec::Constant { values } => Box::new(Constant::new(values)?),
        SignalSpec::Square { low, high } => Box::new(Square::new(low, high)?),
        SignalSpec::Sawtooth { low, high, incr } => Box::new(Sawtooth::new(low, high, incr)?),
        SignalSpec::Sinusoidal {
            amplitude,
            period,
            phase,
            offset,
        } => Box::new(Sinusoidal::new(amplitude, period, phase, offset)?),
        SignalSpec::SinusoidalMesh {
            amplitude,
            period,
            phase,
            offset,
        } => Box::new(Sinusoidal::new_mesh(amplitude, period, phase, offset)?),
        SignalSpec::Uniform { min, max } => Box::new(UniformNoise::new(min, max, seed)?),
        SignalSpec::Gaussian { mean, sd } => Box::new(GaussianNoise::new(mean, sd, seed)?),
    };
    Ok(sig)
}
