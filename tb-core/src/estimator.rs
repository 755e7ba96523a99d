// Copyright (c) Facebook, Inc. and its affiliates.

//! Summary statistics over the observations collected during a control
//! interval.
use anyhow::Result;
use quantiles::ckms::CKMS;
use tb_intf::EstimatorSpec;

const CKMS_ERROR: f64 = 0.001;

pub trait Estimator: Send {
    fn collect(&mut self, value: f64);

    /// Current estimate, NaN if nothing has been collected.
    fn estimate(&mut self) -> f64;

    fn reset(&mut self);

    /// Number of values collected since the last reset.
    fn count(&self) -> usize;

    fn collect_all(&mut self, values: &[f64]) {
        for v in values.iter() {
            self.collect(*v);
        }
    }
}

fn check_prob(prob: f64) -> Result<()> {
    if !(prob >= 0.0 && prob <= 1.0) {
        invalid_arg!("quantile probability {} not in [0, 1]", prob);
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct MostRecent {
    last: Option<f64>,
    count: usize,
}

impl Estimator for MostRecent {
    fn collect(&mut self, value: f64) {
        self.last = Some(value);
        self.count += 1;
    }

    fn estimate(&mut self) -> f64 {
        self.last.unwrap_or(f64::NAN)
    }

    fn reset(&mut self) {
        self.last = None;
        self.count = 0;
    }

    fn count(&self) -> usize {
        self.count
    }
}

#[derive(Debug, Clone, Default)]
pub struct Mean {
    sum: f64,
    count: usize,
}

impl Estimator for Mean {
    fn collect(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn estimate(&mut self) -> f64 {
        match self.count {
            0 => f64::NAN,
            n => self.sum / n as f64,
        }
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }

    fn count(&self) -> usize {
        self.count
    }
}

/// Streaming quantile over everything collected since the last reset.
pub struct Quantile {
    prob: f64,
    ckms: CKMS<f64>,
    count: usize,
}

impl Quantile {
    pub fn new(prob: f64) -> Result<Self> {
        check_prob(prob)?;
        Ok(Self {
            prob,
            ckms: CKMS::<f64>::new(CKMS_ERROR),
            count: 0,
        })
    }
}

impl Estimator for Quantile {
    fn collect(&mut self, value: f64) {
        self.ckms.insert(value);
        self.count += 1;
    }

    fn estimate(&mut self) -> f64 {
        match self.ckms.query(self.prob) {
            Some((_, v)) => v,
            None => f64::NAN,
        }
    }

    fn reset(&mut self) {
        self.ckms = CKMS::<f64>::new(CKMS_ERROR);
        self.count = 0;
    }

    fn count(&self) -> usize {
        self.count
    }
}

/// Exponentially weighted moving average of per-batch quantiles. Values
/// collected between two `estimate()` calls form a batch whose
/// `prob`-quantile is folded into the average with weight `1 - alpha`.
pub struct EwmaQuantile {
    prob: f64,
    alpha: f64,
    batch: Vec<f64>,
    ewma: Option<f64>,
    count: usize,
}

impl EwmaQuantile {
    pub fn new(prob: f64, alpha: f64) -> Result<Self> {
        check_prob(prob)?;
        if !(alpha >= 0.0 && alpha <= 1.0) {
            invalid_arg!("ewma alpha {} not in [0, 1]", alpha);
        }
        Ok(Self {
            prob,
            alpha,
            batch: vec![],
            ewma: None,
            count: 0,
        })
    }

    fn batch_quantile(&mut self) -> f64 {
        let n = self.batch.len();
        let idx = ((self.prob * n as f64).ceil() as usize).max(1).min(n);
        self.batch
            .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.batch[idx - 1]
    }
}

impl Estimator for EwmaQuantile {
    fn collect(&mut self, value: f64) {
        self.batch.push(value);
        self.count += 1;
    }

    fn estimate(&mut self) -> f64 {
        if self.batch.len() > 0 {
            let q = self.batch_quantile();
            self.ewma = Some(match self.ewma {
                Some(ewma) => self.alpha * ewma + (1.0 - self.alpha) * q,
                None => q,
            });
            self.batch.clear();
        }
        self.ewma.unwrap_or(f64::NAN)
    }

    fn reset(&mut self) {
        self.batch.clear();
        self.ewma = None;
        self.count = 0;
    }

    fn count(&self) -> usize {
        self.count
    }
}

pub fn build_estimator(spec: &EstimatorSpec) -> Result<Box<dyn Estimator>> {
    let estimator: Box<dyn Estimator> = match spec {
        EstimatorSpec::MostRecent => Box::new(MostRecent::default()),
        EstimatorSpec::Mean => Box::new(Mean::default()),
        EstimatorSpec::Quantile { prob } => Box::new(Quantile::new(*prob)?),
        EstimatorSpec::EwmaQuantile { prob, alpha } => Box::new(EwmaQuantile::new(*prob, *alpha)?),
    };
    Ok(estimator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_estimators() {
        let _ = ::env_logger::try_init();
        let mut mr = MostRecent::default();
        let mut mean = Mean::default();
        assert!(mr.estimate().is_nan());
        assert!(mean.estimate().is_nan());

        for est in [&mut mr as &mut dyn Estimator, &mut mean].iter_mut() {
            est.collect_all(&[2.0, 4.0, 9.0]);
            assert_eq!(est.count(), 3);
        }
        assert_eq!(mr.estimate(), 9.0);
        assert_eq!(mean.estimate(), 5.0);

        mean.reset();
        assert_eq!(mean.count(), 0);
        assert!(mean.estimate().is_nan());
    }

    #[test]
    fn test_quantile() {
        let _ = ::env_logger::try_init();
        let mut q = Quantile::new(0.9).unwrap();
        assert!(q.estimate().is_nan());
        for i in 1..=1000 {
            q.collect(i as f64);
        }
        let p90 = q.estimate();
        println!("p90={}", p90);
        assert!(p90 >= 895.0 && p90 <= 905.0);

        q.reset();
        assert_eq!(q.count(), 0);
        assert!(q.estimate().is_nan());
        assert!(Quantile::new(1.5).is_err());
    }

    #[test]
    fn test_ewma_quantile() {
        let _ = ::env_logger::try_init();
        let mut q = EwmaQuantile::new(0.5, 0.5).unwrap();
        assert!(q.estimate().is_nan());

        // ceil(0.5 * 4) = 2nd smallest
        q.collect_all(&[40.0, 10.0, 30.0, 20.0]);
        assert_eq!(q.estimate(), 20.0);

        // No new data, estimate stays.
        assert_eq!(q.estimate(), 20.0);

        q.collect_all(&[60.0, 60.0]);
        assert_eq!(q.estimate(), 40.0);
        assert_eq!(q.count(), 6);

        q.reset();
        assert!(q.estimate().is_nan());

        let mut q0 = EwmaQuantile::new(0.0, 0.7).unwrap();
        q0.collect_all(&[3.0, 1.0]);
        assert_eq!(q0.estimate(), 1.0);
        assert!(EwmaQuantile::new(0.5, -0.1).is_err());
    }
}
