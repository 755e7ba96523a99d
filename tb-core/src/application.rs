// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::debug;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tb_intf::AppPerfCategory;

use super::sensor::Sensor;
use super::vm::VmHandle;
use super::TestbedError;

pub type SharedSensor = Arc<Mutex<Box<dyn Sensor>>>;
pub type SloPredicate = Box<dyn Fn(f64) -> bool + Send + Sync>;

static NEXT_APP_ID: AtomicU64 = AtomicU64::new(0);

/// A multi-tier application spread over a set of VMs, with at most one
/// sensor and one SLO predicate per performance category.
pub struct Application {
    id: u64,
    name: String,
    vms: RwLock<Vec<VmHandle>>,
    sensors: RwLock<BTreeMap<AppPerfCategory, SharedSensor>>,
    slos: RwLock<BTreeMap<AppPerfCategory, SloPredicate>>,
}

impl Application {
    pub fn new(name: &str, vms: Vec<VmHandle>) -> Self {
        Self {
            id: NEXT_APP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            vms: RwLock::new(vms),
            sensors: RwLock::new(BTreeMap::new()),
            slos: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_vms(&self) -> usize {
        self.vms.read().unwrap().len()
    }

    pub fn vms(&self) -> Vec<VmHandle> {
        self.vms.read().unwrap().clone()
    }

    pub fn set_vms(&self, vms: Vec<VmHandle>) {
        *self.vms.write().unwrap() = vms;
    }

    /// Replaces the sensor previously registered for `cat`, if any.
    pub fn register_sensor(&self, cat: AppPerfCategory, sensor: Box<dyn Sensor>) {
        debug!("app[{}]: Registering {} sensor", &self.name, cat);
        self.sensors
            .write()
            .unwrap()
            .insert(cat, Arc::new(Mutex::new(sensor)));
    }

    pub fn deregister_sensor(&self, cat: AppPerfCategory) -> Result<()> {
        match self.sensors.write().unwrap().remove(&cat) {
            Some(_) => Ok(()),
            None => Err(TestbedError::UnknownCategory {
                what: "sensor",
                category: cat,
            }
            .into()),
        }
    }

    pub fn sensor(&self, cat: AppPerfCategory) -> Result<SharedSensor> {
        match self.sensors.read().unwrap().get(&cat) {
            Some(v) => Ok(v.clone()),
            None => Err(TestbedError::UnknownCategory {
                what: "sensor",
                category: cat,
            }
            .into()),
        }
    }

    pub fn set_slo<F>(&self, cat: AppPerfCategory, pred: F)
    where
        F: Fn(f64) -> bool + Send + Sync + 'static,
    {
        self.slos.write().unwrap().insert(cat, Box::new(pred));
    }

    /// Whether `value` meets the SLO for `cat`. Categories without an SLO
    /// are always met.
    pub fn slo(&self, cat: AppPerfCategory, value: f64) -> bool {
        match self.slos.read().unwrap().get(&cat) {
            Some(pred) => pred(value),
            None => true,
        }
    }
}
