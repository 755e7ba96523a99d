// Copyright (c) Facebook, Inc. and its affiliates.

//! Virtual machines, the managers hosting them and the registry tying them
//! together.
//!
//! VM handles are shared between the application they belong to and the
//! manager controlling it, so all setters take `&self`. Allocations are
//! fractions: shares and caps of CPU are relative to the VM's vCPUs, memory
//! ones to its maximum memory.
use anyhow::Result;
use log::debug;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tb_intf::{VmSpec, VmmSpec};

use super::TestbedError;

pub trait VirtualMachine: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn vmm_id(&self) -> &str;
    fn num_vcpus(&self) -> u32;

    fn cpu_cap(&self) -> Result<f64>;
    fn set_cpu_cap(&self, v: f64) -> Result<()>;
    fn cpu_share(&self) -> Result<f64>;
    fn set_cpu_share(&self, v: f64) -> Result<()>;
    fn memory_cap(&self) -> Result<f64>;
    fn set_memory_cap(&self, v: f64) -> Result<()>;
    fn memory_share(&self) -> Result<f64>;
    fn set_memory_share(&self, v: f64) -> Result<()>;
}

pub type VmHandle = Arc<dyn VirtualMachine>;

impl fmt::Debug for dyn VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}({})", self.vmm_id(), self.id(), self.name())
    }
}

pub trait VmManager: Send + Sync {
    fn id(&self) -> &str;
    fn hostname(&self) -> &str;
    fn alive(&self) -> bool;
    fn max_supported_num_vcpus(&self) -> u32;
    fn vm(&self, id: &str) -> Result<VmHandle>;
}

/// Lookup table of VM managers by id. Built once at startup and passed to
/// whoever needs to resolve VM references.
#[derive(Default)]
pub struct Registry {
    vmms: BTreeMap<String, Arc<dyn VmManager>>,
}

impl Registry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_vmm(&mut self, vmm: Arc<dyn VmManager>) -> Result<()> {
        let id = vmm.id().to_string();
        if self.vmms.contains_key(&id) {
            invalid_arg!("VM manager {:?} already registered", &id);
        }
        debug!("registry: Adding VM manager {:?} on {:?}", &id, vmm.hostname());
        self.vmms.insert(id, vmm);
        Ok(())
    }

    pub fn exists_vmm(&self, id: &str) -> bool {
        self.vmms.contains_key(id)
    }

    pub fn vmm(&self, id: &str) -> Result<Arc<dyn VmManager>> {
        match self.vmms.get(id) {
            Some(vmm) => Ok(vmm.clone()),
            None => Err(TestbedError::UnknownVmm(id.to_string()).into()),
        }
    }

    pub fn vm(&self, vmm_id: &str, vm_id: &str) -> Result<VmHandle> {
        self.vmm(vmm_id)?.vm(vm_id)
    }
}

#[derive(Debug, Clone)]
struct SimAllocs {
    cpu_cap: f64,
    cpu_share: f64,
    memory_cap: f64,
    memory_share: f64,
}

/// In-memory VM. Allocations are only recorded.
#[derive(Debug)]
pub struct SimVm {
    id: String,
    name: String,
    vmm_id: String,
    vcpus: u32,
    allocs: Mutex<SimAllocs>,
}

fn check_frac(what: &str, vm: &SimVm, v: f64) -> Result<()> {
    if !(v >= 0.0 && v <= 1.0) {
        invalid_arg!("{}/{}: {} {} not in [0, 1]", &vm.vmm_id, &vm.id, what, v);
    }
    Ok(())
}

impl SimVm {
    fn new(vmm_id: &str, spec: &VmSpec) -> Result<Self> {
        let vm = Self {
            id: spec.id.clone(),
            name: match spec.name.len() {
                0 => spec.id.clone(),
                _ => spec.name.clone(),
            },
            vmm_id: vmm_id.to_string(),
            vcpus: spec.vcpus,
            allocs: Mutex::new(SimAllocs {
                cpu_cap: spec.cpu_cap,
                cpu_share: spec.cpu_share,
                memory_cap: spec.memory_cap,
                memory_share: spec.memory_share,
            }),
        };
        check_frac("cpu_cap", &vm, spec.cpu_cap)?;
        check_frac("cpu_share", &vm, spec.cpu_share)?;
        check_frac("memory_cap", &vm, spec.memory_cap)?;
        check_frac("memory_share", &vm, spec.memory_share)?;
        Ok(vm)
    }

    fn update(&self, what: &str, v: f64, field: impl FnOnce(&mut SimAllocs) -> &mut f64) -> Result<()> {
        check_frac(what, self, v)?;
        let mut allocs = self.allocs.lock().unwrap();
        let slot = field(&mut allocs);
        debug!(
            "sim-vm: {}/{} {} {:.3} -> {:.3}",
            &self.vmm_id, &self.id, what, *slot, v
        );
        *slot = v;
        Ok(())
    }
}

impl VirtualMachine for SimVm {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn vmm_id(&self) -> &str {
        &self.vmm_id
    }

    fn num_vcpus(&self) -> u32 {
        self.vcpus
    }

    fn cpu_cap(&self) -> Result<f64> {
        Ok(self.allocs.lock().unwrap().cpu_cap)
    }

    fn set_cpu_cap(&self, v: f64) -> Result<()> {
        self.update("cpu_cap", v, |a| &mut a.cpu_cap)
    }

    fn cpu_share(&self) -> Result<f64> {
        Ok(self.allocs.lock().unwrap().cpu_share)
    }

    fn set_cpu_share(&self, v: f64) -> Result<()> {
        self.update("cpu_share", v, |a| &mut a.cpu_share)
    }

    fn memory_cap(&self) -> Result<f64> {
        Ok(self.allocs.lock().unwrap().memory_cap)
    }

    fn set_memory_cap(&self, v: f64) -> Result<()> {
        self.update("memory_cap", v, |a| &mut a.memory_cap)
    }

    fn memory_share(&self) -> Result<f64> {
        Ok(self.allocs.lock().unwrap().memory_share)
    }

    fn set_memory_share(&self, v: f64) -> Result<()> {
        self.update("memory_share", v, |a| &mut a.memory_share)
    }
}

/// VM manager whose VMs live in memory. Used for dry runs and tests.
pub struct SimVmManager {
    id: String,
    hostname: String,
    max_vcpus: u32,
    vms: BTreeMap<String, Arc<SimVm>>,
}

impl SimVmManager {
    pub fn new(id: &str, hostname: &str, max_vcpus: u32) -> Self {
        Self {
            id: id.to_string(),
            hostname: hostname.to_string(),
            max_vcpus,
            vms: BTreeMap::new(),
        }
    }

    pub fn from_spec(spec: &VmmSpec) -> Result<Self> {
        let mut vmm = Self::new(&spec.id, &spec.hostname, spec.max_vcpus);
        for vm in spec.vms.iter() {
            vmm.add_vm(vm)?;
        }
        Ok(vmm)
    }

    pub fn add_vm(&mut self, spec: &VmSpec) -> Result<()> {
        if spec.vcpus == 0 || spec.vcpus > self.max_vcpus {
            invalid_arg!(
                "{}/{}: vcpus {} not in [1, {}]",
                &self.id,
                &spec.id,
                spec.vcpus,
                self.max_vcpus
            );
        }
        if self.vms.contains_key(&spec.id) {
            invalid_arg!("{}/{}: duplicate VM", &self.id, &spec.id);
        }
        let vm = SimVm::new(&self.id, spec)?;
        self.vms.insert(spec.id.clone(), Arc::new(vm));
        Ok(())
    }
}

impl VmManager for SimVmManager {
    fn id(&self) -> &str {
        &self.id
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn alive(&self) -> bool {
        true
    }

    fn max_supported_num_vcpus(&self) -> u32 {
        self.max_vcpus
    }

    fn vm(&self, id: &str) -> Result<VmHandle> {
        match self.vms.get(id) {
            Some(vm) => Ok(vm.clone()),
            None => Err(TestbedError::UnknownVm {
                vmm: self.id.clone(),
                vm: id.to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sim_registry(nr_vms: usize) -> Registry {
        let mut vmm = SimVmManager::new("sim", "localhost", 4);
        for i in 0..nr_vms {
            vmm.add_vm(&VmSpec {
                id: format!("vm{}", i),
                vcpus: 2,
                ..Default::default()
            })
            .unwrap();
        }
        let mut reg = Registry::new();
        reg.add_vmm(Arc::new(vmm)).unwrap();
        reg
    }

    #[test]
    fn test_registry_lookup() {
        let _ = ::env_logger::try_init();
        let mut reg = sim_registry(2);
        assert!(reg.exists_vmm("sim"));
        assert!(!reg.exists_vmm("kvm"));

        let vmm = reg.vmm("sim").unwrap();
        assert!(vmm.alive());
        assert_eq!(vmm.max_supported_num_vcpus(), 4);
        assert_eq!(vmm.hostname(), "localhost");

        let vm = reg.vm("sim", "vm1").unwrap();
        assert_eq!(vm.id(), "vm1");
        assert_eq!(vm.name(), "vm1");
        assert_eq!(vm.vmm_id(), "sim");
        assert_eq!(vm.num_vcpus(), 2);

        let err = reg.vmm("kvm").err().unwrap();
        assert!(matches!(
            err.downcast_ref::<TestbedError>(),
            Some(TestbedError::UnknownVmm(_))
        ));
        let err = reg.vm("sim", "vm9").err().unwrap();
        println!("{}", &err);
        assert!(matches!(
            err.downcast_ref::<TestbedError>(),
            Some(TestbedError::UnknownVm { .. })
        ));

        assert!(reg
            .add_vmm(Arc::new(SimVmManager::new("sim", "other", 1)))
            .is_err());
    }

    #[test]
    fn test_sim_allocations() {
        let _ = ::env_logger::try_init();
        let reg = sim_registry(1);
        let vm = reg.vm("sim", "vm0").unwrap();
        let same = reg.vm("sim", "vm0").unwrap();

        assert_eq!(vm.cpu_share().unwrap(), 1.0);
        vm.set_cpu_share(0.25).unwrap();
        vm.set_cpu_cap(0.5).unwrap();
        vm.set_memory_cap(0.75).unwrap();
        vm.set_memory_share(0.125).unwrap();
        assert_eq!(same.cpu_share().unwrap(), 0.25);
        assert_eq!(same.cpu_cap().unwrap(), 0.5);
        assert_eq!(same.memory_cap().unwrap(), 0.75);
        assert_eq!(same.memory_share().unwrap(), 0.125);

        assert!(vm.set_cpu_share(1.5).is_err());
        assert!(vm.set_memory_cap(-0.1).is_err());
        assert!(vm.set_cpu_cap(f64::NAN).is_err());
        assert_eq!(vm.cpu_share().unwrap(), 0.25);
    }

    #[test]
    fn test_sim_vmm_from_spec() {
        let _ = ::env_logger::try_init();
        let spec = VmmSpec {
            id: "sim".into(),
            hostname: "host0".into(),
            max_vcpus: 2,
            vms: vec![
                VmSpec {
                    id: "a".into(),
                    name: "web".into(),
                    ..Default::default()
                },
                VmSpec {
                    id: "b".into(),
                    vcpus: 3,
                    ..Default::default()
                },
            ],
        };
        assert!(SimVmManager::from_spec(&spec).is_err());

        let mut spec = spec;
        spec.vms.truncate(1);
        let vmm = SimVmManager::from_spec(&spec).unwrap();
        assert_eq!(vmm.vm("a").unwrap().name(), "web");
    }
}
