//! Test doubles shared by the state machine tests.

use crate::device::PowerSequencerDevice;
use crate::rail::Rail;
use crate::Error;
use services::{AdditionalData, Services};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Scriptable sequencer device for state machine tests.
#[derive(Clone, Default)]
pub struct TestDevice {
    pub name: String,
    pub open: Arc<AtomicBool>,
    pub pgood: Arc<AtomicBool>,
    pub fail_power_ops: Arc<AtomicBool>,
    pub power_on_count: Arc<AtomicU32>,
    pub power_off_count: Arc<AtomicU32>,
}

impl TestDevice {
    pub fn new(name: &str, pgood: bool) -> Self {
        Self {
            name: name.to_string(),
            pgood: Arc::new(AtomicBool::new(pgood)),
            ..Default::default()
        }
    }
}

impl PowerSequencerDevice for TestDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn rails(&self) -> &[Rail] {
        &[]
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    fn open(&mut self, _services: &mut dyn Services) -> Result<(), Error> {
        self.open.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::Relaxed);
    }

    fn power_on(&mut self, _services: &mut dyn Services) -> Result<(), Error> {
        if self.fail_power_ops.load(Ordering::Relaxed) {
            return Err(Error::failed("device did not respond"));
        }
        self.power_on_count.fetch_add(1, Ordering::Relaxed);
        self.pgood.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn power_off(&mut self, _services: &mut dyn Services) -> Result<(), Error> {
        if self.fail_power_ops.load(Ordering::Relaxed) {
            return Err(Error::failed("device did not respond"));
        }
        self.power_off_count.fetch_add(1, Ordering::Relaxed);
        self.pgood.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn power_good(&mut self, _services: &mut dyn Services) -> Result<bool, Error> {
        Ok(self.pgood.load(Ordering::Relaxed))
    }

    fn gpio_values(&self, _services: &mut dyn Services) -> Result<Vec<u8>, Error> {
        Ok(vec![])
    }

    fn status_word(&self, _page: u8) -> Result<u16, Error> {
        Ok(0)
    }

    fn status_vout(&self, _page: u8) -> Result<u8, Error> {
        Ok(0)
    }

    fn read_vout(&self, _page: u8) -> Result<f64, Error> {
        Ok(0.0)
    }

    fn vout_uv_fault_limit(&self, _page: u8) -> Result<f64, Error> {
        Ok(0.0)
    }

    fn find_pgood_fault(
        &mut self,
        _services: &mut dyn Services,
        _power_supply_error: &str,
        _additional_data: &mut AdditionalData,
    ) -> Result<String, Error> {
        Ok(String::new())
    }
}
