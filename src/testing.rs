//! Scripted stand-ins for the compressor used by the unit tests.

use crate::connection::{Connector, Error, Transport};
use crate::modbus::Exception;
use crate::registers;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub(crate) enum Failure {
    /// Respond with an exception response carrying this code.
    Exception(u8),
    /// Fail as if the device stopped responding.
    Timeout,
    /// Return one register less than requested.
    Short,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    Read { address: u16, count: u16 },
    Write { address: u16, value: u16 },
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    registers: Mutex<BTreeMap<u16, u16>>,
    failures: Mutex<BTreeMap<u16, Failure>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeTransport {
    /// A device with a plausible identity and a few counters filled in.
    pub(crate) fn compressor() -> Self {
        let fake = Self::default();
        let identity = "SW 1.02.03-rc4SN0012345"
            .chars()
            .map(|c| c as u16)
            .collect::<Vec<_>>();
        fake.set(registers::IDENTITY.address, &identity);
        fake.set(registers::TIMERS.address, &[0x0001, 0x0002, 0, 77, 12, 3, 0, 0]);
        fake.set(registers::ANALOG.address, &[3000, 157]);
        fake
    }

    pub(crate) fn set(&self, address: u16, values: &[u16]) {
        let mut guard = self.registers.lock().unwrap();
        for (address, value) in (address..).zip(values) {
            guard.insert(address, *value);
        }
    }

    pub(crate) fn value(&self, address: u16) -> u16 {
        self.registers.lock().unwrap().get(&address).copied().unwrap_or(0)
    }

    pub(crate) fn fail(&self, address: u16, failure: Failure) {
        self.failures.lock().unwrap().insert(address, failure);
    }

    pub(crate) fn heal(&self, address: u16) {
        self.failures.lock().unwrap().remove(&address);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn reads_of(&self, address: u16) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Read { address: a, .. } if *a == address))
            .count()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn failure(&self, address: u16) -> Option<Failure> {
        self.failures.lock().unwrap().get(&address).copied()
    }
}

impl Transport for FakeTransport {
    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, Error> {
        self.calls.lock().unwrap().push(Call::Read { address, count });
        let values = (address..address + count).map(|a| self.value(a)).collect::<Vec<_>>();
        match self.failure(address) {
            None => Ok(values),
            Some(Failure::Exception(exception_code)) => {
                Err(Error::Exception(Exception { function_code: 3, exception_code }))
            }
            Some(Failure::Timeout) => Err(Error::Timeout(Duration::from_secs(1))),
            Some(Failure::Short) => Ok(values[..values.len().saturating_sub(1)].to_vec()),
        }
    }

    async fn write_register(&self, address: u16, value: u16) -> Result<(), Error> {
        self.calls.lock().unwrap().push(Call::Write { address, value });
        match self.failure(address) {
            None | Some(Failure::Short) => {
                self.set(address, &[value]);
                Ok(())
            }
            Some(Failure::Exception(exception_code)) => {
                Err(Error::Exception(Exception { function_code: 6, exception_code }))
            }
            Some(Failure::Timeout) => Err(Error::Timeout(Duration::from_secs(1))),
        }
    }
}

pub(crate) struct FakeConnector {
    pub(crate) transport: Arc<FakeTransport>,
    pub(crate) refuse: AtomicBool,
    pub(crate) connects: Mutex<Vec<(String, u8)>>,
}

impl FakeConnector {
    pub(crate) fn new(transport: FakeTransport) -> Self {
        Self {
            transport: Arc::new(transport),
            refuse: AtomicBool::new(false),
            connects: Mutex::new(Vec::new()),
        }
    }
}

impl Connector for FakeConnector {
    type Transport = Arc<FakeTransport>;

    async fn connect(&self, host: &str, unit: u8) -> Result<Arc<FakeTransport>, Error> {
        self.connects.lock().unwrap().push((host.to_string(), unit));
        if self.refuse.load(Ordering::SeqCst) {
            let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
            return Err(Error::Connect(refused, host.to_string()));
        }
        Ok(Arc::clone(&self.transport))
    }
}
