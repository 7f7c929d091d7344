//! Register writes behind the power and fault reset commands.

use crate::connection::Transport;
use crate::modbus::ModbusError;
use crate::publish::Lifecycle;
use crate::registers::{POWER_OFF, POWER_ON, POWER_REGISTER, RESET_FAULTS, RESET_REGISTER};
use tracing::info;

pub const POWER_ON_FAILED: &str = "Cannot power on compressor";
pub const POWER_OFF_FAILED: &str = "Cannot power off compressor";
pub const RESET_FAILED: &str = "Cannot reset compressor";

#[derive(strum::Display, strum::EnumString, Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
#[strum(serialize_all = "kebab-case")]
pub enum Command {
    PowerOn,
    PowerOff,
    Reset,
}

pub struct Controller<T, L> {
    transport: T,
    lifecycle: L,
}

impl<T: Transport, L: Lifecycle> Controller<T, L> {
    pub fn new(transport: T, lifecycle: L) -> Self {
        Self { transport, lifecycle }
    }

    pub fn into_parts(self) -> (T, L) {
        (self.transport, self.lifecycle)
    }

    async fn write(&self, what: &'static str, address: u16, value: u16) -> Result<(), ModbusError> {
        self.transport
            .write_register(address, value)
            .await
            .map_err(|e| ModbusError::new(what, address, e))?;
        info!(message = "register written", address, value);
        Ok(())
    }

    pub async fn power_on(&self) -> Result<(), ModbusError> {
        self.write(POWER_ON_FAILED, POWER_REGISTER, POWER_ON).await
    }

    /// Stop the compressor. Stopping the poll loop is up to the caller.
    pub async fn power_off(&self) -> Result<(), ModbusError> {
        self.write(POWER_OFF_FAILED, POWER_REGISTER, POWER_OFF).await
    }

    /// Acknowledge latched faults. A failure is also reported to the lifecycle as a fault.
    pub async fn reset_faults(&self) -> Result<(), ModbusError> {
        let result = self.write(RESET_FAILED, RESET_REGISTER, RESET_FAULTS).await;
        if let Err(e) = &result {
            self.lifecycle.report_fault(&e.to_string());
        }
        result
    }

    pub async fn execute(&self, command: Command) -> Result<(), ModbusError> {
        match command {
            Command::PowerOn => self.power_on().await,
            Command::PowerOff => self.power_off().await,
            Command::Reset => self.reset_faults().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::ModbusErrorKind;
    use crate::publish::{self, EventKind};
    use crate::testing::{Call, Failure, FakeTransport};
    use std::sync::Arc;

    #[tokio::test]
    async fn commands_write_their_registers() {
        let fake = Arc::new(FakeTransport::default());
        let (sender, _receiver) = publish::channel();
        let controller = Controller::new(Arc::clone(&fake), sender);
        controller.power_on().await.unwrap();
        controller.power_off().await.unwrap();
        controller.execute(Command::Reset).await.unwrap();
        assert_eq!(
            fake.calls(),
            [
                Call::Write { address: 0x12B, value: 0xFF01 },
                Call::Write { address: 0x12B, value: 0xFF00 },
                Call::Write { address: 0x12D, value: 0xFF01 },
            ]
        );
    }

    #[tokio::test]
    async fn write_exceptions_are_write_classified() {
        let fake = Arc::new(FakeTransport::default());
        fake.fail(POWER_REGISTER, Failure::Exception(3));
        let (sender, mut receiver) = publish::channel();
        let controller = Controller::new(Arc::clone(&fake), sender);
        let error = controller.power_on().await.unwrap_err();
        assert_eq!(error.kind(), ModbusErrorKind::Write);
        assert_eq!(error.address, POWER_REGISTER);
        assert_eq!(
            error.to_string(),
            "Cannot power on compressor: cannot write register address 0x012b: illegal data \
             value (exception code 3)"
        );
        // Only a failed reset is a fault.
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_reset_reports_a_fault() {
        let fake = Arc::new(FakeTransport::default());
        fake.fail(RESET_REGISTER, Failure::Timeout);
        let (sender, mut receiver) = publish::channel();
        let controller = Controller::new(Arc::clone(&fake), sender);
        let error = controller.reset_faults().await.unwrap_err();
        assert_eq!(error.kind(), ModbusErrorKind::Transport);
        let event = receiver.try_recv().unwrap();
        assert_eq!(
            event.kind,
            EventKind::Fault("Cannot reset compressor: request for address 0x012d failed".into())
        );
    }

    #[test]
    fn command_names() {
        assert_eq!(Command::PowerOn.to_string(), "power-on");
        assert_eq!("reset".parse::<Command>().unwrap(), Command::Reset);
    }
}
