//! One read operation per register group, decoding and publishing the result.
//!
//! An operation either publishes every record it is responsible for, or fails without publishing
//! anything.

use crate::bitfield::{self, BitFields};
use crate::connection::Transport;
use crate::modbus::{MAX_READ_COUNT, ModbusError};
use crate::publish::Publisher;
use crate::records::{self, AnalogTelemetry, CompressorIdentity, Record, TimerInfo};
use crate::registers::{
    self, ANALOG, ANALOG_FIELDS, ERROR_FIELDS, ERRORS_WARNINGS, IDENTITY, RegisterGroup, STATUS,
    STATUS_FIELDS, TIMERS, WARNING_FIELDS, WATER_LEVEL,
};
use tracing::trace;

pub const READ_STATUS: &str = "Cannot read status";
pub const READ_ERRORS_AND_WARNINGS: &str = "Cannot read errors and warnings";
pub const READ_ANALOG_DATA: &str = "Cannot read telemetry";
pub const READ_TIMERS: &str = "Cannot read timers";
pub const READ_IDENTITY: &str = "Cannot read compressor version";

const _ASSERT_GROUPS_FIT_ONE_READ: () = const {
    let groups = registers::GROUPS;
    let mut idx = 0;
    while idx < groups.len() {
        assert!(groups[idx].count <= MAX_READ_COUNT, "group needs more than one read request");
        idx += 1;
    }
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Modbus(#[from] ModbusError),
    #[error(
        "{what}: expected {expected} registers starting at 0x{address:04x}, received {received}"
    )]
    ShortResponse { what: &'static str, address: u16, expected: u16, received: usize },
}

impl Error {
    pub fn as_modbus(&self) -> Option<&ModbusError> {
        match self {
            Error::Modbus(e) => Some(e),
            Error::ShortResponse { .. } => None,
        }
    }
}

fn short(what: &'static str, group: RegisterGroup, received: usize) -> Error {
    Error::ShortResponse { what, address: group.address, expected: group.count, received }
}

pub struct TelemetryReader<T, P> {
    transport: T,
    publisher: P,
}

impl<T: Transport, P: Publisher> TelemetryReader<T, P> {
    pub fn new(transport: T, publisher: P) -> Self {
        Self { transport, publisher }
    }

    pub fn into_parts(self) -> (T, P) {
        (self.transport, self.publisher)
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    async fn read_group(&self, what: &'static str, group: RegisterGroup) -> Result<Vec<u16>, Error> {
        let values = self
            .transport
            .read_registers(group.address, group.count)
            .await
            .map_err(|e| ModbusError::new(what, group.address, e))?;
        if values.len() != usize::from(group.count) {
            return Err(short(what, group, values.len()));
        }
        trace!(message = "read", group = group.name, ?values);
        Ok(values)
    }

    /// Read and publish the status bits.
    pub async fn read_status(&self) -> Result<BitFields, Error> {
        let registers = self.read_group(READ_STATUS, STATUS).await?;
        let status = bitfield::decode_fields(&STATUS_FIELDS, &registers)
            .ok_or_else(|| short(READ_STATUS, STATUS, registers.len()))?;
        self.publisher.publish(Record::Status(status.clone()));
        Ok(status)
    }

    /// Read the error and warning registers, publishing the errors record followed by the
    /// warnings record.
    pub async fn read_errors_and_warnings(&self) -> Result<(BitFields, BitFields), Error> {
        let what = READ_ERRORS_AND_WARNINGS;
        let registers = self.read_group(what, ERRORS_WARNINGS).await?;
        let errors = bitfield::decode_fields(&ERROR_FIELDS, &registers);
        let warnings = bitfield::decode_fields(&WARNING_FIELDS, &registers);
        let (Some(errors), Some(warnings)) = (errors, warnings) else {
            return Err(short(what, ERRORS_WARNINGS, registers.len()));
        };
        self.publisher.publish(Record::Errors(errors.clone()));
        self.publisher.publish(Record::Warnings(warnings.clone()));
        Ok((errors, warnings))
    }

    pub async fn read_analog_data(&self) -> Result<AnalogTelemetry, Error> {
        let water = self.read_group(READ_ANALOG_DATA, WATER_LEVEL).await?;
        let analog = self.read_group(READ_ANALOG_DATA, ANALOG).await?;
        let values = ANALOG_FIELDS.map(|field| {
            let words = if field.group == WATER_LEVEL { &water } else { &analog };
            field.decode(words)
        });
        let [
            Some(water_level),
            Some(target_speed),
            Some(motor_current),
            Some(heatsink_temperature),
            Some(dclink_voltage),
            Some(motor_speed_percentage),
            Some(motor_speed_rpm),
            Some(motor_input),
            Some(compressor_power_consumption),
            Some(compressor_volume_percentage),
            Some(compressor_volume),
            Some(group_volume),
            Some(stage1_output_pressure),
            Some(line_pressure),
            Some(stage1_output_temperature),
        ] = values
        else {
            return Err(short(READ_ANALOG_DATA, ANALOG, analog.len()));
        };
        let telemetry = AnalogTelemetry {
            water_level,
            target_speed,
            motor_current,
            heatsink_temperature,
            dclink_voltage,
            motor_speed_percentage,
            motor_speed_rpm,
            motor_input,
            compressor_power_consumption,
            compressor_volume_percentage,
            compressor_volume,
            group_volume,
            stage1_output_pressure,
            line_pressure,
            stage1_output_temperature,
        };
        self.publisher.publish(Record::AnalogData(telemetry.clone()));
        Ok(telemetry)
    }

    pub async fn read_timers(&self) -> Result<TimerInfo, Error> {
        let registers = self.read_group(READ_TIMERS, TIMERS).await?;
        let &[running_high, running_low, loaded_high, loaded_low, service, run_on, ..] =
            registers.as_slice()
        else {
            return Err(short(READ_TIMERS, TIMERS, registers.len()));
        };
        let timers = TimerInfo {
            running_hours: records::u32_from_words(running_high, running_low),
            loaded_hours: records::u32_from_words(loaded_high, loaded_low),
            lowest_service_counter: service,
            run_on_timer: run_on,
        };
        self.publisher.publish(Record::TimerInfo(timers.clone()));
        Ok(timers)
    }

    pub async fn read_identity(&self) -> Result<CompressorIdentity, Error> {
        let registers = self.read_group(READ_IDENTITY, IDENTITY).await?;
        let (version, serial) = registers.split_at(registers::SOFTWARE_VERSION_LEN);
        let identity = CompressorIdentity {
            software_version: records::string_from_words(version),
            serial_number: records::string_from_words(serial),
        };
        self.publisher.publish(Record::CompressorInfo(identity.clone()));
        Ok(identity)
    }
}
