//! The Modbus register map of the compressor controller.
//!
//! Only one controller model is supported, so everything here is fixed at compile time. Addresses
//! are the raw protocol addresses (zero based) as sent on the wire.
//!
//! Bit-field tables list the field names from the least significant bit upwards. `_` marks a bit
//! that the controller reserves: it occupies a position but is never reported.

/// A contiguous range of holding registers that is read in one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct RegisterGroup {
    pub name: &'static str,
    pub address: u16,
    pub count: u16,
}

impl RegisterGroup {
    const fn new(name: &'static str, address: u16, count: u16) -> Self {
        Self { name, address, count }
    }

    pub fn addresses(&self) -> std::ops::Range<u16> {
        self.address..self.address + self.count
    }
}

pub const STATUS: RegisterGroup = RegisterGroup::new("status", 0x30, 3);
pub const ERRORS_WARNINGS: RegisterGroup = RegisterGroup::new("errors and warnings", 0x63, 16);
pub const WATER_LEVEL: RegisterGroup = RegisterGroup::new("water level", 0x1E, 1);
pub const ANALOG: RegisterGroup = RegisterGroup::new("analog data", 0x22, 14);
pub const TIMERS: RegisterGroup = RegisterGroup::new("timers", 0x39, 8);
pub const IDENTITY: RegisterGroup = RegisterGroup::new("compressor info", 0xC7, 23);

/// Every group the poll loop reads.
pub const GROUPS: [RegisterGroup; 6] = [STATUS, ERRORS_WARNINGS, WATER_LEVEL, ANALOG, TIMERS, IDENTITY];

/// Writing [`POWER_ON`] or [`POWER_OFF`] here starts or stops the compressor.
pub const POWER_REGISTER: u16 = 0x12B;
pub const POWER_ON: u16 = 0xFF01;
pub const POWER_OFF: u16 = 0xFF00;
/// Writing [`RESET_FAULTS`] here acknowledges the currently latched faults.
pub const RESET_REGISTER: u16 = 0x12D;
pub const RESET_FAULTS: u16 = 0xFF01;

/// Length of the software version string at the start of [`IDENTITY`]. The serial number takes
/// the remaining registers.
pub const SOFTWARE_VERSION_LEN: usize = 14;

/// Bit-field layout of one register within a [`RegisterGroup`].
#[derive(Clone, Copy, Debug)]
pub struct BitField {
    /// Index of the register within its group.
    pub offset: u16,
    pub names: &'static [Option<&'static str>],
}

macro_rules! bits {
    (@one _) => { None };
    (@one $name: literal) => { Some($name) };
    ($offset: literal => [$($name: tt),* $(,)?]) => {
        BitField { offset: $offset, names: &[$(bits!(@one $name)),*] }
    };
}

pub const STATUS_FIELDS: [BitField; 2] = [
    bits!(0 => [
        "readyToStart",
        "operating",
        "startInhibit",
        "motorStartPhase",
        "offLoad",
        "onLoad",
        "softStop",
        "runOnTimer",
        "fault",
        "warning",
        "serviceRequired",
        "minAllowedSpeedAchieved",
        "maxAllowedSpeedAchieved",
    ]),
    bits!(2 => [
        "startByRemote",
        "startWithTimerControl",
        "startWithPressureRequirement",
        "startAfterDePressurise",
        "startAfterPowerLoss",
        "startAfterDryerPreRun",
    ]),
];

/// Status bit telling whether the controller accepts remote start commands.
pub const START_BY_REMOTE: &str = "startByRemote";

pub const ERROR_FIELDS: [BitField; 3] = [
    bits!(0 => [
        "powerSupplyFailureE400",
        "emergencyStopActivatedE401",
        "highMotorTemperatureM1E402",
        "compressorDischargeTemperatureE403",
        "startTemperatureLowE404",
        "dischargeOverPressureE405",
        "linePressureSensorB1E406",
        "dischargePressureSensorB2E407",
        "dischargeTemperatureSensorR2E408",
        "controllerHardwareE409",
        "coolingE410",
        "oilPressureLowE411",
        "externalFaultE412",
        "dryerE413",
        "condensateDrainE414",
        "noPressureBuildUpE415",
    ]),
    bits!(1 => ["heavyStartupE416"]),
    bits!(6 => [
        "preAdjustmentVSDE500",
        "preAdjustmentE501",
        "lockedVSDE502",
        "writeFaultVSDE503",
        "communicationVSDE504",
        "stopPressedVSDE505",
        "stopInputEMVSDE506",
        "readFaultVSDE507",
        "stopInputVSDEME508",
        "seeVSDDisplayE509",
        "speedBelowMinLimitE510",
    ]),
];

pub const WARNING_FIELDS: [BitField; 3] = [
    bits!(8 => [
        "serviceDueA600",
        "dischargeOverPressureA601",
        "compressorDischargeTemperatureA602",
        _,
        _,
        _,
        "linePressureHighA606",
        "controllerBatteryEmptyA607",
        "dryerA608",
        "condensateDrainA609",
        "fineSeparatorA610",
        "airFilterA611",
        "oilFilterA612",
        "oilLevelLowA613",
        "oilTemperatureHighA614",
        "externalWarningA615",
    ]),
    bits!(9 => [
        "motorLuricationSystemA616",
        "input1A617",
        "input2A618",
        "input3A619",
        "input4A620",
        "input5A621",
        "input6A622",
        "fullSDCardA623",
    ]),
    bits!(14 => ["temperatureHighVSDA700"]),
];

const _ASSERT_BIT_FIELDS_FIT: () = const {
    let tables: [(&[BitField], RegisterGroup); 3] = [
        (&STATUS_FIELDS, STATUS),
        (&ERROR_FIELDS, ERRORS_WARNINGS),
        (&WARNING_FIELDS, ERRORS_WARNINGS),
    ];
    let mut table = 0;
    while table < tables.len() {
        let (fields, group) = tables[table];
        let mut idx = 0;
        while idx < fields.len() {
            assert!(fields[idx].names.len() <= 16, "a register only holds 16 bits");
            assert!(fields[idx].offset < group.count, "bit field outside of its register group");
            idx += 1;
        }
        table += 1;
    }
};

#[derive(Clone, Copy, Debug, serde::Serialize, PartialEq, Eq)]
pub struct DataType {
    scale: u8,
    signed: bool,
}

impl DataType {
    pub const U16: Self = Self { scale: 1, signed: false };
    pub const I16: Self = Self { scale: 1, signed: true };
    /// Unsigned value with one decimal place encoded as an integer number of tenths.
    pub const DEC: Self = Self { scale: 10, signed: false };

    pub const fn from_word(self, word: u16) -> Value {
        if self.scale == 10 {
            Value::Tenths(word)
        } else if self.signed {
            Value::I16(word as i16)
        } else {
            Value::U16(word)
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.signed { "i16" } else { "u16" })?;
        if self.scale != 1 {
            f.write_fmt(format_args!("/{}", self.scale))?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    U16(u16),
    I16(i16),
    /// This data type contains a value multiplied by 10.
    Tenths(u16),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::U16(n) => f64::from(n),
            Value::I16(n) => f64::from(n),
            Value::Tenths(n) => f64::from(n) / 10.0,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::U16(n) => f.write_fmt(format_args!("{}", n)),
            Value::I16(n) => f.write_fmt(format_args!("{}", n)),
            Value::Tenths(n) => f.write_fmt(format_args!("{}", f64::from(n) / 10.0)),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::U16(n) => serializer.serialize_u16(n),
            Value::I16(n) => serializer.serialize_i16(n),
            Value::Tenths(n) => serializer.serialize_f64(f64::from(n) / 10.0),
        }
    }
}

/// One analog telemetry register.
#[derive(Clone, Copy, Debug)]
pub struct AnalogField {
    pub name: &'static str,
    pub group: RegisterGroup,
    pub offset: u16,
    pub data_type: DataType,
}

impl AnalogField {
    pub fn address(&self) -> u16 {
        self.group.address + self.offset
    }

    pub fn decode(&self, words: &[u16]) -> Option<Value> {
        let word = *words.get(usize::from(self.offset))?;
        Some(self.data_type.from_word(word))
    }
}

macro_rules! analog {
    ($($group: ident [$offset: literal]: $ty: ident, $name: literal;)*) => {
        [$(AnalogField { name: $name, group: $group, offset: $offset, data_type: DataType::$ty },)*]
    }
}

pub const ANALOG_FIELDS: [AnalogField; 15] = analog![
    WATER_LEVEL[0]: I16, "waterLevel";
    ANALOG[0]: U16, "targetSpeed";
    ANALOG[1]: DEC, "motorCurrent";
    ANALOG[2]: I16, "heatsinkTemperature";
    ANALOG[3]: U16, "dclinkVoltage";
    ANALOG[4]: U16, "motorSpeedPercentage";
    ANALOG[5]: U16, "motorSpeedRPM";
    ANALOG[6]: DEC, "motorInput";
    ANALOG[7]: DEC, "compressorPowerConsumption";
    ANALOG[8]: U16, "compressorVolumePercentage";
    ANALOG[9]: DEC, "compressorVolume";
    ANALOG[10]: DEC, "groupVolume";
    ANALOG[11]: I16, "stage1OutputPressure";
    ANALOG[12]: I16, "linePressure";
    ANALOG[13]: I16, "stage1OutputTemperature";
];

/// One row of the human readable register map.
#[derive(serde::Serialize)]
pub struct RegisterSchema {
    pub address: u16,
    pub group: &'static str,
    pub name: String,
    pub kind: String,
}

impl RegisterSchema {
    pub fn all_registers() -> Vec<Self> {
        let mut result = Vec::new();
        let bit_tables: [(&str, &[BitField], RegisterGroup); 3] = [
            ("status", &STATUS_FIELDS, STATUS),
            ("errors", &ERROR_FIELDS, ERRORS_WARNINGS),
            ("warnings", &WARNING_FIELDS, ERRORS_WARNINGS),
        ];
        for (group, fields, registers) in bit_tables {
            for field in fields {
                for (bit, name) in field.names.iter().enumerate() {
                    let Some(name) = name else { continue };
                    result.push(RegisterSchema {
                        address: registers.address + field.offset,
                        group,
                        name: name.to_string(),
                        kind: format!("bit {bit}"),
                    });
                }
            }
        }
        for field in &ANALOG_FIELDS {
            result.push(RegisterSchema {
                address: field.address(),
                group: "analogData",
                name: field.name.to_string(),
                kind: field.data_type.to_string(),
            });
        }
        let timers = [
            (0, "runningHours", "u32"),
            (2, "loadedHours", "u32"),
            (4, "lowestServiceCounter", "u16"),
            (5, "runOnTimer", "u16"),
        ];
        for (offset, name, kind) in timers {
            result.push(RegisterSchema {
                address: TIMERS.address + offset,
                group: "timerInfo",
                name: name.to_string(),
                kind: kind.to_string(),
            });
        }
        let identity_len = IDENTITY.count as usize - SOFTWARE_VERSION_LEN;
        result.push(RegisterSchema {
            address: IDENTITY.address,
            group: "compressorInfo",
            name: "softwareVersion".to_string(),
            kind: format!("ascii[{SOFTWARE_VERSION_LEN}]"),
        });
        result.push(RegisterSchema {
            address: IDENTITY.address + SOFTWARE_VERSION_LEN as u16,
            group: "compressorInfo",
            name: "serialNumber".to_string(),
            kind: format!("ascii[{identity_len}]"),
        });
        result.push(RegisterSchema {
            address: POWER_REGISTER,
            group: "control",
            name: "power".to_string(),
            kind: format!("write 0x{POWER_ON:04X} on, 0x{POWER_OFF:04X} off"),
        });
        result.push(RegisterSchema {
            address: RESET_REGISTER,
            group: "control",
            name: "resetFaults".to_string(),
            kind: format!("write 0x{RESET_FAULTS:04X}"),
        });
        result
    }

    pub fn is_match(&self, pattern: &str) -> bool {
        let pattern = pattern.to_lowercase();
        self.name.to_lowercase().contains(&pattern)
            || self.group.to_lowercase().contains(&pattern)
            || format!("0x{:04x}", self.address).contains(&pattern)
            || self.address.to_string().contains(&pattern)
    }
}
