//! Register table of the x-center Modbus interface.

use crate::client::{ClientError, DeviceType, RawValue, WriteTarget, WriteValue};

/// Modbus register type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterType {
    Coil,
    Discrete,
    Input,
    Holding,
}

impl RegisterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterType::Coil => "coil",
            RegisterType::Discrete => "discrete",
            RegisterType::Input => "input",
            RegisterType::Holding => "holding",
        }
    }
}

/// Word layout of a register value. 32-bit values are big-endian word order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    U16,
    I16,
    U32,
}

impl DataType {
    /// Number of 16-bit registers per value.
    pub fn words(&self) -> u16 {
        match self {
            DataType::U16 | DataType::I16 => 1,
            DataType::U32 => 2,
        }
    }
}

/// One readable value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Register {
    /// Bulk-read key.
    pub key: &'static str,
    pub register_type: RegisterType,
    pub address: u16,
    pub data_type: DataType,
    /// Raw value is divided by this to get engineering units.
    pub divisor: f64,
}

const fn input(key: &'static str, address: u16, data_type: DataType, divisor: f64) -> Register {
    Register {
        key,
        register_type: RegisterType::Input,
        address,
        data_type,
        divisor,
    }
}

const fn holding(key: &'static str, address: u16, data_type: DataType, divisor: f64) -> Register {
    Register {
        key,
        register_type: RegisterType::Holding,
        address,
        data_type,
        divisor,
    }
}

const fn discrete(key: &'static str, address: u16) -> Register {
    Register {
        key,
        register_type: RegisterType::Discrete,
        address,
        data_type: DataType::U16,
        divisor: 1.0,
    }
}

const fn temperature(key: &'static str, address: u16) -> Register {
    input(key, address, DataType::I16, 10.0)
}

static HEAT_PUMP_REGISTERS: &[Register] = &[
    temperature("outdoor_temperature", 1),
    temperature("supply_temp_heat_pump", 50),
    temperature("return_temp_heat_pump", 51),
    temperature("energy_source_inlet", 52),
    temperature("energy_source_outlet", 53),
    input("power_total", 100, DataType::U16, 100.0),
    input("power_electrical_total", 101, DataType::U16, 100.0),
    input("power_heating", 102, DataType::U16, 100.0),
    input("power_hot_water", 103, DataType::U16, 100.0),
    input("cop_total", 104, DataType::U16, 100.0),
    input("cop_heating", 105, DataType::U16, 100.0),
    input("cop_hot_water", 106, DataType::U16, 100.0),
    input("heat_pump_status", 200, DataType::U16, 1.0),
    discrete("global_alarm", 0),
    input("operating_hours_compressor", 300, DataType::U32, 1.0),
    input("operating_hours_fan", 302, DataType::U32, 1.0),
    discrete("pv_modulation_status", 1),
    input("pv_modulation_power", 400, DataType::U16, 1.0),
];

static STORAGE_REGISTERS: &[Register] = &[
    temperature("t1_temperature", 1),
    temperature("t4_temperature", 4),
    temperature("outdoor_temperature_avg", 5),
    temperature("heating_setpoint", 10),
    temperature("heating_actual", 11),
    temperature("heating_circuit_setpoint", 12),
    temperature("heating_circuit_actual", 13),
    input("heating_circuit_status", 20, DataType::U16, 1.0),
    input("heating_circuit_operating_mode", 21, DataType::U16, 1.0),
    temperature("hot_water_setpoint", 30),
    temperature("hot_water_actual", 31),
    temperature("cooling_actual", 40),
    discrete("cooling_mode_active", 0),
    discrete("summer_mode_active", 1),
    input("operating_hours_circuit_pump", 60, DataType::U32, 1.0),
    holding("hot_water_setpoint_constant", 100, DataType::I16, 10.0),
    holding("season_selection_manual", 101, DataType::U16, 1.0),
    holding("heating_circuit_energy_mode", 102, DataType::U16, 1.0),
    holding("heating_curve_offset", 103, DataType::I16, 10.0),
    holding("season_threshold_heating_limit", 104, DataType::I16, 10.0),
];

/// Readable registers of a device type.
pub fn registers_for(device_type: DeviceType) -> &'static [Register] {
    match device_type {
        DeviceType::HeatPump => HEAT_PUMP_REGISTERS,
        DeviceType::StorageHeating | DeviceType::StorageDhw => STORAGE_REGISTERS,
    }
}

/// Register used to probe whether a unit is present.
pub fn probe_register(device_type: DeviceType) -> &'static Register {
    &registers_for(device_type)[0]
}

/// Decode the words (or bits) read for `register`.
///
/// Returns `None` if fewer words than the data type needs were returned.
pub fn decode(register: &Register, words: &[u16]) -> Option<RawValue> {
    let raw = match register.data_type {
        DataType::U16 => f64::from(*words.first()?),
        DataType::I16 => f64::from(*words.first()? as i16),
        DataType::U32 => {
            let [high, low] = words.get(..2)? else {
                return None;
            };
            f64::from((u32::from(*high) << 16) | u32::from(*low))
        }
    };
    Some(RawValue::Number(raw / register.divisor))
}

/// A single Modbus write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Register { address: u16, value: u16 },
    Coil { address: u16, value: bool },
}

/// Register kind and scaling of a write target. The address is not part of
/// the table; it comes from `modbus.write_registers`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct WriteLayout {
    register_type: RegisterType,
    data_type: DataType,
    divisor: f64,
}

fn write_layout(target: WriteTarget) -> WriteLayout {
    let holding = |data_type, divisor| WriteLayout {
        register_type: RegisterType::Holding,
        data_type,
        divisor,
    };
    match target {
        WriteTarget::HotWaterSetpoint => holding(DataType::I16, 10.0),
        WriteTarget::SeasonSelection => holding(DataType::U16, 1.0),
        WriteTarget::EnergyMode => holding(DataType::U16, 1.0),
        WriteTarget::HeatingCurveOffset => holding(DataType::I16, 10.0),
        WriteTarget::SeasonThresholdHeatingLimit => holding(DataType::I16, 10.0),
        WriteTarget::HotWaterSingleCharge => WriteLayout {
            register_type: RegisterType::Coil,
            data_type: DataType::U16,
            divisor: 1.0,
        },
    }
}

/// Encode a typed write into a Modbus operation at `address`.
///
/// Without an address the write is refused with
/// [`ClientError::WritesDisabled`].
pub fn encode_write(
    device_type: DeviceType,
    target: WriteTarget,
    value: WriteValue,
    address: Option<u16>,
) -> Result<WriteOp, ClientError> {
    if !device_type.is_storage() {
        return Err(ClientError::Unsupported {
            device_type,
            target,
        });
    }
    let address = address.ok_or(ClientError::WritesDisabled(target))?;

    let layout = write_layout(target);
    let encoding = |value: f64| ClientError::Encoding { target, value };

    match (layout.register_type, value) {
        (RegisterType::Coil, WriteValue::Trigger) => Ok(WriteOp::Coil {
            address,
            value: true,
        }),
        (RegisterType::Holding, WriteValue::Code(code)) if layout.divisor == 1.0 => {
            Ok(WriteOp::Register {
                address,
                value: code,
            })
        }
        (RegisterType::Holding, WriteValue::Number(number)) => {
            let scaled = (number * layout.divisor).round();
            let word = match layout.data_type {
                DataType::I16 if (f64::from(i16::MIN)..=f64::from(i16::MAX)).contains(&scaled) => {
                    scaled as i16 as u16
                }
                DataType::U16 if (0.0..=f64::from(u16::MAX)).contains(&scaled) => scaled as u16,
                _ => return Err(encoding(number)),
            };
            Ok(WriteOp::Register {
                address,
                value: word,
            })
        }
        (_, WriteValue::Number(number)) => Err(encoding(number)),
        (_, WriteValue::Code(code)) => Err(encoding(f64::from(code))),
        (_, WriteValue::Trigger) => Err(encoding(1.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappings;
    use std::collections::HashSet;

    #[test]
    fn test_every_readable_attribute_has_a_register() {
        for device_type in DeviceType::ALL {
            let keys: HashSet<_> = registers_for(device_type).iter().map(|r| r.key).collect();
            for attribute in mappings::attributes_for(device_type) {
                if !attribute.writable() {
                    assert!(keys.contains(attribute.key), "{}", attribute.key);
                }
            }
        }
    }

    #[test]
    fn test_decode_signed_tenths() {
        let register = probe_register(DeviceType::HeatPump);
        assert_eq!(decode(register, &[215]), Some(RawValue::Number(21.5)));
        assert_eq!(decode(register, &[0xFFE2]), Some(RawValue::Number(-3.0)));
        assert_eq!(decode(register, &[]), None);
    }

    #[test]
    fn test_decode_u32() {
        let register = input("hours", 0, DataType::U32, 1.0);
        assert_eq!(decode(&register, &[0x0001, 0x0002]), Some(RawValue::Number(65538.0)));
        assert_eq!(decode(&register, &[0x0001]), None);
    }

    #[test]
    fn test_encode_setpoint() {
        let op = encode_write(
            DeviceType::StorageDhw,
            WriteTarget::HotWaterSetpoint,
            WriteValue::Number(48.5),
            Some(1200),
        )
        .unwrap();
        assert_eq!(op, WriteOp::Register { address: 1200, value: 485 });
    }

    #[test]
    fn test_encode_negative_offset() {
        let op = encode_write(
            DeviceType::StorageHeating,
            WriteTarget::HeatingCurveOffset,
            WriteValue::Number(-2.0),
            Some(7),
        )
        .unwrap();
        assert_eq!(op, WriteOp::Register { address: 7, value: (-20i16) as u16 });
    }

    #[test]
    fn test_encode_trigger_and_code() {
        assert_eq!(
            encode_write(
                DeviceType::StorageDhw,
                WriteTarget::HotWaterSingleCharge,
                WriteValue::Trigger,
                Some(12),
            )
            .unwrap(),
            WriteOp::Coil { address: 12, value: true }
        );
        assert_eq!(
            encode_write(
                DeviceType::StorageHeating,
                WriteTarget::EnergyMode,
                WriteValue::Code(3),
                Some(300),
            )
            .unwrap(),
            WriteOp::Register { address: 300, value: 3 }
        );
    }

    #[test]
    fn test_encode_without_address_is_refused() {
        for target in WriteTarget::ALL {
            let value = match target {
                WriteTarget::HotWaterSingleCharge => WriteValue::Trigger,
                WriteTarget::SeasonSelection | WriteTarget::EnergyMode => WriteValue::Code(1),
                _ => WriteValue::Number(1.0),
            };
            assert!(
                matches!(
                    encode_write(DeviceType::StorageDhw, target, value, None),
                    Err(ClientError::WritesDisabled(t)) if t == target
                ),
                "{:?}",
                target
            );
        }
    }

    #[test]
    fn test_encode_rejects_mismatch() {
        assert!(matches!(
            encode_write(
                DeviceType::HeatPump,
                WriteTarget::EnergyMode,
                WriteValue::Code(1),
                Some(300)
            ),
            Err(ClientError::Unsupported { .. })
        ));
        assert!(matches!(
            encode_write(
                DeviceType::StorageHeating,
                WriteTarget::SeasonSelection,
                WriteValue::Trigger,
                Some(301)
            ),
            Err(ClientError::Encoding { .. })
        ));
        assert!(matches!(
            encode_write(
                DeviceType::StorageDhw,
                WriteTarget::HotWaterSetpoint,
                WriteValue::Number(5000.0),
                Some(1200)
            ),
            Err(ClientError::Encoding { .. })
        ));
    }
}
