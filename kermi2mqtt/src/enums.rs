//! Enumerated register values of the x-center.

use std::fmt;

/// Enumeration types carried by register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnumType {
    SeasonSelection,
    EnergyMode,
    HeatPumpStatus,
    HeatingCircuitStatus,
    OperatingMode,
}

impl EnumType {
    pub const ALL: [EnumType; 5] = [
        EnumType::SeasonSelection,
        EnumType::EnergyMode,
        EnumType::HeatPumpStatus,
        EnumType::HeatingCircuitStatus,
        EnumType::OperatingMode,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EnumType::SeasonSelection => "SeasonSelection",
            EnumType::EnergyMode => "EnergyMode",
            EnumType::HeatPumpStatus => "HeatPumpStatus",
            EnumType::HeatingCircuitStatus => "HeatingCircuitStatus",
            EnumType::OperatingMode => "OperatingMode",
        }
    }

    /// Register codes and member names.
    pub fn members(&self) -> &'static [(u16, &'static str)] {
        match self {
            EnumType::SeasonSelection => &[(0, "AUTO"), (1, "HEATING"), (2, "COOLING"), (3, "OFF")],
            EnumType::EnergyMode => &[
                (0, "OFF"),
                (1, "ECO"),
                (2, "NORMAL"),
                (3, "COMFORT"),
                (4, "CUSTOM"),
            ],
            EnumType::HeatPumpStatus => &[
                (0, "STANDBY"),
                (1, "ALARM"),
                (2, "HOT_WATER"),
                (3, "DEFROST"),
                (4, "HEATING"),
                (5, "COOLING"),
            ],
            EnumType::HeatingCircuitStatus => &[
                (0, "OFF"),
                (1, "HEATING"),
                (2, "HEATING_UP"),
                (3, "COOLING"),
                (4, "COOLING_DOWN"),
                (5, "STANDBY"),
            ],
            EnumType::OperatingMode => &[
                (0, "OFF"),
                (1, "AUTO"),
                (2, "HEATING"),
                (3, "COOLING"),
                (4, "FROST_PROTECTION"),
            ],
        }
    }

    /// Bus vocabulary overrides, keyed by member name.
    ///
    /// Season selection follows the Home Assistant HVAC modes and energy mode
    /// its climate presets. Members without an entry publish their lower-cased
    /// name.
    pub fn renames(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            EnumType::SeasonSelection => &[
                ("AUTO", "auto"),
                ("HEATING", "heat"),
                ("COOLING", "cool"),
                ("OFF", "off"),
            ],
            EnumType::EnergyMode => &[
                ("OFF", "away"),
                ("ECO", "eco"),
                ("NORMAL", "comfort"),
                ("COMFORT", "boost"),
            ],
            _ => &[],
        }
    }

    /// Member name for a code.
    pub fn member(&self, code: u16) -> Option<&'static str> {
        self.members()
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, name)| *name)
    }
}

impl fmt::Display for EnumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
