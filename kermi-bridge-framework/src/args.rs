//! CLI argument parsing for bridges.

use std::path::PathBuf;

use clap::Parser;

/// Common CLI arguments for the bridge.
#[derive(Parser, Debug, Clone)]
#[command(about = "Modbus to MQTT bridge")]
pub struct BridgeArgs {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, default_value = "kermi2mqtt.json5")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default_config() {
        let args = BridgeArgs::try_parse_from(["kermi2mqtt"]).unwrap();
        assert_eq!(args.config, PathBuf::from("kermi2mqtt.json5"));
        assert_eq!(args.log_level, None);
    }

    #[test]
    fn test_args_overrides() {
        let args =
            BridgeArgs::try_parse_from(["kermi2mqtt", "-c", "/etc/kermi.json5", "--log-level", "debug"])
                .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/kermi.json5"));
        assert_eq!(args.log_level, Some("debug".to_string()));
    }
}
