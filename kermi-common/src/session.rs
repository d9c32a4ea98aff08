use std::time::Duration;

use rumqttc::{MqttOptions, TlsConfiguration, Transport};

use crate::config::{MqttConfig, TlsConfig};
use crate::error::{Error, Result};

/// Build MQTT connection options from the provided configuration.
pub fn mqtt_options(config: &MqttConfig, client_id: &str) -> Result<MqttOptions> {
    config.validate()?;

    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);

    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }

    if config.tls.enabled {
        options.set_transport(Transport::tls_with_config(tls_configuration(&config.tls)?));
    }

    tracing::info!(
        broker = %config.broker_addr(),
        client_id = %client_id,
        tls = config.tls.enabled,
        "Prepared MQTT connection options"
    );

    Ok(options)
}

fn tls_configuration(tls: &TlsConfig) -> Result<TlsConfiguration> {
    let Some(ca_path) = &tls.ca_certs else {
        if tls.certfile.is_some() {
            return Err(Error::Tls(
                "client certificates require an explicit ca_certs bundle".to_string(),
            ));
        }
        // Platform root store
        return Ok(TlsConfiguration::default());
    };

    let ca = read_pem(ca_path)?;
    let client_auth = match (&tls.certfile, &tls.keyfile) {
        (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
        _ => None,
    };

    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    })
}

fn read_pem(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::Tls(format!("Failed to read '{}': {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_options() {
        let mut config = MqttConfig::new("broker.local");
        config.port = 1884;
        config.username = Some("bridge".to_string());

        let options = mqtt_options(&config, "kermi2mqtt_xcenter").unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.client_id(), "kermi2mqtt_xcenter");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
    }

    #[test]
    fn test_missing_ca_file_is_tls_error() {
        let mut config = MqttConfig::new("broker.local");
        config.tls.enabled = true;
        config.tls.ca_certs = Some("/nonexistent/ca.pem".to_string());

        let result = mqtt_options(&config, "test");
        assert!(matches!(result, Err(Error::Tls(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MqttConfig::new("");
        assert!(matches!(
            mqtt_options(&config, "test"),
            Err(Error::Config(_))
        ));
    }
}
