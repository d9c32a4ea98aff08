//! Modbus implementation of [`DeviceClient`].
//!
//! One connection is shared by all units; the unit address is switched
//! before each group of requests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_modbus::ExceptionCode;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use kermi_bridge_framework::BackoffPolicy;

use crate::client::{ClientError, DeviceClient, DeviceType, PollSnapshot, RawValue, WriteTarget, WriteValue};
use crate::config::{ConnectionConfig, ModbusConfig};
use crate::registers::{self, Register, RegisterType, WriteOp};

/// Modbus TCP/RTU client for the x-center units.
pub struct ModbusDeviceClient {
    connection: ConnectionConfig,
    timeout: Duration,
    units: Vec<(DeviceType, u8)>,
    backoff: BackoffPolicy,
    write_addresses: HashMap<WriteTarget, u16>,
    context: Mutex<Option<Context>>,
    connected: AtomicBool,
    /// Units found by the last probe; `None` until probed.
    present: Mutex<Option<Vec<(DeviceType, u8)>>>,
}

impl ModbusDeviceClient {
    pub fn new(config: &ModbusConfig, backoff: BackoffPolicy) -> Self {
        let write_addresses = config.write_addresses();
        if write_addresses.is_empty() {
            info!("No write registers configured, controls are read-only");
        }

        Self {
            connection: config.connection.clone(),
            timeout: config.timeout(),
            units: config.units.enabled(),
            backoff,
            write_addresses,
            context: Mutex::new(None),
            connected: AtomicBool::new(false),
            present: Mutex::new(None),
        }
    }

    fn first_slave(&self) -> Slave {
        Slave(self.units.first().map(|(_, unit)| *unit).unwrap_or(1))
    }

    async fn open(&self) -> Result<Context, ClientError> {
        let slave = self.first_slave();

        match &self.connection {
            ConnectionConfig::Tcp { host, port } => {
                let addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| ClientError::Connection(format!("Cannot resolve {}: {}", host, e)))?
                    .next()
                    .ok_or_else(|| ClientError::Connection(format!("No address for {}", host)))?;

                tokio::time::timeout(self.timeout, tcp::connect_slave(addr, slave))
                    .await
                    .map_err(|_| ClientError::Timeout(self.timeout))?
                    .map_err(|e| ClientError::Connection(e.to_string()))
            }
            ConnectionConfig::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let parity = match parity.to_lowercase().as_str() {
                    "even" => tokio_serial::Parity::Even,
                    "odd" => tokio_serial::Parity::Odd,
                    _ => tokio_serial::Parity::None,
                };

                let stop_bits = match stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };

                let data_bits = match data_bits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };

                let builder = tokio_serial::new(port, *baud_rate)
                    .parity(parity)
                    .stop_bits(stop_bits)
                    .data_bits(data_bits);

                let serial = tokio_serial::SerialStream::open(&builder)
                    .map_err(|e| ClientError::Connection(format!("Serial open failed: {}", e)))?;

                Ok(rtu::attach_slave(serial, slave))
            }
        }
    }

    /// Drop the connection after a transport failure.
    fn mark_disconnected(&self, context: &mut Option<Context>) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(endpoint = %self.connection.endpoint(), "Modbus connection lost");
        }
        *context = None;
    }

    async fn units_to_read(&self) -> Vec<(DeviceType, u8)> {
        self.present
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| self.units.clone())
    }
}

/// Run one request with the per-request timeout. The inner result carries
/// Modbus exceptions; the outer one transport failures.
async fn request<T>(
    timeout: Duration,
    call: impl Future<Output = tokio_modbus::Result<T>>,
) -> Result<Result<T, ExceptionCode>, ClientError> {
    match tokio::time::timeout(timeout, call).await {
        Err(_) => Err(ClientError::Timeout(timeout)),
        Ok(Err(e)) => Err(ClientError::Connection(e.to_string())),
        Ok(Ok(response)) => Ok(response),
    }
}

/// Read one register. `Ok(None)` means the unit does not provide it.
async fn read_register(
    ctx: &mut Context,
    register: &Register,
    timeout: Duration,
) -> Result<Option<RawValue>, ClientError> {
    let words = register.data_type.words();

    let response = match register.register_type {
        RegisterType::Coil => request(timeout, ctx.read_coils(register.address, 1))
            .await?
            .map(|bits| bits.first().copied().map(RawValue::Bool)),
        RegisterType::Discrete => request(timeout, ctx.read_discrete_inputs(register.address, 1))
            .await?
            .map(|bits| bits.first().copied().map(RawValue::Bool)),
        RegisterType::Input => request(timeout, ctx.read_input_registers(register.address, words))
            .await?
            .map(|data| registers::decode(register, &data)),
        RegisterType::Holding => {
            request(timeout, ctx.read_holding_registers(register.address, words))
                .await?
                .map(|data| registers::decode(register, &data))
        }
    };

    match response {
        Ok(value) => {
            if value.is_none() {
                warn!(key = register.key, "Short response, skipping");
            }
            Ok(value)
        }
        Err(exception) => {
            debug!(key = register.key, exception = ?exception, "Register not available");
            Ok(None)
        }
    }
}

async fn read_unit(
    ctx: &mut Context,
    device_type: DeviceType,
    timeout: Duration,
) -> Result<Vec<(&'static str, RawValue)>, ClientError> {
    let mut values = Vec::new();
    for register in registers::registers_for(device_type) {
        if let Some(value) = read_register(ctx, register, timeout).await? {
            values.push((register.key, value));
        }
    }
    Ok(values)
}

/// Read every unit. A unit that times out is left out of the snapshot; the
/// read fails only if none answered.
async fn read_units(
    ctx: &mut Context,
    units: &[(DeviceType, u8)],
    timeout: Duration,
) -> Result<PollSnapshot, ClientError> {
    let mut snapshot = PollSnapshot::new();
    let mut silent = 0;

    for (device_type, unit) in units {
        ctx.set_slave(Slave(*unit));
        match read_unit(ctx, *device_type, timeout).await {
            Ok(values) => {
                for (key, value) in values {
                    snapshot.insert(*device_type, key, value);
                }
            }
            Err(ClientError::Timeout(_)) => {
                debug!(device_type = %device_type, unit, "Unit did not respond, skipping");
                silent += 1;
            }
            Err(e) => return Err(e),
        }
    }

    if silent > 0 && silent == units.len() {
        return Err(ClientError::Timeout(timeout));
    }
    Ok(snapshot)
}

/// How a unit reacted to the presence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    Answered,
    /// No reply in time. The unit may be powered down; it stays configured.
    Silent,
    /// The gateway reports nothing behind this address.
    Missing,
}

/// Classify a presence-check response. Transport failures other than a
/// timeout are returned as errors.
fn classify_probe<T>(
    response: Result<Result<T, ExceptionCode>, ClientError>,
) -> Result<ProbeOutcome, ClientError> {
    match response {
        Ok(Ok(_)) => Ok(ProbeOutcome::Answered),
        Ok(Err(exception)) if is_gateway_miss(&exception) => Ok(ProbeOutcome::Missing),
        // Any other exception still proves the unit answered
        Ok(Err(_)) => Ok(ProbeOutcome::Answered),
        Err(ClientError::Timeout(_)) => Ok(ProbeOutcome::Silent),
        Err(e) => Err(e),
    }
}

fn is_gateway_miss(exception: &ExceptionCode) -> bool {
    matches!(
        exception,
        ExceptionCode::GatewayTargetDevice | ExceptionCode::GatewayPathUnavailable
    )
}

#[async_trait]
impl DeviceClient for ModbusDeviceClient {
    async fn connect(&self) -> Result<(), ClientError> {
        let mut guard = self.context.lock().await;
        if guard.is_some() && self.is_connected() {
            return Ok(());
        }

        let ctx = self.open().await?;
        *guard = Some(ctx);
        self.connected.store(true, Ordering::SeqCst);
        info!(endpoint = %self.connection.endpoint(), "Connected to Modbus");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        let mut guard = self.context.lock().await;
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut ctx) = guard.take() {
            ctx.disconnect()
                .await
                .map_err(|e| ClientError::Connection(e.to_string()))?;
            info!(endpoint = %self.connection.endpoint(), "Disconnected from Modbus");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    async fn present_units(&self) -> Result<Vec<(DeviceType, u8)>, ClientError> {
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or(ClientError::NotConnected)?;

        let mut present = Vec::with_capacity(self.units.len());
        let mut failure = None;

        for (device_type, unit) in &self.units {
            ctx.set_slave(Slave(*unit));
            let probe = registers::probe_register(*device_type);

            let response = request(self.timeout, ctx.read_input_registers(probe.address, 1)).await;
            match classify_probe(response) {
                Ok(ProbeOutcome::Answered) => present.push((*device_type, *unit)),
                Ok(ProbeOutcome::Silent) => {
                    warn!(device_type = %device_type, unit, "Unit did not respond, polling it anyway");
                    present.push((*device_type, *unit));
                }
                Ok(ProbeOutcome::Missing) => {
                    warn!(device_type = %device_type, unit, "Unit not reachable behind gateway");
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            self.mark_disconnected(&mut guard);
            return Err(e);
        }

        info!(units = ?present, "Probed Modbus units");
        *self.present.lock().await = Some(present.clone());
        Ok(present)
    }

    async fn read_all_devices(&self) -> Result<PollSnapshot, ClientError> {
        let units = self.units_to_read().await;

        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or(ClientError::NotConnected)?;

        let result = read_units(ctx, &units, self.timeout).await;
        match &result {
            Ok(snapshot) => debug!(values = snapshot.len(), "Bulk read complete"),
            Err(e) if e.is_connection() => self.mark_disconnected(&mut guard),
            Err(_) => {}
        }
        result
    }

    async fn write(
        &self,
        device_type: DeviceType,
        target: WriteTarget,
        value: WriteValue,
    ) -> Result<(), ClientError> {
        let address = self.write_addresses.get(&target).copied();
        let op = registers::encode_write(device_type, target, value, address)?;
        let unit = self
            .units
            .iter()
            .find(|(t, _)| *t == device_type)
            .map(|(_, unit)| *unit)
            .ok_or(ClientError::UnitMissing(device_type))?;

        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or(ClientError::NotConnected)?;
        ctx.set_slave(Slave(unit));

        let response = match op {
            WriteOp::Register { address, value } => {
                request(self.timeout, ctx.write_single_register(address, value)).await
            }
            WriteOp::Coil { address, value } => {
                request(self.timeout, ctx.write_single_coil(address, value)).await
            }
        };

        match response {
            Ok(Ok(())) => {
                info!(device_type = %device_type, unit, target = target.as_str(), op = ?op, "Write complete");
                Ok(())
            }
            Ok(Err(exception)) => Err(ClientError::Exception(format!("{:?}", exception))),
            Err(e) => {
                if e.is_connection() {
                    self.mark_disconnected(&mut guard);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnitsConfig;

    fn config(host: &str, port: u16) -> ModbusConfig {
        ModbusConfig {
            connection: ConnectionConfig::Tcp {
                host: host.to_string(),
                port,
            },
            timeout_ms: 500,
            units: UnitsConfig::default(),
            write_registers: HashMap::new(),
        }
    }

    fn client(host: &str, port: u16) -> ModbusDeviceClient {
        ModbusDeviceClient::new(
            &config(host, port),
            BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(20)),
        )
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let client = client("127.0.0.1", 1);
        assert!(!client.is_connected());
        assert!(matches!(
            client.read_all_devices().await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.present_units().await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let client = client("127.0.0.1", 1);
        let err = client.connect().await.unwrap_err();
        assert!(err.is_connection());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_write_rejects_before_io() {
        let client = client("127.0.0.1", 1);
        let err = client
            .write(
                DeviceType::HeatPump,
                WriteTarget::HotWaterSetpoint,
                WriteValue::Number(45.0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_write_without_address_refused_before_io() {
        let client = client("127.0.0.1", 1);
        let err = client
            .write(
                DeviceType::StorageDhw,
                WriteTarget::HotWaterSetpoint,
                WriteValue::Number(45.0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::WritesDisabled(WriteTarget::HotWaterSetpoint)));
    }

    #[tokio::test]
    async fn test_configured_address_reaches_transport() {
        let mut config = config("127.0.0.1", 1);
        config
            .write_registers
            .insert("hot_water_setpoint".to_string(), 1200);
        let client = ModbusDeviceClient::new(
            &config,
            BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(20)),
        );

        let err = client
            .write(
                DeviceType::StorageDhw,
                WriteTarget::HotWaterSetpoint,
                WriteValue::Number(45.0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[test]
    fn test_gateway_exceptions() {
        assert!(is_gateway_miss(&ExceptionCode::GatewayTargetDevice));
        assert!(!is_gateway_miss(&ExceptionCode::IllegalDataAddress));
    }

    #[test]
    fn test_presence_check_classification() {
        let answered: Result<Result<Vec<u16>, ExceptionCode>, ClientError> = Ok(Ok(vec![215]));
        assert_eq!(classify_probe(answered).unwrap(), ProbeOutcome::Answered);

        let illegal: Result<Result<Vec<u16>, ExceptionCode>, ClientError> =
            Ok(Err(ExceptionCode::IllegalDataAddress));
        assert_eq!(classify_probe(illegal).unwrap(), ProbeOutcome::Answered);

        let missing: Result<Result<Vec<u16>, ExceptionCode>, ClientError> =
            Ok(Err(ExceptionCode::GatewayTargetDevice));
        assert_eq!(classify_probe(missing).unwrap(), ProbeOutcome::Missing);

        // A powered-down unit is kept and retried by the poll loop.
        let silent: Result<Result<Vec<u16>, ExceptionCode>, ClientError> =
            Err(ClientError::Timeout(Duration::from_millis(500)));
        assert_eq!(classify_probe(silent).unwrap(), ProbeOutcome::Silent);

        let refused: Result<Result<Vec<u16>, ExceptionCode>, ClientError> =
            Err(ClientError::Connection("broken pipe".into()));
        assert!(classify_probe(refused).unwrap_err().is_connection());
    }

    #[tokio::test]
    async fn test_disconnect_when_idle() {
        let client = client("127.0.0.1", 1);
        assert!(client.disconnect().await.is_ok());
    }
}
