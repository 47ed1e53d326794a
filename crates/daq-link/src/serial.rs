//! Openers for serial ports and TCP sockets.
//!
//! Serial support requires the `serial` feature (enabled by default):
//!
//! ```toml
//! [dependencies]
//! daq-link = { path = "../daq-link", features = ["serial"] }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::transport::DynMedium;

/// Serial parity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Line settings for one serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port path (e.g. `/dev/ttyUSB0`, `COM3`).
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Data bits, 5 through 8.
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity.
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits, 1 or 2.
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl SerialSettings {
    /// 8N1 settings at `baud_rate`.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
        }
    }

    /// Check the settings without touching the port.
    ///
    /// # Errors
    ///
    /// `ConfigurationFailure` for an empty path, zero baud rate, or
    /// unsupported data/stop bits.
    pub fn validate(&self) -> LinkResult<()> {
        let fail = |msg: String| Err(LinkError::new(ErrorKind::ConfigurationFailure, msg));
        if self.port.trim().is_empty() {
            return fail("serial port path is empty".into());
        }
        if self.baud_rate == 0 {
            return fail(format!("baud rate for {} must be non-zero", self.port));
        }
        if !(5..=8).contains(&self.data_bits) {
            return fail(format!("data bits must be 5-8, got {}", self.data_bits));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return fail(format!("stop bits must be 1 or 2, got {}", self.stop_bits));
        }
        Ok(())
    }
}

/// Open a serial port on a blocking thread.
///
/// # Errors
///
/// `ConfigurationFailure` when the settings are invalid or the port cannot
/// be opened.
#[cfg(feature = "serial")]
pub async fn open_serial(settings: &SerialSettings) -> LinkResult<DynMedium> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    settings.validate()?;

    let data_bits = match settings.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };
    let stop_bits = match settings.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };

    let path = settings.port.clone();
    let baud_rate = settings.baud_rate;
    let stream = spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                LinkError::new(
                    ErrorKind::ConfigurationFailure,
                    format!("failed to open serial port {}: {}", path, e),
                )
            })
    })
    .await
    .map_err(|e| {
        LinkError::new(
            ErrorKind::ConfigurationFailure,
            format!("serial open task failed: {}", e),
        )
    })??;

    tracing::info!(port = %settings.port, baud = settings.baud_rate, "Opened serial port");
    Ok(Box::new(stream))
}

/// Names of the serial ports present on this machine.
///
/// # Errors
///
/// `Io` when the platform enumeration fails.
#[cfg(feature = "serial")]
pub fn available_ports() -> LinkResult<Vec<String>> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|e| LinkError::new(ErrorKind::Io, format!("serial port enumeration failed: {}", e)))
}

/// Connect a TCP socket within `connect_timeout`.
///
/// # Errors
///
/// `ConfigurationFailure` when the connection is refused or not established
/// in time.
pub async fn open_tcp(host: &str, port: u16, connect_timeout: Duration) -> LinkResult<DynMedium> {
    let addr = format!("{}:{}", host, port);
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| {
            LinkError::new(
                ErrorKind::ConfigurationFailure,
                format!("connecting to {} timed out after {:?}", addr, connect_timeout),
            )
        })?
        .map_err(|e| {
            LinkError::new(
                ErrorKind::ConfigurationFailure,
                format!("failed to connect to {}: {}", addr, e),
            )
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(addr = %addr, error = %e, "Could not disable Nagle");
    }
    tracing::info!(addr = %addr, "Connected TCP link");
    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_validate_settings() {
        assert!(SerialSettings::new("/dev/ttyUSB0", 9600).validate().is_ok());
        assert!(SerialSettings::new("", 9600).validate().is_err());
        assert!(SerialSettings::new("/dev/ttyUSB0", 0).validate().is_err());

        let mut settings = SerialSettings::new("/dev/ttyUSB0", 9600);
        settings.data_bits = 9;
        let err = settings.validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationFailure);
    }

    #[cfg(feature = "serial")]
    #[tokio::test]
    async fn test_open_missing_port_is_configuration_failure() {
        let err = open_serial(&SerialSettings::new("/dev/does-not-exist-daq-link", 9600))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::ConfigurationFailure);
    }

    #[tokio::test]
    async fn test_open_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 8];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let mut medium = open_tcp("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        medium.write_all(b"PING\r\n").await.unwrap();
        let mut buf = [0u8; 6];
        medium.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING\r\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_tcp_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = open_tcp("127.0.0.1", port, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::ConfigurationFailure);
    }
}
