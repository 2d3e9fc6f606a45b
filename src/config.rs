use std::{collections::HashMap, time::Duration};

use serde::Deserialize;

use crate::{
    error::{Error, Result},
    lan_transport::{LanTransport, DEFAULT_PASSWORD, DEFAULT_PORT},
    serial_transport::{SerialTransport, DEFAULT_BAUD_RATE},
    transport::{Transport, TransportKind},
};

/// Default host poll interval in milliseconds.
pub const DEFAULT_REFRESH_MS: u64 = 60000;

/// Where the VBus data comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    /// A VBus-over-TCP service.
    Lan {
        /// Host name or IP address.
        host: String,
        /// TCP port.
        port: u16,
        /// Password for the `PASS` command.
        password: String,
    },

    /// A serial line.
    Serial {
        /// Port path, e.g. `/dev/ttyACM0` or `COM3`.
        path: String,
        /// Bit rate.
        baud_rate: u32,
    },
}

impl TransportConfig {
    /// The kind of transport this configuration selects.
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Lan { .. } => TransportKind::Lan,
            TransportConfig::Serial { .. } => TransportKind::Serial,
        }
    }

    /// Build the transport.
    pub fn create(&self) -> Box<dyn Transport> {
        match self {
            TransportConfig::Lan {
                host,
                port,
                password,
            } => Box::new(LanTransport::new(host, *port, password)),
            TransportConfig::Serial { path, baud_rate } => {
                Box::new(SerialTransport::new(path, *baud_rate))
            }
        }
    }
}

/// The options as the host hands them over, all optional strings.
///
/// Field names match the host's option keys so the same struct can be read
/// from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawOptions {
    /// `host`
    pub host: Option<String>,
    /// `port`
    pub port: Option<String>,
    /// `password`
    pub password: Option<String>,
    /// `serialport`
    pub serialport: Option<String>,
    /// `refresh`, milliseconds
    pub refresh: Option<String>,
    /// `updateinterval`, seconds
    pub updateinterval: Option<String>,
    /// `deviceid`
    pub deviceid: Option<String>,
}

fn not_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn parse_option<T: std::str::FromStr>(key: &str, value: &Option<String>) -> Result<Option<T>> {
    match not_blank(value) {
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value {:?} for {}", text, key))),
        None => Ok(None),
    }
}

/// The typed binding configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingConfig {
    /// The selected transport.
    pub transport: TransportConfig,

    /// Host poll interval.
    pub refresh: Duration,

    /// Device poll interval; decides between continuous and periodic LAN mode.
    pub update_interval: Duration,

    /// Identifier used to look up the device definition.
    pub device_id: Option<String>,
}

impl BindingConfig {
    /// Create a configuration with default intervals.
    pub fn new(transport: TransportConfig) -> BindingConfig {
        BindingConfig {
            transport,
            refresh: Duration::from_millis(DEFAULT_REFRESH_MS),
            update_interval: Duration::from_secs(0),
            device_id: None,
        }
    }

    /// Build the configuration from the host's raw options.
    ///
    /// Exactly one of `host` and `serialport` must be set.
    pub fn from_options(options: &RawOptions) -> Result<BindingConfig> {
        let host = not_blank(&options.host);
        let serial = not_blank(&options.serialport);

        let transport = match (host, serial) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "You cannot define a LAN and a serial/USB interface".into(),
                ))
            }
            (Some(host), None) => TransportConfig::Lan {
                host: host.to_string(),
                port: parse_option("port", &options.port)?.unwrap_or(DEFAULT_PORT),
                password: not_blank(&options.password)
                    .unwrap_or(DEFAULT_PASSWORD)
                    .to_string(),
            },
            (None, Some(path)) => TransportConfig::Serial {
                path: path.to_string(),
                baud_rate: DEFAULT_BAUD_RATE,
            },
            (None, None) => {
                return Err(Error::Config(
                    "Either a host or a serial port must be defined".into(),
                ))
            }
        };

        let mut config = BindingConfig::new(transport);
        if let Some(refresh) = parse_option("refresh", &options.refresh)? {
            config.refresh = Duration::from_millis(refresh);
        }
        if let Some(update_interval) = parse_option("updateinterval", &options.updateinterval)? {
            config.update_interval = Duration::from_secs(update_interval);
        }
        config.device_id = not_blank(&options.deviceid).map(str::to_string);

        Ok(config)
    }

    /// Build the configuration from the host's key / value properties.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<BindingConfig> {
        let get = |key: &str| properties.get(key).cloned();

        BindingConfig::from_options(&RawOptions {
            host: get("host"),
            port: get("port"),
            password: get("password"),
            serialport: get("serialport"),
            refresh: get("refresh"),
            updateinterval: get("updateinterval"),
            deviceid: get("deviceid"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_lan_defaults() {
        let config =
            BindingConfig::from_properties(&properties(&[("host", "192.168.5.217")])).unwrap();

        assert_eq!(
            TransportConfig::Lan {
                host: "192.168.5.217".into(),
                port: 7053,
                password: "vbus".into(),
            },
            config.transport
        );
        assert_eq!(Duration::from_millis(60000), config.refresh);
        assert_eq!(Duration::from_secs(0), config.update_interval);
        assert_eq!(None, config.device_id);
        assert_eq!(TransportKind::Lan, config.transport.kind());
    }

    #[test]
    fn test_lan_options() {
        let config = BindingConfig::from_properties(&properties(&[
            ("host", "dl2.local"),
            ("port", "7054"),
            ("password", " secret "),
            ("refresh", "10000"),
            ("updateinterval", "60"),
            ("deviceid", " 7E11 "),
            ("serialport", "  "),
        ]))
        .unwrap();

        assert_eq!(
            TransportConfig::Lan {
                host: "dl2.local".into(),
                port: 7054,
                password: "secret".into(),
            },
            config.transport
        );
        assert_eq!(Duration::from_millis(10000), config.refresh);
        assert_eq!(Duration::from_secs(60), config.update_interval);
        assert_eq!(Some("7E11".to_string()), config.device_id);
    }

    #[test]
    fn test_serial() {
        let config =
            BindingConfig::from_properties(&properties(&[("serialport", "/dev/ttyACM0")]))
                .unwrap();

        assert_eq!(
            TransportConfig::Serial {
                path: "/dev/ttyACM0".into(),
                baud_rate: 9600,
            },
            config.transport
        );
        assert_eq!(TransportKind::Serial, config.transport.kind());
    }

    #[test]
    fn test_invalid() {
        let both = properties(&[("host", "dl2"), ("serialport", "/dev/ttyACM0")]);
        assert!(matches!(BindingConfig::from_properties(&both), Err(Error::Config(_))));

        let neither = properties(&[("deviceid", "7E11")]);
        assert!(matches!(BindingConfig::from_properties(&neither), Err(Error::Config(_))));

        let bad_port = properties(&[("host", "dl2"), ("port", "seventy")]);
        assert!(matches!(BindingConfig::from_properties(&bad_port), Err(Error::Config(_))));
    }

    #[test]
    fn test_create_transport() {
        let config = TransportConfig::Serial {
            path: "/dev/ttyACM0".into(),
            baud_rate: 9600,
        };
        let transport = config.create();
        assert_eq!(TransportKind::Serial, transport.kind());
        assert!(!transport.is_connected());
    }
}
