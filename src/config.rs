//! Bridge configuration.
//!
//! The host owns configuration storage and presentation; the bridge
//! consumes a validated snapshot and re-reads nothing on its own. A new
//! snapshot always tears down and rebuilds the whole endpoint set.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Lowest bus id a peripheral can hold; 0 is the controller role.
pub const MIN_DEVICE_ID: u8 = 1;
/// Highest bus id a peripheral can hold.
pub const MAX_DEVICE_ID: u8 = 7;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// First id of the configured device window.
    #[serde(default = "default_first_id")]
    pub first_id: u8,
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub serial: Option<SerialConfig>,
    #[serde(default)]
    pub passthrough: Option<PassthroughConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Bus id of this peripheral, unique within the device window.
    pub id: u8,
    pub host: IpAddr,
    #[serde(default = "default_device_port")]
    pub port: u16,
    #[serde(default)]
    pub mode: EndpointMode,
}

/// What the network session for a device carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointMode {
    /// The peer speaks the framed, sequence-numbered datagram protocol.
    #[default]
    Framed,
    /// The peer is itself a serial-bus relay; datagrams carry raw bus
    /// bytes.
    Raw,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub path: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Legacy TCP pass-through: clients speak raw bus bytes straight to the
/// serial port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PassthroughConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Milliseconds to wait for serial traffic after a client command
    /// before emitting `error_message`; `None` disables the watchdog.
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
    #[serde(default = "default_error_message")]
    pub error_message: String,
}

fn default_first_id() -> u8 {
    MIN_DEVICE_ID
}

fn default_device_port() -> u16 {
    52381
}

fn default_baud() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_listen_port() -> u16 {
    52381
}

fn default_max_clients() -> usize {
    4
}

fn default_error_message() -> String {
    "&& ERR:NORESPONSE".to_string()
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Two devices claim the same bus id. Rejected before any endpoint
    /// is constructed.
    AddressConflict(u8),
    /// Device id outside the configured window.
    InvalidId(u8),
    /// First id outside the peripheral id range.
    InvalidFirstId(u8),
    /// The device window would run past the highest bus id.
    TooManyDevices(usize),
}

impl Config {
    /// Check the invariants the routing engine relies on: ids unique,
    /// inside the window `[first_id, first_id + devices - 1]`, and the
    /// window itself inside the peripheral id range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_DEVICE_ID..=MAX_DEVICE_ID).contains(&self.first_id) {
            return Err(ConfigError::InvalidFirstId(self.first_id));
        }
        let window = (MAX_DEVICE_ID - self.first_id + 1) as usize;
        if self.devices.len() > window {
            return Err(ConfigError::TooManyDevices(self.devices.len()));
        }
        let end = self.first_id as usize + self.devices.len();
        let mut seen = [false; MAX_DEVICE_ID as usize + 1];
        for dev in &self.devices {
            let id = dev.id as usize;
            if id < self.first_id as usize || id >= end {
                return Err(ConfigError::InvalidId(dev.id));
            }
            if seen[id] {
                return Err(ConfigError::AddressConflict(dev.id));
            }
            seen[id] = true;
        }
        Ok(())
    }
}
