//! Node configuration, read from TOML.
//!
//! ```toml
//! [link]
//! key = [0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6, 0xAB, 0xF7, 0x15, 0x88, 0x09, 0xCF, 0x4F, 0x3C]
//! pan_id = 0x0102
//! address = 0x05
//! uplink_channel = 24
//! downlink_channel = 25
//! spreading_factor = 9
//! tx_power = 13
//!
//! [client]
//! client_id_prefix = "LoRaCl"
//! keep_alive = 180
//!
//! [modem]
//! role = "rx"
//! ```
use log::info;
use serde::Deserialize;
use std::path::Path;

use crate::device::crypto::KEY_LENGTH;
use crate::device::frame::MULTICAST_ADDRESS;
use crate::device::radio::{LinkSettings, DEFAULT_SYNC_WORD};
use crate::device::region::{ChannelPlan, SpreadingFactor};
use crate::error::ConfigError;
use crate::modem::ModemConfig;
use crate::mqttsn::message::QoS;
use crate::mqttsn::{
    DEFAULT_KEEP_ALIVE, MAX_TOPIC_LENGTH, RESPONSE_TIMEOUT_MS, RETRY_COUNT, SEND_TIMEOUT_MS,
};
use crate::{LoRaAddress, PanId};

/// Root configuration structure (matches the TOML structure).
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub link: LinkConfig,
    #[serde(default)]
    pub client: ClientConfig,
    /// Present when the node runs as a serial modem.
    pub modem: Option<ModemConfig>,
}

/// Link layer parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// Pre-shared network key.
    pub key: [u8; KEY_LENGTH],
    pub pan_id: PanId,
    pub address: LoRaAddress,
    #[serde(default = "default_sync_word")]
    pub sync_word: u8,
    pub uplink_channel: u8,
    pub downlink_channel: u8,
    pub spreading_factor: SpreadingFactor,
    /// Transmit power, in dBm.
    #[serde(default = "default_tx_power")]
    pub tx_power: i8,
    /// Fixed seed for the listen-before-talk delays.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// MQTT-SN client parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub client_id_prefix: String,
    /// Keep-alive interval, in seconds.
    pub keep_alive: u16,
    pub clean_session: bool,
    /// Empty when no will is configured.
    pub will_topic: String,
    pub will_message: String,
    pub will_qos: QoS,
    pub will_retain: bool,
    pub retry_count: u8,
    pub response_timeout_ms: u32,
    /// Bound on channel access for each outgoing message.
    pub send_timeout_ms: u32,
}

fn default_sync_word() -> u8 {
    DEFAULT_SYNC_WORD
}

fn default_tx_power() -> i8 {
    13
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "LoRaCl".to_owned(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            will_topic: String::new(),
            will_message: String::new(),
            will_qos: QoS::AtMostOnce,
            will_retain: false,
            retry_count: RETRY_COUNT,
            response_timeout_ms: RESPONSE_TIMEOUT_MS,
            send_timeout_ms: SEND_TIMEOUT_MS,
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(content)?;
        config.client.validate()?;
        Ok(config)
    }

    /// Load configuration from file.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&config_path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {:?}", config_path.as_ref());
        Ok(config)
    }
}

impl LinkConfig {
    /// Resolve the channel plan. The identity must be nonzero and not the multicast address.
    pub fn validate(&self) -> Result<ChannelPlan, ConfigError> {
        if self.pan_id == 0 || self.address == 0 || self.address == MULTICAST_ADDRESS {
            return Err(ConfigError::ParameterInvalid {
                context: format!(
                    "Invalid device identity (pan: {:#06x}, address: {:#04x}).",
                    self.pan_id, self.address
                ),
            });
        }
        ChannelPlan::select(self.uplink_channel, self.downlink_channel, self.spreading_factor)
    }

    pub fn settings(&self) -> Result<LinkSettings, ConfigError> {
        Ok(LinkSettings {
            key: self.key,
            pan_id: self.pan_id,
            address: self.address,
            sync_word: self.sync_word,
            tx_power: self.tx_power,
            plan: self.validate()?,
            seed: self.seed,
        })
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.will_topic.len() > MAX_TOPIC_LENGTH {
            return Err(ConfigError::ParameterInvalid {
                context: format!("Will topic is too long ({}B).", self.will_topic.len()),
            });
        }
        if self.retry_count == 0 {
            return Err(ConfigError::ParameterInvalid {
                context: "Retry count must be at least 1.".to_owned(),
            });
        }
        if self.will_qos == QoS::FireAndForget {
            return Err(ConfigError::ParameterInvalid {
                context: "Will QoS cannot be -1.".to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::region::DwellTime;
    use crate::modem::ModemRole;

    const CONFIG: &str = r#"
        [link]
        key = [43, 126, 21, 22, 40, 174, 210, 166, 171, 247, 21, 136, 9, 207, 79, 60]
        pan_id = 0x0102
        address = 5
        uplink_channel = 40
        downlink_channel = 41
        spreading_factor = 9

        [client]
        client_id_prefix = "Node"
        keep_alive = 180
        will_topic = "node/status"
        will_message = "offline"
        will_qos = 1
    "#;

    #[test]
    fn parses_full_configuration() {
        let config = NodeConfig::from_toml_str(CONFIG).unwrap();
        assert_eq!(config.link.sync_word, DEFAULT_SYNC_WORD);
        assert_eq!(config.link.spreading_factor, SpreadingFactor::Sf9);
        assert_eq!(config.client.keep_alive, 180);
        assert_eq!(config.client.will_qos, QoS::AtLeastOnce);
        assert_eq!(config.client.retry_count, RETRY_COUNT);

        let settings = config.link.settings().unwrap();
        assert_eq!(settings.plan.dwell_time, DwellTime::Dwell1);
        assert_eq!(settings.plan.max_payload, 57);
    }

    #[test]
    fn client_section_is_optional() {
        let link_only: String = CONFIG.split("[client]").next().unwrap_or_default().to_owned();
        let config = NodeConfig::from_toml_str(&link_only).unwrap();
        assert_eq!(config.client.keep_alive, DEFAULT_KEEP_ALIVE);
        assert!(config.client.will_topic.is_empty());
    }

    #[test]
    fn modem_section() {
        assert!(NodeConfig::from_toml_str(CONFIG).unwrap().modem.is_none());

        let modem = format!("{}\n[modem]\nrole = \"tx\"\n", CONFIG);
        let config = NodeConfig::from_toml_str(&modem).unwrap();
        let modem = config.modem.unwrap();
        assert_eq!(modem.role, ModemRole::Tx);
        assert_eq!(modem.send_timeout_ms, SEND_TIMEOUT_MS);
    }

    #[test]
    fn rejects_invalid_values() {
        let bad_sf = CONFIG.replace("spreading_factor = 9", "spreading_factor = 13");
        assert!(matches!(NodeConfig::from_toml_str(&bad_sf), Err(ConfigError::Parse(_))));

        let bad_pair = CONFIG.replace("downlink_channel = 41", "downlink_channel = 30");
        let config = NodeConfig::from_toml_str(&bad_pair).unwrap();
        assert!(matches!(
            config.link.settings(),
            Err(ConfigError::FrequencyInvalid { uplink: 40, downlink: 30 })
        ));

        let bad_addr = CONFIG.replace("address = 5", "address = 0");
        let config = NodeConfig::from_toml_str(&bad_addr).unwrap();
        assert!(matches!(config.link.validate(), Err(ConfigError::ParameterInvalid { .. })));
    }
}
