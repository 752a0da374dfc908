//! Errors shared across layers: initialization failures and the coarse link status codes the
//! application observes.

/// Configuration rejected at initialization time. Never retried.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Channel pair (uplink: {}, downlink: {}) does not fall in a single dwell-time region!", .uplink, .downlink)]
    FrequencyInvalid { uplink: u8, downlink: u8 },

    #[error("Spreading factor SF{} is not supported by the selected region.", .spreading_factor)]
    DataRateInvalid { spreading_factor: u8 },

    #[error("Invalid parameter. Context: {}", .context)]
    ParameterInvalid { context: String },

    #[error("Unable to parse configuration.")]
    Parse(#[from] toml::de::Error),

    #[error("Unable to read configuration.")]
    Io(#[from] std::io::Error),
}

/// Coarse outcome of a link-layer operation, as seen by applications and by the MQTT-SN client.
#[derive(thiserror::Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkStatus {
    #[error("Invalid parameter.")]
    ParameterInvalid,

    #[error("Payload length exceeds the region limit.")]
    LengthError,

    #[error("Channel not free.")]
    ChannelNotFree,

    #[error("Reception timeout.")]
    RxTimeout,

    #[error("Transmission timeout.")]
    TxTimeout,

    #[error("Cryptographic error.")]
    CryptoError,

    #[error("Link error.")]
    Error,
}

impl LinkStatus {
    /// Status byte used on the serial API (0 is reserved for success).
    pub fn code(&self) -> u8 {
        match self {
            LinkStatus::ParameterInvalid => 2,
            LinkStatus::LengthError => 6,
            LinkStatus::ChannelNotFree => 7,
            LinkStatus::RxTimeout => 8,
            LinkStatus::CryptoError => 9,
            LinkStatus::Error => 10,
            LinkStatus::TxTimeout => 11,
        }
    }

    pub fn from_code(code: u8) -> Option<Result<(), LinkStatus>> {
        match code {
            0 => Some(Ok(())),
            2 => Some(Err(LinkStatus::ParameterInvalid)),
            6 => Some(Err(LinkStatus::LengthError)),
            7 => Some(Err(LinkStatus::ChannelNotFree)),
            8 => Some(Err(LinkStatus::RxTimeout)),
            9 => Some(Err(LinkStatus::CryptoError)),
            10 => Some(Err(LinkStatus::Error)),
            11 => Some(Err(LinkStatus::TxTimeout)),
            _ => None,
        }
    }
}
