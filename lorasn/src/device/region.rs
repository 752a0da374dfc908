//! Regulatory channel plan: channel numbers, dwell-time regions, duty cycle and payload limits.
use serde::Deserialize;

use crate::error::ConfigError;

/// First channel of the dwell-time-free region.
pub const DWELL0_FIRST_CHANNEL: u8 = 24;
/// First channel of the dwell-time-limited region.
pub const DWELL1_FIRST_CHANNEL: u8 = 39;
/// Last channel of the dwell-time-limited region.
pub const DWELL1_LAST_CHANNEL: u8 = 61;

const FIRST_CHANNEL_FREQUENCY: u32 = 920_600_000;
const CHANNEL_SPACING: u32 = 200_000;

/// Maximum payload indexed by `SF12 - sf`, for each region.
const DWELL0_MAX_PAYLOAD: [u8; 6] = [91, 188, 200, 244, 244, 244];
const DWELL1_MAX_PAYLOAD: [u8; 6] = [0, 0, 15, 57, 125, 244];

const DWELL1_DUTY_CYCLE: u8 = 10;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize)]
#[serde(try_from = "u8")]
pub enum SpreadingFactor {
    Sf7 = 7,
    Sf8 = 8,
    Sf9 = 9,
    Sf10 = 10,
    Sf11 = 11,
    Sf12 = 12,
}

impl SpreadingFactor {
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for SpreadingFactor {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            7 => Ok(SpreadingFactor::Sf7),
            8 => Ok(SpreadingFactor::Sf8),
            9 => Ok(SpreadingFactor::Sf9),
            10 => Ok(SpreadingFactor::Sf10),
            11 => Ok(SpreadingFactor::Sf11),
            12 => Ok(SpreadingFactor::Sf12),
            spreading_factor => Err(ConfigError::DataRateInvalid { spreading_factor }),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Bandwidth {
    Khz125,
    Khz250,
    Khz500,
}

impl Bandwidth {
    pub fn hz(&self) -> u32 {
        match self {
            Bandwidth::Khz125 => 125_000,
            Bandwidth::Khz250 => 250_000,
            Bandwidth::Khz500 => 500_000,
        }
    }
}

/// Regulatory region a channel pair falls into.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DwellTime {
    /// Channels 24 to 38: no duty cycle, every spreading factor.
    Dwell0,
    /// Channels 39 to 61: 10% duty cycle, SF10 at most.
    Dwell1,
}

impl DwellTime {
    pub fn of_channel(channel: u8) -> Option<DwellTime> {
        match channel {
            DWELL0_FIRST_CHANNEL..=38 => Some(DwellTime::Dwell0),
            DWELL1_FIRST_CHANNEL..=DWELL1_LAST_CHANNEL => Some(DwellTime::Dwell1),
            _ => None,
        }
    }
}

/// Validated radio parameters derived from the configured channels and spreading factor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChannelPlan {
    pub dwell_time: DwellTime,
    pub uplink_frequency: u32,
    pub downlink_frequency: u32,
    pub spreading_factor: SpreadingFactor,
    pub bandwidth: Bandwidth,
    /// Percentage of airtime allowed, 0 meaning unconstrained.
    pub duty_cycle: u8,
    pub max_payload: u8,
}

/// Center frequency of a channel number, in Hz.
pub fn channel_frequency(channel: u8) -> Option<u32> {
    DwellTime::of_channel(channel)
        .map(|_| FIRST_CHANNEL_FREQUENCY + (channel - DWELL0_FIRST_CHANNEL) as u32 * CHANNEL_SPACING)
}

impl ChannelPlan {
    /// Both channels must belong to the same region and the spreading factor must be allowed
    /// there.
    pub fn select(
        uplink_channel: u8,
        downlink_channel: u8,
        spreading_factor: SpreadingFactor,
    ) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::FrequencyInvalid {
            uplink: uplink_channel,
            downlink: downlink_channel,
        };
        let dwell_time = match (
            DwellTime::of_channel(uplink_channel),
            DwellTime::of_channel(downlink_channel),
        ) {
            (Some(up), Some(down)) if up == down => up,
            _ => return Err(invalid()),
        };
        let sf_index = (SpreadingFactor::Sf12.value() - spreading_factor.value()) as usize;
        let (duty_cycle, max_payload) = match dwell_time {
            DwellTime::Dwell0 => (0, DWELL0_MAX_PAYLOAD[sf_index]),
            DwellTime::Dwell1 => {
                if spreading_factor > SpreadingFactor::Sf10 {
                    return Err(ConfigError::DataRateInvalid {
                        spreading_factor: spreading_factor.value(),
                    });
                }
                (DWELL1_DUTY_CYCLE, DWELL1_MAX_PAYLOAD[sf_index])
            }
        };
        let uplink_frequency = channel_frequency(uplink_channel).ok_or_else(invalid)?;
        let downlink_frequency = channel_frequency(downlink_channel).ok_or_else(invalid)?;
        Ok(ChannelPlan {
            dwell_time,
            uplink_frequency,
            downlink_frequency,
            spreading_factor,
            bandwidth: Bandwidth::Khz125,
            duty_cycle,
            max_payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_frequencies_follow_the_grid() {
        assert_eq!(channel_frequency(24), Some(920_600_000));
        assert_eq!(channel_frequency(38), Some(923_400_000));
        assert_eq!(channel_frequency(39), Some(923_600_000));
        assert_eq!(channel_frequency(61), Some(928_000_000));
        assert_eq!(channel_frequency(23), None);
        assert_eq!(channel_frequency(62), None);
    }

    #[test]
    fn dwell0_plan_has_no_duty_cycle() {
        let plan = ChannelPlan::select(24, 25, SpreadingFactor::Sf12).unwrap();
        assert_eq!(plan.dwell_time, DwellTime::Dwell0);
        assert_eq!(plan.duty_cycle, 0);
        assert_eq!(plan.max_payload, 91);
        assert_eq!(plan.uplink_frequency, 920_600_000);
        assert_eq!(plan.downlink_frequency, 920_800_000);

        let plan = ChannelPlan::select(30, 30, SpreadingFactor::Sf7).unwrap();
        assert_eq!(plan.max_payload, 244);
    }

    #[test]
    fn dwell1_plan_limits_spreading_factor() {
        let plan = ChannelPlan::select(40, 41, SpreadingFactor::Sf10).unwrap();
        assert_eq!(plan.dwell_time, DwellTime::Dwell1);
        assert_eq!(plan.duty_cycle, 10);
        assert_eq!(plan.max_payload, 15);

        assert!(matches!(
            ChannelPlan::select(40, 41, SpreadingFactor::Sf11),
            Err(ConfigError::DataRateInvalid { spreading_factor: 11 })
        ));
    }

    #[test]
    fn cross_region_pairs_are_rejected() {
        assert!(matches!(
            ChannelPlan::select(38, 39, SpreadingFactor::Sf7),
            Err(ConfigError::FrequencyInvalid { uplink: 38, downlink: 39 })
        ));
        assert!(matches!(
            ChannelPlan::select(10, 24, SpreadingFactor::Sf7),
            Err(ConfigError::FrequencyInvalid { .. })
        ));
    }

    #[test]
    fn spreading_factor_conversion() {
        assert_eq!(SpreadingFactor::try_from(9).unwrap(), SpreadingFactor::Sf9);
        assert!(SpreadingFactor::try_from(6).is_err());
    }
}
