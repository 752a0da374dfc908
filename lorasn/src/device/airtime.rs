//! LoRa time-on-air estimation (Semtech AN1200.13).
use super::device::TxConfig;

/// Airtime of a `length` bytes frame, explicit header, rounded up to the millisecond.
pub fn time_on_air_ms(config: &TxConfig, length: usize) -> u32 {
    let sf = config.spreading_factor.value() as f64;
    let symbol_ms = (1u32 << config.spreading_factor.value()) as f64 * 1000.0 / config.bandwidth.hz() as f64;
    // Low data rate optimization is mandated above 16ms symbols.
    let low_dr = if symbol_ms > 16.0 { 1.0 } else { 0.0 };
    let crc = if config.crc_on { 1.0 } else { 0.0 };

    let preamble_ms = (config.preamble_length as f64 + 4.25) * symbol_ms;
    let numerator = 8.0 * length as f64 - 4.0 * sf + 28.0 + 16.0 * crc;
    let denominator = 4.0 * (sf - 2.0 * low_dr);
    let payload_symbols =
        8.0 + ((numerator / denominator).ceil() * (config.coding_rate as u8 as f64 + 4.0)).max(0.0);

    (preamble_ms + payload_symbols * symbol_ms).ceil() as u32
}
