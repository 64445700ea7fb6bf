use serde::{Deserialize, Serialize};

use crate::config::types::{DataBits, Parity, StopBits};

/// Serial line settings for the RS-485 bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
        }
    }
}

impl Config {
    pub fn serial_port_info(&self) -> String {
        format!(
            "{} ({} baud, {} data bits, {} parity, {} stop bits)",
            self.device, self.baud_rate, self.data_bits, self.parity, self.stop_bits
        )
    }
}
