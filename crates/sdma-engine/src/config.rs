//! Device bring-up configuration.

use std::ops::Range;

use sdma_mem::CoherencyMode;

use crate::error::{DmaError, Result};
use crate::ring::DescriptorWidth;

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Receive buffers, owned by the device and cycled through hardware.
    pub rx_count: u32,
    /// Transmit buffers, cycled through the free queue.
    pub tx_count: u32,
    /// Fixed size of every buffer in bytes.
    pub buffer_size: u32,
    pub mode: CoherencyMode,
    pub width: DescriptorWidth,
    /// Completion ring depth in slots; hardware may hold at most
    /// `ring_depth - 1` buffers per direction.
    pub ring_depth: u32,
    /// Assert the continue bit capability at the card.
    pub cont_enable: bool,
    /// Entries handled per service call before yielding.
    pub service_burst: u32,
    /// Register offsets consumers may touch through the device's
    /// register read/write surface, relative to the register space base.
    pub register_window: Range<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            rx_count: 128,
            tx_count: 128,
            buffer_size: 4096,
            mode: CoherencyMode::Coherent,
            width: DescriptorWidth::Wide,
            ring_depth: 512,
            cont_enable: true,
            service_burst: 1024,
            register_window: 0x100..0x1_0000,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(DmaError::BadConfig("buffer_size must be non-zero"));
        }
        if self.rx_count == 0 {
            return Err(DmaError::BadConfig("rx_count must be non-zero"));
        }
        if self.ring_depth < 2 {
            return Err(DmaError::BadConfig("ring_depth must be at least 2"));
        }
        if self.service_burst == 0 {
            return Err(DmaError::BadConfig("service_burst must be non-zero"));
        }
        if self.register_window.start >= self.register_window.end {
            return Err(DmaError::BadConfig("register_window is empty"));
        }
        if let DescriptorWidth::Narrow = self.width {
            if u64::from(self.rx_count) + u64::from(self.tx_count) > 0x1000 {
                return Err(DmaError::BadConfig(
                    "narrow descriptors index at most 4096 buffers",
                ));
            }
            if self.buffer_size > 0xff_ffff {
                return Err(DmaError::BadConfig(
                    "narrow descriptors carry 24-bit sizes",
                ));
            }
        }
        Ok(())
    }

    /// Total buffer payload span, the region below which mapping offsets
    /// address buffers rather than registers.
    pub fn buffer_span(&self) -> u64 {
        (u64::from(self.rx_count) + u64::from(self.tx_count)) * u64::from(self.buffer_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_validates() {
        DeviceConfig::default().validate().unwrap();
    }

    #[test]
    fn narrow_limits_enforced() {
        let cfg = DeviceConfig {
            width: DescriptorWidth::Narrow,
            rx_count: 4000,
            tx_count: 200,
            ..DeviceConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = DeviceConfig {
            width: DescriptorWidth::Narrow,
            rx_count: 8,
            tx_count: 8,
            ..DeviceConfig::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn degenerate_shapes_rejected() {
        for cfg in [
            DeviceConfig { buffer_size: 0, ..DeviceConfig::default() },
            DeviceConfig { rx_count: 0, ..DeviceConfig::default() },
            DeviceConfig { ring_depth: 1, ..DeviceConfig::default() },
            DeviceConfig { service_burst: 0, ..DeviceConfig::default() },
            DeviceConfig { register_window: 0x100..0x100, ..DeviceConfig::default() },
        ] {
            assert!(cfg.validate().is_err());
        }
    }
}
