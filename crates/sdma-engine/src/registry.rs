//! Registry of live devices, addressed by generation-tagged handles.
//!
//! A handle names a slot plus the generation it was issued under; once
//! the slot is reused the old handle stops resolving instead of
//! silently reaching the new occupant.

use std::sync::{Arc, Mutex};

use sdma_mem::mmio::RegisterIo;
use sdma_mem::BusHeap;

use crate::config::DeviceConfig;
use crate::device::Device;
use crate::error::{DmaError, Result};
use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    slot: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    device: Option<Arc<Device>>,
}

pub struct DeviceRegistry {
    slots: Mutex<Vec<Slot>>,
}

impl DeviceRegistry {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot { generation: 0, device: None });
        Self { slots: Mutex::new(slots) }
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).iter().filter(|s| s.device.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bring up a device and register it in the first free slot.
    pub fn create(
        &self,
        cfg: DeviceConfig,
        heap: Arc<BusHeap>,
        regs: Arc<dyn RegisterIo>,
    ) -> Result<DeviceHandle> {
        // Bring-up happens outside the slot lock; a device that fails
        // bring-up never occupies a slot.
        let dev = Device::new(cfg, heap, regs)?;
        let mut slots = lock(&self.slots);
        let Some((i, slot)) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.device.is_none())
        else {
            dev.shutdown();
            return Err(DmaError::RegistryFull);
        };
        slot.generation += 1;
        slot.device = Some(dev);
        Ok(DeviceHandle {
            slot: i as u32,
            generation: slot.generation,
        })
    }

    pub fn get(&self, handle: DeviceHandle) -> Result<Arc<Device>> {
        let slots = lock(&self.slots);
        let slot = slots
            .get(handle.slot as usize)
            .ok_or(DmaError::StaleHandle)?;
        if slot.generation != handle.generation {
            return Err(DmaError::StaleHandle);
        }
        slot.device.clone().ok_or(DmaError::StaleHandle)
    }

    /// Shut the device down and free its slot. The handle and any copy
    /// of it are dead afterwards.
    pub fn destroy(&self, handle: DeviceHandle) -> Result<()> {
        let dev = {
            let mut slots = lock(&self.slots);
            let slot = slots
                .get_mut(handle.slot as usize)
                .ok_or(DmaError::StaleHandle)?;
            if slot.generation != handle.generation {
                return Err(DmaError::StaleHandle);
            }
            slot.device.take().ok_or(DmaError::StaleHandle)?
        };
        dev.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdma_mem::mmio::RamRegisters;
    use sdma_mem::BUS_PAGE;

    fn cfg() -> DeviceConfig {
        DeviceConfig {
            rx_count: 2,
            tx_count: 2,
            ring_depth: 4,
            ..DeviceConfig::default()
        }
    }

    fn create(reg: &DeviceRegistry) -> Result<DeviceHandle> {
        reg.create(
            cfg(),
            BusHeap::new(64 * BUS_PAGE),
            Arc::new(RamRegisters::new(0x8000)),
        )
    }

    #[test]
    fn create_get_destroy() {
        let reg = DeviceRegistry::new(4);
        let h = create(&reg).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(h).unwrap().buffer_count(), 4);
        reg.destroy(h).unwrap();
        assert!(reg.is_empty());
        assert!(matches!(reg.get(h), Err(DmaError::StaleHandle)));
        assert!(matches!(reg.destroy(h), Err(DmaError::StaleHandle)));
    }

    #[test]
    fn stale_handle_does_not_reach_slot_reuser() {
        let reg = DeviceRegistry::new(1);
        let first = create(&reg).unwrap();
        reg.destroy(first).unwrap();
        let second = create(&reg).unwrap();
        assert!(matches!(reg.get(first), Err(DmaError::StaleHandle)));
        assert!(reg.get(second).is_ok());
    }

    #[test]
    fn capacity_enforced() {
        let reg = DeviceRegistry::new(1);
        let _h = create(&reg).unwrap();
        assert!(matches!(create(&reg), Err(DmaError::RegistryFull)));
    }
}
