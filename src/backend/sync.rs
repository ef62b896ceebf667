// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync
// Bounds how many frames the CPU may run ahead of the GPU

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

/// Frames the CPU may record/submit ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let mut sync = Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
        };

        if let Err(e) = sync.create_handles(&device.device) {
            sync.destroy(&device.device);
            return Err(e).context("Failed to create frame sync objects");
        }
        Ok(sync)
    }

    fn create_handles(&mut self, device: &ash::Device) -> Result<(), vk::Result> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        unsafe {
            self.image_available = device.create_semaphore(&semaphore_info, None)?;
            self.render_finished = device.create_semaphore(&semaphore_info, None)?;
            self.in_flight_fence = device.create_fence(&fence_info, None)?;
        }
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            if self.image_available != vk::Semaphore::null() {
                device.destroy_semaphore(self.image_available, None);
            }
            if self.render_finished != vk::Semaphore::null() {
                device.destroy_semaphore(self.render_finished, None);
            }
            if self.in_flight_fence != vk::Fence::null() {
                device.destroy_fence(self.in_flight_fence, None);
            }
        }
    }
}

/// Ring of per-frame sync objects and the slot currently in use
pub struct FrameSynchronizer {
    frames: Vec<FrameSync>,
    current: usize,
}

impl FrameSynchronizer {
    pub fn new(device: &VulkanDevice, frames_in_flight: usize) -> Result<Self> {
        let mut frames = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight.max(1) {
            match FrameSync::new(device) {
                Ok(sync) => frames.push(sync),
                Err(e) => {
                    for sync in &frames {
                        sync.destroy(&device.device);
                    }
                    return Err(e);
                }
            }
        }

        log::debug!("Created sync objects for {} frames in flight", frames.len());
        Ok(Self { frames, current: 0 })
    }

    pub fn current(&self) -> &FrameSync {
        &self.frames[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Swap in `sync` for the current slot, handing back the old objects
    pub fn replace_current(&mut self, sync: FrameSync) -> FrameSync {
        std::mem::replace(&mut self.frames[self.current], sync)
    }

    /// Destroy and recreate the current slot's semaphores and fence.
    ///
    /// The device must be idle so nothing is still pending on the old ones.
    pub fn recreate_current(&mut self, device: &VulkanDevice) -> Result<()> {
        let fresh = FrameSync::new(device)?;
        self.replace_current(fresh).destroy(&device.device);
        log::debug!("Recreated sync objects for frame slot {}", self.current);
        Ok(())
    }

    /// Move to the next slot
    pub fn advance(&mut self) {
        self.current = next_frame_index(self.current, self.frames.len());
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for sync in self.frames.drain(..) {
            sync.destroy(device);
        }
        self.current = 0;
    }
}

pub fn next_frame_index(current: usize, frames_in_flight: usize) -> usize {
    (current + 1) % frames_in_flight.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn frame_index_wraps() {
        let mut index = 0;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(index);
            index = next_frame_index(index, MAX_FRAMES_IN_FLIGHT);
        }
        assert_eq!(seen, vec![0, 1, 0, 1, 0]);
    }

    fn slot(raw: u64) -> FrameSync {
        FrameSync {
            image_available: vk::Semaphore::from_raw(raw),
            render_finished: vk::Semaphore::from_raw(raw + 1),
            in_flight_fence: vk::Fence::from_raw(raw + 2),
        }
    }

    #[test]
    fn replace_current_swaps_only_the_current_slot() {
        let mut frames = FrameSynchronizer {
            frames: vec![slot(10), slot(20)],
            current: 1,
        };

        let old = frames.replace_current(slot(30));

        assert_eq!(old.image_available, vk::Semaphore::from_raw(20));
        assert_eq!(old.in_flight_fence, vk::Fence::from_raw(22));
        assert_eq!(frames.current().image_available, vk::Semaphore::from_raw(30));
        assert_eq!(frames.current().in_flight_fence, vk::Fence::from_raw(32));
        assert_eq!(frames.frames[0].image_available, vk::Semaphore::from_raw(10));

        frames.advance();
        assert_eq!(frames.current().render_finished, vk::Semaphore::from_raw(11));
    }

    #[test]
    fn single_slot_stays_put() {
        assert_eq!(next_frame_index(0, 1), 0);
        assert_eq!(next_frame_index(0, 0), 0);
    }
}
