// Command recording
//
// Two complete sets of command buffers (one buffer per swapchain image in
// each). The render thread submits from the active set while the streaming
// thread re-records the inactive one, then publishes it by flipping the
// active index.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::VulkanDevice;

/// Number of command buffer sets
pub const COMMAND_SET_COUNT: usize = 2;

/// Which of the two command buffer sets is safe to submit
#[derive(Debug, Default)]
pub struct ActiveSet(AtomicUsize);

impl ActiveSet {
    pub fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Set the render thread submits from
    pub fn active(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Set the recorder may write into
    pub fn inactive(&self) -> usize {
        (self.active() + 1) % COMMAND_SET_COUNT
    }

    /// Publish the freshly recorded set
    pub fn flip(&self) -> usize {
        let next = self.inactive();
        self.0.store(next, Ordering::Release);
        next
    }
}

/// One vertex buffer binding and how many vertices to draw from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawItem {
    pub buffer: vk::Buffer,
    pub vertex_count: u32,
}

/// Everything drawn by one recording pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrawList {
    pub items: Vec<DrawItem>,
}

impl DrawList {
    pub fn new(items: Vec<DrawItem>) -> Self {
        Self { items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of vertices across every entry
    pub fn total_vertices(&self) -> u64 {
        self.items.iter().map(|item| u64::from(item.vertex_count)).sum()
    }
}

impl FromIterator<DrawItem> for DrawList {
    fn from_iter<I: IntoIterator<Item = DrawItem>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Static state every recording needs
pub struct RecordTargets {
    pub render_pass: vk::RenderPass,
    pub pipeline: vk::Pipeline,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
}

/// Double-buffered command buffers and the recording logic
pub struct CommandRecorder {
    device: Arc<VulkanDevice>,
    pools: [vk::CommandPool; COMMAND_SET_COUNT],
    sets: [Vec<vk::CommandBuffer>; COMMAND_SET_COUNT],
    targets: RecordTargets,
    active: ActiveSet,
    // Serializes recorders; pools are externally synchronized
    record_lock: Mutex<()>,
}

impl CommandRecorder {
    /// One pool and one set of `framebuffers.len()` buffers per set
    pub fn new(device: Arc<VulkanDevice>, targets: RecordTargets) -> Result<Self> {
        let mut this = Self {
            device,
            pools: [vk::CommandPool::null(); COMMAND_SET_COUNT],
            sets: Default::default(),
            targets,
            active: ActiveSet::new(),
            record_lock: Mutex::new(()),
        };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(this.device.queue_families.graphics)
            // RESET: buffers are re-recorded individually
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let image_count = this.targets.framebuffers.len() as u32;

        for set in 0..COMMAND_SET_COUNT {
            let pool = unsafe { this.device.device.create_command_pool(&pool_info, None) }
                .context("Failed to create command pool")?;
            this.pools[set] = pool;

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(image_count);

            this.sets[set] = unsafe { this.device.device.allocate_command_buffers(&alloc_info) }
                .context("Failed to allocate command buffers")?;
        }

        log::info!(
            "Allocated {} command buffer sets of {} buffers",
            COMMAND_SET_COUNT,
            image_count
        );
        Ok(this)
    }

    pub fn active_set(&self) -> usize {
        self.active.active()
    }

    /// Command buffer to submit for `image_index` from the active set
    pub fn active_command_buffer(&self, image_index: u32) -> Option<vk::CommandBuffer> {
        self.sets[self.active.active()]
            .get(image_index as usize)
            .copied()
    }

    /// Re-record the inactive set with `draws`, then make it active.
    ///
    /// Holds the queue lock and idles the device first, so no submission can
    /// read buffers that are being reset or vertex buffers that were freed.
    pub fn record_commands(&self, draws: &DrawList) -> Result<usize> {
        let _recording = self.record_lock.lock();
        let queues = self.device.lock_queues();

        // TODO: replace the device-wide idle with per-command-buffer fences
        self.device.wait_idle_locked(&queues)?;

        let target = self.active.inactive();
        for (image, &cmd) in self.sets[target].iter().enumerate() {
            self.record_one(cmd, self.targets.framebuffers[image], draws)
                .with_context(|| format!("Failed to record command buffer {image} of set {target}"))?;
        }

        let now_active = self.active.flip();
        log::debug!(
            "Recorded set {} ({} draws, {} vertices)",
            now_active,
            draws.items.len(),
            draws.total_vertices()
        );
        Ok(now_active)
    }

    fn record_one(
        &self,
        cmd: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        draws: &DrawList,
    ) -> Result<()> {
        let device = &self.device.device;
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.targets.clear_color,
            },
        }];

        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.targets.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.targets.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())?;
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);

            if !draws.is_empty() {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.targets.pipeline);
                // One bind + draw per entry; vertices drawn still sum to draws.total_vertices()
                for item in &draws.items {
                    device.cmd_bind_vertex_buffers(cmd, 0, &[item.buffer], &[0]);
                    device.cmd_draw(cmd, item.vertex_count, 1, 0, 0);
                }
            }

            device.cmd_end_render_pass(cmd);
            device.end_command_buffer(cmd)?;
        }
        Ok(())
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        // Destroying a pool frees its command buffers
        unsafe {
            for &pool in &self.pools {
                if pool != vk::CommandPool::null() {
                    self.device.device.destroy_command_pool(pool, None);
                }
            }
        }
    }
}
