// Renderer - lifecycle, entity submission and the frame loop
//
// STARTUP ORDER:
//   device (instance, debug messenger, surface, physical + logical device)
//   -> swapchain -> render pass + pipeline -> framebuffers
//   -> command pools/buffers -> initial recording -> sync objects
//   -> streaming thread
//
// Shutdown walks the same list backwards. Every stage is stored as soon as it
// exists, so a failed startup is cleaned up by `shutdown()` (or Drop).

use anyhow::{anyhow, Context, Result};
use ash::vk;
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::buffer::{self, GpuBuffer};
use crate::backend::commands::{CommandRecorder, DrawItem, DrawList, RecordTargets};
use crate::backend::pipeline::{create_framebuffers, destroy_framebuffers};
use crate::backend::sync::FrameSynchronizer;
use crate::backend::vertex::Vertex;
use crate::backend::{GraphicsPipeline, Swapchain, VulkanDevice};
use crate::config::Config;
use crate::entity::{EntityId, EntityRef};
use crate::error::{RendererError, RendererResult};
use crate::platform::SurfaceProvider;
use crate::streaming::{
    GpuBackend, RenderableRegistry, StreamProcessor, StreamStats, StreamStatsSnapshot,
    StreamingWorker, TransferQueue, TransferRequest,
};

/// Vulkan implementation of the streaming thread's GPU work
pub struct VulkanStreamBackend {
    device: Arc<VulkanDevice>,
    recorder: Arc<CommandRecorder>,
}

impl VulkanStreamBackend {
    pub fn new(device: Arc<VulkanDevice>, recorder: Arc<CommandRecorder>) -> Self {
        Self { device, recorder }
    }
}

impl GpuBackend for VulkanStreamBackend {
    type Buffer = GpuBuffer;

    fn create_vertex_buffer(&mut self, id: EntityId, vertices: &[Vertex]) -> Result<GpuBuffer> {
        buffer::create_vertex_buffer(&self.device, &id.to_string(), vertices)
            .with_context(|| format!("Failed to upload vertices of {}", id))
    }

    fn destroy_vertex_buffer(&mut self, buffer: GpuBuffer) {
        buffer::destroy_buffer(&self.device, buffer);
    }

    fn record_commands(&mut self, registry: &RenderableRegistry<GpuBuffer>) -> Result<()> {
        let draws: DrawList = registry
            .iter()
            .map(|(_, entry)| DrawItem {
                buffer: entry.resource.buffer,
                vertex_count: entry.vertex_count,
            })
            .collect();
        self.recorder.record_commands(&draws)?;
        Ok(())
    }
}

/// Cloneable handle for queueing entity changes from any thread
#[derive(Clone)]
pub struct EntitySubmitter {
    queue: Arc<TransferQueue>,
    stats: Arc<StreamStats>,
}

impl EntitySubmitter {
    fn new(queue: Arc<TransferQueue>, stats: Arc<StreamStats>) -> Self {
        Self { queue, stats }
    }

    /// Queue GPU upload of `entity`'s mesh. False if the queue is full.
    pub fn add_entity(&self, entity: &EntityRef) -> bool {
        self.submit(TransferRequest::Add(entity.clone()), None)
    }

    /// Queue release of `entity`'s GPU resources. False if the queue is full.
    pub fn remove_entity(&self, entity: &EntityRef) -> bool {
        self.submit(TransferRequest::Remove(entity.id()), None)
    }

    /// Like [`add_entity`](Self::add_entity) but waits up to `timeout` for room
    pub fn add_entity_timeout(&self, entity: &EntityRef, timeout: Duration) -> bool {
        self.submit(TransferRequest::Add(entity.clone()), Some(timeout))
    }

    pub fn remove_entity_timeout(&self, entity: &EntityRef, timeout: Duration) -> bool {
        self.submit(TransferRequest::Remove(entity.id()), Some(timeout))
    }

    /// Requests waiting for the streaming thread
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn submit(&self, request: TransferRequest, timeout: Option<Duration>) -> bool {
        let id = request.entity_id();
        let accepted = match timeout {
            Some(timeout) => self.queue.push_timeout(request, timeout),
            None => self.queue.try_push(request),
        };
        if !accepted {
            self.stats.record_rejected();
            log::trace!("Transfer queue refused request for {}", id);
        }
        accepted
    }
}

/// The streaming renderer
///
/// Owns the Vulkan objects, the transfer queue and the streaming thread.
/// `render()` must be called from one thread; entity changes may come from
/// anywhere through [`EntitySubmitter`].
pub struct Renderer {
    config: Config,
    stats: Arc<StreamStats>,
    submitter: EntitySubmitter,

    // Torn down in this order by `shutdown()`
    worker: Option<StreamingWorker<VulkanStreamBackend>>,
    frames: Option<FrameSynchronizer>,
    recorder: Option<Arc<CommandRecorder>>,
    framebuffers: Vec<vk::Framebuffer>,
    pipeline: Option<GraphicsPipeline>,
    swapchain: Option<Swapchain>,
    device: Option<Arc<VulkanDevice>>,

    wait_stages: [vk::PipelineStageFlags; 1],
}

impl Renderer {
    pub fn new(config: Config) -> Self {
        let stats = Arc::new(StreamStats::default());
        let queue = Arc::new(TransferQueue::with_capacity(config.streaming.queue_capacity));
        Self {
            submitter: EntitySubmitter::new(queue, stats.clone()),
            stats,
            config,
            worker: None,
            frames: None,
            recorder: None,
            framebuffers: Vec::new(),
            pipeline: None,
            swapchain: None,
            device: None,
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// True between a successful `startup()` and `shutdown()`
    pub fn is_started(&self) -> bool {
        self.worker.is_some()
    }

    /// Create every GPU object for `window` and start the streaming thread.
    ///
    /// Requests queued before startup are processed once the thread runs.
    pub fn startup(&mut self, window: &dyn SurfaceProvider) -> RendererResult<()> {
        if self.device.is_some() {
            return Err(anyhow!("Renderer is already started").into());
        }

        // A previous shutdown closed the queue for good
        if self.submitter.queue.is_shutdown() {
            let queue = Arc::new(TransferQueue::with_capacity(self.config.streaming.queue_capacity));
            self.submitter = EntitySubmitter::new(queue, self.stats.clone());
        }

        self.init_vulkan(window).map_err(|e| {
            log::error!("Renderer startup failed: {:#}", e);
            RendererError::from(e)
        })
    }

    fn init_vulkan(&mut self, window: &dyn SurfaceProvider) -> Result<()> {
        let (width, height) = window.pixel_size();
        log::info!("Initializing Vulkan for a {}x{} surface", width, height);

        // Device: instance, debug messenger, surface, physical + logical device
        let device = VulkanDevice::new(
            &self.config.window.title,
            self.config.validation_enabled(),
            window,
        )?;
        self.device = Some(device.clone());

        let swapchain = Swapchain::new(device.clone(), width, height)?;
        let format = swapchain.format;
        let extent = swapchain.extent;
        let image_views = swapchain.image_views.clone();
        self.swapchain = Some(swapchain);

        let pipeline = GraphicsPipeline::new(
            device.clone(),
            format,
            extent,
            &self.config.shaders.vertex,
            &self.config.shaders.fragment,
        )?;
        let render_pass = pipeline.render_pass;
        let graphics_pipeline = pipeline.pipeline;
        self.pipeline = Some(pipeline);

        self.framebuffers = create_framebuffers(&device, &image_views, render_pass, extent)?;

        let recorder = Arc::new(CommandRecorder::new(
            device.clone(),
            RecordTargets {
                render_pass,
                pipeline: graphics_pipeline,
                framebuffers: self.framebuffers.clone(),
                extent,
                clear_color: self.config.graphics.clear_color,
            },
        )?);
        self.recorder = Some(recorder.clone());

        // Nothing registered yet: the active set only clears
        recorder
            .record_commands(&DrawList::default())
            .context("Initial command recording failed")?;

        self.frames = Some(FrameSynchronizer::new(
            &device,
            self.config.graphics.max_frames_in_flight,
        )?);

        let processor = StreamProcessor::new(
            VulkanStreamBackend::new(device, recorder),
            self.stats.clone(),
        );
        self.worker = Some(StreamingWorker::spawn(
            self.submitter.queue.clone(),
            processor,
        )?);

        log::info!("Renderer started");
        Ok(())
    }

    /// Queue `entity` for upload. False if the queue is full or shut down.
    pub fn add_entity(&self, entity: &EntityRef) -> bool {
        self.submitter.add_entity(entity)
    }

    /// Queue removal of `entity`. False if the queue is full or shut down.
    pub fn remove_entity(&self, entity: &EntityRef) -> bool {
        self.submitter.remove_entity(entity)
    }

    /// Handle for producers on other threads
    pub fn submitter(&self) -> EntitySubmitter {
        self.submitter.clone()
    }

    pub fn stream_stats(&self) -> StreamStatsSnapshot {
        self.stats.snapshot()
    }

    /// Render one frame: wait, acquire, submit the active set, present.
    pub fn render(&mut self) -> RendererResult<()> {
        let (Some(device), Some(swapchain), Some(recorder), Some(frames)) = (
            self.device.as_ref(),
            self.swapchain.as_ref(),
            self.recorder.as_ref(),
            self.frames.as_mut(),
        ) else {
            return Err(RendererError::NotStarted);
        };
        let timeout = self.config.graphics.frame_timeout_ns();

        let sync = frames.current();
        let fences = [sync.in_flight_fence];
        let wait_semaphores = [sync.image_available];
        let signal_semaphores = [sync.render_finished];

        // Slot must be finished on the GPU before its objects are reused
        unsafe { device.device.wait_for_fences(&fences, true, timeout) }?;

        // Fence stays signaled until we know a submit follows
        let image_index = swapchain.acquire_next_image(timeout, wait_semaphores[0])?;

        {
            // Recorder holds this lock while it resets and flips sets
            let queues = device.lock_queues();

            let cmd = recorder
                .active_command_buffer(image_index)
                .ok_or_else(|| anyhow!("No command buffer for swapchain image {}", image_index))?;
            let command_buffers = [cmd];

            let submit_info = vk::SubmitInfo::default()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&self.wait_stages)
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores);

            let submitted = unsafe {
                device.device.reset_fences(&fences).and_then(|()| {
                    device
                        .device
                        .queue_submit(device.graphics_queue, &[submit_info], fences[0])
                })
            };
            if let Err(e) = submitted {
                recover_frame_slot(device, &queues, frames, &self.wait_stages);
                return Err(anyhow::Error::new(e)
                    .context("Failed to submit command buffer")
                    .into());
            }

            swapchain
                .present(device.present_queue, image_index, &signal_semaphores)
                .context("Failed to present swapchain image")?;
        }

        frames.advance();
        Ok(())
    }

    /// Stop streaming and destroy every GPU object. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        self.submitter.queue.shutdown();

        let was_started = self.device.is_some();
        let processor = self.worker.take().and_then(StreamingWorker::stop);

        let Some(device) = self.device.take() else {
            return;
        };

        if let Err(e) = device.wait_idle() {
            log::error!("Failed to wait for device idle during shutdown: {:#}", e);
        }

        if let Some(mut processor) = processor {
            let released = processor.release_all();
            log::debug!("Released {} entity buffers", released);
        }

        if let Some(mut frames) = self.frames.take() {
            frames.destroy(&device.device);
        }

        // Pools go with the recorder
        self.recorder = None;

        destroy_framebuffers(&device, &self.framebuffers);
        self.framebuffers.clear();

        self.pipeline = None;
        self.swapchain = None;

        // Last reference: allocator, device, surface, messenger, instance
        drop(device);

        if was_started {
            log::info!("Renderer shut down");
        }
    }
}

/// Batch with no work that only consumes the acquire semaphore
fn release_batch<'a>(
    image_available: &'a [vk::Semaphore],
    wait_stages: &'a [vk::PipelineStageFlags],
) -> vk::SubmitInfo<'a> {
    vk::SubmitInfo::default()
        .wait_semaphores(image_available)
        .wait_dst_stage_mask(wait_stages)
}

/// Put the current slot back in the state the next `render()` expects after
/// its submit failed: acquire semaphore unsignaled, fence signaled.
///
/// Tries an empty batch first, then rebuilds the slot on an idle device.
fn recover_frame_slot(
    device: &VulkanDevice,
    queues: &MutexGuard<'_, ()>,
    frames: &mut FrameSynchronizer,
    wait_stages: &[vk::PipelineStageFlags],
) {
    let sync = frames.current();
    let fences = [sync.in_flight_fence];
    let image_available = [sync.image_available];
    let release = release_batch(&image_available, wait_stages);

    let released = unsafe {
        device.device.reset_fences(&fences).and_then(|()| {
            device
                .device
                .queue_submit(device.graphics_queue, &[release], fences[0])
        })
    };
    let Err(e) = released else {
        log::warn!("Frame submit failed, slot released with an empty batch");
        return;
    };

    log::warn!("Empty batch failed ({}), rebuilding frame sync objects", e);
    if let Err(e) = device.wait_idle_locked(queues) {
        log::error!("Failed to wait for device idle: {:#}", e);
    }
    if let Err(e) = frames.recreate_current(device) {
        log::error!("Failed to rebuild frame sync objects: {:#}", e);
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
