// Streaming task
//
// Applies queued add/remove requests to the registry, creating and freeing
// GPU buffers, and re-records command buffers once per drained batch.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::queue::{TransferQueue, TransferRequest, WorkBatch};
use super::registry::{RenderableEntry, RenderableRegistry};
use crate::backend::vertex::Vertex;
use crate::entity::EntityId;

/// GPU side of the streaming task
///
/// Implemented over Vulkan by the renderer; tests drive the processor with an
/// in-memory backend.
pub trait GpuBackend: Send {
    type Buffer: Send + 'static;

    /// Allocate a host-visible vertex buffer holding `vertices`
    fn create_vertex_buffer(&mut self, id: EntityId, vertices: &[Vertex]) -> Result<Self::Buffer>;

    /// Free a buffer and its memory
    fn destroy_vertex_buffer(&mut self, buffer: Self::Buffer);

    /// Re-record the inactive command set from the registry and publish it.
    ///
    /// On success nothing submitted afterwards references buffers that are
    /// no longer in `registry`, and the GPU has finished with earlier ones.
    fn record_commands(&mut self, registry: &RenderableRegistry<Self::Buffer>) -> Result<()>;
}

/// Counters shared between the streaming thread and observers
#[derive(Debug, Default)]
pub struct StreamStats {
    batches: AtomicU64,
    added: AtomicU64,
    removed: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    recordings: AtomicU64,
    recording_failures: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStatsSnapshot {
    /// Non-empty batches processed
    pub batches: u64,
    /// Entities that received GPU resources
    pub added: u64,
    /// Entities whose GPU resources were released
    pub removed: u64,
    /// Adds ignored because the entity has no vertices
    pub skipped: u64,
    /// Adds that failed to allocate GPU resources
    pub dropped: u64,
    /// Requests refused because the queue was full
    pub rejected: u64,
    pub recordings: u64,
    pub recording_failures: u64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            added: self.added.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            recordings: self.recordings.load(Ordering::Relaxed),
            recording_failures: self.recording_failures.load(Ordering::Relaxed),
        }
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Outcome of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub added: usize,
    pub replaced: usize,
    pub removed: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub recorded: bool,
}

/// Owns the registry and the backend; lives on the streaming thread
pub struct StreamProcessor<G: GpuBackend> {
    backend: G,
    registry: RenderableRegistry<G::Buffer>,
    // Out of the registry but possibly still referenced by the active set
    retired: Vec<G::Buffer>,
    stats: Arc<StreamStats>,
}

impl<G: GpuBackend> StreamProcessor<G> {
    pub fn new(backend: G, stats: Arc<StreamStats>) -> Self {
        Self {
            backend,
            registry: RenderableRegistry::new(),
            retired: Vec::new(),
            stats,
        }
    }

    pub fn registry(&self) -> &RenderableRegistry<G::Buffer> {
        &self.registry
    }

    pub fn backend(&self) -> &G {
        &self.backend
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    /// Buffers removed from the registry but not yet freed
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Apply `requests` in order, then re-record once.
    ///
    /// Buffers of removed or replaced entries leave the registry immediately
    /// and are freed after the re-record succeeds. An empty batch touches
    /// nothing and does not re-record.
    pub fn process_batch(&mut self, requests: Vec<TransferRequest>) -> BatchReport {
        let mut report = BatchReport::default();
        if requests.is_empty() {
            return report;
        }

        for request in requests {
            match request {
                TransferRequest::Add(entity) => {
                    let id = entity.id();
                    let vertices = match entity.mesh() {
                        Some(mesh) if !mesh.is_empty() => &mesh.vertices,
                        _ => {
                            log::trace!("{} has no vertices, skipping", id);
                            report.skipped += 1;
                            StreamStats::bump(&self.stats.skipped);
                            continue;
                        }
                    };

                    match self.add(id, vertices) {
                        Ok(replaced) => {
                            report.added += 1;
                            report.replaced += usize::from(replaced);
                            StreamStats::bump(&self.stats.added);
                        }
                        Err(e) => {
                            log::warn!("Dropping {}: {:#}", id, e);
                            report.dropped += 1;
                            StreamStats::bump(&self.stats.dropped);
                        }
                    }
                }
                TransferRequest::Remove(id) => {
                    if let Some(entry) = self.registry.remove(id) {
                        self.retired.push(entry.resource);
                        report.removed += 1;
                        StreamStats::bump(&self.stats.removed);
                    }
                }
            }
        }

        StreamStats::bump(&self.stats.batches);
        report.recorded = self.record();
        if report.recorded {
            self.free_retired();
        }
        report
    }

    fn add(&mut self, id: EntityId, vertices: &[Vertex]) -> Result<bool> {
        let vertex_count =
            u32::try_from(vertices.len()).context("Vertex count does not fit in u32")?;
        let buffer = self.backend.create_vertex_buffer(id, vertices)?;

        let previous = self.registry.insert(
            id,
            RenderableEntry {
                resource: buffer,
                vertex_count,
            },
        );
        // Re-adding replaces the old buffer
        if let Some(previous) = previous {
            self.retired.push(previous.resource);
            return Ok(true);
        }
        Ok(false)
    }

    fn free_retired(&mut self) {
        for buffer in self.retired.drain(..) {
            self.backend.destroy_vertex_buffer(buffer);
        }
    }

    fn record(&mut self) -> bool {
        match self.backend.record_commands(&self.registry) {
            Ok(()) => {
                StreamStats::bump(&self.stats.recordings);
                true
            }
            Err(e) => {
                log::error!("Command re-recording failed: {:#}", e);
                StreamStats::bump(&self.stats.recording_failures);
                false
            }
        }
    }

    /// Free every registry entry; used at shutdown after the device idles
    pub fn release_all(&mut self) -> usize {
        let mut released = self.retired.len();
        self.free_retired();
        for (_, entry) in self.registry.drain() {
            self.backend.destroy_vertex_buffer(entry.resource);
            released += 1;
        }
        released
    }
}

/// Runs a [`StreamProcessor`] on a dedicated thread fed by a [`TransferQueue`]
pub struct StreamingWorker<G: GpuBackend + 'static> {
    queue: Arc<TransferQueue>,
    handle: Option<JoinHandle<StreamProcessor<G>>>,
}

impl<G: GpuBackend + 'static> StreamingWorker<G> {
    pub fn spawn(queue: Arc<TransferQueue>, mut processor: StreamProcessor<G>) -> Result<Self> {
        let thread_queue = queue.clone();
        let handle = thread::Builder::new()
            .name("entity-streaming".into())
            .spawn(move || {
                log::debug!("Streaming thread started");
                loop {
                    match thread_queue.wait_for_work() {
                        WorkBatch::Shutdown => break,
                        WorkBatch::Requests(batch) => {
                            let count = batch.len();
                            let report = processor.process_batch(batch);
                            log::debug!("Processed {} transfer requests: {:?}", count, report);
                        }
                    }
                }
                log::debug!("Streaming thread stopped");
                processor
            })
            .context("Failed to spawn streaming thread")?;

        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    pub fn queue(&self) -> &Arc<TransferQueue> {
        &self.queue
    }

    /// Signal shutdown, join, and hand back the processor with its registry
    pub fn stop(mut self) -> Option<StreamProcessor<G>> {
        self.join()
    }

    fn join(&mut self) -> Option<StreamProcessor<G>> {
        let handle = self.handle.take()?;
        self.queue.shutdown();
        match handle.join() {
            Ok(processor) => Some(processor),
            Err(_) => {
                log::error!("Streaming thread panicked; its GPU buffers are leaked");
                None
            }
        }
    }
}

impl<G: GpuBackend + 'static> Drop for StreamingWorker<G> {
    fn drop(&mut self) {
        if let Some(mut processor) = self.join() {
            processor.release_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::commands::ActiveSet;
    use crate::entity::{Entity, EntityRef, Mesh};
    use std::collections::HashSet;

    #[derive(Default)]
    struct MockBackend {
        next: u32,
        live: HashSet<u32>,
        fail_ids: HashSet<EntityId>,
        fail_record: bool,
        active: ActiveSet,
        recorded_totals: Vec<u64>,
    }

    impl GpuBackend for MockBackend {
        type Buffer = u32;

        fn create_vertex_buffer(&mut self, id: EntityId, _vertices: &[Vertex]) -> Result<u32> {
            if self.fail_ids.contains(&id) {
                anyhow::bail!("out of device memory");
            }
            self.next += 1;
            self.live.insert(self.next);
            Ok(self.next)
        }

        fn destroy_vertex_buffer(&mut self, buffer: u32) {
            assert!(self.live.remove(&buffer), "double free of {buffer}");
        }

        fn record_commands(&mut self, registry: &RenderableRegistry<u32>) -> Result<()> {
            if self.fail_record {
                anyhow::bail!("device lost");
            }
            self.recorded_totals.push(registry.total_vertex_count());
            self.active.flip();
            Ok(())
        }
    }

    fn processor() -> StreamProcessor<MockBackend> {
        StreamProcessor::new(MockBackend::default(), Arc::new(StreamStats::default()))
    }

    fn entity(vertices: usize) -> EntityRef {
        Entity::with_vertices(vec![Vertex::default(); vertices]).into_ref()
    }

    #[test]
    fn add_then_remove_leaves_entity_absent() {
        let mut p = processor();
        let e = entity(3);
        p.process_batch(vec![
            TransferRequest::Add(e.clone()),
            TransferRequest::Remove(e.id()),
        ]);
        assert!(!p.registry().contains(e.id()));
        assert!(p.backend().live.is_empty());
    }

    #[test]
    fn remove_then_add_leaves_entity_present() {
        let mut p = processor();
        let e = entity(3);
        let report = p.process_batch(vec![
            TransferRequest::Remove(e.id()),
            TransferRequest::Add(e.clone()),
        ]);
        assert!(p.registry().contains(e.id()));
        assert_eq!(report.removed, 0);
        assert_eq!(report.added, 1);
    }

    #[test]
    fn empty_batch_does_not_record() {
        let mut p = processor();
        let report = p.process_batch(Vec::new());
        assert_eq!(report, BatchReport::default());
        assert!(p.backend().recorded_totals.is_empty());
        assert_eq!(p.stats().snapshot().batches, 0);
    }

    #[test]
    fn batch_records_exactly_once() {
        let mut p = processor();
        let batch = (0..5).map(|_| TransferRequest::Add(entity(3))).collect();
        let report = p.process_batch(batch);
        assert!(report.recorded);
        assert_eq!(p.backend().recorded_totals, vec![15]);
    }

    #[test]
    fn empty_and_missing_meshes_are_skipped() {
        let mut p = processor();
        let empty = Entity::new(Some(Mesh::default())).into_ref();
        let none = Entity::new(None).into_ref();
        let report = p.process_batch(vec![TransferRequest::Add(empty), TransferRequest::Add(none)]);
        assert_eq!(report.skipped, 2);
        assert!(p.registry().is_empty());
        assert_eq!(p.stats().snapshot().skipped, 2);
    }

    #[test]
    fn removing_unknown_entity_is_a_no_op() {
        let mut p = processor();
        let report = p.process_batch(vec![TransferRequest::Remove(EntityId(424242))]);
        assert_eq!(report.removed, 0);
        assert!(p.registry().is_empty());
    }

    #[test]
    fn allocation_failure_drops_entity_and_keeps_going() {
        let mut p = processor();
        let bad = entity(3);
        let good = entity(4);
        p.backend.fail_ids.insert(bad.id());

        let report = p.process_batch(vec![
            TransferRequest::Add(bad.clone()),
            TransferRequest::Add(good.clone()),
        ]);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.added, 1);
        assert!(!p.registry().contains(bad.id()));
        assert!(p.registry().contains(good.id()));
        assert_eq!(p.stats().snapshot().dropped, 1);
    }

    #[test]
    fn re_adding_replaces_and_frees_old_buffer() {
        let mut p = processor();
        let e = entity(3);
        p.process_batch(vec![TransferRequest::Add(e.clone())]);
        let report = p.process_batch(vec![TransferRequest::Add(e.clone())]);
        assert_eq!(report.replaced, 1);
        assert_eq!(p.registry().len(), 1);
        assert_eq!(p.backend().live.len(), 1);
    }

    #[test]
    fn removed_buffers_outlive_a_failed_recording() {
        let mut p = processor();
        let e = entity(3);
        p.process_batch(vec![TransferRequest::Add(e.clone())]);

        p.backend.fail_record = true;
        let report = p.process_batch(vec![TransferRequest::Remove(e.id())]);
        assert!(!report.recorded);
        assert!(!p.registry().contains(e.id()));
        // Active set still draws it, so the buffer must stay alive
        assert_eq!(p.retired_count(), 1);
        assert_eq!(p.backend().live.len(), 1);
        assert_eq!(p.stats().snapshot().recording_failures, 1);

        p.backend.fail_record = false;
        p.process_batch(vec![TransferRequest::Remove(EntityId(0))]);
        assert_eq!(p.retired_count(), 0);
        assert!(p.backend().live.is_empty());
    }

    #[test]
    fn release_all_frees_every_buffer() {
        let mut p = processor();
        p.process_batch((0..4).map(|_| TransferRequest::Add(entity(3))).collect());
        assert_eq!(p.release_all(), 4);
        assert!(p.registry().is_empty());
        assert!(p.backend().live.is_empty());
    }
}
