// End-to-end streaming without a GPU: producers push through the transfer
// queue, the worker thread applies batches against an in-memory backend.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stream_renderer::backend::commands::ActiveSet;
use stream_renderer::streaming::{
    GpuBackend, RenderableRegistry, StreamProcessor, StreamStats, StreamingWorker, TransferQueue,
    TransferRequest,
};
use stream_renderer::{Entity, EntityId, EntityRef, Vertex};

#[derive(Default)]
struct GpuState {
    next: u64,
    live: HashSet<u64>,
    recordings: Vec<Vec<(EntityId, u32)>>,
}

/// Backend whose state stays observable after it moves onto the worker thread
#[derive(Clone, Default)]
struct SharedBackend {
    state: Arc<Mutex<GpuState>>,
    active: Arc<ActiveSet>,
}

impl GpuBackend for SharedBackend {
    type Buffer = u64;

    fn create_vertex_buffer(&mut self, _id: EntityId, _vertices: &[Vertex]) -> Result<u64> {
        let mut state = self.state.lock();
        state.next += 1;
        let handle = state.next;
        state.live.insert(handle);
        Ok(handle)
    }

    fn destroy_vertex_buffer(&mut self, buffer: u64) {
        assert!(self.state.lock().live.remove(&buffer), "buffer {buffer} freed twice");
    }

    fn record_commands(&mut self, registry: &RenderableRegistry<u64>) -> Result<()> {
        let draws = registry
            .iter()
            .map(|(id, entry)| (id, entry.vertex_count))
            .collect();
        self.state.lock().recordings.push(draws);
        self.active.flip();
        Ok(())
    }
}

fn triangle(vertices: usize) -> EntityRef {
    Entity::with_vertices(vec![Vertex::default(); vertices]).into_ref()
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for streaming thread");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn batches_update_registry_and_flip_active_set() {
    let backend = SharedBackend::default();
    let mut processor = StreamProcessor::new(backend.clone(), Arc::new(StreamStats::default()));
    assert_eq!(backend.active.active(), 0);

    let a = triangle(3);
    processor.process_batch(vec![TransferRequest::Add(a.clone())]);

    assert_eq!(processor.registry().len(), 1);
    assert_eq!(processor.registry().total_vertex_count(), 3);
    assert_eq!(backend.active.active(), 1);

    let b = triangle(4);
    processor.process_batch(vec![
        TransferRequest::Add(b.clone()),
        TransferRequest::Remove(a.id()),
    ]);

    assert_eq!(processor.registry().ids(), vec![b.id()]);
    assert_eq!(processor.registry().total_vertex_count(), 4);
    assert_eq!(backend.active.active(), 0);

    let recordings = backend.state.lock().recordings.clone();
    assert_eq!(recordings, vec![vec![(a.id(), 3)], vec![(b.id(), 4)]]);
    assert_eq!(backend.state.lock().live.len(), 1);
}

#[test]
fn draining_an_empty_queue_changes_nothing() {
    let queue = TransferQueue::with_capacity(4);
    let backend = SharedBackend::default();
    let mut processor = StreamProcessor::new(backend.clone(), Arc::new(StreamStats::default()));

    processor.process_batch(queue.drain());
    processor.process_batch(queue.drain());

    assert!(processor.registry().is_empty());
    assert!(backend.state.lock().recordings.is_empty());
    assert_eq!(backend.active.active(), 0);
}

#[test]
fn queue_rejects_past_capacity_until_drained() {
    const CAPACITY: usize = 8;
    let queue = TransferQueue::with_capacity(CAPACITY);

    for _ in 0..CAPACITY {
        assert!(queue.try_push(TransferRequest::Add(triangle(3))));
    }
    assert!(!queue.try_push(TransferRequest::Add(triangle(3))));

    assert_eq!(queue.drain().len(), CAPACITY);
    assert!(queue.try_push(TransferRequest::Add(triangle(3))));
}

#[test]
fn worker_thread_applies_requests_from_many_producers() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 25;

    let queue = Arc::new(TransferQueue::with_capacity(16));
    let stats = Arc::new(StreamStats::default());
    let backend = SharedBackend::default();
    let worker = StreamingWorker::spawn(
        queue.clone(),
        StreamProcessor::new(backend.clone(), stats.clone()),
    )
    .unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut kept = Vec::new();
                for i in 0..PER_PRODUCER {
                    let entity = triangle(3);
                    let request = TransferRequest::Add(entity.clone());
                    assert!(queue.push_timeout(request, Duration::from_secs(5)));
                    // Every other entity is removed again
                    if i % 2 == 0 {
                        let request = TransferRequest::Remove(entity.id());
                        assert!(queue.push_timeout(request, Duration::from_secs(5)));
                    } else {
                        kept.push(entity.id());
                    }
                }
                kept
            })
        })
        .collect();

    let expected: HashSet<EntityId> = producers
        .into_iter()
        .flat_map(|p| p.join().unwrap())
        .collect();

    let adds = (PRODUCERS * PER_PRODUCER) as u64;
    wait_for(|| stats.snapshot().added == adds && queue.is_empty());

    let mut processor = worker.stop().expect("streaming thread returns its processor");
    let registered: HashSet<EntityId> = processor.registry().ids().into_iter().collect();
    assert_eq!(registered, expected);
    assert_eq!(processor.registry().total_vertex_count(), 3 * expected.len() as u64);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.removed, adds - expected.len() as u64);
    assert!(snapshot.batches >= 1);
    assert_eq!(snapshot.recordings, snapshot.batches);

    processor.release_all();
    assert!(backend.state.lock().live.is_empty());
}

#[test]
fn dropping_the_worker_releases_its_buffers() {
    let queue = Arc::new(TransferQueue::with_capacity(8));
    let stats = Arc::new(StreamStats::default());
    let backend = SharedBackend::default();
    let worker = StreamingWorker::spawn(
        queue.clone(),
        StreamProcessor::new(backend.clone(), stats.clone()),
    )
    .unwrap();

    for _ in 0..3 {
        assert!(queue.try_push(TransferRequest::Add(triangle(3))));
    }
    wait_for(|| stats.snapshot().added == 3);
    assert_eq!(backend.state.lock().live.len(), 3);

    drop(worker);
    assert!(backend.state.lock().live.is_empty());
    assert!(queue.is_shutdown());
    assert!(!queue.try_push(TransferRequest::Add(triangle(3))));
}
