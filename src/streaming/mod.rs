// Entity streaming - producer/consumer path from simulation to GPU
//
// queue:    bounded add/remove requests, shared with producers
// registry: entity id -> GPU vertex resources
// worker:   the streaming thread that applies requests and re-records

pub mod queue;
pub mod registry;
pub mod worker;

pub use queue::{TransferQueue, TransferRequest, WorkBatch, DEFAULT_QUEUE_CAPACITY};
pub use registry::{RenderableEntry, RenderableRegistry};
pub use worker::{
    BatchReport, GpuBackend, StreamProcessor, StreamStats, StreamStatsSnapshot, StreamingWorker,
};
