// Streaming Vulkan renderer
//
// Simulation code hands entities to the renderer through a bounded queue; a
// dedicated streaming thread uploads their vertices and re-records one of two
// command buffer sets, while the render loop keeps submitting the other.

pub mod backend;
pub mod config;
pub mod entity;
pub mod error;
pub mod platform;
pub mod renderer;
pub mod streaming;

pub use backend::Vertex;
pub use config::Config;
pub use entity::{Entity, EntityId, EntityRef, Mesh, RenderEntity};
pub use error::{RendererError, RendererResult};
pub use platform::SurfaceProvider;
pub use renderer::{EntitySubmitter, Renderer, VulkanStreamBackend};
pub use streaming::StreamStatsSnapshot;
