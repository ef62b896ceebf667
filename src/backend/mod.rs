// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Every object keeps an Arc to the device so the device is destroyed last

pub mod buffer;
pub mod commands;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod vertex;

pub use commands::{ActiveSet, CommandRecorder, DrawItem, DrawList};
pub use device::VulkanDevice;
pub use pipeline::GraphicsPipeline;
pub use swapchain::Swapchain;
pub use vertex::Vertex;
