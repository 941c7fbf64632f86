// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. Every object that owns a Vulkan handle holds
// an Arc<VulkanDevice> and releases the handle on drop.

pub mod device;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use pipeline::{Pipeline, PipelineConfig, PipelineLayout};
pub use swapchain::{FrameError, Swapchain};
