// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash, every type owns its handles and
// releases them on drop

pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use pipeline::{GraphicsPipeline, PipelineConfig};
pub use swapchain::Swapchain;
