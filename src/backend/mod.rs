// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash, one per object group, each releasing its
// handles on drop.

pub mod command;
pub mod device;
pub mod guard;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use command::CommandRecorder;
pub use device::{DeviceConfig, VulkanDevice};
pub use pipeline::{Framebuffers, RenderPipeline};
pub use swapchain::Swapchain;
pub use sync::FrameSync;
