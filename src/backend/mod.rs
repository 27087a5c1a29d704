// Backend module - Vulkan abstraction layer
//
// Thin owning wrappers around ash. Every GPU object here releases itself in
// Drop and holds an Arc of the device so it can never outlive it.

pub mod acceleration;
pub mod barrier;
pub mod buffer;
pub mod command;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod sbt;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
