// Frame-rendering core for a mesh-shading Vulkan renderer
//
// `backend` talks to the GPU, `geometry` prepares meshes at load time and
// `renderer` runs the per-frame protocol on top of both.

pub mod backend;
pub mod config;
pub mod error;
pub mod geometry;
pub mod renderer;

pub use backend::{FrameParameters, GpuDevice, VulkanDevice};
pub use config::Config;
pub use error::{RenderError, RenderResult};
pub use renderer::{FrameOutcome, RenderCore};
