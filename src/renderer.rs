// =============================================================================
// RENDER CORE - Per-surface frame protocol
// =============================================================================
//
// One instance per rendering surface. Holds the sync set, command pools,
// swapchain and depth target, and drives
// acquire -> wait -> reset/record -> submit -> present every frame.
// Out-of-date and zero-area surfaces are absorbed here; only device-level
// failures reach the caller.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::backend::commands::{CommandPipeline, FrameParameters, RenderTarget};
use crate::backend::gpu::GpuDevice;
use crate::backend::image::ImageAllocation;
use crate::backend::swapchain::SwapchainManager;
use crate::backend::sync::FrameSync;
use crate::config::Config;
use crate::error::{RenderError, RenderResult};

/// What happened to a `render_frame` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { image_index: u32 },
    /// Nothing to draw into (zero-area surface or shut down)
    Skipped,
    /// The swapchain was rebuilt instead of presenting
    Recreated,
}

pub struct RenderCore<D: GpuDevice> {
    device: Arc<D>,
    sync: FrameSync,
    commands: CommandPipeline,
    swapchain: SwapchainManager,
    depth: Option<ImageAllocation>,

    frame_cursor: usize,
    present_mode: vk::PresentModeKHR,
    window_extent: vk::Extent2D,

    /// Surface has zero area, no swapchain can exist until a resize
    pending_device_properties_update: bool,
    needs_recreation: bool,
    shut_down: bool,
}

impl<D: GpuDevice> RenderCore<D> {
    pub fn new(
        device: Arc<D>,
        config: &Config,
        display: RawDisplayHandle,
        window: RawWindowHandle,
        window_extent: vk::Extent2D,
    ) -> RenderResult<Self> {
        let graphics = &config.graphics;
        let slot_count = graphics.max_frames_in_flight;

        let mut sync = FrameSync::create_all(&*device, slot_count, graphics.fence_timeout_ns)?;
        let mut commands =
            match CommandPipeline::create_all(&*device, slot_count, config.meshlet.max_mesh_tasks) {
                Ok(commands) => commands,
                Err(err) => {
                    release_sync(&*device, &mut sync);
                    return Err(err);
                }
            };

        let mut swapchain = SwapchainManager::new(graphics.min_image_count, graphics.acquire_timeout_ns);
        if let Err(err) = swapchain.create_surface(&*device, display, window) {
            release_sync(&*device, &mut sync);
            commands.destroy_all(&*device);
            return Err(err);
        }

        let mut core = Self {
            device,
            sync,
            commands,
            swapchain,
            depth: None,
            frame_cursor: 0,
            present_mode: config.get_present_mode(),
            window_extent,
            pending_device_properties_update: false,
            needs_recreation: false,
            shut_down: false,
        };
        core.build_swapchain()?;

        log::info!("Render core ready with {} frame slots", slot_count);
        Ok(core)
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn swapchain(&self) -> &SwapchainManager {
        &self.swapchain
    }

    pub fn depth_target(&self) -> Option<&ImageAllocation> {
        self.depth.as_ref()
    }

    /// Slot the next frame records into
    pub fn frame_slot(&self) -> usize {
        self.frame_cursor
    }

    pub fn is_pending_update(&self) -> bool {
        self.pending_device_properties_update
    }

    /// Current drawable extent, `None` while the surface has no area
    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.swapchain.properties().map(|properties| properties.extent)
    }

    /// Window resize report. Recreation happens on the next frame.
    pub fn on_resize(&mut self, width: u32, height: u32) {
        self.window_extent = vk::Extent2D { width, height };
        if width == 0 || height == 0 {
            log::debug!("Surface minimized, pausing rendering");
            self.pending_device_properties_update = true;
        } else {
            self.pending_device_properties_update = false;
            self.needs_recreation = true;
        }
    }

    /// Wait until the next frame's slot is free and return it. Host writes
    /// owned by that slot are safe afterwards; the wait inside
    /// `render_frame` then has nothing left to do.
    pub fn wait_for_slot(&mut self) -> RenderResult<usize> {
        let slot = self.frame_cursor;
        if self.shut_down {
            return Ok(slot);
        }
        if let Some(token) = self.sync.wait(&*self.device, slot)? {
            self.commands.reset_pool(&*self.device, token)?;
        }
        Ok(slot)
    }

    pub fn render_frame(&mut self, params: &FrameParameters) -> RenderResult<FrameOutcome> {
        if self.shut_down || self.pending_device_properties_update {
            return Ok(FrameOutcome::Skipped);
        }
        if self.needs_recreation {
            self.recreate()?;
            if self.pending_device_properties_update {
                return Ok(FrameOutcome::Skipped);
            }
        }

        let slot = self.frame_cursor;
        let device = &*self.device;

        // Acquire also waits on the slot's previous submission
        let acquired = self.swapchain.acquire_next(device, &mut self.sync, slot)?;
        if let Some(token) = acquired.pool_reset {
            self.commands.reset_pool(device, token)?;
        }
        let Some(image_index) = acquired.image_index else {
            self.recreate()?;
            return Ok(FrameOutcome::Recreated);
        };

        let color = self
            .swapchain
            .images()
            .get(image_index as usize)
            .ok_or(RenderError::vulkan("swapchain acquire", vk::Result::ERROR_UNKNOWN))?;
        let target = RenderTarget { color, depth: self.depth.as_ref() };

        self.commands.record(device, slot, params, &target)?;
        self.commands.submit(device, &mut self.sync, slot)?;
        let presented = self.swapchain.present(device, &self.sync, slot, image_index)?;

        self.frame_cursor = (slot + 1) % self.sync.slot_count();

        if !presented {
            self.recreate()?;
            return Ok(FrameOutcome::Recreated);
        }
        Ok(FrameOutcome::Presented { image_index })
    }

    /// Rebuild the swapchain and depth target against the current surface
    fn recreate(&mut self) -> RenderResult<()> {
        log::info!("Recreating swapchain...");
        self.device
            .wait_idle()
            .map_err(|result| RenderError::vulkan("device idle wait", result))?;
        // Semaphores of an abandoned acquire or present may still be signaled
        self.sync.reset_semaphores(&*self.device)?;
        self.build_swapchain()
    }

    fn build_swapchain(&mut self) -> RenderResult<()> {
        let device = &*self.device;
        let (properties, capabilities) =
            self.swapchain
                .query_surface(device, self.present_mode, self.window_extent)?;

        let Some(properties) = properties else {
            log::debug!("Surface has zero area, deferring swapchain creation");
            self.pending_device_properties_update = true;
            return Ok(());
        };

        if let Some(mut depth) = self.depth.take() {
            depth.destroy(device);
        }
        self.swapchain.create(device, &properties, &capabilities)?;
        self.depth = Some(
            device
                .create_depth_target(properties.extent)
                .map_err(RenderError::creation("depth target"))?,
        );

        self.pending_device_properties_update = false;
        self.needs_recreation = false;
        Ok(())
    }

    /// Release everything in dependency order. Safe to call twice.
    ///
    /// A failed idle wait (device lost) does not stop the release; its error
    /// is returned once every object is gone.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        if self.shut_down {
            return Ok(());
        }
        log::info!("Shutting down render core...");

        let device = &*self.device;
        let idle = self.sync.destroy_all(device);
        self.commands.destroy_all(device);
        if let Some(mut depth) = self.depth.take() {
            depth.destroy(device);
        }
        self.swapchain.release_all(device);

        self.shut_down = true;
        idle
    }
}

/// Cleanup on a failed construction, where the original error wins
fn release_sync<D: GpuDevice>(device: &D, sync: &mut FrameSync) {
    if let Err(err) = sync.destroy_all(device) {
        log::warn!("Frame sync cleanup after failed setup: {}", err);
    }
}

impl<D: GpuDevice> Drop for RenderCore<D> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("Render core shutdown failed: {}", err);
        }
    }
}
