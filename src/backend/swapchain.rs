// Swapchain - Window presentation
//
// Owns the surface, the current swapchain, the one being retired and the
// views of every presentable image. Out-of-date and suboptimal results are
// not errors here: they come back as "no image" / "not presented" and the
// caller recreates.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::gpu::{GpuDevice, SwapchainDesc};
use super::image::ImageAllocation;
use super::sync::{FrameSync, PoolResetToken};
use crate::error::{RenderError, RenderResult};

/// Format, present mode and extent agreed with the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceProperties {
    pub format: vk::SurfaceFormatKHR,
    pub mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
}

impl SurfaceProperties {
    /// Pick format, mode and extent. `Ok(None)` means the surface has no area
    /// right now and no swapchain can be built.
    pub fn negotiate(
        formats: &[vk::SurfaceFormatKHR],
        present_modes: &[vk::PresentModeKHR],
        capabilities: &vk::SurfaceCapabilitiesKHR,
        preferred_mode: vk::PresentModeKHR,
        window_extent: vk::Extent2D,
    ) -> RenderResult<Option<Self>> {
        // Choose surface format (prefer SRGB)
        let format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .copied()
            .ok_or(RenderError::NoSurfaceFormat)?;

        // FIFO is always supported
        let mode = if present_modes.contains(&preferred_mode) {
            preferred_mode
        } else {
            vk::PresentModeKHR::FIFO
        };

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: window_extent.width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: window_extent.height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };

        if extent.width == 0 || extent.height == 0 {
            return Ok(None);
        }

        Ok(Some(Self { format, mode, extent }))
    }
}

/// Result of asking the presentation engine for an image
#[derive(Debug)]
pub struct AcquireOutcome {
    /// `None` when the swapchain must be recreated first
    pub image_index: Option<u32>,
    /// Present when the slot's previous work was waited on
    pub pool_reset: Option<PoolResetToken>,
}

pub struct SwapchainManager {
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    old_swapchain: vk::SwapchainKHR,
    properties: Option<SurfaceProperties>,
    images: Vec<ImageAllocation>,
    min_image_count: u32,
    acquire_timeout_ns: u64,
}

impl SwapchainManager {
    pub fn new(min_image_count: u32, acquire_timeout_ns: u64) -> Self {
        Self {
            surface: vk::SurfaceKHR::null(),
            swapchain: vk::SwapchainKHR::null(),
            old_swapchain: vk::SwapchainKHR::null(),
            properties: None,
            images: Vec::new(),
            min_image_count,
            acquire_timeout_ns,
        }
    }

    /// Bind the presentation surface to a native window
    pub fn create_surface<D: GpuDevice + ?Sized>(
        &mut self,
        device: &D,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> RenderResult<()> {
        self.surface = device
            .create_surface(display, window)
            .map_err(RenderError::creation("surface"))?;
        Ok(())
    }

    /// Current capabilities plus negotiated properties (`None` for zero area)
    pub fn query_surface<D: GpuDevice + ?Sized>(
        &self,
        device: &D,
        preferred_mode: vk::PresentModeKHR,
        window_extent: vk::Extent2D,
    ) -> RenderResult<(Option<SurfaceProperties>, vk::SurfaceCapabilitiesKHR)> {
        let query = |result| RenderError::vulkan("surface query", result);
        let capabilities = device.surface_capabilities(self.surface).map_err(query)?;
        let formats = device.surface_formats(self.surface).map_err(query)?;
        let modes = device.surface_present_modes(self.surface).map_err(query)?;

        let properties = SurfaceProperties::negotiate(
            &formats,
            &modes,
            &capabilities,
            preferred_mode,
            window_extent,
        )?;
        Ok((properties, capabilities))
    }

    /// Build a swapchain, retiring the current one if there is one
    pub fn create<D: GpuDevice + ?Sized>(
        &mut self,
        device: &D,
        properties: &SurfaceProperties,
        capabilities: &vk::SurfaceCapabilitiesKHR,
    ) -> RenderResult<()> {
        let queue_families = device.unique_queue_families();
        // Concurrent sharing only pays off when images cross queue families
        let sharing_mode = if queue_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let mut image_count = self.min_image_count.max(capabilities.min_image_count);
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        self.old_swapchain = self.swapchain;
        let desc = SwapchainDesc {
            surface: self.surface,
            min_image_count: image_count,
            format: properties.format,
            extent: properties.extent,
            sharing_mode,
            queue_families: &queue_families,
            pre_transform: capabilities.current_transform,
            present_mode: properties.mode,
            old_swapchain: self.old_swapchain,
        };

        let swapchain = match device.create_swapchain(&desc) {
            Ok(swapchain) => swapchain,
            Err(result) => {
                self.old_swapchain = vk::SwapchainKHR::null();
                return Err(RenderError::Creation { what: "swapchain", result });
            }
        };
        self.swapchain = swapchain;

        let images = match device.swapchain_images(swapchain) {
            Ok(images) => images,
            Err(result) => {
                // The old swapchain is retired either way
                self.destroy_images(device);
                if self.old_swapchain != vk::SwapchainKHR::null() {
                    device.destroy_swapchain(self.old_swapchain);
                    self.old_swapchain = vk::SwapchainKHR::null();
                }
                self.properties = None;
                return Err(RenderError::vulkan("swapchain image query", result));
            }
        };

        // Old views reference old images; both go before the old swapchain
        self.destroy_images(device);
        if self.old_swapchain != vk::SwapchainKHR::null() {
            device.destroy_swapchain(self.old_swapchain);
            self.old_swapchain = vk::SwapchainKHR::null();
        }

        self.images = images
            .into_iter()
            .map(|image| {
                ImageAllocation::swapchain_image(image, properties.format.format, properties.extent)
            })
            .collect();
        for allocation in &mut self.images {
            allocation.view = device
                .create_image_view(allocation.image, allocation.format, vk::ImageAspectFlags::COLOR)
                .map_err(RenderError::creation("swapchain image view"))?;
        }

        self.properties = Some(*properties);
        log::info!(
            "Created swapchain with {} images ({}x{}, {:?}, {:?})",
            self.images.len(),
            properties.extent.width,
            properties.extent.height,
            properties.format.format,
            properties.mode
        );
        Ok(())
    }

    /// Wait on the slot's previous work, then request the next image.
    ///
    /// The wait happens whatever the acquire result is, so the slot's
    /// bookkeeping never depends on presentation state.
    pub fn acquire_next<D: GpuDevice + ?Sized>(
        &self,
        device: &D,
        sync: &mut FrameSync,
        slot: usize,
    ) -> RenderResult<AcquireOutcome> {
        let pool_reset = sync.wait(device, slot)?;

        if self.swapchain == vk::SwapchainKHR::null() {
            return Ok(AcquireOutcome { image_index: None, pool_reset });
        }

        let result = device.acquire_next_image(
            self.swapchain,
            self.acquire_timeout_ns,
            sync.slot(slot).image_available,
        );

        let image_index = match result {
            Ok((index, false)) => Some(index),
            Ok((_, true)) => {
                log::debug!("Swapchain suboptimal on acquire");
                None
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date on acquire");
                None
            }
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => {
                return Err(RenderError::AcquireTimeout)
            }
            Err(result) => return Err(RenderError::vulkan("swapchain acquire", result)),
        };

        Ok(AcquireOutcome { image_index, pool_reset })
    }

    /// Queue the image for presentation once the slot's render work is done.
    /// Returns false when the swapchain has to be recreated.
    pub fn present<D: GpuDevice + ?Sized>(
        &self,
        device: &D,
        sync: &FrameSync,
        slot: usize,
        image_index: u32,
    ) -> RenderResult<bool> {
        let result = device.queue_present(
            device.present_queue().queue,
            self.swapchain,
            image_index,
            sync.slot(slot).render_finished,
        );

        match result {
            Ok(false) => Ok(true),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain needs recreation after present");
                Ok(false)
            }
            Err(result) => Err(RenderError::vulkan("present", result)),
        }
    }

    fn destroy_images<D: GpuDevice + ?Sized>(&mut self, device: &D) {
        for allocation in &mut self.images {
            allocation.destroy(device);
        }
        self.images.clear();
    }

    /// Views, then swapchains, then the surface
    pub fn release_all<D: GpuDevice + ?Sized>(&mut self, device: &D) {
        self.destroy_images(device);

        if self.swapchain != vk::SwapchainKHR::null() {
            device.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
        }
        if self.old_swapchain != vk::SwapchainKHR::null() {
            device.destroy_swapchain(self.old_swapchain);
            self.old_swapchain = vk::SwapchainKHR::null();
        }
        if self.surface != vk::SurfaceKHR::null() {
            device.destroy_surface(self.surface);
            self.surface = vk::SurfaceKHR::null();
        }
        self.properties = None;
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn properties(&self) -> Option<&SurfaceProperties> {
        self.properties.as_ref()
    }

    pub fn images(&self) -> &[ImageAllocation] {
        &self.images
    }
}
