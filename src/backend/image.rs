// Image allocations
//
// Pairs an image with its view and, when the application allocated the image
// itself, the backing memory. Swapchain images belong to the swapchain: only
// their views are ours to destroy.

use ash::vk;

use super::gpu::GpuDevice;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

#[derive(Debug)]
pub enum ImageMemory {
    /// Destroyed implicitly with the swapchain
    SwapchainOwned,
    /// Allocated by us, `None` only for devices without real memory
    DeviceOwned(Option<gpu_allocator::vulkan::Allocation>),
}

#[derive(Debug)]
pub struct ImageAllocation {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub memory: ImageMemory,
}

impl ImageAllocation {
    pub fn swapchain_image(image: vk::Image, format: vk::Format, extent: vk::Extent2D) -> Self {
        Self {
            image,
            view: vk::ImageView::null(),
            format,
            extent,
            memory: ImageMemory::SwapchainOwned,
        }
    }

    pub fn is_swapchain_owned(&self) -> bool {
        matches!(self.memory, ImageMemory::SwapchainOwned)
    }

    /// Release the view and, for device-owned images, the image and memory.
    /// Safe to call twice.
    pub fn destroy<D: GpuDevice + ?Sized>(&mut self, device: &D) {
        if self.view != vk::ImageView::null() {
            device.destroy_image_view(self.view);
            self.view = vk::ImageView::null();
        }

        if let ImageMemory::DeviceOwned(allocation) = &mut self.memory {
            if self.image != vk::Image::null() {
                device.destroy_device_image(self.image, allocation.take());
            }
        }
        self.image = vk::Image::null();
    }
}
