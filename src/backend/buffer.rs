// Buffer and image memory
//
// Host-visible buffers addressed by device address (the mapped geometry region
// and descriptor buffers) plus the device-local depth attachment. Memory comes
// from the device's gpu-allocator instance.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::gpu::GpuDevice;
use super::image::{ImageAllocation, ImageMemory, DEPTH_FORMAT};
use super::VulkanDevice;

/// Persistently mapped buffer the shaders read through its device address
pub struct HostBuffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    address: vk::DeviceAddress,
}

impl HostBuffer {
    /// `usage` is extended with `SHADER_DEVICE_ADDRESS`
    pub fn new(
        device: &VulkanDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device.device.create_buffer(&buffer_info, None)
                .context("Failed to create buffer")?
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(err).context("Failed to allocate buffer memory");
            }
        };

        let bound = unsafe {
            device.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(err) = bound {
            unsafe { device.device.destroy_buffer(buffer, None) };
            let _ = device.allocator().lock().free(allocation);
            return Err(err).context("Failed to bind buffer memory");
        }

        let address_info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
        let address = unsafe { device.device.get_buffer_device_address(&address_info) };

        log::debug!("Buffer '{}': {} bytes at {:#x}", name, size, address);

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            size,
            address,
        })
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.address
    }

    /// CPU view of the buffer, `None` once destroyed
    pub fn mapped_mut(&mut self) -> Option<&mut [u8]> {
        let size = self.size as usize;
        let slice = self.allocation.as_mut()?.mapped_slice_mut()?;
        Some(&mut slice[..size])
    }

    /// Safe to call twice
    pub fn destroy(&mut self, device: &VulkanDevice) {
        if let Some(allocation) = self.allocation.take() {
            unsafe { device.device.destroy_buffer(self.buffer, None) };
            if let Err(err) = device.allocator().lock().free(allocation) {
                log::warn!("Failed to free buffer memory: {}", err);
            }
            self.buffer = vk::Buffer::null();
        }
    }
}

/// Create a depth image, its memory and view
pub(super) fn create_depth_image(
    device: &VulkanDevice,
    extent: vk::Extent2D,
) -> VkResult<ImageAllocation> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(DEPTH_FORMAT)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = unsafe { device.device.create_image(&image_info, None) }?;

    let requirements = unsafe { device.device.get_image_memory_requirements(image) };
    let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
        name: "depth",
        requirements,
        location: MemoryLocation::GpuOnly,
        linear: false,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(err) => {
            log::error!("Depth image allocation failed: {}", err);
            unsafe { device.device.destroy_image(image, None) };
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
    };

    let bound = unsafe {
        device.device.bind_image_memory(image, allocation.memory(), allocation.offset())
    };
    if let Err(err) = bound {
        device.destroy_device_image(image, Some(allocation));
        return Err(err);
    }

    let mut depth = ImageAllocation {
        image,
        view: vk::ImageView::null(),
        format: DEPTH_FORMAT,
        extent,
        memory: ImageMemory::DeviceOwned(Some(allocation)),
    };
    match device.create_image_view(image, DEPTH_FORMAT, vk::ImageAspectFlags::DEPTH) {
        Ok(view) => {
            depth.view = view;
            Ok(depth)
        }
        Err(err) => {
            depth.destroy(device);
            Err(err)
        }
    }
}
