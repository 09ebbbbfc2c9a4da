// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers and the window system's surface extension
// - Physical device selection (Vulkan 1.3, mesh shading, descriptor buffers)
// - Logical device + graphics/present queues
// - Memory allocator setup
// - `GpuDevice` implementation the frame core runs against

use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::extensions::{ext, khr};
use ash::prelude::VkResult;
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocation, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::gpu::{DescriptorBinding, GpuDevice, QueueInfo, RenderingDesc, SubmitDesc, SwapchainDesc};
use super::image::ImageAllocation;

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device goes away
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    entry: Entry,

    // Queue handles
    graphics: QueueInfo,
    present: QueueInfo,

    // Extension loaders
    surface_loader: khr::Surface,
    swapchain_loader: khr::Swapchain,
    mesh_shader: ext::MeshShader,
    descriptor_buffer: ext::DescriptorBuffer,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create Vulkan device able to present to windows of `display`.
    ///
    /// `window` is only used to probe present support while picking queue
    /// families; the probe surface is destroyed before returning.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, app_name, enable_validation, display)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Pick physical device (GPU) against a probe surface
        let surface_loader = khr::Surface::new(&entry, &instance);
        let probe = unsafe { create_platform_surface(&entry, &instance, display, window) }
            .context("Failed to create probe surface")?;
        let picked = Self::pick_physical_device(&instance, &surface_loader, probe);
        unsafe { surface_loader.destroy_surface(probe, None) };
        let (physical_device, graphics_family, present_family) = picked?;

        // Step 5: Create logical device
        let device = Self::create_logical_device(
            &instance,
            physical_device,
            graphics_family,
            present_family,
        )?;
        let graphics = QueueInfo {
            family: graphics_family,
            queue: unsafe { device.get_device_queue(graphics_family, 0) },
        };
        let present = QueueInfo {
            family: present_family,
            queue: unsafe { device.get_device_queue(present_family, 0) },
        };

        // Step 6: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!("Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                .to_string_lossy());
        log::info!("API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version));
        log::info!("Queue families: graphics {}, present {}", graphics_family, present_family);

        // Step 7: Create memory allocator
        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        let swapchain_loader = khr::Swapchain::new(&instance, &device);
        let mesh_shader = ext::MeshShader::new(&instance, &device);
        let descriptor_buffer = ext::DescriptorBuffer::new(&instance, &device);

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            entry,
            graphics,
            present,
            surface_loader,
            swapchain_loader,
            mesh_shader,
            descriptor_buffer,
            debug_utils,
            properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("Meshlet Renderer")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        // Surface extensions for this window system
        let mut extensions = surface_extensions(display)?;
        if enable_validation {
            extensions.push(ext::DebugUtils::name().as_ptr());
        }

        // Validation layers
        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe {
            debug_utils.create_debug_utils_messenger(&create_info, None)
        }?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, u32, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };

            if props.api_version < vk::API_VERSION_1_3 || !Self::check_device_support(instance, device) {
                continue;
            }

            let queue_families = unsafe {
                instance.get_physical_device_queue_family_properties(device)
            };

            let graphics_family = queue_families
                .iter()
                .position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|i| i as u32);
            let Some(graphics_family) = graphics_family else {
                continue;
            };

            let can_present = |family: u32| unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, family, surface)
                    .unwrap_or(false)
            };
            // Same family when it can present, otherwise the first that can
            let present_family = if can_present(graphics_family) {
                Some(graphics_family)
            } else {
                (0..queue_families.len() as u32).find(|&family| can_present(family))
            };
            let Some(present_family) = present_family else {
                continue;
            };

            // Score device (prefer discrete GPU, then a shared queue family)
            let mut score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };
            if graphics_family == present_family {
                score += 10;
            }

            if score > best_score {
                best_score = score;
                best_device = Some((device, graphics_family, present_family));
            }
        }

        best_device.ok_or_else(|| {
            anyhow::anyhow!("No GPU with mesh shading, descriptor buffers and presentation found")
        })
    }

    fn required_extensions() -> [&'static CStr; 3] {
        [
            khr::Swapchain::name(),
            ext::MeshShader::name(),
            ext::DescriptorBuffer::name(),
        ]
    }

    fn check_device_support(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let available = match unsafe { instance.enumerate_device_extension_properties(device) } {
            Ok(extensions) => extensions,
            Err(_) => return false,
        };
        let has_extension = |name: &CStr| {
            available
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
        };
        if !Self::required_extensions().into_iter().all(has_extension) {
            return false;
        }

        let mut mesh = vk::PhysicalDeviceMeshShaderFeaturesEXT::default();
        let mut descriptor = vk::PhysicalDeviceDescriptorBufferFeaturesEXT::default();
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut vulkan13 = vk::PhysicalDeviceVulkan13Features::default();
        {
            let mut features = vk::PhysicalDeviceFeatures2::builder()
                .push_next(&mut mesh)
                .push_next(&mut descriptor)
                .push_next(&mut vulkan12)
                .push_next(&mut vulkan13);
            unsafe { instance.get_physical_device_features2(device, &mut features) };
        }

        mesh.mesh_shader == vk::TRUE
            && mesh.task_shader == vk::TRUE
            && descriptor.descriptor_buffer == vk::TRUE
            && vulkan12.buffer_device_address == vk::TRUE
            && vulkan13.dynamic_rendering == vk::TRUE
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_family: u32,
        present_family: u32,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let mut families = vec![graphics_family];
        if present_family != graphics_family {
            families.push(present_family);
        }
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        // Required device extensions
        let extensions: Vec<*const c_char> = Self::required_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let mut mesh = vk::PhysicalDeviceMeshShaderFeaturesEXT::builder()
            .mesh_shader(true)
            .task_shader(true);
        let mut descriptor = vk::PhysicalDeviceDescriptorBufferFeaturesEXT::builder()
            .descriptor_buffer(true);
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(true);
        let mut vulkan13 = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(true)
            .synchronization2(true);
        let mut features = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut mesh)
            .push_next(&mut descriptor)
            .push_next(&mut vulkan12)
            .push_next(&mut vulkan13);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features);

        let device = unsafe {
            instance.create_device(physical_device, &create_info, None)
        }
        .context("Failed to create logical device")?;

        Ok(device)
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true, // Descriptor buffers are bound by address
            allocation_sizes: Default::default(),
        })?;

        Ok(allocator)
    }

    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }
}

/// Instance extensions needed to present on `display`
fn surface_extensions(display: RawDisplayHandle) -> Result<Vec<*const c_char>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => anyhow::bail!("Unsupported display handle: {:?}", other),
    };
    Ok(vec![khr::Surface::name().as_ptr(), platform.as_ptr()])
}

/// Platform-specific window connection
unsafe fn create_platform_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> VkResult<vk::SurfaceKHR> {
    match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .map(|d| d.as_ptr())
                .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy as *mut vk::Display)
                .window(handle.window);
            khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(handle.surface.as_ptr());
            khr::WaylandSurface::new(entry, instance).create_wayland_surface(&create_info, None)
        }
        _ => {
            log::error!("Unsupported window handle type");
            Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
        }
    }
}

/// Stage and access masks for the layout transitions the frame records
fn transition_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (vk::PipelineStageFlags, vk::AccessFlags, vk::PipelineStageFlags, vk::AccessFlags) {
    let depth_stages =
        vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL) => (
            depth_stages,
            vk::AccessFlags::empty(),
            depth_stages,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        (_, vk::ImageLayout::PRESENT_SRC_KHR) => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
        ),
        // Chains with the acquire semaphore wait at color output
        _ => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
    }
}

fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl GpuDevice for VulkanDevice {
    fn graphics_queue(&self) -> QueueInfo {
        self.graphics
    }

    fn present_queue(&self) -> QueueInfo {
        self.present
    }

    // -- synchronization --------------------------------------------------

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }

    // -- commands ---------------------------------------------------------

    fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool> {
        // TRANSIENT: buffers are re-recorded every frame, the pool is reset whole
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        unsafe { self.device.reset_command_pool(pool, vk::CommandPoolResetFlags::empty()) }
    }

    fn allocate_primary_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        unsafe { self.device.allocate_command_buffers(&info) }?
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &info) }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }
    }

    fn cmd_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let (src_stage, src_access, dst_stage, dst_access) = transition_masks(old_layout, new_layout);
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(subresource_range(aspect))
            .build();

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, desc: &RenderingDesc) {
        let color_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(desc.color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue { float32: desc.clear_color },
            })
            .build();
        let depth_attachment = desc.depth_view.map(|view| {
            vk::RenderingAttachmentInfo::builder()
                .image_view(view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                })
                .build()
        });

        let mut info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: desc.extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment));
        if let Some(depth) = depth_attachment.as_ref() {
            info = info.depth_attachment(depth);
        }

        unsafe { self.device.cmd_begin_rendering(cmd, &info) }
    }

    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_rendering(cmd) }
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
        }
    }

    fn cmd_set_viewports(&self, cmd: vk::CommandBuffer, viewports: &[vk::Viewport]) {
        unsafe { self.device.cmd_set_viewport(cmd, 0, viewports) }
    }

    fn cmd_set_scissors(&self, cmd: vk::CommandBuffer, scissors: &[vk::Rect2D]) {
        unsafe { self.device.cmd_set_scissor(cmd, 0, scissors) }
    }

    fn cmd_bind_descriptor_buffers(&self, cmd: vk::CommandBuffer, bindings: &[DescriptorBinding]) {
        let infos: Vec<vk::DescriptorBufferBindingInfoEXT> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorBufferBindingInfoEXT::builder()
                    .address(binding.address)
                    .usage(binding.usage)
                    .build()
            })
            .collect();
        unsafe { self.descriptor_buffer.cmd_bind_descriptor_buffers(cmd, &infos) }
    }

    fn cmd_set_descriptor_buffer_offsets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        buffer_indices: &[u32],
        offsets: &[vk::DeviceSize],
    ) {
        unsafe {
            self.descriptor_buffer.cmd_set_descriptor_buffer_offsets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                buffer_indices,
                offsets,
            )
        }
    }

    fn cmd_draw_mesh_tasks(&self, cmd: vk::CommandBuffer, group_count: u32) {
        unsafe { self.mesh_shader.cmd_draw_mesh_tasks(cmd, group_count, 1, 1) }
    }

    fn queue_submit(&self, queue: vk::Queue, submit: &SubmitDesc) -> VkResult<()> {
        let wait_semaphores = [submit.wait_semaphore];
        let wait_stages = [submit.wait_stage];
        let command_buffers = [submit.command_buffer];
        let signal_semaphores = [submit.signal_semaphore];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)      // Wait for image to be available
            .wait_dst_stage_mask(&wait_stages)      // Which stage waits
            .command_buffers(&command_buffers)      // Commands to execute
            .signal_semaphores(&signal_semaphores); // Signal when done

        unsafe {
            self.device
                .queue_submit(queue, &[submit_info.build()], submit.fence)
        }
    }

    // -- presentation -----------------------------------------------------

    fn create_surface(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> VkResult<vk::SurfaceKHR> {
        unsafe { create_platform_surface(&self.entry, &self.instance, display, window) }
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        unsafe { self.surface_loader.destroy_surface(surface, None) }
    }

    fn surface_capabilities(&self, surface: vk::SurfaceKHR) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, surface)
        }
    }

    fn surface_formats(&self, surface: vk::SurfaceKHR) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, surface)
        }
    }

    fn surface_present_modes(&self, surface: vk::SurfaceKHR) -> VkResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, surface)
        }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(desc.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(desc.sharing_mode)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);
        if desc.sharing_mode == vk::SharingMode::CONCURRENT {
            create_info = create_info.queue_family_indices(desc.queue_families);
        }

        unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null())
        }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.swapchain_loader.queue_present(queue, &present_info) }
    }

    // -- images -----------------------------------------------------------

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(subresource_range(aspect));
        unsafe { self.device.create_image_view(&view_info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_depth_target(&self, extent: vk::Extent2D) -> VkResult<ImageAllocation> {
        super::buffer::create_depth_image(self, extent)
    }

    fn destroy_device_image(&self, image: vk::Image, allocation: Option<Allocation>) {
        unsafe { self.device.destroy_image(image, None) };
        if let Some(allocation) = allocation {
            if let Err(err) = self.allocator.lock().free(allocation) {
                log::warn!("Failed to free image memory: {}", err);
            }
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order; the allocator still needs the device
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
