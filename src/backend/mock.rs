// In-memory device used by the unit tests.
//
// Tracks live handles, binary semaphore signal state, fence state and which
// command buffers still have GPU work outstanding, and rejects the misuse a
// validation layer would flag (reusing a pending fence, resetting a pool whose
// work has not completed, waiting on a semaphore nobody signals).

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use rustc_hash::{FxHashMap, FxHashSet};

use super::gpu::{DescriptorBinding, GpuDevice, QueueInfo, RenderingDesc, SubmitDesc, SwapchainDesc};
use super::image::{ImageAllocation, ImageMemory, DEPTH_FORMAT};

/// Commands captured while recording
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Begin,
    End,
    Barrier {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    BeginRendering {
        color_view: vk::ImageView,
        depth_view: Option<vk::ImageView>,
    },
    EndRendering,
    BindPipeline(vk::Pipeline),
    Viewports(usize),
    Scissors(usize),
    BindDescriptorBuffers(Vec<DescriptorBinding>),
    DescriptorOffsets(Vec<vk::DeviceSize>),
    DrawMeshTasks(u32),
}

/// Snapshot of the last swapchain creation request
#[derive(Debug, Clone)]
pub struct SwapchainRequest {
    pub handle: vk::SwapchainKHR,
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub sharing_mode: vk::SharingMode,
    pub queue_families: Vec<u32>,
    pub present_mode: vk::PresentModeKHR,
    pub old_swapchain: vk::SwapchainKHR,
}

#[derive(Debug)]
struct State {
    next_handle: u64,
    graphics_family: u32,
    present_family: u32,

    semaphores: FxHashMap<u64, bool>,
    fences: FxHashMap<u64, bool>,
    pending_fences: FxHashMap<u64, Option<u64>>,
    fence_creations_left: Option<usize>,

    pools: FxHashSet<u64>,
    buffer_pool: FxHashMap<u64, u64>,
    buffers_in_flight: FxHashSet<u64>,
    pool_resets: usize,
    recorded: Vec<Recorded>,
    submissions: Vec<SubmitDesc>,
    reject_submit: Option<vk::Result>,
    idle_failure: Option<vk::Result>,
    surface_failure: Option<vk::Result>,

    surfaces: FxHashSet<u64>,
    capabilities: vk::SurfaceCapabilitiesKHR,
    formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
    swapchains: FxHashMap<u64, Vec<vk::Image>>,
    swapchain_requests: Vec<SwapchainRequest>,
    acquire_cursor: u32,
    image_query_failure: Option<vk::Result>,
    acquire_failures: Vec<vk::Result>,
    present_failures: Vec<vk::Result>,
    presented: Vec<u32>,

    views: FxHashSet<u64>,
    device_images: FxHashSet<u64>,

    auto_complete: bool,
    fence_waits: usize,
    device_idle_waits: usize,
    queue_idle_waits: usize,
    invalid_destroys: usize,
}

pub struct MockDevice {
    state: Mutex<State>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_queue_families(0, 0)
    }

    pub fn with_queue_families(graphics_family: u32, present_family: u32) -> Self {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D { width: 800, height: 600 },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            max_image_array_layers: 1,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        };
        Self {
            state: Mutex::new(State {
                next_handle: 1,
                graphics_family,
                present_family,
                semaphores: FxHashMap::default(),
                fences: FxHashMap::default(),
                pending_fences: FxHashMap::default(),
                fence_creations_left: None,
                pools: FxHashSet::default(),
                buffer_pool: FxHashMap::default(),
                buffers_in_flight: FxHashSet::default(),
                pool_resets: 0,
                recorded: Vec::new(),
                submissions: Vec::new(),
                reject_submit: None,
                idle_failure: None,
                surface_failure: None,
                surfaces: FxHashSet::default(),
                capabilities,
                formats: vec![
                    vk::SurfaceFormatKHR {
                        format: vk::Format::R8G8B8A8_UNORM,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_SRGB,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                ],
                present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                swapchains: FxHashMap::default(),
                swapchain_requests: Vec::new(),
                acquire_cursor: 0,
                image_query_failure: None,
                acquire_failures: Vec::new(),
                present_failures: Vec::new(),
                presented: Vec::new(),
                views: FxHashSet::default(),
                device_images: FxHashSet::default(),
                auto_complete: true,
                fence_waits: 0,
                device_idle_waits: 0,
                queue_idle_waits: 0,
                invalid_destroys: 0,
            }),
        }
    }

    // -- scripting --------------------------------------------------------

    /// Register a fence as signaled by in-flight work
    pub fn signal_fence_later(&self, fence: vk::Fence) {
        self.state.lock().pending_fences.insert(fence.as_raw(), None);
    }

    /// Finish every outstanding submission
    pub fn complete_pending_work(&self) {
        let mut state = self.state.lock();
        let pending: Vec<u64> = state.pending_fences.keys().copied().collect();
        for fence in pending {
            state.complete(fence);
        }
    }

    /// When false, fence waits on unfinished work time out
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state.lock().auto_complete = enabled;
    }

    /// Signal a binary semaphore as an acquire would
    pub fn signal_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.insert(semaphore.as_raw(), true);
    }

    pub fn fail_fence_creation_after(&self, successes: usize) {
        self.state.lock().fence_creations_left = Some(successes);
    }

    pub fn fail_next_acquire(&self, result: vk::Result) {
        self.state.lock().acquire_failures.push(result);
    }

    pub fn fail_next_present(&self, result: vk::Result) {
        self.state.lock().present_failures.push(result);
    }

    pub fn reject_next_submit(&self, result: vk::Result) {
        self.state.lock().reject_submit = Some(result);
    }

    /// Next device idle wait fails without draining the queue
    pub fn fail_next_wait_idle(&self, result: vk::Result) {
        self.state.lock().idle_failure = Some(result);
    }

    pub fn fail_next_surface_creation(&self, result: vk::Result) {
        self.state.lock().surface_failure = Some(result);
    }

    pub fn fail_next_image_query(&self, result: vk::Result) {
        self.state.lock().image_query_failure = Some(result);
    }

    pub fn set_current_extent(&self, width: u32, height: u32) {
        let mut state = self.state.lock();
        state.capabilities.current_extent = vk::Extent2D { width, height };
        if width == 0 || height == 0 {
            state.capabilities.min_image_extent = vk::Extent2D { width: 0, height: 0 };
        }
    }

    pub fn set_present_modes(&self, modes: Vec<vk::PresentModeKHR>) {
        self.state.lock().present_modes = modes;
    }

    pub fn set_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state.lock().formats = formats;
    }

    // -- inspection -------------------------------------------------------

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_pools(&self) -> usize {
        self.state.lock().pools.len()
    }

    pub fn live_swapchains(&self) -> Vec<vk::SwapchainKHR> {
        self.state
            .lock()
            .swapchains
            .keys()
            .map(|&raw| vk::SwapchainKHR::from_raw(raw))
            .collect()
    }

    pub fn live_views(&self) -> usize {
        self.state.lock().views.len()
    }

    pub fn live_surfaces(&self) -> usize {
        self.state.lock().surfaces.len()
    }

    pub fn live_device_images(&self) -> usize {
        self.state.lock().device_images.len()
    }

    pub fn swapchain_requests(&self) -> Vec<SwapchainRequest> {
        self.state.lock().swapchain_requests.clone()
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.state.lock().recorded.clone()
    }

    pub fn clear_recorded(&self) {
        self.state.lock().recorded.clear();
    }

    pub fn submissions(&self) -> Vec<SubmitDesc> {
        self.state.lock().submissions.clone()
    }

    pub fn presented(&self) -> Vec<u32> {
        self.state.lock().presented.clone()
    }

    pub fn pool_resets(&self) -> usize {
        self.state.lock().pool_resets
    }

    pub fn fence_waits(&self) -> usize {
        self.state.lock().fence_waits
    }

    pub fn device_idle_waits(&self) -> usize {
        self.state.lock().device_idle_waits
    }

    pub fn queue_idle_waits(&self) -> usize {
        self.state.lock().queue_idle_waits
    }

    pub fn invalid_destroys(&self) -> usize {
        self.state.lock().invalid_destroys
    }
}

impl State {
    fn handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn complete(&mut self, fence: u64) {
        if let Some(buffer) = self.pending_fences.remove(&fence) {
            if let Some(signaled) = self.fences.get_mut(&fence) {
                *signaled = true;
            }
            if let Some(buffer) = buffer {
                self.buffers_in_flight.remove(&buffer);
            }
        }
    }

    fn drain_all(&mut self) {
        let pending: Vec<u64> = self.pending_fences.keys().copied().collect();
        for fence in pending {
            self.complete(fence);
        }
    }

    fn record(&mut self, recorded: Recorded) {
        self.recorded.push(recorded);
    }
}

fn remove_live(set: &mut FxHashSet<u64>, raw: u64, invalid: &mut usize) {
    if !set.remove(&raw) {
        *invalid += 1;
    }
}

impl GpuDevice for MockDevice {
    fn graphics_queue(&self) -> QueueInfo {
        let family = self.state.lock().graphics_family;
        QueueInfo { family, queue: vk::Queue::from_raw(1000 + family as u64) }
    }

    fn present_queue(&self) -> QueueInfo {
        let family = self.state.lock().present_family;
        QueueInfo { family, queue: vk::Queue::from_raw(1000 + family as u64) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.semaphores.insert(raw, false);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        if state.semaphores.remove(&semaphore.as_raw()).is_none() {
            state.invalid_destroys += 1;
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        if let Some(left) = state.fence_creations_left.as_mut() {
            if *left == 0 {
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
            *left -= 1;
        }
        let raw = state.handle();
        state.fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.pending_fences.remove(&fence.as_raw());
        if state.fences.remove(&fence.as_raw()).is_none() {
            state.invalid_destroys += 1;
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.fence_waits += 1;
        let raw = fence.as_raw();
        match state.fences.get(&raw) {
            None => Err(vk::Result::ERROR_UNKNOWN),
            Some(true) => Ok(()),
            Some(false) if state.auto_complete && state.pending_fences.contains_key(&raw) => {
                state.complete(raw);
                Ok(())
            }
            Some(false) => Err(vk::Result::TIMEOUT),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        if state.pending_fences.contains_key(&raw) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        match state.fences.get_mut(&raw) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        state.device_idle_waits += 1;
        if let Some(result) = state.idle_failure.take() {
            return Err(result);
        }
        state.drain_all();
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        let mut state = self.state.lock();
        state.queue_idle_waits += 1;
        state.drain_all();
        Ok(())
    }

    fn create_command_pool(&self, _queue_family: u32) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.pools.insert(raw);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        let State { pools, invalid_destroys, buffer_pool, .. } = &mut *state;
        remove_live(pools, pool.as_raw(), invalid_destroys);
        buffer_pool.retain(|_, owner| *owner != pool.as_raw());
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        let mut state = self.state.lock();
        let busy = state
            .buffer_pool
            .iter()
            .any(|(buffer, owner)| *owner == pool.as_raw() && state.buffers_in_flight.contains(buffer));
        if busy || !state.pools.contains(&pool.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        state.pool_resets += 1;
        Ok(())
    }

    fn allocate_primary_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.buffer_pool.insert(raw, pool.as_raw());
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.buffers_in_flight.contains(&cmd.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        state.record(Recorded::Begin);
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> VkResult<()> {
        self.state.lock().record(Recorded::End);
        Ok(())
    }

    fn cmd_image_barrier(
        &self,
        _cmd: vk::CommandBuffer,
        image: vk::Image,
        _aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        self.state.lock().record(Recorded::Barrier { image, old_layout, new_layout });
    }

    fn cmd_begin_rendering(&self, _cmd: vk::CommandBuffer, desc: &RenderingDesc) {
        self.state.lock().record(Recorded::BeginRendering {
            color_view: desc.color_view,
            depth_view: desc.depth_view,
        });
    }

    fn cmd_end_rendering(&self, _cmd: vk::CommandBuffer) {
        self.state.lock().record(Recorded::EndRendering);
    }

    fn cmd_bind_pipeline(&self, _cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.state.lock().record(Recorded::BindPipeline(pipeline));
    }

    fn cmd_set_viewports(&self, _cmd: vk::CommandBuffer, viewports: &[vk::Viewport]) {
        self.state.lock().record(Recorded::Viewports(viewports.len()));
    }

    fn cmd_set_scissors(&self, _cmd: vk::CommandBuffer, scissors: &[vk::Rect2D]) {
        self.state.lock().record(Recorded::Scissors(scissors.len()));
    }

    fn cmd_bind_descriptor_buffers(&self, _cmd: vk::CommandBuffer, bindings: &[DescriptorBinding]) {
        self.state.lock().record(Recorded::BindDescriptorBuffers(bindings.to_vec()));
    }

    fn cmd_set_descriptor_buffer_offsets(
        &self,
        _cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _buffer_indices: &[u32],
        offsets: &[vk::DeviceSize],
    ) {
        self.state.lock().record(Recorded::DescriptorOffsets(offsets.to_vec()));
    }

    fn cmd_draw_mesh_tasks(&self, _cmd: vk::CommandBuffer, group_count: u32) {
        self.state.lock().record(Recorded::DrawMeshTasks(group_count));
    }

    fn queue_submit(&self, _queue: vk::Queue, submit: &SubmitDesc) -> VkResult<()> {
        let mut state = self.state.lock();
        if let Some(result) = state.reject_submit.take() {
            return Err(result);
        }

        let fence = submit.fence.as_raw();
        let fence_ready = state.fences.get(&fence) == Some(&false) && !state.pending_fences.contains_key(&fence);
        let waited = state.semaphores.get(&submit.wait_semaphore.as_raw()) == Some(&true);
        let signal_free = state.semaphores.get(&submit.signal_semaphore.as_raw()) == Some(&false);
        if !fence_ready || !waited || !signal_free {
            return Err(vk::Result::ERROR_UNKNOWN);
        }

        state.semaphores.insert(submit.wait_semaphore.as_raw(), false);
        state.semaphores.insert(submit.signal_semaphore.as_raw(), true);
        state.pending_fences.insert(fence, Some(submit.command_buffer.as_raw()));
        state.buffers_in_flight.insert(submit.command_buffer.as_raw());
        state.submissions.push(*submit);
        Ok(())
    }

    fn create_surface(
        &self,
        _display: RawDisplayHandle,
        _window: RawWindowHandle,
    ) -> VkResult<vk::SurfaceKHR> {
        let mut state = self.state.lock();
        if let Some(result) = state.surface_failure.take() {
            return Err(result);
        }
        let raw = state.handle();
        state.surfaces.insert(raw);
        Ok(vk::SurfaceKHR::from_raw(raw))
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        let mut state = self.state.lock();
        if !state.swapchains.is_empty() {
            // Destroying a surface under a live swapchain
            state.invalid_destroys += 1;
        }
        let State { surfaces, invalid_destroys, .. } = &mut *state;
        remove_live(surfaces, surface.as_raw(), invalid_destroys);
    }

    fn surface_capabilities(&self, _surface: vk::SurfaceKHR) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        Ok(self.state.lock().capabilities)
    }

    fn surface_formats(&self, _surface: vk::SurfaceKHR) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.state.lock().formats.clone())
    }

    fn surface_present_modes(&self, _surface: vk::SurfaceKHR) -> VkResult<Vec<vk::PresentModeKHR>> {
        Ok(self.state.lock().present_modes.clone())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        if !state.surfaces.contains(&desc.surface.as_raw()) {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        if desc.old_swapchain != vk::SwapchainKHR::null()
            && !state.swapchains.contains_key(&desc.old_swapchain.as_raw())
        {
            return Err(vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR);
        }

        let raw = state.handle();
        let caps = state.capabilities;
        let mut count = desc.min_image_count.max(caps.min_image_count);
        if caps.max_image_count > 0 {
            count = count.min(caps.max_image_count);
        }
        let images: Vec<vk::Image> = (0..count)
            .map(|_| vk::Image::from_raw(state.handle()))
            .collect();
        state.swapchains.insert(raw, images);

        let handle = vk::SwapchainKHR::from_raw(raw);
        state.swapchain_requests.push(SwapchainRequest {
            handle,
            min_image_count: desc.min_image_count,
            format: desc.format,
            extent: desc.extent,
            sharing_mode: desc.sharing_mode,
            queue_families: desc.queue_families.to_vec(),
            present_mode: desc.present_mode,
            old_swapchain: desc.old_swapchain,
        });
        Ok(handle)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        if state.swapchains.remove(&swapchain.as_raw()).is_none() {
            state.invalid_destroys += 1;
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let mut state = self.state.lock();
        if let Some(result) = state.image_query_failure.take() {
            return Err(result);
        }
        state
            .swapchains
            .get(&swapchain.as_raw())
            .cloned()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        let suboptimal = match state.acquire_failures.pop() {
            Some(vk::Result::SUBOPTIMAL_KHR) => true,
            Some(result) => return Err(result),
            None => false,
        };

        let count = match state.swapchains.get(&swapchain.as_raw()) {
            Some(images) => images.len() as u32,
            None => return Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
        };
        match state.semaphores.get(&semaphore.as_raw()) {
            Some(false) => {}
            _ => return Err(vk::Result::ERROR_UNKNOWN),
        }
        state.semaphores.insert(semaphore.as_raw(), true);

        let index = state.acquire_cursor % count;
        state.acquire_cursor += 1;
        Ok((index, suboptimal))
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        if let Some(result) = state.present_failures.pop() {
            return match result {
                vk::Result::SUBOPTIMAL_KHR => {
                    state.semaphores.insert(wait_semaphore.as_raw(), false);
                    state.presented.push(image_index);
                    Ok(true)
                }
                // Whether the wait happened is unknown, leave it signaled
                other => Err(other),
            };
        }
        if !state.swapchains.contains_key(&swapchain.as_raw())
            || state.semaphores.get(&wait_semaphore.as_raw()) != Some(&true)
        {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        state.semaphores.insert(wait_semaphore.as_raw(), false);
        state.presented.push(image_index);
        Ok(false)
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.views.insert(raw);
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        let State { views, invalid_destroys, .. } = &mut *state;
        remove_live(views, view.as_raw(), invalid_destroys);
    }

    fn create_depth_target(&self, extent: vk::Extent2D) -> VkResult<ImageAllocation> {
        let mut state = self.state.lock();
        let image = state.handle();
        let view = state.handle();
        state.device_images.insert(image);
        state.views.insert(view);
        Ok(ImageAllocation {
            image: vk::Image::from_raw(image),
            view: vk::ImageView::from_raw(view),
            format: DEPTH_FORMAT,
            extent,
            memory: ImageMemory::DeviceOwned(None),
        })
    }

    fn destroy_device_image(
        &self,
        image: vk::Image,
        _allocation: Option<gpu_allocator::vulkan::Allocation>,
    ) {
        let mut state = self.state.lock();
        let State { device_images, invalid_destroys, .. } = &mut *state;
        remove_live(device_images, image.as_raw(), invalid_destroys);
    }
}
