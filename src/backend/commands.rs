// Command submission
//
// One command pool and one primary buffer per frame slot. A pool is only reset
// with the token `FrameSync::wait` hands out, so a buffer is never reset while
// the GPU may still read it.

use ash::vk;

use super::gpu::{DescriptorBinding, GpuDevice, RenderingDesc, SubmitDesc};
use super::image::ImageAllocation;
use super::sync::{FrameSync, PoolResetToken};
use crate::error::{RenderError, RenderResult};
use crate::geometry::{DescriptorOffsets, RESOURCE_KIND_COUNT};

/// Pipeline and the layout its descriptor-buffer offsets are set against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineBinding {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

/// One visible mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawItem {
    pub offsets: DescriptorOffsets,
    pub meshlet_count: u32,
}

/// Everything the scene side decides for a frame
#[derive(Debug, Clone)]
pub struct FrameParameters {
    pub clear_color: [f32; 4],
    /// Without a pipeline the frame is only cleared
    pub pipeline: Option<PipelineBinding>,
    /// One binding per resource kind, in `ResourceKind` order
    pub descriptor_bindings: [DescriptorBinding; RESOURCE_KIND_COUNT],
    pub viewports: Vec<vk::Viewport>,
    pub scissors: Vec<vk::Rect2D>,
    pub draws: Vec<DrawItem>,
}

impl FrameParameters {
    /// Clear-only frame covering `extent`
    pub fn clear(clear_color: [f32; 4], extent: vk::Extent2D) -> Self {
        Self {
            clear_color,
            pipeline: None,
            descriptor_bindings: [DescriptorBinding::default(); RESOURCE_KIND_COUNT],
            viewports: vec![full_viewport(extent)],
            scissors: vec![vk::Rect2D { offset: vk::Offset2D::default(), extent }],
            draws: Vec::new(),
        }
    }
}

/// Viewport covering the whole target with the standard depth range
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Images a frame renders into
#[derive(Debug, Clone, Copy)]
pub struct RenderTarget<'a> {
    pub color: &'a ImageAllocation,
    pub depth: Option<&'a ImageAllocation>,
}

/// Task groups needed to cover `meshlet_count` meshlets
pub fn task_group_count(meshlet_count: u32, max_mesh_tasks: u32) -> u32 {
    meshlet_count.div_ceil(max_mesh_tasks.max(1))
}

#[derive(Debug)]
struct SlotCommands {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

#[derive(Debug)]
pub struct CommandPipeline {
    slots: Vec<SlotCommands>,
    max_mesh_tasks: u32,
    buffer_indices: [u32; RESOURCE_KIND_COUNT],
}

impl CommandPipeline {
    /// One pool + primary buffer per slot on the graphics family
    pub fn create_all<D: GpuDevice + ?Sized>(
        device: &D,
        slot_count: usize,
        max_mesh_tasks: u32,
    ) -> RenderResult<Self> {
        let family = device.graphics_queue().family;
        let mut pipeline = Self {
            slots: Vec::with_capacity(slot_count),
            max_mesh_tasks,
            buffer_indices: std::array::from_fn(|i| i as u32),
        };

        for _ in 0..slot_count {
            let pool = match device.create_command_pool(family) {
                Ok(pool) => pool,
                Err(result) => {
                    pipeline.destroy_all(device);
                    return Err(RenderError::Creation { what: "command pool", result });
                }
            };
            let buffer = match device.allocate_primary_command_buffer(pool) {
                Ok(buffer) => buffer,
                Err(result) => {
                    device.destroy_command_pool(pool);
                    pipeline.destroy_all(device);
                    return Err(RenderError::Creation { what: "command buffer", result });
                }
            };
            pipeline.slots.push(SlotCommands { pool, buffer });
        }

        log::info!("Created {} command pools on queue family {}", slot_count, family);
        Ok(pipeline)
    }

    pub fn command_buffer(&self, slot: usize) -> vk::CommandBuffer {
        self.slots[slot].buffer
    }

    /// Reset the pool whose previous work the token proves complete
    pub fn reset_pool<D: GpuDevice + ?Sized>(
        &self,
        device: &D,
        token: PoolResetToken,
    ) -> RenderResult<()> {
        let slot = &self.slots[token.slot()];
        device
            .reset_command_pool(slot.pool)
            .map_err(|result| RenderError::vulkan("command pool reset", result))
    }

    /// Record one frame into the slot's buffer
    pub fn record<D: GpuDevice + ?Sized>(
        &self,
        device: &D,
        slot: usize,
        params: &FrameParameters,
        target: &RenderTarget,
    ) -> RenderResult<()> {
        let cmd = self.slots[slot].buffer;
        device
            .begin_command_buffer(cmd)
            .map_err(|result| RenderError::vulkan("command buffer begin", result))?;

        // Previous contents are cleared, so UNDEFINED is a valid source layout
        device.cmd_image_barrier(
            cmd,
            target.color.image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        if let Some(depth) = target.depth {
            device.cmd_image_barrier(
                cmd,
                depth.image,
                vk::ImageAspectFlags::DEPTH,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            );
        }

        device.cmd_begin_rendering(
            cmd,
            &RenderingDesc {
                color_view: target.color.view,
                depth_view: target.depth.map(|depth| depth.view),
                extent: target.color.extent,
                clear_color: params.clear_color,
            },
        );

        if let Some(binding) = params.pipeline {
            self.record_draws(device, cmd, binding, params);
        }

        device.cmd_end_rendering(cmd);
        device.cmd_image_barrier(
            cmd,
            target.color.image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );

        device
            .end_command_buffer(cmd)
            .map_err(|result| RenderError::vulkan("command buffer end", result))
    }

    fn record_draws<D: GpuDevice + ?Sized>(
        &self,
        device: &D,
        cmd: vk::CommandBuffer,
        binding: PipelineBinding,
        params: &FrameParameters,
    ) {
        device.cmd_bind_pipeline(cmd, binding.pipeline);
        if !params.viewports.is_empty() {
            device.cmd_set_viewports(cmd, &params.viewports);
        }
        if !params.scissors.is_empty() {
            device.cmd_set_scissors(cmd, &params.scissors);
        }
        device.cmd_bind_descriptor_buffers(cmd, &params.descriptor_bindings);

        for draw in &params.draws {
            if draw.meshlet_count == 0 {
                continue;
            }
            device.cmd_set_descriptor_buffer_offsets(
                cmd,
                binding.layout,
                &self.buffer_indices,
                draw.offsets.as_slice(),
            );
            device.cmd_draw_mesh_tasks(cmd, task_group_count(draw.meshlet_count, self.max_mesh_tasks));
        }
    }

    /// Submit the slot's buffer: wait for the acquired image at color output,
    /// signal render-finished and the slot fence
    pub fn submit<D: GpuDevice + ?Sized>(
        &self,
        device: &D,
        sync: &mut FrameSync,
        slot: usize,
    ) -> RenderResult<()> {
        sync.mark_submitted(device, slot)?;

        let frame = sync.slot(slot);
        let submit = SubmitDesc {
            command_buffer: self.slots[slot].buffer,
            wait_semaphore: frame.image_available,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: frame.render_finished,
            fence: frame.in_flight_fence,
        };

        if let Err(result) = device.queue_submit(device.graphics_queue().queue, &submit) {
            sync.cancel_submission(slot);
            log::error!("Submission of frame slot {} rejected: {}", slot, result);
            return Err(if result == vk::Result::ERROR_DEVICE_LOST {
                RenderError::DeviceLost { op: "queue submit" }
            } else {
                RenderError::SubmitRejected(result)
            });
        }
        Ok(())
    }

    /// Destroying a pool frees its buffers. Call only once the device is idle.
    pub fn destroy_all<D: GpuDevice + ?Sized>(&mut self, device: &D) {
        for slot in self.slots.drain(..) {
            device.destroy_command_pool(slot.pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockDevice, Recorded};
    use crate::geometry::{DescriptorLayouts, DescriptorOffsets};
    use ash::vk::Handle;

    fn extent() -> vk::Extent2D {
        vk::Extent2D { width: 800, height: 600 }
    }

    fn color_target() -> ImageAllocation {
        let mut color = ImageAllocation::swapchain_image(
            vk::Image::from_raw(0xC0),
            vk::Format::B8G8R8A8_SRGB,
            extent(),
        );
        color.view = vk::ImageView::from_raw(0xC1);
        color
    }

    fn drawing_params(meshlet_counts: &[u32]) -> FrameParameters {
        let layouts = DescriptorLayouts::uniform(64, 0);
        let mut params = FrameParameters::clear([0.0; 4], extent());
        params.pipeline = Some(PipelineBinding {
            pipeline: vk::Pipeline::from_raw(0xA0),
            layout: vk::PipelineLayout::from_raw(0xA1),
        });
        params.draws = meshlet_counts
            .iter()
            .enumerate()
            .map(|(slot, &meshlet_count)| DrawItem {
                offsets: DescriptorOffsets::compute(&layouts, slot as u64).unwrap(),
                meshlet_count,
            })
            .collect();
        params
    }

    #[test]
    fn task_groups_round_up() {
        assert_eq!(task_group_count(0, 32), 0);
        assert_eq!(task_group_count(1, 32), 1);
        assert_eq!(task_group_count(32, 32), 1);
        assert_eq!(task_group_count(33, 32), 2);
        assert_eq!(task_group_count(5, 0), 5);
    }

    #[test]
    fn one_pool_per_slot() {
        let device = MockDevice::new();
        let mut commands = CommandPipeline::create_all(&device, 3, 32).unwrap();
        assert_eq!(device.live_pools(), 3);
        assert_ne!(commands.command_buffer(0), commands.command_buffer(1));

        commands.destroy_all(&device);
        commands.destroy_all(&device);
        assert_eq!(device.live_pools(), 0);
        assert_eq!(device.invalid_destroys(), 0);
    }

    #[test]
    fn clear_only_frame_skips_draws() {
        let device = MockDevice::new();
        let commands = CommandPipeline::create_all(&device, 1, 32).unwrap();
        let color = color_target();
        let params = FrameParameters::clear([0.2, 0.2, 0.2, 1.0], extent());

        commands
            .record(&device, 0, &params, &RenderTarget { color: &color, depth: None })
            .unwrap();

        let recorded = device.recorded();
        assert_eq!(recorded.first(), Some(&Recorded::Begin));
        assert_eq!(recorded.last(), Some(&Recorded::End));
        assert!(!recorded.iter().any(|r| matches!(r, Recorded::DrawMeshTasks(_))));
        assert!(recorded.contains(&Recorded::Barrier {
            image: color.image,
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }));
    }

    #[test]
    fn draws_use_cached_offsets_and_task_groups() {
        let device = MockDevice::new();
        let commands = CommandPipeline::create_all(&device, 1, 32).unwrap();
        let color = color_target();
        let params = drawing_params(&[1, 0, 70]);

        commands
            .record(&device, 0, &params, &RenderTarget { color: &color, depth: None })
            .unwrap();

        let recorded = device.recorded();
        let draws: Vec<u32> = recorded
            .iter()
            .filter_map(|r| match r {
                Recorded::DrawMeshTasks(groups) => Some(*groups),
                _ => None,
            })
            .collect();
        assert_eq!(draws, vec![1, 3]);

        let offsets: Vec<Vec<u64>> = recorded
            .iter()
            .filter_map(|r| match r {
                Recorded::DescriptorOffsets(offsets) => Some(offsets.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets[0], params.draws[0].offsets.as_slice().to_vec());
        assert_eq!(offsets[1], params.draws[2].offsets.as_slice().to_vec());
    }

    #[test]
    fn depth_target_is_transitioned_and_attached() {
        let device = MockDevice::new();
        let commands = CommandPipeline::create_all(&device, 1, 32).unwrap();
        let color = color_target();
        let depth = device.create_depth_target(extent()).unwrap();

        commands
            .record(
                &device,
                0,
                &FrameParameters::clear([0.0; 4], extent()),
                &RenderTarget { color: &color, depth: Some(&depth) },
            )
            .unwrap();

        let recorded = device.recorded();
        assert!(recorded.contains(&Recorded::Barrier {
            image: depth.image,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        }));
        assert!(recorded.contains(&Recorded::BeginRendering {
            color_view: color.view,
            depth_view: Some(depth.view),
        }));
    }

    #[test]
    fn submit_waits_at_color_output_and_signals_slot_primitives() {
        let device = MockDevice::new();
        let commands = CommandPipeline::create_all(&device, 2, 32).unwrap();
        let mut sync = FrameSync::create_all(&device, 2, 1_000).unwrap();
        let color = color_target();
        commands
            .record(&device, 1, &FrameParameters::clear([0.0; 4], extent()), &RenderTarget {
                color: &color,
                depth: None,
            })
            .unwrap();
        // Stands in for the acquire
        device.signal_semaphore(sync.slot(1).image_available);
        commands.submit(&device, &mut sync, 1).unwrap();

        let submit = device.submissions().pop().unwrap();
        assert_eq!(submit.wait_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(submit.wait_semaphore, sync.slot(1).image_available);
        assert_eq!(submit.signal_semaphore, sync.slot(1).render_finished);
        assert_eq!(submit.fence, sync.slot(1).in_flight_fence);
        assert!(sync.is_in_use(1));
    }

    #[test]
    fn pool_reset_requires_completed_work() {
        let device = MockDevice::new();
        let commands = CommandPipeline::create_all(&device, 1, 32).unwrap();
        let mut sync = FrameSync::create_all(&device, 1, 1_000).unwrap();
        let color = color_target();
        let params = FrameParameters::clear([0.0; 4], extent());
        let target = RenderTarget { color: &color, depth: None };

        commands.record(&device, 0, &params, &target).unwrap();
        device.signal_semaphore(sync.slot(0).image_available);
        commands.submit(&device, &mut sync, 0).unwrap();

        // Recording again while in flight is refused by the device
        assert!(commands.record(&device, 0, &params, &target).is_err());

        let token = sync.wait(&device, 0).unwrap().unwrap();
        commands.reset_pool(&device, token).unwrap();
        assert_eq!(device.pool_resets(), 1);
        commands.record(&device, 0, &params, &target).unwrap();
    }

    #[test]
    fn rejected_submission_is_fatal_and_rolls_back() {
        let device = MockDevice::new();
        let commands = CommandPipeline::create_all(&device, 1, 32).unwrap();
        let mut sync = FrameSync::create_all(&device, 1, 1_000).unwrap();
        device.signal_semaphore(sync.slot(0).image_available);
        device.reject_next_submit(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        let err = commands.submit(&device, &mut sync, 0).unwrap_err();
        assert!(matches!(err, RenderError::SubmitRejected(_)));
        assert!(err.is_device_failure());
        assert!(!sync.is_in_use(0));

        device.reject_next_submit(vk::Result::ERROR_DEVICE_LOST);
        let err = commands.submit(&device, &mut sync, 0).unwrap_err();
        assert!(matches!(err, RenderError::DeviceLost { .. }));
    }
}
