// Synchronization primitives
//
// One set of semaphores and one fence per frame-in-flight slot.
// Fences start signaled so the first frame never blocks; a slot's command
// pool may only be reset once its fence has been observed signaled, which is
// what the `PoolResetToken` returned by `wait` stands for.

use ash::vk;

use super::gpu::GpuDevice;
use crate::error::{RenderError, RenderResult};

/// Where a slot's fence is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Created signaled, never submitted
    Signaled,
    /// Submitted, GPU work may still be running (the slot is "in use")
    Pending,
    /// Unsignaled and ready to be handed to a submission
    Reset,
}

/// Frame synchronization - one per frame in flight
#[derive(Debug)]
pub struct SlotSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    state: FenceState,
}

impl SlotSync {
    fn null() -> Self {
        Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
            state: FenceState::Signaled,
        }
    }

    pub fn state(&self) -> FenceState {
        self.state
    }
}

/// Proof that a slot's previous GPU work has completed.
///
/// Consumed by `CommandPipeline::reset_pool`; it cannot be cloned, so a pool
/// is reset at most once per observed fence signal.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "the slot's command pool must be reset with this token"]
pub struct PoolResetToken {
    slot: usize,
}

impl PoolResetToken {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[derive(Debug)]
pub struct FrameSync {
    slots: Vec<SlotSync>,
    fence_timeout_ns: u64,
}

impl FrameSync {
    /// Allocate semaphores and pre-signaled fences for `slot_count` slots
    pub fn create_all<D: GpuDevice + ?Sized>(
        device: &D,
        slot_count: usize,
        fence_timeout_ns: u64,
    ) -> RenderResult<Self> {
        let mut sync = Self {
            slots: Vec::with_capacity(slot_count),
            fence_timeout_ns,
        };

        for _ in 0..slot_count {
            if let Err(err) = sync.push_slot(device) {
                sync.release_handles(device);
                return Err(err);
            }
        }

        log::info!("Created synchronization objects for {} frame slots", slot_count);
        Ok(sync)
    }

    fn push_slot<D: GpuDevice + ?Sized>(&mut self, device: &D) -> RenderResult<()> {
        // Pushed before creation so a partial slot is still released on failure
        self.slots.push(SlotSync::null());
        let index = self.slots.len() - 1;
        let slot = &mut self.slots[index];

        slot.image_available = device
            .create_semaphore()
            .map_err(RenderError::creation("image-available semaphore"))?;
        slot.render_finished = device
            .create_semaphore()
            .map_err(RenderError::creation("render-finished semaphore"))?;
        slot.in_flight_fence = device
            .create_fence(true)
            .map_err(RenderError::creation("in-flight fence"))?;
        Ok(())
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &SlotSync {
        &self.slots[index]
    }

    pub fn is_in_use(&self, index: usize) -> bool {
        self.slots[index].state == FenceState::Pending
    }

    /// Block until the slot's last submission has completed, then reset its
    /// fence. A no-op returning `None` when the slot has nothing in flight.
    pub fn wait<D: GpuDevice + ?Sized>(
        &mut self,
        device: &D,
        index: usize,
    ) -> RenderResult<Option<PoolResetToken>> {
        let timeout = self.fence_timeout_ns;
        let slot = &mut self.slots[index];
        if slot.state != FenceState::Pending || slot.in_flight_fence == vk::Fence::null() {
            return Ok(None);
        }

        device
            .wait_for_fence(slot.in_flight_fence, timeout)
            .map_err(|result| match result {
                vk::Result::TIMEOUT => {
                    log::error!("Fence of frame slot {} did not signal within {} ns", index, timeout);
                    RenderError::FenceTimeout { slot: index }
                }
                other => RenderError::vulkan("fence wait", other),
            })?;
        device
            .reset_fence(slot.in_flight_fence)
            .map_err(|result| RenderError::vulkan("fence reset", result))?;
        slot.state = FenceState::Reset;

        Ok(Some(PoolResetToken { slot: index }))
    }

    /// Prepare the slot's fence for a submission and mark the slot in use
    pub fn mark_submitted<D: GpuDevice + ?Sized>(
        &mut self,
        device: &D,
        index: usize,
    ) -> RenderResult<()> {
        let slot = &mut self.slots[index];
        match slot.state {
            FenceState::Pending => {
                // Submitting against an unobserved fence would lose the signal
                return Err(RenderError::vulkan("fence reuse", vk::Result::NOT_READY));
            }
            FenceState::Signaled => {
                device
                    .reset_fence(slot.in_flight_fence)
                    .map_err(|result| RenderError::vulkan("fence reset", result))?;
            }
            FenceState::Reset => {}
        }
        slot.state = FenceState::Pending;
        Ok(())
    }

    /// Roll back `mark_submitted` when the submission never reached the queue
    pub fn cancel_submission(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if slot.state == FenceState::Pending {
            slot.state = FenceState::Reset;
        }
    }

    /// Replace every semaphore. Semaphores cannot be reset individually, so
    /// any left in an unknown signal state are destroyed and recreated.
    pub fn reset_semaphores<D: GpuDevice + ?Sized>(&mut self, device: &D) -> RenderResult<()> {
        device
            .queue_wait_idle(device.graphics_queue().queue)
            .map_err(|result| RenderError::vulkan("graphics queue wait", result))?;

        for slot in &mut self.slots {
            for semaphore in [&mut slot.image_available, &mut slot.render_finished] {
                if *semaphore == vk::Semaphore::null() {
                    continue;
                }
                device.destroy_semaphore(*semaphore);
                *semaphore = vk::Semaphore::null();
                *semaphore = device
                    .create_semaphore()
                    .map_err(RenderError::creation("replacement semaphore"))?;
            }
        }

        log::debug!("Recreated semaphores for {} frame slots", self.slots.len());
        Ok(())
    }

    /// Wait for the device to go idle, then destroy every primitive.
    ///
    /// The primitives are destroyed even when the wait fails (a lost device
    /// never goes idle); the wait error is returned afterwards.
    pub fn destroy_all<D: GpuDevice + ?Sized>(&mut self, device: &D) -> RenderResult<()> {
        let idle = device
            .wait_idle()
            .map_err(|result| RenderError::vulkan("device idle wait", result));
        if let Err(err) = &idle {
            log::error!("Releasing frame sync without an idle device: {}", err);
        }
        self.release_handles(device);
        idle
    }

    fn release_handles<D: GpuDevice + ?Sized>(&mut self, device: &D) {
        for slot in &mut self.slots {
            if slot.image_available != vk::Semaphore::null() {
                device.destroy_semaphore(slot.image_available);
                slot.image_available = vk::Semaphore::null();
            }
            if slot.render_finished != vk::Semaphore::null() {
                device.destroy_semaphore(slot.render_finished);
                slot.render_finished = vk::Semaphore::null();
            }
            if slot.in_flight_fence != vk::Fence::null() {
                device.destroy_fence(slot.in_flight_fence);
                slot.in_flight_fence = vk::Fence::null();
            }
            slot.state = FenceState::Signaled;
        }
    }
}
