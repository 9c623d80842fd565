// =============================================================================
// FRAME SYNCHRONIZER - frames in flight
// =============================================================================
//
// A fixed ring of N frame slots, each with an image-available semaphore, a
// render-finished semaphore and an in-flight fence. Every loop iteration
// uses slot `frame_counter % N`:
//
// ┌──────────────────────────────────────────────────────────────────────────┐
// │ wait slot fence ─> acquire ─> wait image's previous owner ─> claim image │
// │   ─> reset slot fence ─> submit ─> present ─> frame_counter += 1         │
// └──────────────────────────────────────────────────────────────────────────┘
//
// The fence wait caps outstanding GPU work at N frames. The per-image owner
// array catches the case where the presentation engine hands back an image
// that an older slot is still rendering into (N not dividing the image
// count, or images returned out of order).
//
// The GPU side is reached only through `FrameBackend`, so the protocol runs
// the same against the real device and against a recording mock.

use anyhow::{anyhow, Result};
use ash::vk;

use crate::backend::FrameSync;
use crate::error::FrameError;

/// Frame slots in the ring
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Result of asking the swapchain for an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub suboptimal: bool,
}

/// GPU-facing operations the frame loop drives
pub trait FrameBackend {
    /// Block until `fence` is signaled or `timeout` nanoseconds pass
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> Result<(), FrameError>;

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), FrameError>;

    /// Ask for the next image; `signal` fires once it is safe to render into
    fn acquire_next_image(
        &self,
        signal: vk::Semaphore,
        timeout: u64,
    ) -> Result<AcquiredImage, FrameError>;

    /// Submit the pre-recorded commands for `image_index` on the graphics queue
    fn submit(
        &self,
        image_index: u32,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(), FrameError>;

    /// Queue `image_index` for display once `wait` fires. Returns suboptimal.
    fn present(&self, image_index: u32, wait: vk::Semaphore) -> Result<bool, FrameError>;

    fn wait_idle(&self) -> Result<(), FrameError>;

    fn destroy_frame_sync(&self, sync: &FrameSync);
}

/// Where a slot is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    WaitingForGpu,
    Acquiring,
    Submitted,
    /// Idle; also the state of a fresh slot, whose fence starts signaled
    Presented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame was submitted and queued for display
    Presented {
        slot: usize,
        image_index: u32,
        /// The swapchain works but no longer matches the surface
        needs_rebuild: bool,
    },
    /// Acquire reported a stale swapchain; nothing was submitted
    OutOfDate,
}

pub struct FrameSynchronizer<const N: usize> {
    slots: [FrameSync; N],
    states: [SlotState; N],
    /// Fence of the slot that last rendered into each swapchain image
    images_in_flight: Vec<Option<vk::Fence>>,
    frame_counter: u64,
    timeout: u64,
    destroyed: bool,
}

impl<const N: usize> FrameSynchronizer<N> {
    pub fn new(slots: [FrameSync; N], image_count: usize, timeout: u64) -> Self {
        assert!(N > 0, "at least one frame slot is required");
        Self {
            slots,
            states: [SlotState::Presented; N],
            images_in_flight: vec![None; image_count],
            frame_counter: 0,
            timeout,
            destroyed: false,
        }
    }

    /// Create the slot primitives on a real device
    pub fn create(device: &ash::Device, image_count: usize, timeout: u64) -> Result<Self> {
        let mut created = Vec::with_capacity(N);
        for _ in 0..N {
            match FrameSync::new(device) {
                Ok(sync) => created.push(sync),
                Err(e) => {
                    for sync in &created {
                        sync.destroy(device);
                    }
                    return Err(e);
                }
            }
        }

        let slots: [FrameSync; N] = created
            .try_into()
            .map_err(|_| anyhow!("expected {} frame slots", N))?;

        log::info!("Created {} frame slots", N);
        Ok(Self::new(slots, image_count, timeout))
    }

    /// Run one acquire, submit, present iteration
    pub fn draw_frame<B: FrameBackend>(&mut self, backend: &B) -> Result<FrameStatus, FrameError> {
        let slot = self.current_slot();
        let sync = self.slots[slot];

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Throttle on the work this slot submitted last time
        // ─────────────────────────────────────────────────────────────────────
        self.states[slot] = SlotState::WaitingForGpu;
        backend.wait_for_fence(sync.in_flight_fence, self.timeout)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Acquire; the semaphore fires asynchronously
        // ─────────────────────────────────────────────────────────────────────
        self.states[slot] = SlotState::Acquiring;
        let acquired = match backend.acquire_next_image(sync.image_available, self.timeout) {
            Ok(acquired) => acquired,
            Err(FrameError::OutOfDate) => {
                // The fence was not reset, so the slot is reusable as is
                self.states[slot] = SlotState::Presented;
                return Ok(FrameStatus::OutOfDate);
            }
            Err(e) => return Err(e),
        };
        let image = acquired.index as usize;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: An older slot may still be rendering into this image
        // ─────────────────────────────────────────────────────────────────────
        let previous_owner = *self
            .images_in_flight
            .get(image)
            .ok_or(FrameError::ImageIndexOutOfRange(acquired.index))?;
        if let Some(previous) = previous_owner {
            // Our own fence was already waited on in step 1
            if previous != sync.in_flight_fence {
                backend.wait_for_fence(previous, self.timeout)?;
            }
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4 + 5: Claim the image, then arm the fence for this submission
        // ─────────────────────────────────────────────────────────────────────
        self.images_in_flight[image] = Some(sync.in_flight_fence);
        backend.reset_fence(sync.in_flight_fence)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Submit
        // ─────────────────────────────────────────────────────────────────────
        backend.submit(
            acquired.index,
            sync.image_available,
            sync.render_finished,
            sync.in_flight_fence,
        )?;
        self.states[slot] = SlotState::Submitted;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 7 + 8: Present and advance, even when the chain turned stale
        // ─────────────────────────────────────────────────────────────────────
        let present = backend.present(acquired.index, sync.render_finished);
        self.states[slot] = SlotState::Presented;
        self.frame_counter += 1;

        let needs_rebuild = match present {
            Ok(suboptimal) => suboptimal || acquired.suboptimal,
            Err(FrameError::OutOfDate) => true,
            Err(e) => return Err(e),
        };

        Ok(FrameStatus::Presented {
            slot,
            image_index: acquired.index,
            needs_rebuild,
        })
    }

    /// Forget image ownership after the swapchain was rebuilt.
    /// Callers must have waited for device idle first.
    pub fn reset_image_owners(&mut self, image_count: usize) {
        self.images_in_flight.clear();
        self.images_in_flight.resize(image_count, None);
    }

    /// Block until the GPU has drained all submitted work
    pub fn shutdown<B: FrameBackend>(&self, backend: &B) -> Result<(), FrameError> {
        backend.wait_idle()
    }

    /// Wait for idle, then release every slot. Safe to call more than once.
    pub fn destroy<B: FrameBackend>(&mut self, backend: &B) -> Result<(), FrameError> {
        if self.destroyed {
            return Ok(());
        }
        backend.wait_idle()?;
        for sync in &self.slots {
            backend.destroy_frame_sync(sync);
        }
        self.images_in_flight.clear();
        self.destroyed = true;
        Ok(())
    }

    #[inline]
    pub fn current_slot(&self) -> usize {
        (self.frame_counter % N as u64) as usize
    }

    #[inline]
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn slot_state(&self, index: usize) -> SlotState {
        self.states[index]
    }

    #[cfg(test)]
    pub fn image_owner(&self, image_index: usize) -> Option<vk::Fence> {
        self.images_in_flight.get(image_index).copied().flatten()
    }

    pub fn tracked_images(&self) -> usize {
        self.images_in_flight.len()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{slots, Call, MockGpu};
    use super::*;

    fn presented_slot(status: FrameStatus) -> usize {
        match status {
            FrameStatus::Presented { slot, .. } => slot,
            FrameStatus::OutOfDate => panic!("expected a presented frame"),
        }
    }

    #[test]
    fn five_frames_cycle_two_slots() {
        let slots = slots::<2>();
        let gpu = MockGpu::new(&slots, 3);
        let mut sync = FrameSynchronizer::new(slots, 3, u64::MAX);

        let used: Vec<usize> = (0..5)
            .map(|_| presented_slot(sync.draw_frame(&gpu).unwrap()))
            .collect();

        assert_eq!(used, vec![0, 1, 0, 1, 0]);
        assert_eq!(sync.frame_counter(), 5);
        assert_eq!(sync.current_slot(), 1);
    }

    #[test]
    fn outstanding_frames_never_exceed_slot_count() {
        let slots = slots::<2>();
        let gpu = MockGpu::new(&slots, 3);
        let mut sync = FrameSynchronizer::new(slots, 3, u64::MAX);

        for _ in 0..50 {
            sync.draw_frame(&gpu).unwrap();
            assert!(gpu.pending.borrow().len() <= 2);
        }
        assert_eq!(gpu.max_pending.get(), 2);
    }

    #[test]
    fn steps_run_in_protocol_order() {
        let slots = slots::<2>();
        let gpu = MockGpu::new(&slots, 3);
        let mut sync = FrameSynchronizer::new(slots, 3, u64::MAX);
        let s = slots[0];

        let status = sync.draw_frame(&gpu).unwrap();

        assert_eq!(
            status,
            FrameStatus::Presented { slot: 0, image_index: 0, needs_rebuild: false }
        );
        assert_eq!(
            gpu.calls(),
            vec![
                Call::WaitFence(s.in_flight_fence),
                Call::Acquire(s.image_available),
                Call::ResetFence(s.in_flight_fence),
                Call::Submit {
                    image: 0,
                    wait: s.image_available,
                    signal: s.render_finished,
                    fence: s.in_flight_fence,
                },
                Call::Present { image: 0, wait: s.render_finished },
            ]
        );
        assert_eq!(sync.image_owner(0), Some(s.in_flight_fence));
        assert_eq!(sync.slot_state(0), SlotState::Presented);
    }

    #[test]
    fn waits_for_older_slot_still_using_the_image() {
        let slots = slots::<2>();
        let gpu = MockGpu::new(&slots, 3);
        let mut sync = FrameSynchronizer::new(slots, 3, u64::MAX);
        gpu.script_images(&[0, 1, 1]);

        sync.draw_frame(&gpu).unwrap();
        sync.draw_frame(&gpu).unwrap();
        gpu.clear_calls();

        // Slot 0 gets image 1, which slot 1 has not finished with
        sync.draw_frame(&gpu).unwrap();

        let calls = gpu.calls();
        assert_eq!(calls[0], Call::WaitFence(slots[0].in_flight_fence));
        assert_eq!(calls[1], Call::Acquire(slots[0].image_available));
        assert_eq!(calls[2], Call::WaitFence(slots[1].in_flight_fence));
        assert_eq!(calls[3], Call::ResetFence(slots[0].in_flight_fence));
        assert_eq!(sync.image_owner(1), Some(slots[0].in_flight_fence));
    }

    #[test]
    fn own_previous_image_needs_no_second_wait() {
        let slots = slots::<2>();
        let gpu = MockGpu::new(&slots, 3);
        let mut sync = FrameSynchronizer::new(slots, 3, u64::MAX);
        gpu.script_images(&[0, 1, 0]);

        sync.draw_frame(&gpu).unwrap();
        sync.draw_frame(&gpu).unwrap();
        gpu.clear_calls();
        sync.draw_frame(&gpu).unwrap();

        let waits = gpu
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::WaitFence(_)))
            .count();
        assert_eq!(waits, 1);
    }

    #[test]
    fn stale_acquire_skips_frame_and_keeps_fence_armed() {
        let slots = slots::<2>();
        let gpu = MockGpu::new(&slots, 3);
        let mut sync = FrameSynchronizer::new(slots, 3, u64::MAX);
        gpu.acquire_script.borrow_mut().push_back(Err(FrameError::OutOfDate));

        assert_eq!(sync.draw_frame(&gpu).unwrap(), FrameStatus::OutOfDate);
        assert_eq!(sync.frame_counter(), 0);
        assert!(!gpu.calls().iter().any(|call| matches!(call, Call::ResetFence(_))));

        // The same slot retries without deadlocking on its fence
        assert_eq!(presented_slot(sync.draw_frame(&gpu).unwrap()), 0);
        assert_eq!(sync.frame_counter(), 1);
    }

    #[test]
    fn suboptimal_or_stale_present_requests_rebuild() {
        let slots = slots::<2>();
        let gpu = MockGpu::new(&slots, 3);
        let mut sync = FrameSynchronizer::new(slots, 3, u64::MAX);
        gpu.present_script
            .borrow_mut()
            .extend([Ok(true), Err(FrameError::OutOfDate), Ok(false)]);

        for expected in [true, true, false] {
            match sync.draw_frame(&gpu).unwrap() {
                FrameStatus::Presented { needs_rebuild, .. } => assert_eq!(needs_rebuild, expected),
                FrameStatus::OutOfDate => panic!("acquire was not stale"),
            }
        }
        assert_eq!(sync.frame_counter(), 3);
    }

    #[test]
    fn suboptimal_acquire_still_renders() {
        let slots = slots::<2>();
        let gpu = MockGpu::new(&slots, 3);
        let mut sync = FrameSynchronizer::new(slots, 3, u64::MAX);
        gpu.acquire_script
            .borrow_mut()
            .push_back(Ok(AcquiredImage { index: 2, suboptimal: true }));

        assert_eq!(
            sync.draw_frame(&gpu).unwrap(),
            FrameStatus::Presented { slot: 0, image_index: 2, needs_rebuild: true }
        );
    }

    #[test]
    fn timeout_is_reported_without_advancing() {
        let slots = slots::<2>();
        let gpu = MockGpu::new(&slots, 3);
        let mut sync = FrameSynchronizer::new(slots, 3, 1_000_000);
        gpu.wait_result.set(Some(FrameError::Timeout));

        assert_eq!(sync.draw_frame(&gpu), Err(FrameError::Timeout));
        assert_eq!(sync.frame_counter(), 0);
        assert_eq!(sync.slot_state(0), SlotState::WaitingForGpu);
    }

    #[test]
    fn untracked_image_index_is_an_error() {
        let slots = slots::<2>();
        let gpu = MockGpu::new(&slots, 3);
        let mut sync = FrameSynchronizer::new(slots, 3, u64::MAX);
        gpu.script_images(&[7]);

        assert_eq!(sync.draw_frame(&gpu), Err(FrameError::ImageIndexOutOfRange(7)));
    }

    #[test]
    fn rebuild_resets_image_ownership() {
        let slots = slots::<2>();
        let gpu = MockGpu::new(&slots, 3);
        let mut sync = FrameSynchronizer::new(slots, 3, u64::MAX);
        for _ in 0..3 {
            sync.draw_frame(&gpu).unwrap();
        }

        sync.shutdown(&gpu).unwrap();
        sync.reset_image_owners(4);

        assert_eq!(sync.tracked_images(), 4);
        assert!((0..4).all(|image| sync.image_owner(image).is_none()));
        // The slot ring carries on where it was
        assert_eq!(sync.frame_counter(), 3);
        assert_eq!(presented_slot(sync.draw_frame(&gpu).unwrap()), 1);
    }

    #[test]
    fn destroy_waits_for_idle_first() {
        let slots = slots::<2>();
        let gpu = MockGpu::new(&slots, 3);
        let mut sync = FrameSynchronizer::new(slots, 3, u64::MAX);
        for _ in 0..4 {
            sync.draw_frame(&gpu).unwrap();
        }
        gpu.clear_calls();

        sync.destroy(&gpu).unwrap();
        sync.destroy(&gpu).unwrap();

        assert_eq!(
            gpu.calls(),
            vec![
                Call::WaitIdle,
                Call::Destroy(slots[0].in_flight_fence),
                Call::Destroy(slots[1].in_flight_fence),
            ]
        );
        assert!(gpu.pending.borrow().is_empty());
    }

    #[test]
    fn three_slots_over_two_images() {
        let slots = slots::<3>();
        let gpu = MockGpu::new(&slots, 2);
        let mut sync = FrameSynchronizer::new(slots, 2, u64::MAX);

        // Every acquire lands on an image the previous-but-one slot used
        for _ in 0..12 {
            sync.draw_frame(&gpu).unwrap();
        }
        assert_eq!(sync.frame_counter(), 12);
        assert!(gpu.max_pending.get() <= 3);
    }
}
