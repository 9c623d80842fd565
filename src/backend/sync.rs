// Synchronization primitives
//
// Fences for GPU-CPU and semaphores for GPU-GPU ordering, grouped into
// one set per frame in flight.

use anyhow::{Context, Result};
use ash::vk;

use super::guard::SetupGuard;

/// One frame slot's primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        // Start signaled so the first wait on this slot returns immediately
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        // Null entries are fine to destroy
        let mut semaphores = SetupGuard::new(
            [vk::Semaphore::null(); 2],
            |made: &[vk::Semaphore; 2]| unsafe {
                for &semaphore in made {
                    device.destroy_semaphore(semaphore, None);
                }
            },
        );

        for (i, name) in ["image-available", "render-finished"].into_iter().enumerate() {
            semaphores.get_mut()[i] = unsafe { device.create_semaphore(&semaphore_info, None) }
                .with_context(|| format!("Failed to create {} semaphore", name))?;
        }

        let in_flight_fence = unsafe { device.create_fence(&fence_info, None) }
            .context("Failed to create in-flight fence")?;

        let [image_available, render_finished] = semaphores.into_inner();
        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
        })
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
