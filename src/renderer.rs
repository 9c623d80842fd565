// Renderer - ties the device, the presentation-dependent resources and the
// frame loop together.
//
// Setup order: device -> swapchain -> pipeline -> framebuffers -> commands,
// then the frame slots. Everything from the swapchain down is rebuilt as one
// group when the surface changes; the device and the slot ring survive.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::PathBuf;
use std::sync::Arc;
use winit::window::Window;

use crate::backend::{
    CommandRecorder, DeviceConfig, FrameSync, Framebuffers, RenderPipeline, Swapchain,
    VulkanDevice,
};
use crate::config::Config;
use crate::error::FrameError;
use crate::frame::{
    AcquiredImage, FrameBackend, FrameStatus, FrameSynchronizer, MAX_FRAMES_IN_FLIGHT,
};

/// Settings the presentation group is rebuilt from
struct RenderSettings {
    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],
    vertex_shader: PathBuf,
    fragment_shader: PathBuf,
}

impl RenderSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            present_mode: config.preferred_present_mode(),
            clear_color: config.graphics.clear_color,
            vertex_shader: config.shaders.vertex.clone(),
            fragment_shader: config.shaders.fragment.clone(),
        }
    }
}

/// Everything that depends on the swapchain's format, extent or image count.
/// Field order is drop order: dependents go first.
struct PresentationTargets {
    commands: CommandRecorder,
    _framebuffers: Framebuffers,
    _pipeline: RenderPipeline,
    swapchain: Swapchain,
}

impl PresentationTargets {
    fn build(
        device: &Arc<VulkanDevice>,
        settings: &RenderSettings,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let swapchain = Swapchain::new(device.clone(), width, height, settings.present_mode)?;
        log::info!(
            "Presenting {:?} in {:?}/{:?}",
            swapchain.present_mode,
            swapchain.format,
            swapchain.color_space
        );

        let pipeline = RenderPipeline::new(
            device.clone(),
            swapchain.format,
            swapchain.extent,
            &settings.vertex_shader,
            &settings.fragment_shader,
        )?;

        let framebuffers = Framebuffers::new(
            device.clone(),
            &swapchain.image_views,
            pipeline.render_pass,
            swapchain.extent,
        )?;

        let commands = CommandRecorder::new(
            device.clone(),
            &framebuffers.framebuffers,
            pipeline.render_pass,
            pipeline.pipeline,
            swapchain.extent,
            settings.clear_color,
        )?;

        Ok(Self {
            commands,
            _framebuffers: framebuffers,
            _pipeline: pipeline,
            swapchain,
        })
    }
}

/// The frame loop's view of the real GPU
struct FrameContext<'a> {
    device: &'a VulkanDevice,
    targets: Option<&'a PresentationTargets>,
}

impl FrameContext<'_> {
    fn targets(&self) -> Result<&PresentationTargets, FrameError> {
        // Torn down and not yet rebuilt is the same as stale
        self.targets.ok_or(FrameError::OutOfDate)
    }
}

impl FrameBackend for FrameContext<'_> {
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> Result<(), FrameError> {
        unsafe { self.device.device.wait_for_fences(&[fence], true, timeout) }
            .map_err(FrameError::from)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), FrameError> {
        unsafe { self.device.device.reset_fences(&[fence]) }.map_err(FrameError::from)
    }

    fn acquire_next_image(
        &self,
        signal: vk::Semaphore,
        timeout: u64,
    ) -> Result<AcquiredImage, FrameError> {
        let (index, suboptimal) = self.targets()?.swapchain.acquire_next_image(timeout, signal)?;
        Ok(AcquiredImage { index, suboptimal })
    }

    fn submit(
        &self,
        image_index: u32,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(), FrameError> {
        let cmd = self
            .targets()?
            .commands
            .buffer_for(image_index)
            .ok_or(FrameError::ImageIndexOutOfRange(image_index))?;

        let wait_semaphores = [wait];
        // Vertex work may start early; only color output waits for the image
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [signal];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info], fence)
        }
        .map_err(FrameError::from)
    }

    fn present(&self, image_index: u32, wait: vk::Semaphore) -> Result<bool, FrameError> {
        self.targets()?
            .swapchain
            .present(self.device.present_queue, image_index, &[wait])
    }

    fn wait_idle(&self) -> Result<(), FrameError> {
        unsafe { self.device.device.device_wait_idle() }.map_err(FrameError::from)
    }

    fn destroy_frame_sync(&self, sync: &FrameSync) {
        sync.destroy(&self.device.device);
    }
}

/// What the next redraw should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramePlan {
    /// Zero-sized window: no extent to draw into or rebuild for
    Skip,
    Rebuild,
    Draw,
}

/// Tracks whether the presentation group still matches the surface
#[derive(Debug, Default)]
struct ChainState {
    stale: bool,
}

impl ChainState {
    fn request_rebuild(&mut self) {
        self.stale = true;
    }

    fn plan(&self, width: u32, height: u32, has_targets: bool) -> FramePlan {
        if width == 0 || height == 0 {
            FramePlan::Skip
        } else if self.stale || !has_targets {
            FramePlan::Rebuild
        } else {
            FramePlan::Draw
        }
    }

    /// Fold a frame's outcome in. Returns whether anything was presented.
    fn record(&mut self, status: FrameStatus) -> bool {
        match status {
            FrameStatus::Presented {
                slot,
                image_index,
                needs_rebuild,
            } => {
                log::trace!("Presented image {} from slot {}", image_index, slot);
                if needs_rebuild {
                    log::debug!("Swapchain suboptimal, rebuilding before next frame");
                    self.stale = true;
                }
                true
            }
            FrameStatus::OutOfDate => {
                log::debug!("Swapchain out of date, skipping frame");
                self.stale = true;
                false
            }
        }
    }

    fn rebuilt(&mut self) {
        self.stale = false;
    }
}

/// Drain the GPU, drop the old group, build a new one and retarget image
/// ownership at its image count. `build` returns the group and its image count.
fn rebuild_presentation<B, T, const N: usize>(
    synchronizer: &mut FrameSynchronizer<N>,
    backend: &B,
    targets: &mut Option<T>,
    build: impl FnOnce() -> Result<(T, usize)>,
) -> Result<()>
where
    B: FrameBackend,
{
    synchronizer
        .shutdown(backend)
        .context("Failed to drain the GPU before rebuilding")?;

    // Reverse dependency order, see PresentationTargets
    *targets = None;

    let (built, image_count) = build()?;
    synchronizer.reset_image_owners(image_count);
    *targets = Some(built);
    Ok(())
}

pub struct Renderer {
    synchronizer: FrameSynchronizer<MAX_FRAMES_IN_FLIGHT>,
    /// `None` only between teardown and rebuild
    targets: Option<PresentationTargets>,
    settings: RenderSettings,
    chain: ChainState,
    // Dropped last, after everything created from it
    device: Arc<VulkanDevice>,
}

impl Renderer {
    pub fn new(config: &Config, window: &Window) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let device_config = DeviceConfig {
            app_name: config.window.title.clone(),
            enable_validation: config.validation_enabled(),
        };
        let device = VulkanDevice::new(&device_config, display_handle, window_handle)?;
        log::info!(
            "Validation layers {}",
            if device.validation_enabled() { "enabled" } else { "disabled" }
        );

        let settings = RenderSettings::from_config(config);
        let size = window.inner_size();
        let targets = PresentationTargets::build(&device, &settings, size.width, size.height)?;

        let synchronizer = FrameSynchronizer::create(
            &device.device,
            targets.swapchain.image_count(),
            config.frame_timeout_ns(),
        )?;

        log::info!("Vulkan initialized successfully!");

        Ok(Self {
            synchronizer,
            targets: Some(targets),
            settings,
            chain: ChainState::default(),
            device,
        })
    }

    fn frame_context(&self) -> FrameContext<'_> {
        FrameContext {
            device: &self.device,
            targets: self.targets.as_ref(),
        }
    }

    /// Mark the presentation group stale, e.g. after a resize
    pub fn request_rebuild(&mut self) {
        self.chain.request_rebuild();
    }

    /// Render one frame. Returns whether anything was presented.
    pub fn draw_frame(&mut self, width: u32, height: u32) -> Result<bool> {
        match self.chain.plan(width, height, self.targets.is_some()) {
            FramePlan::Skip => return Ok(false),
            FramePlan::Rebuild => self.rebuild(width, height)?,
            FramePlan::Draw => {}
        }

        let context = FrameContext {
            device: &self.device,
            targets: self.targets.as_ref(),
        };
        let status = self.synchronizer.draw_frame(&context).map_err(|e| {
            let slot = self.synchronizer.current_slot();
            log::error!(
                "Frame {} failed in slot {} ({:?})",
                self.synchronizer.frame_counter(),
                slot,
                self.synchronizer.slot_state(slot)
            );
            e
        });

        Ok(self.chain.record(status.context("Frame submission failed")?))
    }

    /// Tear the presentation group down and build it again for a new size
    fn rebuild(&mut self, width: u32, height: u32) -> Result<()> {
        log::info!("Rebuilding swapchain resources for {}x{}", width, height);

        // Waiting for idle needs only the device
        let backend = FrameContext {
            device: &self.device,
            targets: None,
        };
        let device = &self.device;
        let settings = &self.settings;
        rebuild_presentation(&mut self.synchronizer, &backend, &mut self.targets, || {
            let targets = PresentationTargets::build(device, settings, width, height)?;
            let image_count = targets.swapchain.image_count();
            Ok((targets, image_count))
        })?;
        self.chain.rebuilt();

        log::debug!(
            "Tracking {} swapchain images after rebuild",
            self.synchronizer.tracked_images()
        );
        Ok(())
    }

    /// Stop issuing work and wait for the GPU to finish what it has
    pub fn shutdown(&self) -> Result<()> {
        self.synchronizer
            .shutdown(&self.frame_context())
            .context("Failed to wait for device idle")
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Slot primitives first, once the device is idle; the presentation
        // group and the device follow as fields are dropped
        let context = FrameContext {
            device: &self.device,
            targets: self.targets.as_ref(),
        };
        if let Err(e) = self.synchronizer.destroy(&context) {
            log::error!("Failed to release frame slots: {}", e);
        }
    }
}
