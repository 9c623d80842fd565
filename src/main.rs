// =============================================================================
// VULKAN TRIANGLE - minimal presentation pipeline
// =============================================================================
//
// Opens a window and draws one colored triangle every frame, keeping up to
// MAX_FRAMES_IN_FLIGHT frames queued on the GPU.
//
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (App)                                         │
// │    └── Renderer                                                 │
// │          ├── VulkanDevice (instance, surface, GPU, queues)      │
// │          ├── Swapchain ─> Pipeline ─> Framebuffers ─> Commands  │
// │          └── FrameSynchronizer (semaphores, fences)             │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the slot's fence
// 2. Acquire a swapchain image
// 3. Wait for whichever slot last rendered into that image
// 4. Submit the pre-recorded command buffer
// 5. Present
//
// =============================================================================

mod backend;
mod config;
mod error;
mod frame;
mod renderer;

use anyhow::{Context, Result};
use config::Config;
use renderer::Renderer;
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowAttributes},
};

fn main() -> Result<()> {
    // The log level lives in the config, so its load outcome is logged after
    let (config, report) = Config::load();

    init_logging(&config);
    report.log();
    log::info!("Starting Vulkan triangle");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.resizable { "resizable" } else { "fixed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Setup or frame failures end the loop and surface here as a nonzero exit
    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// RUST_LOG wins over the configured level when set
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or(config.debug.log_level.as_str())).init();
}

struct App {
    config: Config,
    // Declared before the window: the surface must go before its window
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            renderer: None,
            window: None,
            fatal: None,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:?}", error);
        self.fatal = Some(error);
        event_loop.exit();
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(ref renderer) = self.renderer {
            if let Err(e) = renderer.shutdown() {
                self.fail(event_loop, e);
                return;
            }
        }
        event_loop.exit();
    }

    fn create_window(&self, event_loop: &ActiveEventLoop) -> Result<Arc<Window>> {
        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(self.config.window.resizable);

        let window = event_loop
            .create_window(window_attributes)
            .context("Failed to create window")?;
        Ok(Arc::new(window))
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match self.create_window(event_loop) {
            Ok(w) => w,
            Err(e) => return self.fail(event_loop, e),
        };

        match Renderer::new(&self.config, &window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => return self.fail(event_loop, e.context("Failed to initialize Vulkan")),
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                // A zero size is handled at draw time; the rebuild waits for a real one
                if let Some(ref mut renderer) = self.renderer {
                    renderer.request_rebuild();
                }
            }

            WindowEvent::RedrawRequested => {
                let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref())
                else {
                    return;
                };
                let size = window.inner_size();
                if let Err(e) = renderer.draw_frame(size.width, size.height) {
                    self.fail(event_loop, e);
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown(event_loop);
                }
            }

            _ => {}
        }
    }

    /// Keep frames coming; the frame loop itself paces against the GPU
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Release GPU resources while the window is still alive
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}
