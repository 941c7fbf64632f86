// =============================================================================
// HELLO TRIANGLE - Minimal Vulkan renderer
// =============================================================================
//
// Opens a window, brings up a Vulkan device and swapchain, builds one
// graphics pipeline and draws a hard-coded triangle every frame.
//
// OWNERSHIP:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit ApplicationHandler)                                 │
// │    ├── Renderer                                                 │
// │    │     ├── Command buffers (one per swapchain image)          │
// │    │     ├── Pipeline + PipelineLayout                          │
// │    │     ├── Swapchain (images, depth, render pass, sync)       │
// │    │     └── Arc<VulkanDevice> (surface, queues, command pool)  │
// │    └── Window                                                   │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait on the current slot's fence, acquire a swapchain image
// 2. Wait on whichever fence last used that image
// 3. Submit the pre-recorded command buffer for the image
// 4. Present, advance the frame slot
//
// =============================================================================

mod backend;
mod config;

use anyhow::{Context, Result};
use ash::vk;
use backend::swapchain::check_per_image_counts;
use backend::{FrameError, Pipeline, PipelineConfig, PipelineLayout, Swapchain, VulkanDevice};
use config::Config;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    let config = Config::load();
    log::info!("Starting triangle renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        config.window.title
    );
    log::info!("Preferred present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    app.finish()
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    // RUST_LOG overrides the default level
    builder.parse_default_env();
    builder.init();
}

// =============================================================================
// RENDERER
// =============================================================================

/// Every Vulkan object the frame loop needs.
///
/// Field order matters for Drop: the device goes last.
struct Renderer {
    /// One per swapchain image, recorded once
    command_buffers: Vec<vk::CommandBuffer>,
    pipeline: Pipeline,
    _pipeline_layout: PipelineLayout,
    swapchain: Swapchain,
    device: Arc<VulkanDevice>,
    warned_suboptimal: bool,
}

impl Renderer {
    fn new(window: &Window, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let device = VulkanDevice::new(window, &config.window.title, config.validation_enabled())?;

        let size = window.inner_size();
        let swapchain = Swapchain::new(
            device.clone(),
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
            config.present_mode(),
        )?;

        log::info!(
            "Swapchain extent: {}x{} (aspect {:.2})",
            swapchain.width(),
            swapchain.height(),
            swapchain.aspect_ratio()
        );

        let pipeline_layout = PipelineLayout::empty(&device)?;

        let mut pipeline_config = PipelineConfig::default_for(swapchain.extent);
        pipeline_config.layout = pipeline_layout.handle;
        pipeline_config.render_pass = swapchain.render_pass;

        let pipeline = Pipeline::new(
            &device,
            &config.shaders.vertex,
            &config.shaders.fragment,
            &pipeline_config,
        )?;

        let command_buffers = allocate_command_buffers(&device, swapchain.image_count())?;
        let renderer = Self {
            command_buffers,
            pipeline,
            _pipeline_layout: pipeline_layout,
            swapchain,
            device,
            warned_suboptimal: false,
        };
        renderer.check_per_image_resources()?;
        renderer.record_command_buffers(config.graphics.clear_color)?;

        log::info!(
            "Created {} pre-recorded command buffers",
            renderer.command_buffers.len()
        );
        log::info!("Vulkan initialized successfully!");

        Ok(renderer)
    }

    /// One view, depth resource, framebuffer and command buffer per image
    fn check_per_image_resources(&self) -> Result<()> {
        let [views, depth, framebuffers] = self.swapchain.per_image_counts();
        check_per_image_counts(
            self.swapchain.image_count(),
            &[views, depth, framebuffers, self.command_buffers.len()],
        )
    }

    /// Static scene: clear, bind the pipeline, draw three vertices.
    fn record_command_buffers(&self, clear_color: [f32; 4]) -> Result<()> {
        let device = &self.device.device;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        for (i, &cmd) in self.command_buffers.iter().enumerate() {
            let begin_info = vk::CommandBufferBeginInfo::builder();

            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(self.swapchain.render_pass)
                .framebuffer(self.swapchain.framebuffer(i))
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: self.swapchain.extent,
                })
                .clear_values(&clear_values);

            unsafe {
                device
                    .begin_command_buffer(cmd, &begin_info)
                    .context("Failed to begin recording command buffer")?;

                device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
                self.pipeline.bind(cmd);
                device.cmd_draw(cmd, 3, 1, 0, 0);
                device.cmd_end_render_pass(cmd);

                device
                    .end_command_buffer(cmd)
                    .context("Failed to record command buffer")?;
            }
        }

        Ok(())
    }

    /// Acquire, submit, present. Suboptimal results are tolerated.
    fn draw_frame(&mut self) -> Result<()> {
        let (image_index, suboptimal) = self.swapchain.acquire_next_image()?;
        self.note_suboptimal(suboptimal);

        let cmd = *self
            .command_buffers
            .get(image_index as usize)
            .with_context(|| format!("No command buffer for image {}", image_index))?;

        let suboptimal = self.swapchain.submit_command_buffers(cmd, image_index)?;
        self.note_suboptimal(suboptimal);

        Ok(())
    }

    fn note_suboptimal(&mut self, suboptimal: bool) {
        if suboptimal && !self.warned_suboptimal {
            log::warn!("Swapchain is suboptimal for the surface; continuing without recreation");
            self.warned_suboptimal = true;
        }
    }

    fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Waiting for device idle before teardown...");
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device wait idle failed: {:#}", e);
        }

        unsafe {
            self.device
                .device
                .free_command_buffers(self.device.command_pool, &self.command_buffers);
        }
    }
}

fn allocate_command_buffers(device: &VulkanDevice, count: usize) -> Result<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(device.command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count as u32);

    unsafe { device.device.allocate_command_buffers(&alloc_info) }
        .context("Failed to allocate command buffers")
}

// =============================================================================
// FPS TRACKING
// =============================================================================

/// Counts frames and reports a rate once per second
struct FpsCounter {
    frame_count: u32,
    last_update: Instant,
}

impl FpsCounter {
    fn new(now: Instant) -> Self {
        Self {
            frame_count: 0,
            last_update: now,
        }
    }

    fn tick(&mut self, now: Instant) -> Option<f32> {
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_update);
        if elapsed < Duration::from_secs(1) {
            return None;
        }

        let fps = self.frame_count as f32 / elapsed.as_secs_f32();
        self.frame_count = 0;
        self.last_update = now;
        Some(fps)
    }
}

fn frame_limit_reached(limit: Option<u64>, frames_presented: u64) -> bool {
    limit.is_some_and(|limit| frames_presented >= limit)
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer owns the surface, which must
/// go before the window it was created from.
struct App {
    config: Config,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    /// First fatal error; returned from main after the loop exits
    error: Option<anyhow::Error>,
    frames_presented: u64,
    fps: FpsCounter,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            renderer: None,
            window: None,
            error: None,
            frames_presented: 0,
            fps: FpsCounter::new(Instant::now()),
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.error.is_none() {
            self.error = Some(error);
        }
        event_loop.exit();
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(renderer) = &self.renderer {
            if let Err(e) = renderer.wait_idle() {
                self.fail(event_loop, e);
                return;
            }
        }
        event_loop.exit();
    }

    /// No frames once shutdown has begun or a frame has failed
    fn should_draw(&self, exiting: bool) -> bool {
        !exiting && self.error.is_none()
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        if !self.should_draw(event_loop.exiting()) {
            return;
        }

        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        if let Err(e) = renderer.draw_frame() {
            if let Some(FrameError::Acquire(result) | FrameError::Present(result)) =
                e.downcast_ref::<FrameError>()
            {
                log::error!("Swapchain unusable ({:?}); recreation is not supported", result);
            }
            self.fail(event_loop, e.context("Frame failed"));
            return;
        }
        self.frames_presented += 1;

        if let Some(fps) = self.fps.tick(Instant::now()) {
            log::debug!("{:.0} FPS", fps);
            if self.config.debug.show_fps {
                if let Some(window) = &self.window {
                    window.set_title(&format!("{} - {:.0} FPS", self.config.window.title, fps));
                }
            }
        }

        if frame_limit_reached(self.config.debug.exit_after_frames, self.frames_presented) {
            log::info!("Presented {} frames, exiting", self.frames_presented);
            self.shutdown(event_loop);
        }
    }

    /// Consumes the app after the event loop has returned
    fn finish(mut self) -> Result<()> {
        // Teardown order: renderer (and surface) before window
        self.renderer = None;
        self.window = None;

        match self.error.take() {
            Some(error) => Err(error),
            None => {
                log::info!("Shut down cleanly after {} frames", self.frames_presented);
                Ok(())
            }
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(false);

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match Renderer::new(&window, &self.config) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
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

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown(event_loop);
                }
            }

            _ => {}
        }
    }

    /// Keep redrawing continuously
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if event_loop.exiting() {
            return;
        }
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Release GPU objects while the window and display connection are alive
        self.renderer = None;
    }
}
