// =============================================================================
// VKRT - Real-time Vulkan ray tracer
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop, input)                                  │
// │    └── Renderer                                                 │
// │          ├── Vulkan Device + Surface                            │
// │          ├── Mesh buffers -> BLAS -> TLAS                       │
// │          ├── Ray tracing pipeline + shader binding table        │
// │          └── Swapchain + storage image (recreated on resize)    │
// └─────────────────────────────────────────────────────────────────┘
//
// CONTROLS:
//   Left drag   orbit        Right drag  pan
//   Wheel       zoom         V           toggle vsync
//   Esc         quit
//
// =============================================================================

mod backend;
mod camera;
mod config;
mod mesh;
mod overlay;
mod renderer;
mod stats;

use anyhow::{Context, Result};
use ash::vk;
use backend::swapchain::DrawableSurface;
use backend::VulkanDevice;
use config::Config;
use mesh::Mesh;
use overlay::TitleOverlay;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use renderer::Renderer;
use std::sync::Arc;
use std::time::Duration;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalPosition,
    event::{ElementState, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

/// Pixels per wheel line when the platform reports pixel deltas
const PIXELS_PER_LINE: f32 = 40.0;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let (config, mut warnings) = Config::load();
    let level = config.debug.level_filter().unwrap_or_else(|e| {
        warnings.push(format!("{:#}, defaulting to info", e));
        log::LevelFilter::Info
    });

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    // Collected before the logger existed
    for warning in &warnings {
        log::warn!("{}", warning);
    }

    log::info!("Starting vkrt");
    log::info!(
        "Window: {}x{}, vsync {}",
        config.window.width,
        config.window.height,
        if config.graphics.vsync { "on" } else { "off" }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// =============================================================================
// WINDOW AS A DRAWABLE SURFACE
// =============================================================================

impl DrawableSurface for Window {
    fn drawable_extent(&self) -> vk::Extent2D {
        let size = self.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    /// Sleeps without dispatching events, so only startup waits on this
    fn wait_for_resize(&self) {
        std::thread::sleep(Duration::from_millis(16));
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer goes before the device it
/// borrows from, and the window outlives the surface created on it.
struct App {
    renderer: Option<Renderer>,
    overlay: Option<TitleOverlay>,
    device: Option<Arc<VulkanDevice>>,
    window: Option<Arc<Window>>,

    config: Config,

    // ─────────────────────────────────────────────────────────────────────────
    // INPUT STATE
    // ─────────────────────────────────────────────────────────────────────────
    cursor: Option<PhysicalPosition<f64>>,
    orbiting: bool,
    panning: bool,

    /// Set when the window is minimized (size = 0) - skip rendering
    is_minimized: bool,
    /// First fatal error, returned from main after the loop exits
    error: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            renderer: None,
            overlay: None,
            device: None,
            window: None,
            config,
            cursor: None,
            orbiting: false,
            panning: false,
            is_minimized: false,
            error: None,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: Arc<Window>) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let device = VulkanDevice::new(
            &self.config.window.title,
            self.config.debug.validation_layers,
            display_handle,
            window_handle,
        )?;

        let mesh = match &self.config.scene.mesh {
            Some(path) => Mesh::load_gltf(path)?,
            None => {
                log::info!("No mesh configured, tracing the built-in triangle");
                Mesh::triangle()
            }
        };

        // A freshly created window already reports its requested size
        let extent = backend::swapchain::wait_for_drawable_extent(window.as_ref());
        let renderer = Renderer::new(device.clone(), &self.config, &mesh, extent)?;

        self.overlay = Some(TitleOverlay::new(window.clone(), &self.config.window.title));
        self.renderer = Some(renderer);
        self.device = Some(device);
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn render_frame(&mut self) -> Result<()> {
        if self.is_minimized {
            return Ok(());
        }

        let (Some(renderer), Some(overlay), Some(window)) =
            (self.renderer.as_mut(), self.overlay.as_mut(), self.window.as_ref())
        else {
            return Ok(());
        };

        renderer.draw_frame(window.as_ref(), overlay)?;
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:?}", error);
        if self.error.is_none() {
            self.error = Some(error);
        }
        event_loop.exit();
    }

    // =========================================================================
    // CAMERA INPUT
    // =========================================================================

    fn cursor_moved(&mut self, position: PhysicalPosition<f64>) -> Result<()> {
        let previous = self.cursor.replace(position);
        let Some(previous) = previous else {
            return Ok(());
        };
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };

        let dx = (position.x - previous.x) as f32;
        let dy = (position.y - previous.y) as f32;

        if self.orbiting {
            renderer.update_camera(|camera| camera.orbit(dx, dy))?;
        } else if self.panning {
            renderer.update_camera(|camera| camera.pan(dx, dy))?;
        }
        Ok(())
    }

    fn scrolled(&mut self, delta: MouseScrollDelta) -> Result<()> {
        let steps = match delta {
            MouseScrollDelta::LineDelta(_, y) => y,
            MouseScrollDelta::PixelDelta(pos) => pos.y as f32 / PIXELS_PER_LINE,
        };
        match self.renderer.as_mut() {
            Some(renderer) => renderer.update_camera(|camera| camera.zoom(steps)),
            None => Ok(()),
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
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        // Keep the window even on failure; it must outlive anything created on it
        self.window = Some(window.clone());

        if let Err(e) = self.init_vulkan(window) {
            self.fail(event_loop, e.context("Failed to initialize Vulkan"));
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        let result = match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
                Ok(())
            }

            // ─────────────────────────────────────────────────────────────────
            // WINDOW RESIZED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    if let Some(renderer) = self.renderer.as_mut() {
                        renderer.notify_resized();
                    }
                }
                Ok(())
            }

            WindowEvent::RedrawRequested => self.render_frame(),

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && !event.repeat {
                    match event.physical_key {
                        PhysicalKey::Code(KeyCode::Escape) => {
                            log::info!("ESC pressed, exiting...");
                            event_loop.exit();
                        }
                        PhysicalKey::Code(KeyCode::KeyV) => {
                            if let Some(overlay) = self.overlay.as_mut() {
                                overlay.toggle_vsync();
                            }
                        }
                        _ => {}
                    }
                }
                Ok(())
            }

            // ─────────────────────────────────────────────────────────────────
            // MOUSE INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::MouseInput { state, button, .. } => {
                let pressed = state == ElementState::Pressed;
                match button {
                    MouseButton::Left => self.orbiting = pressed,
                    MouseButton::Right => self.panning = pressed,
                    _ => {}
                }
                Ok(())
            }
            WindowEvent::CursorMoved { position, .. } => self.cursor_moved(position),
            WindowEvent::CursorLeft { .. } => {
                self.cursor = None;
                Ok(())
            }
            WindowEvent::MouseWheel { delta, .. } => self.scrolled(delta),

            _ => Ok(()),
        };

        if let Err(e) = result {
            self.fail(event_loop, e);
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.renderer = None;
        self.overlay = None;
        self.device = None;
        log::info!("Cleanup complete");
    }
}
