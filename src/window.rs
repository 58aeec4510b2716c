// =============================================================================
// WINDOW SHELL - winit window that the renderer presents into
// =============================================================================
//
// The event loop is pumped from the render loop in `main`, so the shell only
// tracks the window and whether the user asked to leave.

use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle, RawWindowHandle};
use still_water::backend::{GpuError, GpuResult, SurfaceProvider};
use still_water::config::WindowConfig;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::ActiveEventLoop,
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowAttributes, WindowId},
};

pub struct Shell {
    attributes: WindowAttributes,
    window: Option<Window>,
    open: bool,
}

impl Shell {
    pub fn new(config: &WindowConfig) -> Self {
        let attributes = WindowAttributes::default()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(false);

        Self {
            attributes,
            window: None,
            open: true,
        }
    }

    pub fn window(&self) -> Option<&Window> {
        self.window.as_ref()
    }

    fn window_or_err(&self) -> GpuResult<&Window> {
        self.window.as_ref().ok_or(GpuError::WindowUnavailable)
    }

    pub fn set_title(&self, title: &str) {
        if let Some(window) = &self.window {
            window.set_title(title);
        }
    }
}

impl SurfaceProvider for Shell {
    fn display_handle(&self) -> GpuResult<RawDisplayHandle> {
        Ok(self.window_or_err()?.raw_display_handle())
    }

    fn window_handle(&self) -> GpuResult<RawWindowHandle> {
        Ok(self.window_or_err()?.raw_window_handle())
    }

    fn drawable_size(&self) -> (u32, u32) {
        self.window
            .as_ref()
            .map(|window| {
                let size = window.inner_size();
                (size.width, size.height)
            })
            .unwrap_or((0, 0))
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl ApplicationHandler for Shell {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => {
                let size = window.inner_size();
                log::info!("Window created: {}x{}", size.width, size.height);
                self.window = Some(window);
            }
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                self.open = false;
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.open = false;
                event_loop.exit();
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    self.open = false;
                    event_loop.exit();
                }
            }
            _ => {}
        }
    }
}
