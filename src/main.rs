// =============================================================================
// STILL WATER - animated water surface rendered with Vulkan
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Shell (winit window, pumped from the render loop)              │
// │    └── DeviceContext (instance, device, swapchain, depth)       │
// │          ├── RenderPipeline (pass, pipeline, sync, commands)    │
// │          └── GpuBuffer (water mesh, rewritten every frame)      │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Pump window events
// 2. Rebuild the water mesh on the CPU
// 3. Wait for the previous frame, acquire a swapchain image
// 4. Copy the mesh to the GPU, record the draw
// 5. Submit and present
//
// =============================================================================

mod water;
mod window;

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;
use std::mem::size_of;
use std::time::{Duration, Instant};
use still_water::backend::{
    DeviceContext, DeviceOptions, GpuBuffer, PipelineDesc, RenderPipeline, ShaderModule,
    SurfaceProvider, VertexLayout, VulkanLoader,
};
use still_water::config::Config;
use water::{Camera, WaterSurface, WaterVertex};
use window::Shell;
use winit::event_loop::EventLoop;
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting {}", config.window.title);
    log::info!(
        "Window: {}x{}, present mode: {}",
        config.window.width,
        config.window.height,
        config.graphics.present_mode
    );

    if let Err(e) = run(&config) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
    log::info!("Shut down cleanly");
}

fn init_logging(config: &Config) {
    env_logger::Builder::from_default_env()
        .filter_level(config.log_level())
        .init();
}

// =============================================================================
// SETUP
// =============================================================================

fn run(config: &Config) -> Result<()> {
    let mut event_loop = EventLoop::new().context("Failed to create the event loop")?;
    let mut shell = Shell::new(&config.window);

    // The window is created on the first resume
    while shell.window().is_none() {
        if let PumpStatus::Exit(code) = event_loop.pump_app_events(Some(Duration::ZERO), &mut shell)
        {
            anyhow::bail!("Event loop exited before the window opened (code {})", code);
        }
    }

    let options = DeviceOptions {
        app_name: config.window.title.clone(),
        enable_validation: config.validation_enabled(),
        preferred_present_mode: config.get_present_mode(),
    };
    let loader = VulkanLoader::new()?;
    let ctx = DeviceContext::new(loader, &shell, &options)
        .context("Failed to initialize Vulkan")?;

    let shaders = vec![
        ShaderModule::from_file(&ctx, vk::ShaderStageFlags::VERTEX, &config.shaders.vertex)?,
        ShaderModule::from_file(&ctx, vk::ShaderStageFlags::FRAGMENT, &config.shaders.fragment)?,
    ];
    let desc = PipelineDesc {
        vertex_layout: VertexLayout::of::<WaterVertex>(),
        push_constant_size: size_of::<Mat4>() as u32,
        clear_color: config.graphics.clear_color,
        ..PipelineDesc::default()
    };
    let mut pipeline =
        RenderPipeline::new(&ctx, shaders, desc).context("Failed to build the render pipeline")?;

    let mut water = WaterSurface::new(&config.mesh);
    let mut mesh = GpuBuffer::<_, WaterVertex>::new(&ctx, water.vertex_count())
        .context("Failed to allocate the water mesh")?;
    log::info!("Water mesh: {} vertices", water.vertex_count());

    let result = render_loop(
        &mut event_loop,
        &mut shell,
        &config.window.title,
        &mut pipeline,
        &mut water,
        &mut mesh,
        Camera::new(ctx.extent()).view_projection(),
    );

    // Nothing may be destroyed while the GPU still uses it
    let idle = pipeline.wait_idle().context("Failed to wait for the GPU to go idle");
    match (result, idle) {
        (Err(e), Err(idle)) => {
            log::error!("{:#}", idle);
            Err(e)
        }
        (result, idle) => result.and(idle),
    }
}

// =============================================================================
// RENDER LOOP
// =============================================================================

fn render_loop(
    event_loop: &mut EventLoop<()>,
    shell: &mut Shell,
    title: &str,
    pipeline: &mut RenderPipeline<'_, VulkanLoader>,
    water: &mut WaterSurface,
    mesh: &mut GpuBuffer<'_, still_water::backend::VulkanDevice, WaterVertex>,
    view_projection: Mat4,
) -> Result<()> {
    let start = Instant::now();
    let mut fps = FpsCounter::new();

    loop {
        if let PumpStatus::Exit(_) = event_loop.pump_app_events(Some(Duration::ZERO), shell) {
            return Ok(());
        }
        if !shell.is_open() {
            return Ok(());
        }

        water.update(start.elapsed().as_secs_f32());
        mesh.set_vertices(water.vertices())?;

        let mesh = &*mesh;
        pipeline
            .render(|frame| {
                // The fence wait at the top of render means the previous
                // frame no longer reads the mesh memory.
                mesh.sync_with_gpu_memory()?;
                frame.set_viewport_and_scissor();
                frame.push_constant_block(&view_projection)?;
                frame.draw_buffer(mesh);
                Ok(())
            })
            .context("Failed to render a frame")?;

        if let Some(rate) = fps.tick() {
            log::debug!("{:.0} FPS", rate);
            shell.set_title(&format!("{} - {:.0} FPS", title, rate));
        }
    }
}

/// Frames per second, reported once a second
struct FpsCounter {
    frames: u32,
    since: Instant,
}

impl FpsCounter {
    fn new() -> Self {
        Self {
            frames: 0,
            since: Instant::now(),
        }
    }

    fn tick(&mut self) -> Option<f32> {
        self.frames += 1;
        let elapsed = self.since.elapsed().as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }
        let rate = self.frames as f32 / elapsed;
        self.frames = 0;
        self.since = Instant::now();
        Some(rate)
    }
}
