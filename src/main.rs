// =============================================================================
// EMBER - minimal Vulkan rendering harness
// =============================================================================
//
// Opens a window, brings up a Vulkan device and draws a triangle every frame.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop, window, input)                          │
// │    └── Renderer                                                 │
// │          └── VulkanDevice (instance, surface, queues, allocator)│
// │                └── Swapchain (images, depth, render pass, sync) │
// │                      └── GraphicsPipeline + Model               │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

mod app;
mod backend;
mod config;
mod hot_reload;
mod model;
mod renderer;

use anyhow::{Context, Result};
use app::App;
use config::Config;
use std::fs::File;
use winit::event_loop::EventLoop;

fn main() -> Result<()> {
    // Logging depends on the config, so load errors are reported afterwards
    let (config, config_error) = Config::load();

    init_logging(&config)?;
    if let Some(e) = config_error {
        log::warn!("{:#}. Using defaults.", e);
    }

    log::info!("Starting Ember");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app).context("Event loop failed")?;

    app.into_result()
}

/// Initialize logging; `RUST_LOG` overrides the configured level
fn init_logging(config: &Config) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.log_level()).parse_default_env();

    if config.debug.log_to_file {
        let file = File::create(&config.debug.log_file)
            .with_context(|| format!("Failed to create log file {:?}", config.debug.log_file))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init().context("Failed to initialize logger")?;
    Ok(())
}
