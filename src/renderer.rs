// =============================================================================
// RENDERER - swapchain/pipeline lifecycle and the per-frame draw
// =============================================================================
//
// FRAME FLOW:
// 1. Acquire a swapchain image (waits for the frame slot and the image)
// 2. Re-record that image's command buffer
// 3. Submit, then present
// 4. Out of date, suboptimal or resized -> recreate swapchain + pipeline
//
// Command buffers are allocated one per swapchain image and reallocated
// whenever a recreated swapchain comes back with a different image count.

use anyhow::{Context, Result};
use ash::vk;
use glam::Vec2;
use std::path::PathBuf;
use std::sync::Arc;
use winit::window::Window;
use crate::backend::pipeline::create_pipeline_layout;
use crate::backend::{GraphicsPipeline, PipelineConfig, Swapchain, VulkanDevice};
use crate::config::{resolve_asset_path, Config, ModelKind};
use crate::hot_reload::ShaderWatcher;
use crate::model::{self, Model, Vertex};

pub struct Renderer {
    // Declared in drop order: everything below borrows the device
    command_buffers: Vec<vk::CommandBuffer>,
    pipeline: Option<GraphicsPipeline>,
    swapchain: Option<Swapchain>,
    pipeline_layout: vk::PipelineLayout,
    model: Model,
    shader_watcher: Option<ShaderWatcher>,
    device: Arc<VulkanDevice>,

    vertex_shader: PathBuf,
    fragment_shader: PathBuf,
    present_mode: vk::PresentModeKHR,
    max_frames_in_flight: usize,
    clear_color: [f32; 4],

    /// Size of the window's drawable area, updated on every resize event
    window_extent: vk::Extent2D,
    /// Set on resize, cleared after the swapchain has been recreated
    framebuffer_resized: bool,
}

impl Renderer {
    pub fn new(window: &Window, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(&config.window.title, window, enable_validation)?;

        let vertices = load_vertices(config)?;
        let model = Model::new(device.clone(), &vertices)?;

        let pipeline_layout = create_pipeline_layout(&device)?;

        let vertex_shader = resolve_asset_path(&config.shaders.vertex);
        let fragment_shader = resolve_asset_path(&config.shaders.fragment);

        let shader_watcher = if config.shaders.hot_reload {
            match ShaderWatcher::new(&[&vertex_shader, &fragment_shader]) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Shader hot-reload disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let size = window.inner_size();

        let mut renderer = Self {
            command_buffers: Vec::new(),
            pipeline: None,
            swapchain: None,
            pipeline_layout,
            model,
            shader_watcher,
            device,
            vertex_shader,
            fragment_shader,
            present_mode: config.present_mode(),
            max_frames_in_flight: config.graphics.max_frames_in_flight,
            clear_color: config.graphics.clear_color,
            window_extent: vk::Extent2D {
                width: size.width,
                height: size.height,
            },
            framebuffer_resized: false,
        };

        renderer.recreate_swapchain()?;

        log::info!("Vulkan initialized successfully!");
        Ok(renderer)
    }

    /// Record a new drawable size; the swapchain follows on the next frame
    pub fn resize(&mut self, width: u32, height: u32) {
        self.window_extent = vk::Extent2D { width, height };
        self.framebuffer_resized = true;
    }

    /// A zero-sized window cannot own a swapchain
    pub fn is_minimized(&self) -> bool {
        self.window_extent.width == 0 || self.window_extent.height == 0
    }

    // =========================================================================
    // SWAPCHAIN LIFECYCLE
    // =========================================================================

    /// Replace the swapchain after a resize (or create the first one), then
    /// bring command buffers and the pipeline in line with it.
    pub fn recreate_swapchain(&mut self) -> Result<()> {
        if self.is_minimized() {
            log::debug!("Window minimized, deferring swapchain creation");
            return Ok(());
        }

        // Nothing may still reference the old images
        self.device.wait_idle()?;

        // Fails if the new swapchain changed formats
        let swapchain = Swapchain::new(
            self.device.clone(),
            self.window_extent,
            self.present_mode,
            self.max_frames_in_flight,
            self.swapchain.take(),
        )?;

        log::debug!("Swapchain aspect ratio: {:.3}", swapchain.extent_aspect_ratio());

        if command_buffers_stale(self.command_buffers.len(), swapchain.image_count()) {
            self.free_command_buffers();
            self.create_command_buffers(swapchain.image_count())?;
        }

        self.swapchain = Some(swapchain);
        self.framebuffer_resized = false;

        // Formats are unchanged, so the previous pipeline stays compatible
        // with the new render pass if the rebuild fails
        match self.create_pipeline() {
            Ok(pipeline) => self.pipeline = Some(pipeline),
            Err(e) if self.pipeline.is_some() => {
                log::error!("Failed to rebuild pipeline, keeping the previous one: {:#}", e);
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }

    fn create_pipeline(&self) -> Result<GraphicsPipeline> {
        let swapchain = self
            .swapchain
            .as_ref()
            .context("Cannot create pipeline before swapchain")?;

        let config = PipelineConfig {
            render_pass: swapchain.render_pass,
            pipeline_layout: self.pipeline_layout,
            ..PipelineConfig::default()
        };

        GraphicsPipeline::new(
            self.device.clone(),
            &self.vertex_shader,
            &self.fragment_shader,
            &config,
            &Vertex::binding_descriptions(),
            &Vertex::attribute_descriptions(),
        )
    }

    /// Rebuild the pipeline from the shader files on disk. A broken shader
    /// keeps the current pipeline running.
    fn reload_shaders(&mut self) -> Result<()> {
        if self.swapchain.is_none() {
            return Ok(());
        }
        log::info!("Shaders changed, rebuilding pipeline");

        self.device.wait_idle()?;
        match self.create_pipeline() {
            Ok(pipeline) => {
                self.pipeline = Some(pipeline);
                log::info!("Pipeline rebuilt");
            }
            Err(e) => log::error!("Shader reload failed, keeping old pipeline: {:#}", e),
        }
        Ok(())
    }

    // =========================================================================
    // COMMAND BUFFERS
    // =========================================================================

    fn create_command_buffers(&mut self, count: usize) -> Result<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.device.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        self.command_buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        log::info!("Allocated {} command buffers", count);
        Ok(())
    }

    fn free_command_buffers(&mut self) {
        if self.command_buffers.is_empty() {
            return;
        }
        unsafe {
            self.device
                .device
                .free_command_buffers(self.device.command_pool, &self.command_buffers);
        }
        self.command_buffers.clear();
    }

    fn record_command_buffer(&self, image_index: usize) -> Result<()> {
        let device = &self.device.device;
        let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;
        let pipeline = self.pipeline.as_ref().context("Pipeline not initialized")?;
        let cmd = self.command_buffers[image_index];

        let begin_info = vk::CommandBufferBeginInfo::builder();
        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .context("Failed to begin recording command buffer")?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: swapchain.extent,
        };

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(swapchain.render_pass)
            .framebuffer(swapchain.framebuffer(image_index))
            .render_area(render_area)
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: swapchain.extent.width as f32,
            height: swapchain.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);
        }

        pipeline.bind(cmd);
        self.model.bind(cmd);
        self.model.draw(cmd);

        unsafe {
            device.cmd_end_render_pass(cmd);
            device.end_command_buffer(cmd)
        }
        .context("Failed to record command buffer")?;

        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Render a single frame. Returns false when nothing was drawn
    /// (minimized, or the swapchain had to be recreated first).
    pub fn draw_frame(&mut self) -> Result<bool> {
        if self
            .shader_watcher
            .as_ref()
            .is_some_and(|watcher| watcher.poll_changed())
        {
            self.reload_shaders()?;
        }

        if self.is_minimized() {
            return Ok(false);
        }

        if self.swapchain.is_none() {
            // Created lazily when the window starts out minimized
            self.recreate_swapchain()?;
        }

        let Some(swapchain) = self.swapchain.as_mut() else {
            return Ok(false);
        };

        let image_index = match next_step(swapchain.acquire_next_image()?) {
            FrameStep::Draw(image_index) => image_index,
            FrameStep::Recreate => {
                self.recreate_swapchain()?;
                return Ok(false);
            }
        };

        self.record_command_buffer(image_index as usize)?;

        let cmd = self.command_buffers[image_index as usize];
        let present_stale = self
            .swapchain
            .as_mut()
            .context("Swapchain not initialized")?
            .submit_command_buffers(cmd, image_index)?;

        if recreate_after_present(present_stale, self.framebuffer_resized) {
            self.framebuffer_resized = false;
            self.recreate_swapchain()?;
        }

        Ok(true)
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // GPU must be done before anything is destroyed
        let _ = self.device.wait_idle();

        // Reverse order of creation; the device goes last with its Arc
        self.free_command_buffers();
        self.pipeline = None;
        self.swapchain = None;
        unsafe {
            self.device
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None);
        }
    }
}

/// What to do with the result of an image acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameStep {
    Draw(u32),
    /// Swapchain out of date: recreate and skip this frame
    Recreate,
}

fn next_step(acquired: Option<u32>) -> FrameStep {
    match acquired {
        Some(image_index) => FrameStep::Draw(image_index),
        None => FrameStep::Recreate,
    }
}

/// Present reported suboptimal/out of date, or the window changed size
fn recreate_after_present(present_stale: bool, framebuffer_resized: bool) -> bool {
    present_stale || framebuffer_resized
}

/// One command buffer per swapchain image
fn command_buffers_stale(allocated: usize, image_count: usize) -> bool {
    allocated != image_count
}

/// Build the configured geometry
fn load_vertices(config: &Config) -> Result<Vec<Vertex>> {
    match config.scene.model {
        ModelKind::Triangle => Ok(model::triangle()),
        ModelKind::Sierpinski => model::sierpinski(
            config.scene.sierpinski_depth,
            Vec2::new(0.0, -0.5),
            Vec2::new(0.5, 0.5),
            Vec2::new(-0.5, 0.5),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_config_selects_geometry() {
        let mut config = Config::default();
        assert_eq!(load_vertices(&config).unwrap(), model::triangle());

        config.scene.model = ModelKind::Sierpinski;
        config.scene.sierpinski_depth = 2;
        assert_eq!(load_vertices(&config).unwrap().len(), 27);
    }

    #[test]
    fn out_of_date_acquire_recreates() {
        assert_eq!(next_step(Some(2)), FrameStep::Draw(2));
        assert_eq!(next_step(None), FrameStep::Recreate);
    }

    #[test]
    fn stale_present_or_resize_recreates() {
        assert!(!recreate_after_present(false, false));
        assert!(recreate_after_present(true, false));
        assert!(recreate_after_present(false, true));
        assert!(recreate_after_present(true, true));
    }

    #[test]
    fn command_buffers_follow_image_count() {
        // First swapchain: nothing allocated yet
        assert!(command_buffers_stale(0, 3));
        assert!(!command_buffers_stale(3, 3));
        assert!(command_buffers_stale(3, 2));
        assert!(command_buffers_stale(2, 4));
    }
}
