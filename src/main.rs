// =============================================================================
// MESHLET RENDERER - Windowed shell around the frame core
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (window, input, resize)                       │
// │    └── RenderCore (sync set, command pools, swapchain, depth)   │
// │          └── VulkanDevice (GpuDevice over ash + gpu-allocator)  │
// │    └── Scene (mapped region: descriptors, objects, geometry)    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait on the slot's previous work, reset its pool
// 2. Write mesh data into the slot's object blocks
// 3. Acquire swapchain image, record, submit
// 4. Present, recreating the swapchain when it went stale
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use glam::{Mat4, Quat, Vec3};
use meshlet_renderer::backend::{DescriptorBinding, HostBuffer, VulkanDevice};
use meshlet_renderer::config::Config;
use meshlet_renderer::geometry::{
    DescriptorLayouts, MappedArena, Mesh, MeshletConfig, MeshletProcessor, ObjectRanges,
    RangeHandle, ResourceKind, Transform, RESOURCE_KIND_COUNT, TEXTURE_SLOTS,
};
use meshlet_renderer::renderer::{FrameOutcome, RenderCore};
use meshlet_renderer::FrameParameters;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

/// Size of the shared mapped region
const REGION_SIZE: u64 = 16 * 1024 * 1024;
const REGION_ALIGNMENT: u64 = 256;
/// Bytes reserved per descriptor set entry
const DESCRIPTOR_SIZE: u64 = 64;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(config.log_level());
    log::info!("Starting meshlet renderer");
    log::info!("Window: {}x{}", config.window.width, config.window.height);
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// `RUST_LOG` still wins over the configured level
fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

// =============================================================================
// SCENE
// =============================================================================

/// The mapped region and the meshes living in it
struct Scene {
    region: HostBuffer,
    /// One set of object blocks per frame slot
    objects: Vec<ObjectRanges>,
    meshes: Vec<Mesh>,
    bindings: [DescriptorBinding; RESOURCE_KIND_COUNT],
    started: Instant,
}

impl Scene {
    fn new(device: &VulkanDevice, config: &Config) -> Result<Self> {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT
            | vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT;
        let mut region = HostBuffer::new(device, REGION_SIZE, usage, "scene region")?;
        match Self::populate(&mut region, config) {
            Ok((objects, meshes)) => {
                let address = region.device_address();
                let bindings = ResourceKind::ALL.map(|kind| DescriptorBinding {
                    address,
                    usage: kind.buffer_usage(),
                });
                Ok(Self {
                    region,
                    objects,
                    meshes,
                    bindings,
                    started: Instant::now(),
                })
            }
            Err(e) => {
                region.destroy(device);
                Err(e)
            }
        }
    }

    /// Carve the region and upload the cube
    fn populate(
        region: &mut HostBuffer,
        config: &Config,
    ) -> Result<(Vec<ObjectRanges>, Vec<Mesh>)> {
        let mut arena = MappedArena::new(region.size(), REGION_ALIGNMENT);
        let max_objects = u64::from(config.graphics.max_objects);

        // ─────────────────────────────────────────────────────────────────────
        // Descriptor sets first: one table per resource kind
        // ─────────────────────────────────────────────────────────────────────
        let mut descriptor_ranges = Vec::with_capacity(RESOURCE_KIND_COUNT);
        for kind in ResourceKind::ALL {
            let count = match kind {
                ResourceKind::Scene => 1,
                ResourceKind::Textures => max_objects * TEXTURE_SLOTS,
                _ => max_objects,
            };
            descriptor_ranges.push(arena.reserve(DESCRIPTOR_SIZE, count)?);
        }
        let layouts = DescriptorLayouts::new(std::array::from_fn(|i| {
            let range: RangeHandle = descriptor_ranges[i];
            range.into()
        }));

        // ─────────────────────────────────────────────────────────────────────
        // Per-object blocks for every frame slot, then immutable geometry
        // ─────────────────────────────────────────────────────────────────────
        let objects = (0..config.graphics.max_frames_in_flight)
            .map(|_| ObjectRanges::reserve(&mut arena, max_objects))
            .collect::<Result<Vec<_>, _>>()?;
        let processor = MeshletProcessor::new(MeshletConfig::from(&config.meshlet))?;
        let mut cube = Mesh::cube(0, 0, &processor, &layouts)?;

        let mapped = region
            .mapped_mut()
            .context("Scene region is not host visible")?;
        cube.upload_geometry(&mut arena, mapped)?;
        log::info!(
            "Scene region: {} of {} bytes used, cube has {} meshlets",
            arena.used(),
            arena.capacity(),
            cube.meshlets().len()
        );

        Ok((objects, vec![cube]))
    }

    /// Spin the meshes and write them into `slot`'s object blocks. The slot
    /// must be idle.
    fn update(&mut self, extent: vk::Extent2D, slot: usize) -> Result<()> {
        let seconds = self.started.elapsed().as_secs_f32();
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let projection = Mat4::perspective_rh(60f32.to_radians(), aspect, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 1.5, 3.0), Vec3::ZERO, Vec3::Y);
        let view_projection = projection * view;

        let objects = self
            .objects
            .get(slot)
            .with_context(|| format!("No object blocks for frame slot {}", slot))?;
        let region = self
            .region
            .mapped_mut()
            .context("Scene region is not host visible")?;
        for mesh in &mut self.meshes {
            mesh.set_transform(Transform {
                rotation: Quat::from_rotation_y(seconds),
                ..*mesh.transform()
            });
            mesh.sync_buffers(region, objects, view_projection)?;
        }
        Ok(())
    }

    fn frame_parameters(&self, extent: vk::Extent2D, clear_color: [f32; 4]) -> FrameParameters {
        // No pipeline bound: shaders are supplied by the embedding application,
        // so the frame is cleared and the draws are only described
        let mut params = FrameParameters::clear(clear_color, extent);
        params.descriptor_bindings = self.bindings;
        params.draws = self.meshes.iter().filter_map(Mesh::draw_item).collect();
        params
    }

    fn destroy(&mut self, device: &VulkanDevice) {
        self.region.destroy(device);
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

pub struct App {
    config: Config,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,

    // ─────────────────────────────────────────────────────────────────────────
    // VULKAN CORE
    // ─────────────────────────────────────────────────────────────────────────
    device: Option<Arc<VulkanDevice>>,
    core: Option<RenderCore<VulkanDevice>>,
    scene: Option<Scene>,

    stats: FrameStats,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            window: None,
            device: None,
            core: None,
            scene: None,
            stats: FrameStats::new(),
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        // Validation only in debug builds
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(&self.config.window.title, enable_validation, display, handle)?;

        let size = window.inner_size();
        let extent = vk::Extent2D { width: size.width, height: size.height };
        let core = RenderCore::new(device.clone(), &self.config, display, handle, extent)
            .context("Failed to create render core")?;
        let scene = Scene::new(&device, &self.config).context("Failed to build scene")?;

        self.device = Some(device);
        self.core = Some(core);
        self.scene = Some(scene);

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn render_frame(&mut self) -> Result<Option<FrameOutcome>> {
        let (Some(core), Some(scene)) = (self.core.as_mut(), self.scene.as_mut()) else {
            return Ok(None);
        };
        let Some(extent) = core.extent() else {
            return Ok(Some(FrameOutcome::Skipped));
        };

        let slot = core.wait_for_slot()?;
        scene.update(extent, slot)?;
        let params = scene.frame_parameters(extent, self.config.graphics.clear_color);
        Ok(Some(core.render_frame(&params)?))
    }

    fn report_stats(&mut self) {
        let Some(summary) = self.stats.take_summary() else {
            return;
        };
        if summary.recreated > 0 || summary.skipped > 0 {
            log::debug!(
                "Last second: {} skipped, {} swapchain rebuilds",
                summary.skipped,
                summary.recreated
            );
        }
        if let Some(ref window) = self.window {
            window.set_title(&format!(
                "{} | {:.0} fps",
                self.config.window.title, summary.frames_per_second
            ));
        }
    }
}

// =============================================================================
// FRAME STATISTICS
// =============================================================================

struct StatsSummary {
    frames_per_second: f32,
    skipped: u32,
    recreated: u32,
}

/// Outcome counts over a one second window
struct FrameStats {
    window_start: Instant,
    presented: u32,
    skipped: u32,
    recreated: u32,
}

impl FrameStats {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            presented: 0,
            skipped: 0,
            recreated: 0,
        }
    }

    fn record(&mut self, outcome: FrameOutcome) {
        match outcome {
            FrameOutcome::Presented { .. } => self.presented += 1,
            FrameOutcome::Skipped => self.skipped += 1,
            FrameOutcome::Recreated => self.recreated += 1,
        }
    }

    /// Closes the window once a second has passed
    fn take_summary(&mut self) -> Option<StatsSummary> {
        let elapsed = self.window_start.elapsed().as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }
        let summary = StatsSummary {
            frames_per_second: self.presented as f32 / elapsed,
            skipped: self.skipped,
            recreated: self.recreated,
        };
        *self = Self::new();
        Some(summary)
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
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
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
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(core) = self.core.as_mut() {
                    core.on_resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(Some(outcome)) => {
                    self.stats.record(outcome);
                    self.report_stats();
                }
                Ok(None) => {}
                Err(e) => {
                    // Device-level failure: stop rather than retry
                    log::error!("Render error: {:?}", e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("Escape pressed, exiting");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // 1. Frame core (waits for the device to go idle first)
        if let Some(mut core) = self.core.take() {
            if let Err(e) = core.shutdown() {
                log::error!("Render core shutdown failed: {}", e);
            }
        }

        // 2. Mapped region
        if let (Some(mut scene), Some(device)) = (self.scene.take(), self.device.as_ref()) {
            scene.destroy(device);
        }

        // 3. Device goes with the last Arc
        self.device = None;

        log::info!("Cleanup complete");
    }
}
