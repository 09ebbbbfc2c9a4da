// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Provides sensible defaults if the config file is missing or has errors.
// Values that would break frame-core invariants are clamped by `validate`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Upper bound on frame-in-flight slots
pub const MAX_FRAME_SLOTS: usize = 3;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub meshlet: MeshletSettings,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Meshlet Renderer".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Frame core settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    /// Requested swapchain image count, clamped to what the surface supports
    pub min_image_count: u32,
    /// Fence wait bound in nanoseconds; expiry is fatal
    pub fence_timeout_ns: u64,
    /// Acquire bound in nanoseconds; expiry is fatal too
    pub acquire_timeout_ns: u64,
    /// Object slots reserved in the mapped region
    pub max_objects: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.1, 0.1, 0.12, 1.0],
            max_frames_in_flight: 2,
            min_image_count: 3,
            fence_timeout_ns: 10_000_000_000,
            acquire_timeout_ns: 10_000_000_000,
            max_objects: 256,
        }
    }
}

/// Meshlet clustering limits
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MeshletSettings {
    pub max_vertices: u32,
    pub max_triangles: u32,
    pub overdraw_threshold: f32,
    pub max_mesh_tasks: u32,
}

impl Default for MeshletSettings {
    fn default() -> Self {
        Self {
            max_vertices: 64,
            max_triangles: 124,
            overdraw_threshold: 1.05,
            max_mesh_tasks: 32,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.validate();
        Ok(config)
    }

    /// Clamp values that the frame core cannot honour
    pub fn validate(&mut self) {
        let graphics = &mut self.graphics;
        if !(1..=MAX_FRAME_SLOTS).contains(&graphics.max_frames_in_flight) {
            let clamped = graphics.max_frames_in_flight.clamp(1, MAX_FRAME_SLOTS);
            log::warn!(
                "max_frames_in_flight {} out of range, using {}",
                graphics.max_frames_in_flight,
                clamped
            );
            graphics.max_frames_in_flight = clamped;
        }
        if graphics.min_image_count < 2 {
            log::warn!("min_image_count {} too low, using 2", graphics.min_image_count);
            graphics.min_image_count = 2;
        }
        if graphics.fence_timeout_ns == 0 || graphics.fence_timeout_ns == u64::MAX {
            log::warn!("fence_timeout_ns must be finite and nonzero, using default");
            graphics.fence_timeout_ns = GraphicsConfig::default().fence_timeout_ns;
        }
        if graphics.acquire_timeout_ns == 0 || graphics.acquire_timeout_ns == u64::MAX {
            log::warn!("acquire_timeout_ns must be finite and nonzero, using default");
            graphics.acquire_timeout_ns = GraphicsConfig::default().acquire_timeout_ns;
        }
        graphics.max_objects = graphics.max_objects.max(1);

        let meshlet = &mut self.meshlet;
        // Local triangle indices are stored as u8
        meshlet.max_vertices = meshlet.max_vertices.clamp(3, 255);
        // Triangle data is padded to 4 indices per meshlet
        let triangles = meshlet.max_triangles.clamp(4, 512);
        meshlet.max_triangles = triangles - triangles % 4;
        if !(meshlet.overdraw_threshold >= 1.0) {
            log::warn!("overdraw_threshold {} below 1.0, using 1.0", meshlet.overdraw_threshold);
            meshlet.overdraw_threshold = 1.0;
        }
        meshlet.max_mesh_tasks = meshlet.max_mesh_tasks.max(1);
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}
