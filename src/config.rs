use crate::error::{Result, ScanfieldError};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ScanfieldConfig {
    pub scanner: ScannerConfig,
    pub field: FieldConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ScannerConfig {
    /// Frames per second requested from the decode engine
    #[serde(default = "default_scanner_fps")]
    pub fps: u32,

    /// Scan region (width, height) in pixels
    #[serde(default = "default_scan_region")]
    pub scan_region: (u32, u32),

    /// Frame error substrings that mean "no symbol in this frame"
    #[serde(default = "default_noise_patterns")]
    pub noise_patterns: Vec<String>,

    /// Element the decode engine renders its preview into
    #[serde(default = "default_render_target")]
    pub render_target: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct FieldConfig {
    /// Placeholder shown while the field is empty
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SystemConfig {
    /// Field event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Log every field event at debug level, not only value and error changes
    #[serde(default)]
    pub debug_events: bool,
}

impl ScanfieldConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self> {
        Self::load_from_file("scanfield.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env<P: AsRef<Path>>(path: P, env: Environment) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("scanner.fps", default_scanner_fps())?
            .set_default(
                "scanner.scan_region",
                vec![default_scan_region().0, default_scan_region().1],
            )?
            .set_default("scanner.noise_patterns", default_noise_patterns())?
            .set_default("scanner.render_target", default_render_target())?
            .set_default("field.placeholder", default_placeholder())?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .set_default("system.debug_events", false)?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(env)
            .build()?;

        let config: ScanfieldConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.scanner.fps == 0 {
            return Err(ScanfieldError::invalid_config("Scanner fps must be greater than 0"));
        }

        if self.scanner.scan_region.0 == 0 || self.scanner.scan_region.1 == 0 {
            return Err(ScanfieldError::invalid_config("Scan region must be greater than 0"));
        }

        if self.scanner.render_target.trim().is_empty() {
            return Err(ScanfieldError::invalid_config("Scanner render target must not be empty"));
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ScanfieldError::invalid_config("Event bus capacity must be greater than 0"));
        }

        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl Default for ScanfieldConfig {
    fn default() -> Self {
        Self {
            scanner: ScannerConfig::default(),
            field: FieldConfig {
                placeholder: default_placeholder(),
            },
            system: SystemConfig {
                event_bus_capacity: default_event_bus_capacity(),
                debug_events: false,
            },
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            fps: default_scanner_fps(),
            scan_region: default_scan_region(),
            noise_patterns: default_noise_patterns(),
            render_target: default_render_target(),
        }
    }
}

/// Overrides such as `SCANFIELD_SCANNER__FPS=15`
fn environment() -> Environment {
    Environment::with_prefix("SCANFIELD")
        .prefix_separator("_")
        .separator("__")
}

// Default value functions
fn default_scanner_fps() -> u32 {
    10
}
fn default_scan_region() -> (u32, u32) {
    (300, 200)
}
fn default_noise_patterns() -> Vec<String> {
    vec!["parse error".to_string(), "No MultiFormat".to_string()]
}
fn default_render_target() -> String {
    "qr-reader".to_string()
}

fn default_placeholder() -> String {
    "Scan or enter barcode".to_string()
}

fn default_event_bus_capacity() -> usize {
    32
}
