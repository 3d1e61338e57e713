//! Configuration for area-compose
//!
//! Loads configuration from the TOML file at
//! `~/.config/area-compose/config.toml`, writing a default file on first
//! run. Command-line values override what the file says.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compositor::CompositorOptions;
use crate::compositor::backend::{BackendKind, BackendSettings, PictureFilter};
use crate::error::CompositorError;
use crate::plugin::PluginSpec;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// "opengl", "xrender" or "serverauto"
    pub backend: BackendKind,
    /// Upper bound on frames per second
    pub frame_rate: u32,
    /// Window picture filter of the xrender backend: "fast", "good", "best"
    pub picture_filter: PictureFilter,
    /// Shown where no root pixmap is set (hex: 0xRRGGBB)
    pub background_color: u32,
    /// Reconfigure outline colour (hex: 0xRRGGBB)
    pub outline_color: u32,
    /// Plugins in load order
    pub plugins: Vec<PluginSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::OpenGl,
            frame_rate: 60,
            picture_filter: PictureFilter::Fast,
            background_color: 0x2e3440,
            outline_color: 0xffffff,
            plugins: Vec::new(),
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backend: Option<BackendKind>,
    pub display: Option<String>,
    pub frame_rate: Option<u32>,
    /// Replaces the file's plugin list when not empty
    pub plugins: Vec<PluginSpec>,
}

impl Config {
    /// Load `path`, or the default location when `None`. The default file
    /// is created when missing; an explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let config_path = Self::config_path()?;
                if !config_path.exists() {
                    info!("Config file not found at {:?}, using defaults", config_path);
                    if let Err(e) = Self::save_default(&config_path) {
                        warn!("Failed to create default config file: {}", e);
                    }
                    return Ok(Self::default());
                }
                config_path
            }
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|e| CompositorError::config(format!("cannot read {}: {}", config_path.display(), e)))?;
        let config = Self::parse(&content)
            .map_err(|e| CompositorError::config(format!("{}: {}", config_path.display(), e)))?;

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("area-compose");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string =
            toml::to_string_pretty(&Self::default()).context("Failed to serialize default config")?;
        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    /// Merge the command line into this configuration.
    pub fn into_options(self, overrides: Overrides) -> Result<CompositorOptions, CompositorError> {
        let frame_rate = overrides.frame_rate.unwrap_or(self.frame_rate);
        if frame_rate == 0 {
            return Err(CompositorError::config("frame_rate must be at least 1"));
        }
        for (key, color) in [
            ("background_color", self.background_color),
            ("outline_color", self.outline_color),
        ] {
            if color > 0xffffff {
                return Err(CompositorError::config(format!(
                    "{} 0x{:x} is not a 0xRRGGBB colour",
                    key, color
                )));
            }
        }

        let plugins = if overrides.plugins.is_empty() {
            self.plugins
        } else {
            overrides.plugins
        };

        Ok(CompositorOptions {
            backend: overrides.backend.unwrap_or(self.backend),
            settings: BackendSettings {
                display: overrides.display,
                background_color: self.background_color,
                outline_color: self.outline_color,
                picture_filter: self.picture_filter,
            },
            frame_rate,
            plugins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        assert!(text.contains("backend = \"opengl\""));
        assert_eq!(Config::parse(&text).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::parse("backend = \"xrender\"\nbackground_color = 0x102030\n").unwrap();
        assert_eq!(config.backend, BackendKind::XRender);
        assert_eq!(config.background_color, 0x102030);
        assert_eq!(config.frame_rate, 60);
        assert_eq!(config.picture_filter, PictureFilter::Fast);
    }

    #[test]
    fn test_plugin_tables() {
        let config = Config::parse(
            r#"
picture_filter = "best"

[[plugins]]
name = "fade"
args = ["350"]

[[plugins]]
name = "xrender/fade"
"#,
        )
        .unwrap();
        assert_eq!(config.picture_filter, PictureFilter::Best);
        assert_eq!(config.plugins.len(), 2);
        assert_eq!(config.plugins[0].args, vec!["350".to_string()]);
        assert!(config.plugins[1].args.is_empty());
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(Config::parse("backend = \"vulkan\"").is_err());
        assert!(Config::parse("framerate = 30").is_err());
    }

    #[test]
    fn test_command_line_wins() {
        let config = Config {
            plugins: vec![PluginSpec::parse("fade").unwrap()],
            ..Config::default()
        };
        let options = config
            .into_options(Overrides {
                backend: Some(BackendKind::XRender),
                display: Some(":1".into()),
                frame_rate: Some(30),
                plugins: vec![PluginSpec::parse("fade:100").unwrap()],
            })
            .unwrap();
        assert_eq!(options.backend, BackendKind::XRender);
        assert_eq!(options.frame_rate, 30);
        assert_eq!(options.settings.display.as_deref(), Some(":1"));
        assert_eq!(options.plugins, vec![PluginSpec::parse("fade:100").unwrap()]);
    }

    #[test]
    fn test_file_plugins_kept_without_command_line_plugins() {
        let config = Config {
            plugins: vec![PluginSpec::parse("fade").unwrap()],
            ..Config::default()
        };
        let options = config.into_options(Overrides::default()).unwrap();
        assert_eq!(options.backend, BackendKind::OpenGl);
        assert_eq!(options.plugins.len(), 1);
    }

    #[test]
    fn test_invalid_values() {
        let zero = Config::default().into_options(Overrides {
            frame_rate: Some(0),
            ..Overrides::default()
        });
        assert!(matches!(zero, Err(CompositorError::Config(_))));

        let color = Config {
            outline_color: 0x1000000,
            ..Config::default()
        }
        .into_options(Overrides::default());
        assert!(matches!(color, Err(CompositorError::Config(_))));
    }
}
