//! area-compose
//!
//! An X11 compositing manager with an OpenGL texture back-end, an XRender
//! picture back-end and a small plugin runtime.

mod compositor;
mod config;
mod error;
mod plugin;
mod shared;
mod x11_async;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use compositor::Compositor;
use compositor::backend::BackendKind;
use config::{Config, Overrides};
use plugin::PluginSpec;

/// X11 compositing manager
#[derive(Debug, Parser)]
#[command(name = "area-compose", version, about)]
struct Cli {
    /// Rendering back-end
    #[arg(short, long, value_enum)]
    backend: Option<BackendKind>,

    /// X display to connect to (defaults to $DISPLAY)
    #[arg(short, long)]
    display: Option<String>,

    /// More logging; repeat for trace output
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Log errors only
    #[arg(short, long)]
    quiet: bool,

    /// Load a plugin, as NAME or NAME:ARG,ARG... (repeatable)
    #[arg(short, long = "plugin", value_name = "PLUGIN", value_parser = PluginSpec::parse)]
    plugins: Vec<PluginSpec>,

    /// Maximum frames per second
    #[arg(long)]
    frame_rate: Option<u32>,

    /// Read this config file instead of the default one
    #[arg(long, value_name = "PATH", conflicts_with = "no_config")]
    config: Option<PathBuf>,

    /// Ignore config files entirely
    #[arg(long)]
    no_config: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            backend: self.backend,
            display: self.display.clone(),
            frame_rate: self.frame_rate,
            plugins: self.plugins.clone(),
        }
    }
}

/// Filter used when `RUST_LOG` is not set.
fn log_directive(verbose: u8, quiet: bool) -> String {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    format!("area_compose={},warn", level)
}

async fn run(cli: Cli) -> Result<()> {
    let config = if cli.no_config {
        Config::default()
    } else {
        Config::load(cli.config.as_deref())?
    };
    let options = config.into_options(cli.overrides())?;

    let (conn, screen_num) = x11rb::connect(options.settings.display.as_deref())
        .context("Failed to connect to the X server")?;
    info!("Connected to X server (default screen {})", screen_num);

    let mut compositor = Compositor::new(Arc::new(conn), &options)?;
    compositor.run().await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => {
            // --help and --version
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let message = e.to_string();
            eprintln!("area-compose: {}", message.lines().next().unwrap_or("invalid arguments"));
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_directive(cli.verbose, cli.quiet)),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting area-compose");

    match run(cli).await {
        Ok(()) => {
            info!("Compositor stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("area-compose: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directive() {
        assert_eq!(log_directive(0, false), "area_compose=info,warn");
        assert_eq!(log_directive(1, false), "area_compose=debug,warn");
        assert_eq!(log_directive(3, false), "area_compose=trace,warn");
        assert_eq!(log_directive(0, true), "area_compose=error,warn");
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "area-compose",
            "-b",
            "xrender",
            "-vv",
            "-p",
            "fade:300",
            "--plugin",
            "opengl/fade",
            "--frame-rate",
            "75",
        ])
        .unwrap();
        assert_eq!(cli.backend, Some(BackendKind::XRender));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.frame_rate, Some(75));
        assert_eq!(cli.plugins.len(), 2);
        assert_eq!(cli.plugins[0].name, "fade");
        assert_eq!(cli.plugins[0].args, vec!["300".to_string()]);
        assert_eq!(cli.plugins[1].name, "opengl/fade");
    }

    #[test]
    fn test_cli_rejects_bad_values() {
        assert!(Cli::try_parse_from(["area-compose", "-b", "vulkan"]).is_err());
        assert!(Cli::try_parse_from(["area-compose", "-p", ":1"]).is_err());
        assert!(Cli::try_parse_from(["area-compose", "-q", "-v"]).is_err());
        assert!(Cli::try_parse_from(["area-compose", "--no-config", "--config", "x.toml"]).is_err());
    }

    #[test]
    fn test_serverauto_backend_flag() {
        let cli = Cli::try_parse_from(["area-compose", "--backend", "serverauto", "--no-config"]).unwrap();
        assert_eq!(cli.overrides().backend, Some(BackendKind::ServerAuto));
        assert!(cli.no_config);
    }
}
