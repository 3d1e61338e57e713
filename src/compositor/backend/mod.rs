//! Rendering back-ends
//!
//! Two implementations of [`Backend`]: the texture path over GLX and the
//! picture path over XRender. A screen is generic over its back-end; the
//! compositor keeps screens in the tagged [`AnyScreen`](super::screen::AnyScreen).

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::mirror::ScreenMirror;
use super::window::WindowState;
use crate::error::CompositorError;
use crate::plugin::{PluginSet, WindowHooks};
use crate::shared::Rect;

pub mod gl_context;
pub mod partition;
pub mod picture;
pub mod shaders;
pub mod texture;

/// Which rendering path to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[value(name = "opengl")]
    OpenGl,
    #[value(name = "xrender")]
    XRender,
    /// Let the server composite by itself; nothing is drawn
    #[value(name = "serverauto")]
    ServerAuto,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::OpenGl => "opengl",
            BackendKind::XRender => "xrender",
            BackendKind::ServerAuto => "serverauto",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = CompositorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opengl" => Ok(BackendKind::OpenGl),
            "xrender" => Ok(BackendKind::XRender),
            "serverauto" => Ok(BackendKind::ServerAuto),
            other => Err(CompositorError::config(format!("unknown backend {:?}", other))),
        }
    }
}

/// Operations every back-end provides to its screen.
pub trait Backend {
    /// Per-window object the back-end draws from
    type Surface;
    /// Plugin flavour this back-end accepts
    type Plugin: WindowHooks<Self::Surface> + ?Sized;

    fn kind(&self) -> BackendKind;

    /// Create the surface for a freshly mirrored window.
    fn create_window_object(&mut self, window: &WindowState) -> Result<()>;

    fn window_object(&self, id: u32) -> Option<&Self::Surface>;

    /// Drop the back-end's reference to a window's surface.
    fn release_window_object(&mut self, id: u32);

    fn set_root_pixmap_changed(&mut self);

    fn set_root_window_size_changed(&mut self);

    /// Produce one frame from the mirror.
    fn render_screen(&mut self, mirror: &ScreenMirror, plugins: &mut PluginSet<Self::Plugin>) -> Result<()>;
}

/// One step of a frame. Back-ends execute these in order; the plugin
/// hooks run where their step sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStep {
    Clear,
    BackgroundPreRender,
    Background,
    BackgroundPostRender,
    WindowPreRender(u32),
    Window(u32),
    WindowPostRender(u32),
    RectPreRender(Rect),
    Outline(Rect),
    RectPostRender(Rect),
    ExtraJobs,
    Present,
}

/// Steps of the next frame: background, then every renderable window
/// bottom-to-top for which `drawable` holds, then the reconfigure
/// outline, then plugin jobs.
pub fn frame_steps(mirror: &ScreenMirror, drawable: impl Fn(u32) -> bool) -> Vec<FrameStep> {
    let mut steps = vec![
        FrameStep::Clear,
        FrameStep::BackgroundPreRender,
        FrameStep::Background,
        FrameStep::BackgroundPostRender,
    ];
    for window in mirror.stacked().filter(|w| w.is_renderable() && drawable(w.id)) {
        steps.extend([
            FrameStep::WindowPreRender(window.id),
            FrameStep::Window(window.id),
            FrameStep::WindowPostRender(window.id),
        ]);
    }
    if let Some(rect) = mirror.reconfigure_rect() {
        steps.extend([
            FrameStep::RectPreRender(rect),
            FrameStep::Outline(rect),
            FrameStep::RectPostRender(rect),
        ]);
    }
    steps.extend([FrameStep::ExtraJobs, FrameStep::Present]);
    steps
}

/// XRender filter applied to window pictures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PictureFilter {
    #[default]
    Fast,
    Good,
    Best,
}

impl PictureFilter {
    pub fn name(&self) -> &'static str {
        match self {
            PictureFilter::Fast => "fast",
            PictureFilter::Good => "good",
            PictureFilter::Best => "best",
        }
    }
}

/// Options shared by both back-ends.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// X display for the GLX side connection; `$DISPLAY` when unset
    pub display: Option<String>,
    pub background_color: u32,
    pub outline_color: u32,
    pub picture_filter: PictureFilter,
}

/// A `0xRRGGBB` colour as 16-bit channels.
pub fn color_channels(rgb: u32) -> (u16, u16, u16) {
    let expand = |c: u32| ((c & 0xFF) * 0x101) as u16;
    (expand(rgb >> 16), expand(rgb >> 8), expand(rgb))
}

/// A `0xRRGGBB` colour as an opaque RGBA byte quadruple.
pub fn color_bytes(rgb: u32) -> [u8; 4] {
    [(rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8, 0xFF]
}
