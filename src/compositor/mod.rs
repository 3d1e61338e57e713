//! Compositor Module
//!
//! Bootstrap (extension probing, selection ownership, redirection) and
//! the single-threaded event loop driving every screen.

pub mod atoms;
pub mod backend;
pub mod events;
pub mod mirror;
pub mod resource;
pub mod screen;
pub mod server;
pub mod stacking;
pub mod ticks;
pub mod window;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::sleep;
use tracing::{debug, error, info, trace};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::ReplyError;
use x11rb::protocol::Event;
use x11rb::protocol::composite::{self, ConnectionExt as CompositeExt};
use x11rb::protocol::damage::{self, ConnectionExt as DamageExt};
use x11rb::protocol::render::{self, ConnectionExt as RenderExt};
use x11rb::protocol::shape::{self, ConnectionExt as ShapeExt, SK, SO};
use x11rb::protocol::xproto::{
    AtomEnum, ChangeWindowAttributesAux, ClipOrdering, ConnectionExt as XprotoExt, CreateWindowAux,
    EventMask, PropMode, Screen as XScreen, WindowClass,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as WrapperExt;
use x11rb::{CURRENT_TIME, NONE};

use crate::error::{CompositorError, XErrorSeverity, classify_error_kind};
use crate::plugin::{PluginRegistry, PluginSpec};
use crate::shared::Geometry;
use crate::x11_async::X11EventStream;
use atoms::Atoms;
use backend::gl_context;
use backend::picture::PictureBackend;
use backend::texture::TextureBackend;
use backend::{BackendKind, BackendSettings};
use mirror::ScreenMirror;
use screen::{AnyScreen, Screen};
use server::X11Server;
use ticks::TickTracker;

/// Name set on the selection owner windows
pub const OWNER_NAME: &str = "area-compose";

const COMPOSITE_MIN: (u32, u32) = (0, 3);
const DAMAGE_MIN: (u32, u32) = (1, 0);
const RENDER_MIN: (u32, u32) = (0, 1);

/// Everything the compositor needs from the command line and config file.
#[derive(Debug, Clone)]
pub struct CompositorOptions {
    pub backend: BackendKind,
    pub settings: BackendSettings,
    pub frame_rate: u32,
    pub plugins: Vec<PluginSpec>,
}

pub struct Compositor {
    screens: Vec<AnyScreen>,
    server: X11Server,
    /// Frame period in microseconds
    frame_tick_us: u64,
}

impl Compositor {
    /// Take over compositing on every screen of `conn`.
    pub fn new(conn: Arc<RustConnection>, options: &CompositorOptions) -> Result<Self> {
        info!("Initializing compositor ({} backend)", options.backend);

        check_extensions(conn.as_ref(), options.backend)?;
        let atoms = atoms::get_or_intern(conn.as_ref())?;
        let server = X11Server::new(conn.clone(), atoms)?;
        let registry = PluginRegistry::builtin();

        let roots = conn.setup().roots.clone();
        let mut screens = Vec::with_capacity(roots.len());
        for (index, root) in roots.iter().enumerate() {
            let owner = acquire_selection(conn.as_ref(), index, root.root)?;

            if options.backend == BackendKind::ServerAuto {
                conn.composite_redirect_subwindows(root.root, composite::Redirect::AUTOMATIC)?
                    .check()
                    .with_context(|| format!("Failed to redirect screen {}", index))?;
                info!("Screen {}: automatic redirection", index);
                continue;
            }

            let screen = setup_screen(&server, &registry, options, index, root, owner, atoms)?;
            screens.push(screen);
        }
        conn.flush()?;

        let frame_rate = options.frame_rate.max(1);
        info!(
            "Compositor running on {} screens at {} frames per second",
            screens.len(),
            frame_rate
        );
        Ok(Self {
            screens,
            server,
            frame_tick_us: 1_000_000 / frame_rate as u64,
        })
    }

    /// Process events and draw frames until SIGINT or SIGTERM.
    pub async fn run(&mut self) -> Result<()> {
        let stream = X11EventStream::new(self.server.conn().clone())?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        let mut event_buffer: Vec<Event> = Vec::new();
        let mut frame_ticks = TickTracker::with_tick_size(self.frame_tick_us);
        frame_ticks.start()?;
        let mut should_exit = false;

        loop {
            if should_exit {
                info!("Exiting compositor loop");
                return Ok(());
            }

            collect_events(&stream, &mut event_buffer)?;
            self.execute_events(&mut event_buffer)?;

            // Frames that fell behind are dropped, not queued
            if self.wants_frame() && frame_ticks.new_elapsed_ticks()? > 0 {
                self.render_all()?;
            }
            stream.flush()?;

            // Replies read while rendering may have queued events
            collect_events(&stream, &mut event_buffer)?;
            if !event_buffer.is_empty() {
                continue;
            }

            let wants_frame = self.wants_frame();
            let frame_wait = Duration::from_micros(frame_ticks.until_next_tick()?);
            tokio::select! {
                result = stream.wait_readable() => result?,
                _ = sleep(frame_wait), if wants_frame => {}
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down");
                    should_exit = true;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    should_exit = true;
                }
            }
        }
    }

    fn wants_frame(&self) -> bool {
        self.screens.iter().any(AnyScreen::wants_frame)
    }

    fn render_all(&mut self) -> Result<()> {
        for screen in &mut self.screens {
            screen.render_screen(&self.server)?;
        }
        check_glx_errors()
    }

    fn execute_events(&mut self, event_buffer: &mut Vec<Event>) -> Result<()> {
        for event in event_buffer.drain(..) {
            self.handle_event(&event)?;
        }
        check_glx_errors()
    }

    fn handle_event(&mut self, event: &Event) -> Result<()> {
        if let Event::Error(e) = event {
            return match classify_error_kind(e.error_kind) {
                XErrorSeverity::Transient => {
                    debug!(
                        "Ignoring {:?} for 0x{:x} ({})",
                        e.error_kind,
                        e.bad_value,
                        e.request_name.unwrap_or("unknown request")
                    );
                    Ok(())
                }
                XErrorSeverity::Fatal => Err(anyhow!(
                    "X error {:?} on 0x{:x} ({})",
                    e.error_kind,
                    e.bad_value,
                    e.request_name.unwrap_or("unknown request")
                )),
            };
        }

        let Some(routed) = events::translate(event) else {
            trace!("Untracked event {:?}", event);
            return Ok(());
        };
        let Some(index) = self.screen_for(routed.event_window)? else {
            trace!("No screen for window 0x{:x}", routed.event_window);
            return Ok(());
        };
        self.screens[index].handle_event(&self.server, &routed.event)
    }

    /// Index of the screen owning `window`: a root match first, then a
    /// mirrored window, then whatever root the server reports.
    fn screen_for(&self, window: u32) -> Result<Option<usize>> {
        if let Some(index) = screen_index(self.screens.iter().map(AnyScreen::root), window) {
            return Ok(Some(index));
        }
        if let Some(index) = self
            .screens
            .iter()
            .position(|s| s.mirror().window(window).is_some())
        {
            return Ok(Some(index));
        }
        match self.server.conn().get_geometry(window)?.reply() {
            Ok(geom) => Ok(screen_index(self.screens.iter().map(AnyScreen::root), geom.root)),
            Err(ReplyError::X11Error(e)) if classify_error_kind(e.error_kind) == XErrorSeverity::Transient => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn collect_events(stream: &X11EventStream, event_buffer: &mut Vec<Event>) -> Result<()> {
    while let Some(event) = stream.poll_next_event()? {
        event_buffer.push(event);
    }
    Ok(())
}

/// Surface an error recorded by the Xlib handler of the GLX connection.
fn check_glx_errors() -> Result<()> {
    match gl_context::take_fatal_error() {
        Some(code) => Err(anyhow!("fatal X error {} on the GLX connection", code)),
        None => Ok(()),
    }
}

fn screen_index(mut roots: impl Iterator<Item = u32>, window: u32) -> Option<usize> {
    roots.position(|root| root == window)
}

fn version_at_least(found: (u32, u32), minimum: (u32, u32)) -> bool {
    found >= minimum
}

fn require_extension<C: RequestConnection>(conn: &C, name: &'static str) -> Result<()> {
    if conn.extension_information(name)?.is_none() {
        return Err(CompositorError::config(format!("the {} extension is not available", name)).into());
    }
    Ok(())
}

fn require_version(name: &str, found: (u32, u32), minimum: (u32, u32)) -> Result<()> {
    info!("{} extension {}.{}", name, found.0, found.1);
    if !version_at_least(found, minimum) {
        return Err(CompositorError::config(format!(
            "{} extension {}.{} is older than the required {}.{}",
            name, found.0, found.1, minimum.0, minimum.1
        ))
        .into());
    }
    Ok(())
}

/// Probe the extensions the chosen back-end depends on.
fn check_extensions(conn: &RustConnection, backend: BackendKind) -> Result<()> {
    require_extension(conn, composite::X11_EXTENSION_NAME)?;
    let version = conn
        .composite_query_version(0, 4)?
        .reply()
        .context("Failed to query composite version")?;
    require_version(
        "Composite",
        (version.major_version, version.minor_version),
        COMPOSITE_MIN,
    )?;

    if backend == BackendKind::ServerAuto {
        return Ok(());
    }

    require_extension(conn, damage::X11_EXTENSION_NAME)?;
    let version = conn
        .damage_query_version(1, 1)?
        .reply()
        .context("Failed to query damage version")?;
    require_version("Damage", (version.major_version, version.minor_version), DAMAGE_MIN)?;

    require_extension(conn, shape::X11_EXTENSION_NAME)?;
    let version = conn
        .shape_query_version()?
        .reply()
        .context("Failed to query shape version")?;
    info!("Shape extension {}.{}", version.major_version, version.minor_version);

    if backend == BackendKind::XRender {
        require_extension(conn, render::X11_EXTENSION_NAME)?;
        let version = conn
            .render_query_version(0, 11)?
            .reply()
            .context("Failed to query render version")?;
        require_version("Render", (version.major_version, version.minor_version), RENDER_MIN)?;
    }
    Ok(())
}

/// Own `_NET_WM_CM_S<index>` through a fresh input-only window.
fn acquire_selection(conn: &RustConnection, index: usize, root: u32) -> Result<u32> {
    let selection = atoms::intern_cm_selection(conn, index)?;
    let current = conn.get_selection_owner(selection)?.reply()?.owner;
    if current != NONE {
        return Err(CompositorError::init(format!(
            "another compositing manager (window 0x{:x}) is running on screen {}",
            current, index
        ))
        .into());
    }

    let owner = conn.generate_id()?;
    conn.create_window(
        0,
        owner,
        root,
        -1,
        -1,
        1,
        1,
        0,
        WindowClass::INPUT_ONLY,
        0,
        &CreateWindowAux::new(),
    )?
    .check()
    .context("Failed to create the selection owner window")?;

    let atoms = atoms::get_or_intern(conn)?;
    conn.change_property8(PropMode::REPLACE, owner, AtomEnum::WM_NAME, AtomEnum::STRING, OWNER_NAME.as_bytes())?;
    conn.change_property8(
        PropMode::REPLACE,
        owner,
        atoms._NET_WM_NAME,
        atoms.UTF8_STRING,
        OWNER_NAME.as_bytes(),
    )?;

    conn.set_selection_owner(owner, selection, CURRENT_TIME)?;
    let acquired = conn.get_selection_owner(selection)?.reply()?.owner;
    if acquired != owner {
        return Err(CompositorError::init(format!(
            "failed to acquire {} (owned by 0x{:x})",
            atoms::cm_selection_name(index),
            acquired
        ))
        .into());
    }
    debug!("Screen {}: selection owner 0x{:x}", index, owner);
    Ok(owner)
}

/// Let pointer events through `window`.
fn clear_input_shape(conn: &RustConnection, window: u32) -> Result<()> {
    conn.shape_rectangles(SO::SET, SK::INPUT, ClipOrdering::UNSORTED, window, 0, 0, &[])?;
    Ok(())
}

/// Redirect one root and build its back-end, plugins and mirror.
fn setup_screen(
    server: &X11Server,
    registry: &PluginRegistry,
    options: &CompositorOptions,
    index: usize,
    root: &XScreen,
    owner: u32,
    atoms: Atoms,
) -> Result<AnyScreen> {
    let conn = server.conn();
    conn.composite_redirect_subwindows(root.root, composite::Redirect::MANUAL)?
        .check()
        .map_err(|e| {
            CompositorError::init(format!("cannot redirect screen {} ({}); is another compositor running?", index, e))
        })?;

    let overlay = conn
        .composite_get_overlay_window(root.root)?
        .reply()
        .context("Failed to get the composite overlay window")?
        .overlay_win;
    clear_input_shape(conn, overlay)?;
    info!("Screen {}: overlay window 0x{:x}", index, overlay);

    let size = (root.width_in_pixels as u32, root.height_in_pixels as u32);
    let mirror = ScreenMirror::new(
        index,
        root.root,
        Geometry::new(0, 0, size.0, size.1, 0),
        atoms,
    );
    let loaded = registry.instantiate(&options.plugins, options.backend, index)?;

    let mut screen = match options.backend {
        BackendKind::OpenGl => {
            let plugins = PluginRegistry::texture_plugins(loaded)?;
            let backend = TextureBackend::new(
                conn.clone(),
                server.releaser(),
                &options.settings,
                index,
                root.root,
                overlay,
                size,
                atoms,
                &plugins,
            )?;
            AnyScreen::Texture(Screen::new(mirror, backend, plugins))
        }
        BackendKind::XRender => {
            let plugins = PluginRegistry::picture_plugins(loaded)?;
            let backend = PictureBackend::new(
                conn.clone(),
                server.releaser(),
                &options.settings,
                root.root,
                root.root_visual,
                root.root_depth,
                overlay,
                size,
                atoms,
            )?;
            AnyScreen::Picture(Screen::new(mirror, backend, plugins))
        }
        BackendKind::ServerAuto => {
            return Err(CompositorError::config("serverauto screens are not drawn").into());
        }
    };

    let rendering_window = match &screen {
        AnyScreen::Texture(s) => s.backend().rendering_window(),
        AnyScreen::Picture(s) => s.backend().rendering_window(),
    };
    clear_input_shape(conn, rendering_window)?;
    for id in [owner, overlay, rendering_window] {
        screen.ignore(id)?;
    }

    // Nothing may change between selecting events and reading the tree
    conn.grab_server()?;
    let started = select_root_events(conn.as_ref(), root.root).and_then(|()| screen.start(server));
    conn.ungrab_server()?;
    started?;
    Ok(screen)
}

fn select_root_events(conn: &RustConnection, root: u32) -> Result<()> {
    let mask = EventMask::EXPOSURE
        | EventMask::PROPERTY_CHANGE
        | EventMask::STRUCTURE_NOTIFY
        | EventMask::SUBSTRUCTURE_NOTIFY;
    conn.change_window_attributes(root, &ChangeWindowAttributesAux::new().event_mask(mask))?
        .check()
        .context("Failed to select root window events")?;
    Ok(())
}

impl Drop for Compositor {
    fn drop(&mut self) {
        // Back-ends release GL and X objects before the connection goes
        self.screens.clear();
        if let Err(e) = self.server.conn().flush() {
            error!("Failed to flush on shutdown: {}", e);
        }
    }
}
