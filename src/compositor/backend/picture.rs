//! Picture back-end
//!
//! Composites window pictures with the RENDER extension into a
//! back-buffer pixmap, then copies the back buffer onto a rendering
//! window inside the composite overlay. Opacity and clip shapes are
//! expressed through per-window A8 mask pictures.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, trace, warn};
use x11rb::connection::Connection;
use x11rb::protocol::render::{
    self, ConnectionExt as RenderExt, CreatePictureAux, PictOp, PictType, Pictformat, QueryPictFormatsReply, Repeat,
};
use x11rb::protocol::xproto::{
    AtomEnum, ConfigureWindowAux, ConnectionExt, CreateWindowAux, Rectangle, SubwindowMode, WindowClass as XWindowClass,
};
use x11rb::rust_connection::RustConnection;

use super::{Backend, BackendKind, BackendSettings, FrameStep, PictureFilter, color_channels, frame_steps};
use crate::compositor::atoms::Atoms;
use crate::compositor::mirror::ScreenMirror;
use crate::compositor::resource::{Resource, ResourceHandle, ResourceKind, ResourceReleaser, id_or_none};
use crate::compositor::window::{WindowState, mask_alpha};
use crate::error::CompositorError;
use crate::plugin::{PicturePlugin, PluginSet};
use crate::shared::Rect;

/// One composite request against the back buffer.
#[derive(Debug, Clone)]
pub struct XRenderJob {
    pub operation: PictOp,
    pub source: ResourceHandle,
    pub mask: Option<ResourceHandle>,
    pub src_x: i16,
    pub src_y: i16,
    pub mask_x: i16,
    pub mask_y: i16,
    pub dst_x: i16,
    pub dst_y: i16,
    pub width: u16,
    pub height: u16,
}

impl XRenderJob {
    /// `source` (masked by `mask`) composited OVER at `rect`.
    pub fn over(source: ResourceHandle, mask: Option<ResourceHandle>, rect: Rect) -> Self {
        Self {
            operation: PictOp::OVER,
            source,
            mask,
            src_x: 0,
            src_y: 0,
            mask_x: 0,
            mask_y: 0,
            dst_x: rect.x as i16,
            dst_y: rect.y as i16,
            width: rect.width.min(u16::MAX as u32) as u16,
            height: rect.height.min(u16::MAX as u32) as u16,
        }
    }
}

/// What a window mask must contain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MaskSpec {
    pub width: u32,
    pub height: u32,
    /// 16-bit alpha inside `rects`; zero elsewhere
    pub alpha: u16,
    pub rects: Vec<Rect>,
}

impl MaskSpec {
    pub fn for_window(window: &WindowState) -> Self {
        Self {
            width: window.geometry.outer_width(),
            height: window.geometry.outer_height(),
            alpha: mask_alpha(window.opacity()),
            rects: window.effective_clip_shape(),
        }
    }

    pub fn with_alpha(&self, alpha: u16) -> Self {
        Self { alpha, ..self.clone() }
    }
}

/// The four one-pixel edges of `rect`: top, bottom, left, right.
pub fn outline_rects(rect: Rect) -> [Rect; 4] {
    let right = rect.x + rect.width.saturating_sub(1) as i32;
    let bottom = rect.y + rect.height.saturating_sub(1) as i32;
    [
        Rect::new(rect.x, rect.y, rect.width, 1),
        Rect::new(rect.x, bottom, rect.width, 1),
        Rect::new(rect.x, rect.y, 1, rect.height),
        Rect::new(right, rect.y, 1, rect.height),
    ]
}

fn to_rectangle(rect: &Rect) -> Rectangle {
    Rectangle {
        x: rect.x as i16,
        y: rect.y as i16,
        width: rect.width.min(u16::MAX as u32) as u16,
        height: rect.height.min(u16::MAX as u32) as u16,
    }
}

fn render_color(rgb: u32, alpha: u16) -> render::Color {
    let (red, green, blue) = color_channels(rgb);
    render::Color { red, green, blue, alpha }
}

/// What a surface must rebuild before the next frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PictureUpdate {
    /// The window has a new content pixmap
    pub content: bool,
    /// The mask to build, when opacity, shape or size changed
    pub mask: Option<MaskSpec>,
}

/// A window's pictures.
#[derive(Debug)]
pub struct PictureSurface {
    pub id: u32,
    content: Option<ResourceHandle>,
    content_pixmap: Option<ResourceHandle>,
    mask: Option<ResourceHandle>,
    mask_spec: Option<MaskSpec>,
    placed_at: Rect,
}

impl PictureSurface {
    /// Surface for a mirrored window. Input-only windows have none.
    pub fn for_window(window: &WindowState) -> Option<Self> {
        window
            .is_input_output()
            .then(|| Self::new(window.id, window.outer_rect()))
    }

    fn new(id: u32, placed_at: Rect) -> Self {
        Self {
            id,
            content: None,
            content_pixmap: None,
            mask: None,
            mask_spec: None,
            placed_at,
        }
    }

    pub fn content(&self) -> Option<&ResourceHandle> {
        self.content.as_ref()
    }

    pub fn mask(&self) -> Option<&ResourceHandle> {
        self.mask.as_ref()
    }

    pub fn mask_spec(&self) -> Option<&MaskSpec> {
        self.mask_spec.as_ref()
    }

    /// Outer rectangle the pictures were last built for
    pub fn placed_at(&self) -> Rect {
        self.placed_at
    }

    /// Compare against the window's mirror. Nothing is rebuilt before the
    /// window has a content pixmap.
    pub fn pending_update(&self, window: &WindowState) -> PictureUpdate {
        let Some(content) = window.content_pixmap() else {
            return PictureUpdate::default();
        };
        let spec = MaskSpec::for_window(window);
        PictureUpdate {
            content: self.content_pixmap.as_ref().is_none_or(|p| !Rc::ptr_eq(p, content)),
            mask: (self.mask_spec.as_ref() != Some(&spec)).then_some(spec),
        }
    }

    /// The window's own OVER job, if it has contents.
    pub fn job(&self) -> Option<XRenderJob> {
        let content = self.content.clone()?;
        Some(XRenderJob::over(content, self.mask.clone(), self.placed_at))
    }
}

fn new_picture(
    conn: &RustConnection,
    releaser: &Rc<dyn ResourceReleaser>,
    drawable: u32,
    format: Pictformat,
    aux: &CreatePictureAux,
) -> Result<ResourceHandle> {
    let picture = conn.generate_id()?;
    conn.render_create_picture(picture, drawable, format, aux)?;
    Ok(Resource::new(ResourceKind::Picture, picture, releaser.clone()))
}

fn new_pixmap(
    conn: &RustConnection,
    releaser: &Rc<dyn ResourceReleaser>,
    depth: u8,
    drawable: u32,
    width: u32,
    height: u32,
) -> Result<ResourceHandle> {
    let pixmap = conn.generate_id()?;
    conn.create_pixmap(depth, pixmap, drawable, width.max(1) as u16, height.max(1) as u16)?;
    Ok(Resource::new(ResourceKind::Pixmap, pixmap, releaser.clone()))
}

/// Picture helpers handed to plugins.
pub struct PictureOps {
    conn: Arc<RustConnection>,
    root: u32,
    releaser: Rc<dyn ResourceReleaser>,
    formats: QueryPictFormatsReply,
    a8_format: Pictformat,
    back_buffer: ResourceHandle,
}

impl PictureOps {
    pub fn conn(&self) -> &Arc<RustConnection> {
        &self.conn
    }

    /// Picture the frame is assembled in.
    pub fn back_buffer(&self) -> u32 {
        self.back_buffer.id()
    }

    /// Picture format matching a visual on any screen
    pub fn format_for_visual(&self, visual: u32) -> Option<Pictformat> {
        format_for_visual(&self.formats, visual)
    }

    pub fn picture(&self, drawable: u32, format: Pictformat, aux: &CreatePictureAux) -> Result<ResourceHandle> {
        new_picture(&self.conn, &self.releaser, drawable, format, aux)
    }

    pub fn pixmap(&self, depth: u8, width: u32, height: u32) -> Result<ResourceHandle> {
        new_pixmap(&self.conn, &self.releaser, depth, self.root, width, height)
    }

    /// Build an A8 mask: `spec.alpha` inside its rectangles, zero elsewhere.
    pub fn create_mask(&self, spec: &MaskSpec) -> Result<ResourceHandle> {
        let pixmap = self.pixmap(8, spec.width, spec.height)?;
        let mask = self.picture(pixmap.id(), self.a8_format, &CreatePictureAux::new())?;
        let clear = Rectangle {
            x: 0,
            y: 0,
            width: spec.width.max(1) as u16,
            height: spec.height.max(1) as u16,
        };
        let transparent = render::Color { red: 0, green: 0, blue: 0, alpha: 0 };
        self.conn
            .render_fill_rectangles(PictOp::SRC, mask.id(), transparent, &[clear])?;
        if spec.alpha > 0 && !spec.rects.is_empty() {
            let rects: Vec<Rectangle> = spec.rects.iter().map(to_rectangle).collect();
            let alpha = render::Color { red: 0, green: 0, blue: 0, alpha: spec.alpha };
            self.conn.render_fill_rectangles(PictOp::SRC, mask.id(), alpha, &rects)?;
        }
        // The picture keeps the pixmap alive server-side
        drop(pixmap);
        Ok(mask)
    }

    /// Composite `job` onto the back buffer.
    pub fn execute(&self, job: &XRenderJob) -> Result<()> {
        self.conn.render_composite(
            job.operation,
            job.source.id(),
            id_or_none(job.mask.as_ref()),
            self.back_buffer.id(),
            job.src_x,
            job.src_y,
            job.mask_x,
            job.mask_y,
            job.dst_x,
            job.dst_y,
            job.width,
            job.height,
        )?;
        Ok(())
    }
}

fn run_jobs(ops: &PictureOps, jobs: &[XRenderJob]) -> Result<()> {
    for job in jobs {
        ops.execute(job)?;
    }
    Ok(())
}

fn format_for_visual(formats: &QueryPictFormatsReply, visual: u32) -> Option<Pictformat> {
    formats
        .screens
        .iter()
        .flat_map(|s| &s.depths)
        .flat_map(|d| &d.visuals)
        .find(|v| v.visual == visual)
        .map(|v| v.format)
}

fn find_a8_format(formats: &QueryPictFormatsReply) -> Option<Pictformat> {
    formats
        .formats
        .iter()
        .find(|f| f.type_ == PictType::DIRECT && f.depth == 8 && f.direct.alpha_mask == 0xFF)
        .map(|f| f.id)
}

/// Renders a screen through RENDER.
pub struct PictureBackend {
    ops: PictureOps,
    atoms: Atoms,
    size: (u32, u32),
    root_depth: u8,
    root_format: Pictformat,
    window: u32,
    window_picture: ResourceHandle,
    back_pixmap: ResourceHandle,
    filter: PictureFilter,
    background_color: u32,
    outline_color: u32,
    background: Option<ResourceHandle>,
    root_pixmap_changed: bool,
    root_size_changed: bool,
    surfaces: HashMap<u32, PictureSurface>,
}

impl PictureBackend {
    /// Create the rendering window inside `overlay` and a root-sized
    /// back buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: Arc<RustConnection>,
        releaser: Rc<dyn ResourceReleaser>,
        settings: &BackendSettings,
        root: u32,
        root_visual: u32,
        root_depth: u8,
        overlay: u32,
        size: (u32, u32),
        atoms: Atoms,
    ) -> Result<Self> {
        let formats = conn
            .render_query_pict_formats()?
            .reply()
            .context("Failed to query picture formats")?;
        let a8_format = find_a8_format(&formats).ok_or_else(|| CompositorError::init("no A8 picture format"))?;

        let window = conn.generate_id()?;
        conn.create_window(
            root_depth,
            window,
            overlay,
            0,
            0,
            size.0.max(1) as u16,
            size.1.max(1) as u16,
            0,
            XWindowClass::INPUT_OUTPUT,
            root_visual,
            &CreateWindowAux::new().background_pixel(0).border_pixel(0),
        )?;
        conn.map_window(window)?;
        debug!("Created XRender rendering window 0x{:x}", window);

        let root_format = format_for_visual(&formats, root_visual)
            .ok_or_else(|| CompositorError::init(format!("no picture format for root visual 0x{:x}", root_visual)))?;
        let window_picture = new_picture(
            &conn,
            &releaser,
            window,
            root_format,
            &CreatePictureAux::new().subwindowmode(SubwindowMode::INCLUDE_INFERIORS),
        )?;
        let back_pixmap = new_pixmap(&conn, &releaser, root_depth, root, size.0, size.1)?;
        let back_buffer = new_picture(&conn, &releaser, back_pixmap.id(), root_format, &CreatePictureAux::new())?;
        let ops = PictureOps {
            conn,
            root,
            releaser,
            formats,
            a8_format,
            back_buffer,
        };

        Ok(Self {
            ops,
            atoms,
            size,
            root_depth,
            root_format,
            window,
            window_picture,
            back_pixmap,
            filter: settings.picture_filter,
            background_color: settings.background_color,
            outline_color: settings.outline_color,
            background: None,
            root_pixmap_changed: true,
            root_size_changed: false,
            surfaces: HashMap::new(),
        })
    }

    /// Window the frames are copied to; must not be mirrored.
    pub fn rendering_window(&self) -> u32 {
        self.window
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        debug!("Resizing XRender back buffer to {}x{}", width, height);
        self.size = (width, height);
        self.ops.conn.configure_window(
            self.window,
            &ConfigureWindowAux::new().width(width.max(1)).height(height.max(1)),
        )?;
        self.back_pixmap = self.ops.pixmap(self.root_depth, width, height)?;
        self.ops.back_buffer = self
            .ops
            .picture(self.back_pixmap.id(), self.root_format, &CreatePictureAux::new())?;
        self.root_pixmap_changed = true;
        Ok(())
    }

    /// Re-acquire the root pixmap as a repeating picture.
    fn refresh_background(&mut self) -> Result<()> {
        self.background = None;
        let reply = self
            .ops
            .conn
            .get_property(false, self.ops.root, self.atoms._XROOTPMAP_ID, AtomEnum::PIXMAP, 0, 1)?
            .reply()?;
        let Some(pixmap) = reply.value32().and_then(|mut v| v.next()).filter(|&p| p != x11rb::NONE) else {
            debug!("No root pixmap, using background colour");
            return Ok(());
        };
        let depth = match self.ops.conn.get_geometry(pixmap)?.reply() {
            Ok(geometry) => geometry.depth,
            Err(e) => {
                debug!("Root pixmap 0x{:x} unusable: {}", pixmap, e);
                return Ok(());
            }
        };
        if depth != self.root_depth {
            warn!("Root pixmap 0x{:x} has depth {}, expected {}", pixmap, depth, self.root_depth);
            return Ok(());
        }
        let picture = self
            .ops
            .picture(pixmap, self.root_format, &CreatePictureAux::new().repeat(Repeat::NORMAL))?;
        debug!("Background picture 0x{:x} over root pixmap 0x{:x}", picture.id(), pixmap);
        self.background = Some(picture);
        Ok(())
    }

    /// Rebuild a window's content picture after its pixmap changed, and
    /// its mask after opacity, shape or size changed.
    fn sync_surface(&mut self, window: &WindowState) -> Result<()> {
        let Some(surface) = self.surfaces.get_mut(&window.id) else {
            return Ok(());
        };
        let Some(content) = window.content_pixmap() else {
            return Ok(());
        };
        let update = surface.pending_update(window);

        if update.content {
            let format = self
                .ops
                .format_for_visual(window.visual)
                .with_context(|| format!("no picture format for visual 0x{:x}", window.visual))?;
            let picture = self.ops.picture(content.id(), format, &CreatePictureAux::new())?;
            self.ops
                .conn
                .render_set_picture_filter(picture.id(), self.filter.name().as_bytes(), &[])?;
            trace!("Window 0x{:x} content picture 0x{:x}", window.id, picture.id());
            surface.content = Some(picture);
            surface.content_pixmap = Some(content.clone());
        }

        if let Some(spec) = update.mask {
            trace!("Window 0x{:x} mask alpha 0x{:04x}", window.id, spec.alpha);
            surface.mask = Some(self.ops.create_mask(&spec)?);
            surface.mask_spec = Some(spec);
        }
        surface.placed_at = window.outer_rect();
        Ok(())
    }

    fn fill(&self, rgb: u32, op: PictOp, rects: &[Rect]) -> Result<()> {
        let rects: Vec<Rectangle> = rects.iter().map(to_rectangle).collect();
        self.ops
            .conn
            .render_fill_rectangles(op, self.ops.back_buffer(), render_color(rgb, 0xFFFF), &rects)?;
        Ok(())
    }
}

impl Backend for PictureBackend {
    type Surface = PictureSurface;
    type Plugin = dyn PicturePlugin;

    fn kind(&self) -> BackendKind {
        BackendKind::XRender
    }

    fn create_window_object(&mut self, window: &WindowState) -> Result<()> {
        if let Some(surface) = PictureSurface::for_window(window) {
            self.surfaces.insert(window.id, surface);
        }
        Ok(())
    }

    fn window_object(&self, id: u32) -> Option<&PictureSurface> {
        self.surfaces.get(&id)
    }

    fn release_window_object(&mut self, id: u32) {
        self.surfaces.remove(&id);
    }

    fn set_root_pixmap_changed(&mut self) {
        self.root_pixmap_changed = true;
    }

    fn set_root_window_size_changed(&mut self) {
        self.root_size_changed = true;
    }

    fn render_screen(&mut self, mirror: &ScreenMirror, plugins: &mut PluginSet<dyn PicturePlugin>) -> Result<()> {
        if self.root_size_changed || mirror.root_size_changed() {
            let (width, height) = mirror.size();
            self.resize(width, height)?;
            self.root_size_changed = false;
        }
        if self.root_pixmap_changed || mirror.background_changed() {
            self.refresh_background()?;
            self.root_pixmap_changed = false;
        }
        for window in mirror.stacked().filter(|w| w.is_renderable()) {
            if let Err(e) = self.sync_surface(window) {
                warn!("Failed to update pictures of window 0x{:x}: {:#}", window.id, e);
            }
        }

        let (width, height) = self.size;
        let screen = Rect::new(0, 0, width, height);
        let ops = &self.ops;
        let surfaces = &self.surfaces;
        let steps = frame_steps(mirror, |id| surfaces.get(&id).is_some_and(|s| s.content().is_some()));

        // Job of the window being drawn, as left by its pre-render hooks
        let mut window_job = None;
        let mut extra_jobs = 0;
        for step in steps {
            match step {
                FrameStep::Clear => self.fill(0, PictOp::SRC, &[screen])?,
                FrameStep::BackgroundPreRender => {
                    run_jobs(ops, &plugins.collect("background_pre_render", |p| p.background_pre_render(ops)))?
                }
                FrameStep::Background => match &self.background {
                    Some(background) => ops.execute(&XRenderJob {
                        operation: PictOp::SRC,
                        ..XRenderJob::over(background.clone(), None, screen)
                    })?,
                    None => self.fill(self.background_color, PictOp::SRC, &[screen])?,
                },
                FrameStep::BackgroundPostRender => {
                    run_jobs(ops, &plugins.collect("background_post_render", |p| p.background_post_render(ops)))?
                }
                FrameStep::WindowPreRender(id) => {
                    let (Some(window), Some(surface)) = (mirror.window(id), surfaces.get(&id)) else {
                        continue;
                    };
                    let Some(mut job) = surface.job() else {
                        continue;
                    };
                    let pre = plugins.collect("window_pre_render", |p| p.window_pre_render(window, surface, ops, &mut job));
                    run_jobs(ops, &pre)?;
                    window_job = Some(job);
                }
                FrameStep::Window(_) => {
                    if let Some(job) = window_job.take() {
                        ops.execute(&job)?;
                    }
                }
                FrameStep::WindowPostRender(id) => {
                    let (Some(window), Some(surface)) = (mirror.window(id), surfaces.get(&id)) else {
                        continue;
                    };
                    run_jobs(ops, &plugins.collect("window_post_render", |p| p.window_post_render(window, surface, ops)))?;
                }
                FrameStep::RectPreRender(rect) => {
                    run_jobs(ops, &plugins.collect("rect_pre_render", |p| p.rect_pre_render(rect, ops)))?
                }
                FrameStep::Outline(rect) => self.fill(self.outline_color, PictOp::OVER, &outline_rects(rect))?,
                FrameStep::RectPostRender(rect) => {
                    run_jobs(ops, &plugins.collect("rect_post_render", |p| p.rect_post_render(rect, ops)))?
                }
                FrameStep::ExtraJobs => {
                    let extra = plugins.collect("extra_rendering_jobs", |p| p.extra_rendering_jobs(ops));
                    extra_jobs = extra.len();
                    run_jobs(ops, &extra)?;
                }
                FrameStep::Present => {
                    ops.conn.render_composite(
                        PictOp::SRC,
                        ops.back_buffer(),
                        x11rb::NONE,
                        self.window_picture.id(),
                        0,
                        0,
                        0,
                        0,
                        0,
                        0,
                        width.min(u16::MAX as u32) as u16,
                        height.min(u16::MAX as u32) as u16,
                    )?;
                }
            }
        }
        trace!("Screen frame composited with {} extra jobs", extra_jobs);
        Ok(())
    }
}

impl Drop for PictureBackend {
    fn drop(&mut self) {
        if let Err(e) = self.ops.conn.destroy_window(self.window).map(|c| c.ignore_error()) {
            debug!("Failed to destroy rendering window: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::resource::testing::RecordingReleaser;
    use crate::compositor::server::testing::FakeServer;
    use crate::compositor::window::{OPAQUE, WindowClass, test_info};
    use crate::shared::Geometry;

    fn window(opacity: u8) -> WindowState {
        let mut window = WindowState::new(10, test_info(10, 10, 400, 300));
        window.set_opacity(opacity);
        window
    }

    #[test]
    fn test_half_opacity_mask() {
        let spec = MaskSpec::for_window(&window(128));
        assert_eq!(spec.alpha, 0x8080);
        assert_eq!((spec.width, spec.height), (400, 300));
        assert_eq!(spec.rects, vec![Rect::new(0, 0, 400, 300)]);
    }

    #[test]
    fn test_mask_tracks_opacity_extremes() {
        let transparent = MaskSpec::for_window(&window(0));
        let opaque = MaskSpec::for_window(&window(OPAQUE));
        assert_eq!(transparent.alpha, 0);
        assert_eq!(opaque.alpha, 0xFFFF);
        assert_ne!(transparent, opaque);
        assert_eq!(transparent.with_alpha(0xFFFF), opaque);
    }

    #[test]
    fn test_outline_edges() {
        let edges = outline_rects(Rect::new(100, 50, 200, 80));
        assert_eq!(
            edges,
            [
                Rect::new(100, 50, 200, 1),
                Rect::new(100, 129, 200, 1),
                Rect::new(100, 50, 1, 80),
                Rect::new(299, 50, 1, 80),
            ]
        );
    }

    #[test]
    fn test_surface_job_composites_over_at_window_position() {
        let releaser = Rc::new(RecordingReleaser::default());
        let mut surface = PictureSurface::new(10, Rect::new(10, 20, 400, 300));
        assert!(surface.job().is_none());

        surface.content = Some(Resource::new(ResourceKind::Picture, 0x500, releaser.clone()));
        surface.mask = Some(Resource::new(ResourceKind::Picture, 0x501, releaser.clone()));
        let job = surface.job().unwrap();
        assert_eq!(job.operation, PictOp::OVER);
        assert_eq!(job.source.id(), 0x500);
        assert_eq!(job.mask.as_ref().map(|m| m.id()), Some(0x501));
        assert_eq!((job.dst_x, job.dst_y, job.width, job.height), (10, 20, 400, 300));

        // A plugin holding the job keeps the pictures alive
        drop(surface);
        assert!(releaser.released.borrow().is_empty());
        drop(job);
        assert_eq!(releaser.released.borrow().len(), 2);
    }

    /// A mapped window with fresh contents and a surface that has caught up.
    fn synced(server: &FakeServer) -> (WindowState, PictureSurface) {
        let mut window = WindowState::create(server, 10).unwrap().unwrap();
        window.set_mapped();
        window.update_contents(server).unwrap();
        let mut surface = PictureSurface::for_window(&window).unwrap();
        surface.content_pixmap = window.content_pixmap().cloned();
        surface.mask_spec = Some(MaskSpec::for_window(&window));
        window.finish_frame();
        (window, surface)
    }

    fn server() -> FakeServer {
        let mut server = FakeServer::new();
        server.add_window(10, test_info(0, 0, 100, 100));
        server
    }

    #[test]
    fn test_input_only_window_gets_no_surface() {
        let mut info = test_info(0, 0, 10, 10);
        info.class = WindowClass::InputOnly;
        assert!(PictureSurface::for_window(&WindowState::new(7, info)).is_none());
        assert!(PictureSurface::for_window(&window(OPAQUE)).is_some());
    }

    #[test]
    fn test_nothing_pending_before_contents() {
        let surface = PictureSurface::new(10, Rect::new(10, 10, 400, 300));
        assert_eq!(surface.pending_update(&window(OPAQUE)), PictureUpdate::default());
    }

    #[test]
    fn test_synced_surface_has_nothing_pending() {
        let server = server();
        let (window, surface) = synced(&server);
        assert_eq!(surface.pending_update(&window), PictureUpdate::default());
    }

    #[test]
    fn test_damage_rebuilds_content_but_not_mask() {
        let server = server();
        let (mut window, surface) = synced(&server);
        window.add_damage();
        window.update_contents(&server).unwrap();
        let update = surface.pending_update(&window);
        assert!(update.content);
        assert_eq!(update.mask, None);
    }

    #[test]
    fn test_opacity_rebuilds_mask_only() {
        let server = server();
        let (mut window, surface) = synced(&server);
        window.set_opacity(0);
        let update = surface.pending_update(&window);
        assert!(!update.content);
        assert_eq!(update.mask.map(|m| m.alpha), Some(0));
    }

    #[test]
    fn test_resize_rebuilds_mask_covering_new_size() {
        let mut server = server();
        let (mut window, surface) = synced(&server);
        let grown = Geometry::new(0, 0, 200, 150, 0);
        server.set_geometry(10, grown);
        assert!(window.update_geometry(grown));
        window.update_contents(&server).unwrap();

        let update = surface.pending_update(&window);
        assert!(update.content);
        let mask = update.mask.unwrap();
        assert_eq!((mask.width, mask.height), (200, 150));
        assert_eq!(mask.rects, vec![Rect::new(0, 0, 200, 150)]);
    }

    #[test]
    fn test_shape_change_rebuilds_mask() {
        let mut server = server();
        let (mut window, surface) = synced(&server);
        server.set_shape(10, vec![Rect::new(0, 0, 50, 100)]);
        window.set_clip_shape_changed();
        window.update_contents(&server).unwrap();
        let mask = surface.pending_update(&window).mask.unwrap();
        assert_eq!(mask.rects, vec![Rect::new(0, 0, 50, 100)]);
    }
}
