//! Texture back-end
//!
//! Window pixmaps are bound as GL textures through texture-from-pixmap and
//! drawn as textured quads, one per tile. Pixmaps larger than the
//! device's texture limit are copied tile by tile into smaller pixmaps
//! first. Every GL object is held through a [`ResourceHandle`] so a plugin
//! can keep drawing a window's last frame after the window is gone.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, trace, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{AtomEnum, ConnectionExt, CreateGCAux};
use x11rb::rust_connection::RustConnection;

use super::gl_context::GlContext;
use super::partition::{Partition, partition};
use super::shaders::{POSITION_ATTRIB, ShaderProgram, TEXCOORD_ATTRIB};
use super::{Backend, BackendKind, BackendSettings, FrameStep, color_bytes, frame_steps};
use crate::compositor::atoms::Atoms;
use crate::compositor::mirror::ScreenMirror;
use crate::compositor::resource::{Resource, ResourceHandle, ResourceKind, ResourceReleaser};
use crate::compositor::window::WindowState;
use crate::plugin::{PluginSet, TexturePlugin};
use crate::shared::Rect;

/// Texture coordinates of the four quad corners: TL, TR, BL, BR.
const TEXCOORDS: [f32; 8] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
/// Same corners for textures whose first row sits at `t = 1`.
const FLIPPED_TEXCOORDS: [f32; 8] = [0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0];
/// The whole screen in clip space.
const FULLSCREEN: [f32; 8] = [-1.0, 1.0, 1.0, 1.0, -1.0, -1.0, 1.0, -1.0];
const QUAD_ELEMENTS: [u8; 4] = [0, 1, 2, 3];
const OUTLINE_ELEMENTS: [u8; 4] = [0, 1, 3, 2];

/// Clip-space corners of `rect` on a `screen_width` x `screen_height`
/// screen, in TL, TR, BL, BR order.
pub fn quad_positions(rect: Rect, screen_width: u32, screen_height: u32) -> [f32; 8] {
    let [left, top, right, bottom] = rect.to_clip_space(screen_width, screen_height);
    [left, top, right, top, left, bottom, right, bottom]
}

/// One byte per pixel, 255 inside any of `rects` and 0 elsewhere. Rows
/// run top-down unless `bottom_up`.
pub fn shape_bitmap(width: u32, height: u32, rects: &[Rect], bottom_up: bool) -> Vec<u8> {
    let mut bitmap = vec![0u8; width as usize * height as usize];
    let bounds = Rect::new(0, 0, width, height);
    for rect in rects.iter().filter_map(|r| r.intersection(&bounds)) {
        for y in rect.y..rect.bottom() as i32 {
            let row = (if bottom_up { height as i32 - 1 - y } else { y }) as usize;
            let start = row * width as usize + rect.x as usize;
            bitmap[start..start + rect.width as usize].fill(0xFF);
        }
    }
    bitmap
}

/// Deletes GL objects on the screen's context and hands X objects to
/// the connection's releaser.
pub struct GlReleaser {
    ctx: Rc<GlContext>,
    x: Rc<dyn ResourceReleaser>,
}

impl ResourceReleaser for GlReleaser {
    fn release(&self, kind: ResourceKind, id: u32) {
        match kind {
            ResourceKind::Texture | ResourceKind::Buffer => {
                if let Err(e) = self.ctx.make_current() {
                    debug!("Cannot release {:?} {}: {:#}", kind, id, e);
                    return;
                }
                trace!("Deleting GL {:?} {}", kind, id);
                unsafe {
                    if kind == ResourceKind::Texture {
                        gl::DeleteTextures(1, &id);
                    } else {
                        gl::DeleteBuffers(1, &id);
                    }
                }
            }
            ResourceKind::GlxPixmap => self.ctx.destroy_glx_pixmap(id),
            _ => self.x.release(kind, id),
        }
    }
}

/// A textured quad, as drawn by the back-end or requested by a plugin.
#[derive(Debug, Clone)]
pub struct GlRenderingJob {
    /// Four clip-space corners (TL, TR, BL, BR)
    pub primitive_positions: ResourceHandle,
    pub texture_coords: ResourceHandle,
    pub texture: ResourceHandle,
    pub shape_texture: ResourceHandle,
    /// GLX pixmap bound to `texture` while drawing
    pub binding: Option<ResourceHandle>,
    /// Pixmap the binding reads from
    pub source: Option<ResourceHandle>,
    pub alpha: f32,
}

/// One partition of a pixmap with its GL objects.
#[derive(Debug)]
pub struct TextureTile {
    pub partition: Partition,
    positions: ResourceHandle,
    texture_coords: ResourceHandle,
    texture: ResourceHandle,
    shape_texture: ResourceHandle,
    // Released before the pixmap it wraps
    glx_pixmap: Option<ResourceHandle>,
    pixmap: Option<ResourceHandle>,
}

impl TextureTile {
    fn job(&self, source: Option<&ResourceHandle>, alpha: f32) -> GlRenderingJob {
        GlRenderingJob {
            primitive_positions: self.positions.clone(),
            texture_coords: self.texture_coords.clone(),
            texture: self.texture.clone(),
            shape_texture: self.shape_texture.clone(),
            binding: self.glx_pixmap.clone(),
            source: self.pixmap.clone().or_else(|| source.cloned()),
            alpha,
        }
    }
}

/// What a surface must do to its tiles before the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileUpdate {
    Keep,
    /// Same textures, new position buffers
    Move,
    /// New pixmap, size or shape: rebind every tile
    Rebuild,
}

/// A window's textures.
#[derive(Debug)]
pub struct TextureSurface {
    pub id: u32,
    depth: u8,
    tiles: Vec<TextureTile>,
    source: Option<ResourceHandle>,
    placed_at: Option<Rect>,
}

impl TextureSurface {
    /// Surface for a mirrored window. Input-only windows have none.
    pub fn for_window(window: &WindowState) -> Option<Self> {
        window
            .is_input_output()
            .then(|| Self::new(window.id, window.depth))
    }

    fn new(id: u32, depth: u8) -> Self {
        Self {
            id,
            depth,
            tiles: Vec::new(),
            source: None,
            placed_at: None,
        }
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn tiles(&self) -> &[TextureTile] {
        &self.tiles
    }

    /// Where the tiles were last positioned, in root coordinates
    pub fn placed_at(&self) -> Option<Rect> {
        self.placed_at
    }

    /// Compare against the window's mirror. Nothing happens before the
    /// window has a content pixmap.
    pub fn pending_update(&self, window: &WindowState) -> TileUpdate {
        let Some(content) = window.content_pixmap() else {
            return TileUpdate::Keep;
        };
        let new_source = self.source.as_ref().is_none_or(|s| !Rc::ptr_eq(s, content));
        if new_source || window.is_resized() || window.clip_shape_changed() {
            TileUpdate::Rebuild
        } else if self.placed_at != Some(window.outer_rect()) {
            TileUpdate::Move
        } else {
            TileUpdate::Keep
        }
    }

    /// Jobs that redraw the window as it currently looks. They hold
    /// their own references and stay drawable after the window is gone.
    pub fn rendering_jobs(&self, alpha: f32) -> Vec<GlRenderingJob> {
        self.tiles.iter().map(|t| t.job(self.source.as_ref(), alpha)).collect()
    }
}

/// GL state shared by every surface of one screen.
struct GlShared {
    conn: Arc<RustConnection>,
    ctx: Rc<GlContext>,
    releaser: Rc<dyn ResourceReleaser>,
    max_texture_size: u32,
    texcoords: ResourceHandle,
    flipped_texcoords: ResourceHandle,
    blank: ResourceHandle,
}

fn gl_buffer<T: bytemuck::Pod>(releaser: &Rc<dyn ResourceReleaser>, target: u32, data: &[T]) -> ResourceHandle {
    let mut id = 0;
    let bytes: &[u8] = bytemuck::cast_slice(data);
    unsafe {
        gl::GenBuffers(1, &mut id);
        gl::BindBuffer(target, id);
        gl::BufferData(target, bytes.len() as isize, bytes.as_ptr() as *const _, gl::STATIC_DRAW);
        gl::BindBuffer(target, 0);
    }
    Resource::new(ResourceKind::Buffer, id, releaser.clone())
}

fn gl_texture(releaser: &Rc<dyn ResourceReleaser>) -> ResourceHandle {
    let mut id = 0;
    unsafe {
        gl::GenTextures(1, &mut id);
        gl::BindTexture(gl::TEXTURE_2D, id);
        gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as i32);
        gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
        gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
        gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);
        gl::BindTexture(gl::TEXTURE_2D, 0);
    }
    Resource::new(ResourceKind::Texture, id, releaser.clone())
}

/// A 1x1 texture of one colour.
fn gl_solid_texture(releaser: &Rc<dyn ResourceReleaser>, rgba: [u8; 4]) -> ResourceHandle {
    let texture = gl_texture(releaser);
    unsafe {
        gl::BindTexture(gl::TEXTURE_2D, texture.id());
        gl::TexImage2D(
            gl::TEXTURE_2D,
            0,
            gl::RGBA as i32,
            1,
            1,
            0,
            gl::RGBA,
            gl::UNSIGNED_BYTE,
            rgba.as_ptr() as *const _,
        );
        gl::BindTexture(gl::TEXTURE_2D, 0);
    }
    texture
}

impl GlShared {
    fn buffer<T: bytemuck::Pod>(&self, target: u32, data: &[T]) -> ResourceHandle {
        gl_buffer(&self.releaser, target, data)
    }

    fn rewrite_buffer(&self, buffer: &ResourceHandle, data: &[f32]) {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        unsafe {
            gl::BindBuffer(gl::ARRAY_BUFFER, buffer.id());
            gl::BufferData(gl::ARRAY_BUFFER, bytes.len() as isize, bytes.as_ptr() as *const _, gl::DYNAMIC_DRAW);
            gl::BindBuffer(gl::ARRAY_BUFFER, 0);
        }
    }

    fn texture(&self) -> ResourceHandle {
        gl_texture(&self.releaser)
    }

    fn shape_texture(&self, width: u32, height: u32, bitmap: &[u8]) -> ResourceHandle {
        let texture = self.texture();
        unsafe {
            gl::BindTexture(gl::TEXTURE_2D, texture.id());
            gl::PixelStorei(gl::UNPACK_ALIGNMENT, 1);
            gl::TexImage2D(
                gl::TEXTURE_2D,
                0,
                gl::R8 as i32,
                width as i32,
                height as i32,
                0,
                gl::RED,
                gl::UNSIGNED_BYTE,
                bitmap.as_ptr() as *const _,
            );
            gl::PixelStorei(gl::UNPACK_ALIGNMENT, 4);
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
        texture
    }

    /// Copy `part` of `pixmap` into a pixmap of its own.
    fn copy_partition(&self, pixmap: u32, depth: u8, part: &Partition, gc: u32) -> Result<ResourceHandle> {
        let copy = self.conn.generate_id()?;
        let rect = part.rect;
        self.conn
            .create_pixmap(depth, copy, pixmap, rect.width as u16, rect.height as u16)?;
        let copy = Resource::new(ResourceKind::Pixmap, copy, self.releaser.clone());
        self.conn.copy_area(
            pixmap,
            copy.id(),
            gc,
            rect.x as i16,
            rect.y as i16,
            0,
            0,
            rect.width as u16,
            rect.height as u16,
        )?;
        Ok(copy)
    }

    /// Tiles over a `width` x `height` pixmap placed at `origin` on a
    /// screen of `screen`. `shape` holds the visible rectangles relative
    /// to the pixmap; `None` means fully visible.
    #[allow(clippy::too_many_arguments)]
    fn tiles_for(
        &self,
        pixmap: u32,
        depth: u8,
        width: u32,
        height: u32,
        origin: (i32, i32),
        screen: (u32, u32),
        shape: Option<&[Rect]>,
    ) -> Result<Vec<TextureTile>> {
        let parts = partition(width, height, self.max_texture_size);
        let y_inverted = self.ctx.is_y_inverted(depth);
        let texcoords = if y_inverted { &self.texcoords } else { &self.flipped_texcoords };

        let copies = if parts.len() > 1 {
            debug!(
                "Pixmap 0x{:x} ({}x{}) exceeds texture limit {}, splitting into {} tiles",
                pixmap,
                width,
                height,
                self.max_texture_size,
                parts.len()
            );
            let gc = self.conn.generate_id()?;
            self.conn
                .create_gc(gc, pixmap, &CreateGCAux::new().graphics_exposures(0))?;
            let copies = parts
                .iter()
                .map(|part| self.copy_partition(pixmap, depth, part, gc))
                .collect::<Result<Vec<_>>>();
            self.conn.free_gc(gc)?;
            Some(copies?)
        } else {
            None
        };
        // The GLX connection must see the pixmaps created above
        self.conn.get_input_focus()?.reply()?;

        let mut tiles = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let pixmap_handle = copies.as_ref().map(|c| c[i].clone());
            let glx_target = pixmap_handle.as_ref().map_or(pixmap, |p| p.id());
            let glx_pixmap = self.ctx.create_glx_pixmap(glx_target, depth)?;
            let glx_pixmap = Resource::new(ResourceKind::GlxPixmap, glx_pixmap, self.releaser.clone());

            let shape_texture = match shape {
                None => self.blank.clone(),
                Some(rects) => {
                    let local: Vec<Rect> = rects.iter().map(|r| r.offset(-part.rect.x, -part.rect.y)).collect();
                    let bitmap = shape_bitmap(part.rect.width, part.rect.height, &local, !y_inverted);
                    self.shape_texture(part.rect.width, part.rect.height, &bitmap)
                }
            };

            let placed = part.rect.offset(origin.0, origin.1);
            tiles.push(TextureTile {
                partition: *part,
                positions: self.buffer(gl::ARRAY_BUFFER, &quad_positions(placed, screen.0, screen.1)),
                texture_coords: texcoords.clone(),
                texture: self.texture(),
                shape_texture,
                glx_pixmap: Some(glx_pixmap),
                pixmap: pixmap_handle,
            });
        }
        Ok(tiles)
    }

    /// New position buffers for tiles moved to `origin`.
    fn place_tiles(&self, tiles: &mut [TextureTile], origin: (i32, i32), screen: (u32, u32)) {
        for tile in tiles {
            let placed = tile.partition.rect.offset(origin.0, origin.1);
            // Fresh buffers: a plugin may still hold the old placement
            tile.positions = self.buffer(gl::ARRAY_BUFFER, &quad_positions(placed, screen.0, screen.1));
        }
    }
}

fn snippet_refs(snippets: &[(usize, String)]) -> Vec<(usize, &str)> {
    snippets.iter().map(|(i, s)| (*i, s.as_str())).collect()
}

/// Renders a screen through GLX.
pub struct TextureBackend {
    shared: GlShared,
    atoms: Atoms,
    root: u32,
    size: (u32, u32),
    program: ShaderProgram,
    vao: u32,
    quad_elements: ResourceHandle,
    outline_elements: ResourceHandle,
    background_fill: ResourceHandle,
    outline_texture: ResourceHandle,
    fullscreen: ResourceHandle,
    outline_positions: ResourceHandle,
    background: Vec<TextureTile>,
    root_pixmap_changed: bool,
    root_size_changed: bool,
    surfaces: HashMap<u32, TextureSurface>,
}

impl TextureBackend {
    /// Set up GLX on a rendering window inside `overlay` and compile the
    /// shader program with the snippets of `plugins`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: Arc<RustConnection>,
        x_releaser: Rc<dyn ResourceReleaser>,
        settings: &BackendSettings,
        screen_num: usize,
        root: u32,
        overlay: u32,
        size: (u32, u32),
        atoms: Atoms,
        plugins: &PluginSet<dyn TexturePlugin>,
    ) -> Result<Self> {
        let ctx = Rc::new(
            GlContext::new(settings.display.as_deref(), screen_num, overlay, size.0, size.1)
                .context("Failed to set up GLX")?,
        );
        let releaser: Rc<dyn ResourceReleaser> = Rc::new(GlReleaser {
            ctx: ctx.clone(),
            x: x_releaser,
        });

        let mut max_texture_size = 0;
        unsafe { gl::GetIntegerv(gl::MAX_TEXTURE_SIZE, &mut max_texture_size) };
        let max_texture_size = (max_texture_size.max(64)) as u32;
        info!("GL maximum texture size {}", max_texture_size);

        let vertex: Vec<(usize, String)> = plugins
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.vertex_shader().map(|s| (i, s)))
            .collect();
        let fragment: Vec<(usize, String)> = plugins
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.fragment_shader().map(|s| (i, s)))
            .collect();
        let program = ShaderProgram::build(&snippet_refs(&vertex), &snippet_refs(&fragment))?;

        let mut vao = 0;
        unsafe {
            gl::Enable(gl::BLEND);
            gl::BlendFunc(gl::SRC_ALPHA, gl::ONE_MINUS_SRC_ALPHA);
            gl::GenVertexArrays(1, &mut vao);
        }

        let shared = GlShared {
            texcoords: gl_buffer(&releaser, gl::ARRAY_BUFFER, &TEXCOORDS),
            flipped_texcoords: gl_buffer(&releaser, gl::ARRAY_BUFFER, &FLIPPED_TEXCOORDS),
            blank: gl_solid_texture(&releaser, [0xFF; 4]),
            conn,
            ctx,
            releaser,
            max_texture_size,
        };

        Ok(Self {
            quad_elements: shared.buffer(gl::ELEMENT_ARRAY_BUFFER, &QUAD_ELEMENTS),
            outline_elements: shared.buffer(gl::ELEMENT_ARRAY_BUFFER, &OUTLINE_ELEMENTS),
            background_fill: gl_solid_texture(&shared.releaser, color_bytes(settings.background_color)),
            outline_texture: gl_solid_texture(&shared.releaser, color_bytes(settings.outline_color)),
            fullscreen: shared.buffer(gl::ARRAY_BUFFER, &FULLSCREEN),
            outline_positions: shared.buffer(gl::ARRAY_BUFFER, &FULLSCREEN),
            shared,
            atoms,
            root,
            size,
            program,
            vao,
            background: Vec::new(),
            root_pixmap_changed: true,
            root_size_changed: false,
            surfaces: HashMap::new(),
        })
    }

    /// Window GLX draws into; must not be mirrored.
    pub fn rendering_window(&self) -> u32 {
        self.shared.ctx.rendering_window()
    }

    fn resize(&mut self, width: u32, height: u32) {
        debug!("Resizing GL rendering window to {}x{}", width, height);
        self.size = (width, height);
        self.shared.ctx.resize(width, height);
        for surface in self.surfaces.values_mut() {
            surface.placed_at = None;
        }
        self.root_pixmap_changed = true;
    }

    fn root_pixmap(&self) -> Result<Option<u32>> {
        let reply = self
            .shared
            .conn
            .get_property(false, self.root, self.atoms._XROOTPMAP_ID, AtomEnum::PIXMAP, 0, 1)?
            .reply()?;
        Ok(reply.value32().and_then(|mut v| v.next()).filter(|&p| p != x11rb::NONE))
    }

    /// Re-acquire the desktop background. Falls back to the configured
    /// colour when there is no usable root pixmap.
    fn refresh_background(&mut self) -> Result<()> {
        self.background.clear();
        let Some(pixmap) = self.root_pixmap()? else {
            debug!("No root pixmap, using background colour");
            return Ok(());
        };
        let geometry = match self.shared.conn.get_geometry(pixmap)?.reply() {
            Ok(g) => g,
            Err(e) => {
                debug!("Root pixmap 0x{:x} unusable: {}", pixmap, e);
                return Ok(());
            }
        };
        match self.shared.tiles_for(
            pixmap,
            geometry.depth,
            geometry.width as u32,
            geometry.height as u32,
            (0, 0),
            self.size,
            None,
        ) {
            Ok(tiles) => {
                debug!("Background 0x{:x} uploaded as {} tiles", pixmap, tiles.len());
                self.background = tiles;
            }
            Err(e) => warn!("Failed to bind root pixmap 0x{:x}: {:#}", pixmap, e),
        }
        Ok(())
    }

    /// Bring a window's tiles up to date with its mirror.
    fn sync_surface(&mut self, window: &WindowState) -> Result<()> {
        let Some(surface) = self.surfaces.get_mut(&window.id) else {
            return Ok(());
        };
        let Some(content) = window.content_pixmap() else {
            return Ok(());
        };
        let outer = window.outer_rect();
        let origin = (outer.x, outer.y);

        match surface.pending_update(window) {
            TileUpdate::Rebuild => {
                let shape = (!window.clip_shape().is_empty()).then(|| window.clip_shape());
                trace!("Rebuilding {} textures of window 0x{:x}", surface.tiles.len(), window.id);
                surface.tiles =
                    self.shared
                        .tiles_for(content.id(), window.depth, outer.width, outer.height, origin, self.size, shape)?;
                surface.source = Some(content.clone());
                surface.placed_at = Some(outer);
            }
            TileUpdate::Move => {
                self.shared.place_tiles(&mut surface.tiles, origin, self.size);
                surface.placed_at = Some(outer);
            }
            TileUpdate::Keep => {}
        }
        Ok(())
    }

    fn draw(&self, job: &GlRenderingJob, outline: bool) {
        let (elements, mode) = if outline {
            (&self.outline_elements, gl::LINE_LOOP)
        } else {
            (&self.quad_elements, gl::TRIANGLE_STRIP)
        };
        unsafe {
            gl::BindBuffer(gl::ARRAY_BUFFER, job.primitive_positions.id());
            gl::VertexAttribPointer(POSITION_ATTRIB, 2, gl::FLOAT, gl::FALSE, 0, std::ptr::null());
            gl::EnableVertexAttribArray(POSITION_ATTRIB);
            gl::BindBuffer(gl::ARRAY_BUFFER, job.texture_coords.id());
            gl::VertexAttribPointer(TEXCOORD_ATTRIB, 2, gl::FLOAT, gl::FALSE, 0, std::ptr::null());
            gl::EnableVertexAttribArray(TEXCOORD_ATTRIB);

            gl::ActiveTexture(gl::TEXTURE1);
            gl::BindTexture(gl::TEXTURE_2D, job.shape_texture.id());
            gl::ActiveTexture(gl::TEXTURE0);
            gl::BindTexture(gl::TEXTURE_2D, job.texture.id());
        }
        // Bound for the draw only; the pixmap keeps changing underneath
        if let Some(binding) = &job.binding {
            self.shared.ctx.bind_tex_image(binding.id());
        }
        unsafe {
            gl::BindBuffer(gl::ELEMENT_ARRAY_BUFFER, elements.id());
            gl::DrawElements(mode, 4, gl::UNSIGNED_BYTE, std::ptr::null());
        }
        if let Some(binding) = &job.binding {
            self.shared.ctx.release_tex_image(binding.id());
        }
    }

    fn solid_job(&self, positions: &ResourceHandle, texture: &ResourceHandle) -> GlRenderingJob {
        GlRenderingJob {
            primitive_positions: positions.clone(),
            texture_coords: self.shared.texcoords.clone(),
            texture: texture.clone(),
            shape_texture: self.shared.blank.clone(),
            binding: None,
            source: None,
            alpha: 1.0,
        }
    }

    fn draw_background(&self) {
        self.program.set_alpha(1.0);
        if self.background.is_empty() {
            self.draw(&self.solid_job(&self.fullscreen, &self.background_fill), false);
            return;
        }
        for tile in &self.background {
            self.draw(&tile.job(None, 1.0), false);
        }
    }
}

impl Backend for TextureBackend {
    type Surface = TextureSurface;
    type Plugin = dyn TexturePlugin;

    fn kind(&self) -> BackendKind {
        BackendKind::OpenGl
    }

    fn create_window_object(&mut self, window: &WindowState) -> Result<()> {
        if let Some(surface) = TextureSurface::for_window(window) {
            self.surfaces.insert(window.id, surface);
        }
        Ok(())
    }

    fn window_object(&self, id: u32) -> Option<&TextureSurface> {
        self.surfaces.get(&id)
    }

    fn release_window_object(&mut self, id: u32) {
        // GL names freed without a current context leak, the entry must go anyway
        if let Err(e) = self.shared.ctx.make_current() {
            warn!("Releasing textures of window 0x{:x} without a GL context: {:#}", id, e);
        }
        self.surfaces.remove(&id);
    }

    fn set_root_pixmap_changed(&mut self) {
        self.root_pixmap_changed = true;
    }

    fn set_root_window_size_changed(&mut self) {
        self.root_size_changed = true;
    }

    fn render_screen(&mut self, mirror: &ScreenMirror, plugins: &mut PluginSet<dyn TexturePlugin>) -> Result<()> {
        self.shared.ctx.make_current()?;

        if self.root_size_changed || mirror.root_size_changed() {
            let (width, height) = mirror.size();
            self.resize(width, height);
            self.root_size_changed = false;
        }
        if self.root_pixmap_changed || mirror.background_changed() {
            self.refresh_background()?;
            self.root_pixmap_changed = false;
        }

        for window in mirror.stacked().filter(|w| w.is_renderable()) {
            if let Err(e) = self.sync_surface(window) {
                warn!("Failed to update textures of window 0x{:x}: {:#}", window.id, e);
            }
        }

        let (width, height) = self.size;
        let program = &self.program;
        let surfaces = &self.surfaces;
        let steps = frame_steps(mirror, |id| surfaces.get(&id).is_some_and(|s| !s.tiles.is_empty()));

        let mut extra_jobs = 0;
        for step in steps {
            match step {
                FrameStep::Clear => {
                    unsafe {
                        gl::Viewport(0, 0, width as i32, height as i32);
                        gl::ClearColor(0.0, 0.0, 0.0, 1.0);
                        gl::Clear(gl::COLOR_BUFFER_BIT);
                        gl::BindVertexArray(self.vao);
                    }
                    program.use_program();
                }
                FrameStep::BackgroundPreRender => {
                    plugins.dispatch("background_pre_render", |p| p.background_pre_render(program))
                }
                FrameStep::Background => self.draw_background(),
                FrameStep::BackgroundPostRender => {
                    plugins.dispatch("background_post_render", |p| p.background_post_render(program))
                }
                FrameStep::WindowPreRender(id) => {
                    let (Some(window), Some(surface)) = (mirror.window(id), surfaces.get(&id)) else {
                        continue;
                    };
                    program.set_alpha(window.opacity() as f32 / 255.0);
                    plugins.dispatch("window_pre_render", |p| p.window_pre_render(window, surface, program));
                }
                FrameStep::Window(id) => {
                    let (Some(window), Some(surface)) = (mirror.window(id), surfaces.get(&id)) else {
                        continue;
                    };
                    for job in surface.rendering_jobs(window.opacity() as f32 / 255.0) {
                        self.draw(&job, false);
                    }
                }
                FrameStep::WindowPostRender(id) => {
                    let (Some(window), Some(surface)) = (mirror.window(id), surfaces.get(&id)) else {
                        continue;
                    };
                    plugins.dispatch("window_post_render", |p| p.window_post_render(window, surface, program));
                }
                FrameStep::RectPreRender(rect) => plugins.dispatch("rect_pre_render", |p| p.rect_pre_render(rect, program)),
                FrameStep::Outline(rect) => {
                    self.shared
                        .rewrite_buffer(&self.outline_positions, &quad_positions(rect, width, height));
                    program.set_alpha(1.0);
                    self.draw(&self.solid_job(&self.outline_positions, &self.outline_texture), true);
                }
                FrameStep::RectPostRender(rect) => {
                    plugins.dispatch("rect_post_render", |p| p.rect_post_render(rect, program))
                }
                FrameStep::ExtraJobs => {
                    let jobs = plugins.collect("extra_rendering_jobs", |p| p.extra_rendering_jobs());
                    for job in &jobs {
                        program.set_alpha(job.alpha);
                        self.draw(job, false);
                    }
                    extra_jobs = jobs.len();
                }
                FrameStep::Present => {
                    unsafe { gl::BindVertexArray(0) };
                    self.shared.ctx.present();
                }
            }
        }
        trace!("Screen frame drawn with {} extra jobs", extra_jobs);
        Ok(())
    }
}

impl Drop for TextureBackend {
    fn drop(&mut self) {
        if self.shared.ctx.make_current().is_ok() {
            unsafe { gl::DeleteVertexArrays(1, &self.vao) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::backend::partition::BorderFlags;
    use crate::compositor::resource::testing::RecordingReleaser;
    use crate::compositor::server::testing::FakeServer;
    use crate::compositor::window::{WindowClass, test_info};
    use crate::shared::Geometry;

    #[test]
    fn test_quad_positions_cover_screen_corners() {
        let full = quad_positions(Rect::new(0, 0, 1920, 1080), 1920, 1080);
        assert_eq!(full, FULLSCREEN);

        let quarter = quad_positions(Rect::new(960, 0, 960, 540), 1920, 1080);
        assert_eq!(quarter, [0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_shape_bitmap_marks_visible_pixels() {
        let bitmap = shape_bitmap(4, 3, &[Rect::new(1, 0, 2, 1), Rect::new(3, 2, 5, 5)], false);
        assert_eq!(
            bitmap,
            vec![
                0, 255, 255, 0, //
                0, 0, 0, 0, //
                0, 0, 0, 255,
            ]
        );
        let flipped = shape_bitmap(4, 3, &[Rect::new(1, 0, 2, 1)], true);
        assert_eq!(&flipped[8..], &[0, 255, 255, 0]);
        assert!(flipped[..8].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_shape_bitmap_ignores_offscreen_rects() {
        let bitmap = shape_bitmap(2, 2, &[Rect::new(-5, -5, 3, 3), Rect::new(2, 0, 4, 4)], false);
        assert!(bitmap.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_rendering_jobs_outlive_surface() {
        let releaser = Rc::new(RecordingReleaser::default());
        let handle = |kind, id| Resource::new(kind, id, releaser.clone());
        let texcoords = handle(ResourceKind::Buffer, 1);
        let mut surface = TextureSurface::new(10, 24);
        surface.source = Some(handle(ResourceKind::Pixmap, 0x400));
        surface.tiles.push(TextureTile {
            partition: Partition {
                rect: Rect::new(0, 0, 100, 100),
                borders: BorderFlags::all(),
            },
            positions: handle(ResourceKind::Buffer, 2),
            texture_coords: texcoords.clone(),
            texture: handle(ResourceKind::Texture, 3),
            shape_texture: handle(ResourceKind::Texture, 4),
            glx_pixmap: Some(handle(ResourceKind::GlxPixmap, 5)),
            pixmap: None,
        });

        let jobs = surface.rendering_jobs(0.5);
        drop(surface);
        assert!(releaser.released.borrow().is_empty());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].alpha, 0.5);
        assert_eq!(jobs[0].binding.as_ref().map(|b| b.id()), Some(5));
        assert_eq!(jobs[0].source.as_ref().map(|s| s.id()), Some(0x400));

        drop(jobs);
        let released = releaser.released.borrow();
        assert!(released.contains(&(ResourceKind::GlxPixmap, 5)));
        assert!(released.contains(&(ResourceKind::Pixmap, 0x400)));
        assert!(!released.contains(&(ResourceKind::Buffer, 1)));
    }

    /// A mapped window at 100x100 whose surface has caught up with it.
    fn synced(server: &FakeServer) -> (WindowState, TextureSurface) {
        let mut window = WindowState::create(server, 10).unwrap().unwrap();
        window.set_mapped();
        window.update_contents(server).unwrap();
        let mut surface = TextureSurface::for_window(&window).unwrap();
        surface.source = window.content_pixmap().cloned();
        surface.placed_at = Some(window.outer_rect());
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
        assert!(TextureSurface::for_window(&WindowState::new(7, info)).is_none());
        let surface = TextureSurface::for_window(&WindowState::new(8, test_info(0, 0, 10, 10))).unwrap();
        assert_eq!(surface.depth(), 24);
    }

    #[test]
    fn test_tile_update_decisions() {
        let mut server = server();
        let (mut window, surface) = synced(&server);
        assert_eq!(surface.pending_update(&window), TileUpdate::Keep);

        window.update_geometry(Geometry::new(30, 40, 100, 100, 0));
        assert_eq!(surface.pending_update(&window), TileUpdate::Move);

        window.set_clip_shape_changed();
        assert_eq!(surface.pending_update(&window), TileUpdate::Rebuild);
        window.finish_frame();

        let grown = Geometry::new(30, 40, 200, 100, 0);
        server.set_geometry(10, grown);
        window.update_geometry(grown);
        assert_eq!(surface.pending_update(&window), TileUpdate::Rebuild);
        window.update_contents(&server).unwrap();
        assert_eq!(window.clip_shape(), &[Rect::new(0, 0, 200, 100)]);
    }

    #[test]
    fn test_new_pixmap_rebuilds_tiles() {
        let server = server();
        let (mut window, surface) = synced(&server);
        window.add_damage();
        window.update_contents(&server).unwrap();
        window.finish_frame();
        assert_eq!(surface.pending_update(&window), TileUpdate::Rebuild);
    }

    #[test]
    fn test_no_update_before_contents() {
        let window = WindowState::new(10, test_info(0, 0, 100, 100));
        let surface = TextureSurface::for_window(&window).unwrap();
        assert_eq!(surface.pending_update(&window), TileUpdate::Keep);
    }
}
