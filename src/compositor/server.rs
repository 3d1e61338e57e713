//! Display-server seam
//!
//! Every request the mirror issues goes through [`ServerOps`]. Requests on
//! windows that may vanish at any moment map BadWindow / BadDrawable /
//! BadPixmap / BadMatch to `Ok(None)` instead of an error.

use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, trace};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::ReplyError;
use x11rb::protocol::composite::ConnectionExt as CompositeExt;
use x11rb::protocol::damage::{self, ConnectionExt as DamageExt};
use x11rb::protocol::randr::{self, ConnectionExt as RandrExt};
use x11rb::protocol::render::ConnectionExt as RenderExt;
use x11rb::protocol::shape::{ConnectionExt as ShapeExt, SK};
use x11rb::protocol::xproto::{
    self, AtomEnum, ChangeWindowAttributesAux, ConnectionExt as XprotoExt, EventMask, MapState,
};
use x11rb::protocol::ErrorKind;
use x11rb::rust_connection::RustConnection;

use super::atoms::Atoms;
use super::resource::{Resource, ResourceHandle, ResourceKind, ResourceReleaser};
use super::window::{WindowClass, WindowInfo};
use crate::error::{XErrorSeverity, classify_error_kind};
use crate::shared::{Geometry, Rect};

/// Requests the mirror makes of the display server.
pub trait ServerOps {
    /// Geometry, class, visual, map state, parent and raw opacity of a window.
    fn query_window(&self, window: u32) -> Result<Option<WindowInfo>>;

    /// Select property and shape events on `window` and create a
    /// NON_EMPTY damage object for it.
    fn watch_window(&self, window: u32) -> Result<Option<ResourceHandle>>;

    /// 32-bit values of a property; `None` when unset or not 32-bit.
    fn read_cardinals(&self, window: u32, atom: u32) -> Result<Option<Vec<u32>>>;

    fn parent_of(&self, window: u32) -> Result<Option<u32>>;

    /// Children of `window`, bottom-to-top.
    fn children_of(&self, window: u32) -> Result<Vec<u32>>;

    /// Output head rectangles for the screen rooted at `root`.
    fn output_heads(&self, root: u32) -> Result<Vec<Rect>>;

    /// The window's current offscreen pixmap.
    fn name_window_pixmap(&self, window: u32) -> Result<Option<ResourceHandle>>;

    /// Bounding-shape rectangles relative to the window's inner origin.
    fn clip_shape(&self, window: u32) -> Result<Option<Vec<Rect>>>;

    /// Re-arm a damage object after its window was repainted.
    fn acknowledge_damage(&self, damage: &ResourceHandle);
}

fn is_vanished(kind: ErrorKind) -> bool {
    kind == ErrorKind::Match || classify_error_kind(kind) == XErrorSeverity::Transient
}

/// Turn a vanished-resource error into `None`.
fn vanished<T>(window: u32, result: Result<T, ReplyError>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ReplyError::X11Error(e)) if is_vanished(e.error_kind) => {
            debug!("Window 0x{:x} gone: {:?}", window, e.error_kind);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Frees server-side objects created through the x11rb connection.
pub struct X11Releaser {
    conn: Arc<RustConnection>,
}

impl X11Releaser {
    pub fn new(conn: Arc<RustConnection>) -> Rc<Self> {
        Rc::new(Self { conn })
    }
}

impl ResourceReleaser for X11Releaser {
    fn release(&self, kind: ResourceKind, id: u32) {
        trace!("Releasing {:?} 0x{:x}", kind, id);
        // Release errors are irrelevant: the owner may already be gone
        let sent = match kind {
            ResourceKind::Pixmap => self.conn.free_pixmap(id).map(|c| c.ignore_error()),
            ResourceKind::Picture => self.conn.render_free_picture(id).map(|c| c.ignore_error()),
            ResourceKind::Damage => self.conn.damage_destroy(id).map(|c| c.ignore_error()),
            other => {
                debug!("X releaser asked to free {:?} 0x{:x}", other, id);
                Ok(())
            }
        };
        if let Err(e) = sent {
            debug!("Failed to release {:?} 0x{:x}: {}", kind, id, e);
        }
    }
}

/// [`ServerOps`] over a live connection.
pub struct X11Server {
    conn: Arc<RustConnection>,
    atoms: Atoms,
    releaser: Rc<X11Releaser>,
    has_randr: bool,
}

impl X11Server {
    pub fn new(conn: Arc<RustConnection>, atoms: Atoms) -> Result<Self> {
        let has_randr = conn
            .extension_information(randr::X11_EXTENSION_NAME)?
            .is_some();
        if has_randr {
            conn.randr_query_version(1, 3)?
                .reply()
                .context("Failed to query RandR version")?;
        }
        Ok(Self {
            releaser: X11Releaser::new(conn.clone()),
            conn,
            atoms,
            has_randr,
        })
    }

    pub fn conn(&self) -> &Arc<RustConnection> {
        &self.conn
    }

    pub fn releaser(&self) -> Rc<dyn ResourceReleaser> {
        self.releaser.clone()
    }

    fn root_heads(&self, root: u32) -> Result<Vec<Rect>> {
        let geom = self.conn.get_geometry(root)?.reply()?;
        Ok(vec![Rect::new(0, 0, geom.width as u32, geom.height as u32)])
    }
}

impl ServerOps for X11Server {
    fn query_window(&self, window: u32) -> Result<Option<WindowInfo>> {
        // Pipeline all four requests
        let attrs = self.conn.get_window_attributes(window)?;
        let geom = self.conn.get_geometry(window)?;
        let tree = self.conn.query_tree(window)?;
        let opacity = self.conn.get_property(
            false,
            window,
            self.atoms._NET_WM_WINDOW_OPACITY,
            AtomEnum::CARDINAL,
            0,
            1,
        )?;

        let Some(attrs) = vanished(window, attrs.reply())? else {
            return Ok(None);
        };
        let Some(geom) = vanished(window, geom.reply())? else {
            return Ok(None);
        };
        let Some(tree) = vanished(window, tree.reply())? else {
            return Ok(None);
        };
        let opacity = vanished(window, opacity.reply())?
            .and_then(|reply| reply.value32().and_then(|mut v| v.next()));

        let class = if attrs.class == xproto::WindowClass::INPUT_ONLY {
            WindowClass::InputOnly
        } else {
            WindowClass::InputOutput
        };

        Ok(Some(WindowInfo {
            parent: tree.parent,
            geometry: Geometry::new(
                geom.x as i32,
                geom.y as i32,
                geom.width as u32,
                geom.height as u32,
                geom.border_width as u32,
            ),
            depth: geom.depth,
            visual: attrs.visual,
            class,
            mapped: attrs.map_state != MapState::UNMAPPED,
            opacity,
        }))
    }

    fn watch_window(&self, window: u32) -> Result<Option<ResourceHandle>> {
        let events = ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE);
        if vanished(window, self.conn.change_window_attributes(window, &events)?.check())?.is_none() {
            return Ok(None);
        }
        if vanished(window, self.conn.shape_select_input(window, true)?.check())?.is_none() {
            return Ok(None);
        }

        let damage_id = self.conn.generate_id()?;
        let created = self
            .conn
            .damage_create(damage_id, window, damage::ReportLevel::NON_EMPTY)?
            .check();
        Ok(vanished(window, created)?.map(|()| {
            trace!("Created damage 0x{:x} for window 0x{:x}", damage_id, window);
            Resource::new(ResourceKind::Damage, damage_id, self.releaser())
        }))
    }

    fn read_cardinals(&self, window: u32, atom: u32) -> Result<Option<Vec<u32>>> {
        let reply = self
            .conn
            .get_property(false, window, atom, AtomEnum::ANY, 0, 64)?
            .reply();
        Ok(vanished(window, reply)?.and_then(|reply| {
            if reply.type_ == x11rb::NONE {
                return None;
            }
            reply.value32().map(|values| values.collect())
        }))
    }

    fn parent_of(&self, window: u32) -> Result<Option<u32>> {
        let reply = self.conn.query_tree(window)?.reply();
        Ok(vanished(window, reply)?.map(|tree| tree.parent))
    }

    fn children_of(&self, window: u32) -> Result<Vec<u32>> {
        let reply = self.conn.query_tree(window)?.reply();
        Ok(vanished(window, reply)?
            .map(|tree| tree.children)
            .unwrap_or_default())
    }

    fn output_heads(&self, root: u32) -> Result<Vec<Rect>> {
        if !self.has_randr {
            return self.root_heads(root);
        }
        let resources = self
            .conn
            .randr_get_screen_resources_current(root)?
            .reply()
            .context("Failed to read RandR screen resources")?;

        let cookies = resources
            .crtcs
            .iter()
            .map(|&crtc| self.conn.randr_get_crtc_info(crtc, resources.config_timestamp))
            .collect::<Result<Vec<_>, _>>()?;

        let mut heads = Vec::new();
        for cookie in cookies {
            let crtc = cookie.reply()?;
            if crtc.width == 0 || crtc.height == 0 {
                continue;
            }
            heads.push(Rect::new(crtc.x as i32, crtc.y as i32, crtc.width as u32, crtc.height as u32));
        }

        if heads.is_empty() {
            return self.root_heads(root);
        }
        debug!("Output heads for root 0x{:x}: {:?}", root, heads);
        Ok(heads)
    }

    fn name_window_pixmap(&self, window: u32) -> Result<Option<ResourceHandle>> {
        let pixmap = self.conn.generate_id()?;
        let named = self.conn.composite_name_window_pixmap(window, pixmap)?.check();
        Ok(vanished(window, named)?
            .map(|()| Resource::new(ResourceKind::Pixmap, pixmap, self.releaser())))
    }

    fn clip_shape(&self, window: u32) -> Result<Option<Vec<Rect>>> {
        let reply = self.conn.shape_get_rectangles(window, SK::BOUNDING)?.reply();
        Ok(vanished(window, reply)?.map(|reply| {
            reply
                .rectangles
                .iter()
                .map(|r| Rect::new(r.x as i32, r.y as i32, r.width as u32, r.height as u32))
                .collect()
        }))
    }

    fn acknowledge_damage(&self, damage: &ResourceHandle) {
        if let Err(e) = self
            .conn
            .damage_subtract(damage.id(), x11rb::NONE, x11rb::NONE)
            .map(|c| c.ignore_error())
        {
            debug!("Failed to subtract damage 0x{:x}: {}", damage.id(), e);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory display server for the mirror tests.

    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    use super::*;
    use crate::compositor::resource::testing::RecordingReleaser;

    #[derive(Default)]
    pub struct FakeServer {
        windows: HashMap<u32, WindowInfo>,
        children: HashMap<u32, Vec<u32>>,
        properties: HashMap<(u32, u32), Vec<u32>>,
        shapes: HashMap<u32, Vec<Rect>>,
        heads: Vec<Rect>,
        watched: RefCell<Vec<u32>>,
        acknowledged: RefCell<Vec<u32>>,
        pixmaps_named: Cell<u32>,
        failing_pixmaps: Vec<u32>,
        next_id: Cell<u32>,
        pub releaser: Rc<RecordingReleaser>,
    }

    impl FakeServer {
        pub fn new() -> Self {
            Self {
                next_id: Cell::new(0x1000),
                heads: vec![Rect::new(0, 0, 1920, 1080)],
                ..Default::default()
            }
        }

        pub fn add_window(&mut self, id: u32, info: WindowInfo) {
            self.children.entry(info.parent).or_default().push(id);
            self.windows.insert(id, info);
        }

        pub fn remove_window(&mut self, id: u32) {
            if let Some(info) = self.windows.remove(&id) {
                if let Some(siblings) = self.children.get_mut(&info.parent) {
                    siblings.retain(|&w| w != id);
                }
            }
        }

        pub fn set_parent(&mut self, id: u32, parent: u32) {
            if let Some(info) = self.windows.get_mut(&id) {
                info.parent = parent;
            }
        }

        pub fn set_geometry(&mut self, id: u32, geometry: Geometry) {
            if let Some(info) = self.windows.get_mut(&id) {
                info.geometry = geometry;
            }
        }

        /// Make `name_window_pixmap` on `id` fail with a non-vanish error.
        pub fn fail_pixmaps_for(&mut self, id: u32) {
            self.failing_pixmaps.push(id);
        }

        pub fn set_property(&mut self, window: u32, atom: u32, values: Vec<u32>) {
            self.properties.insert((window, atom), values);
        }

        pub fn delete_property(&mut self, window: u32, atom: u32) {
            self.properties.remove(&(window, atom));
        }

        pub fn set_shape(&mut self, window: u32, rects: Vec<Rect>) {
            self.shapes.insert(window, rects);
        }

        pub fn set_heads(&mut self, heads: Vec<Rect>) {
            self.heads = heads;
        }

        pub fn watched(&self) -> Vec<u32> {
            self.watched.borrow().clone()
        }

        pub fn acknowledged(&self) -> Vec<u32> {
            self.acknowledged.borrow().clone()
        }

        pub fn pixmaps_named(&self) -> u32 {
            self.pixmaps_named.get()
        }

        fn next_id(&self) -> u32 {
            let id = self.next_id.get();
            self.next_id.set(id + 1);
            id
        }
    }

    impl ServerOps for FakeServer {
        fn query_window(&self, window: u32) -> Result<Option<WindowInfo>> {
            let mut info = self.windows.get(&window).cloned();
            if let Some(info) = info.as_mut() {
                info.opacity = self
                    .properties
                    .get(&(window, crate::compositor::atoms::test_atoms()._NET_WM_WINDOW_OPACITY))
                    .and_then(|v| v.first().copied())
                    .or(info.opacity);
            }
            Ok(info)
        }

        fn watch_window(&self, window: u32) -> Result<Option<ResourceHandle>> {
            if !self.windows.contains_key(&window) {
                return Ok(None);
            }
            self.watched.borrow_mut().push(window);
            Ok(Some(Resource::new(ResourceKind::Damage, self.next_id(), self.releaser.clone())))
        }

        fn read_cardinals(&self, window: u32, atom: u32) -> Result<Option<Vec<u32>>> {
            Ok(self.properties.get(&(window, atom)).cloned())
        }

        fn parent_of(&self, window: u32) -> Result<Option<u32>> {
            Ok(self.windows.get(&window).map(|info| info.parent))
        }

        fn children_of(&self, window: u32) -> Result<Vec<u32>> {
            Ok(self.children.get(&window).cloned().unwrap_or_default())
        }

        fn output_heads(&self, _root: u32) -> Result<Vec<Rect>> {
            Ok(self.heads.clone())
        }

        fn name_window_pixmap(&self, window: u32) -> Result<Option<ResourceHandle>> {
            if !self.windows.contains_key(&window) {
                return Ok(None);
            }
            if self.failing_pixmaps.contains(&window) {
                anyhow::bail!("NameWindowPixmap on 0x{:x} failed: BadAlloc", window);
            }
            self.pixmaps_named.set(self.pixmaps_named.get() + 1);
            Ok(Some(Resource::new(ResourceKind::Pixmap, self.next_id(), self.releaser.clone())))
        }

        fn clip_shape(&self, window: u32) -> Result<Option<Vec<Rect>>> {
            let Some(info) = self.windows.get(&window) else {
                return Ok(None);
            };
            let bw = info.geometry.border_width as i32;
            Ok(Some(self.shapes.get(&window).cloned().unwrap_or_else(|| {
                vec![Rect::new(
                    -bw,
                    -bw,
                    info.geometry.outer_width(),
                    info.geometry.outer_height(),
                )]
            })))
        }

        fn acknowledge_damage(&self, damage: &ResourceHandle) {
            self.acknowledged.borrow_mut().push(damage.id());
        }
    }
}
