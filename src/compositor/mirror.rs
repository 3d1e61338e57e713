//! Screen mirror
//!
//! Per-screen aggregate of window mirrors. Owns the stacking order, the
//! ignore-set and the root properties the core observes, and turns
//! [`MirrorEvent`]s into mutations plus a list of [`MirrorChange`]s for the
//! back-end and the plugins.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use tracing::{debug, trace, warn};

use super::atoms::Atoms;
use super::events::MirrorEvent;
use super::server::ServerOps;
use super::stacking::StackingOrder;
use super::window::WindowState;
use crate::shared::{Geometry, Rect};

/// Ancestor walks stop after this many hops
const MAX_ANCESTOR_DEPTH: usize = 64;

/// What an event did to the mirror.
#[derive(Debug)]
pub enum MirrorChange {
    Created(u32),
    /// The removed mirror, handed out so its surface and plugins can let go
    Destroyed(Box<WindowState>),
    Mapped(u32),
    Unmapped(u32),
    Damaged(u32),
    Reconfigured(u32),
    PropertyChanged { window: u32, atom: u32 },
    OpacityChanged(u32),
    ShapeChanged(u32),
    RootPixmapChanged,
    RootResized { width: u32, height: u32 },
}

/// Parse `_FLUXBOX_RECONFIGURE_RECT` (x, y, w, h). Anything but four
/// values clears the rectangle.
pub fn parse_reconfigure_rect(values: &[u32]) -> Option<Rect> {
    match values {
        &[x, y, w, h] => {
            let rect = Rect::new(x as i32, y as i32, w, h);
            (!rect.is_empty()).then_some(rect)
        }
        _ => None,
    }
}

pub struct ScreenMirror {
    pub index: usize,
    pub root: u32,
    root_geometry: Geometry,
    atoms: Atoms,
    windows: HashMap<u32, WindowState>,
    stacking: StackingOrder,
    ignored: HashSet<u32>,
    heads: Vec<Rect>,
    active_window: Option<u32>,
    workspace: u32,
    workspace_count: u32,
    reconfigure_rect: Option<Rect>,
    background_changed: bool,
    root_size_changed: bool,
    dirty: bool,
}

impl ScreenMirror {
    pub fn new(index: usize, root: u32, root_geometry: Geometry, atoms: Atoms) -> Self {
        Self {
            index,
            root,
            root_geometry,
            atoms,
            windows: HashMap::new(),
            stacking: StackingOrder::new(),
            ignored: HashSet::new(),
            heads: vec![Rect::new(0, 0, root_geometry.width, root_geometry.height)],
            active_window: None,
            workspace: 0,
            workspace_count: 1,
            reconfigure_rect: None,
            background_changed: true,
            root_size_changed: true,
            dirty: true,
        }
    }

    /// Mirror the root's existing children bottom-to-top and read the root
    /// properties. Returns the created windows.
    pub fn populate(&mut self, server: &dyn ServerOps) -> Result<Vec<MirrorChange>> {
        self.heads = server.output_heads(self.root)?;

        let mut changes = Vec::new();
        for child in server.children_of(self.root)? {
            if let Some(change) = self.create_window(server, child)? {
                changes.push(change);
            }
        }

        for atom in [
            self.atoms._NET_ACTIVE_WINDOW,
            self.atoms._WIN_WORKSPACE,
            self.atoms._WIN_WORKSPACE_COUNT,
            self.atoms._FLUXBOX_RECONFIGURE_RECT,
        ] {
            self.root_property(server, atom, false)?;
        }
        debug!(
            "Screen {} populated with {} windows, {} heads",
            self.index,
            self.stacking.len(),
            self.heads.len()
        );
        Ok(changes)
    }

    pub fn atoms(&self) -> &Atoms {
        &self.atoms
    }

    /// Root width and height
    pub fn size(&self) -> (u32, u32) {
        (self.root_geometry.width, self.root_geometry.height)
    }

    pub fn heads(&self) -> &[Rect] {
        &self.heads
    }

    pub fn active_window(&self) -> Option<u32> {
        self.active_window
    }

    pub fn workspace(&self) -> u32 {
        self.workspace
    }

    pub fn workspace_count(&self) -> u32 {
        self.workspace_count
    }

    pub fn reconfigure_rect(&self) -> Option<Rect> {
        self.reconfigure_rect
    }

    pub fn background_changed(&self) -> bool {
        self.background_changed
    }

    pub fn root_size_changed(&self) -> bool {
        self.root_size_changed
    }

    /// Anything changed since the last frame
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn contains(&self, id: u32) -> bool {
        self.windows.contains_key(&id)
    }

    pub fn window(&self, id: u32) -> Option<&WindowState> {
        self.windows.get(&id)
    }

    pub fn window_mut(&mut self, id: u32) -> Option<&mut WindowState> {
        self.windows.get_mut(&id)
    }

    pub fn stacking_order(&self) -> &[u32] {
        self.stacking.as_slice()
    }

    /// Windows bottom-to-top
    pub fn stacked(&self) -> impl Iterator<Item = &WindowState> + '_ {
        self.stacking.iter().filter_map(|id| self.windows.get(&id))
    }

    pub fn is_ignored(&self, id: u32) -> bool {
        self.ignored.contains(&id)
    }

    /// Stop mirroring `id`; an existing mirror is evicted.
    pub fn add_ignored(&mut self, id: u32) -> Option<MirrorChange> {
        self.ignored.insert(id);
        self.remove_window(id)
    }

    /// Apply one event.
    pub fn handle(&mut self, server: &dyn ServerOps, event: &MirrorEvent) -> Result<Vec<MirrorChange>> {
        trace!("Screen {}: {:?}", self.index, event);
        let mut changes = Vec::new();
        match *event {
            MirrorEvent::Create { window, parent } => {
                if parent == self.root {
                    changes.extend(self.create_window(server, window)?);
                }
            }
            MirrorEvent::Destroy { window } => {
                changes.extend(self.remove_window(window));
            }
            MirrorEvent::Map { window } => {
                if let Some(w) = self.windows.get_mut(&window) {
                    w.set_mapped();
                    self.dirty = true;
                    changes.push(MirrorChange::Mapped(window));
                }
            }
            MirrorEvent::Unmap { window } => {
                if let Some(w) = self.windows.get_mut(&window) {
                    w.set_unmapped();
                    self.dirty = true;
                    changes.push(MirrorChange::Unmapped(window));
                }
            }
            MirrorEvent::Configure { window, geometry, above } => {
                if window == self.root {
                    changes.extend(self.resize_root(server, geometry)?);
                } else if self.windows.contains_key(&window) {
                    changes.push(self.configure_window(server, window, geometry, above)?);
                }
            }
            MirrorEvent::Reparent { window, parent } => {
                if parent == self.root {
                    changes.extend(self.create_window(server, window)?);
                } else {
                    changes.extend(self.remove_window(window));
                }
            }
            MirrorEvent::Damage { window } => {
                if let Some(w) = self.windows.get_mut(&window) {
                    w.add_damage();
                    if w.is_mapped() {
                        self.dirty = true;
                    }
                    changes.push(MirrorChange::Damaged(window));
                }
            }
            MirrorEvent::Property { window, atom, deleted } => {
                if window == self.root {
                    changes.extend(self.root_property(server, atom, deleted)?);
                } else if let Some(w) = self.windows.get_mut(&window) {
                    let opacity_changed =
                        w.update_property(server, atom, self.atoms._NET_WM_WINDOW_OPACITY)?;
                    changes.push(MirrorChange::PropertyChanged { window, atom });
                    if opacity_changed {
                        self.dirty = true;
                        changes.push(MirrorChange::OpacityChanged(window));
                    }
                }
            }
            MirrorEvent::Shape { window } => {
                if let Some(w) = self.windows.get_mut(&window) {
                    w.set_clip_shape_changed();
                    self.dirty = true;
                    changes.push(MirrorChange::ShapeChanged(window));
                }
            }
            MirrorEvent::Expose { window, .. } => {
                if window == self.root {
                    self.dirty = true;
                }
            }
        }
        Ok(changes)
    }

    fn create_window(&mut self, server: &dyn ServerOps, id: u32) -> Result<Option<MirrorChange>> {
        if self.ignored.contains(&id) || self.windows.contains_key(&id) {
            return Ok(None);
        }
        let Some(window) = WindowState::create(server, id)? else {
            return Ok(None);
        };
        if window.is_mapped() {
            self.dirty = true;
        }
        self.windows.insert(id, window);
        self.stacking.push_top(id);
        Ok(Some(MirrorChange::Created(id)))
    }

    fn remove_window(&mut self, id: u32) -> Option<MirrorChange> {
        let window = self.windows.remove(&id)?;
        self.stacking.remove(id);
        if window.is_mapped() {
            self.dirty = true;
        }
        if self.active_window == Some(id) {
            self.active_window = None;
        }
        trace!("Screen {}: removed window 0x{:x}", self.index, id);
        Some(MirrorChange::Destroyed(Box::new(window)))
    }

    fn configure_window(
        &mut self,
        server: &dyn ServerOps,
        id: u32,
        geometry: Geometry,
        above: Option<u32>,
    ) -> Result<MirrorChange> {
        match above {
            None => self.stacking.insert_bottom(id),
            Some(sibling) if self.stacking.contains(sibling) => {
                self.stacking.insert_above(id, sibling);
            }
            Some(sibling) => match self.managed_ancestor(server, sibling)? {
                Some(ancestor) if ancestor != id => {
                    self.stacking.insert_above(id, ancestor);
                }
                _ => self.stacking.push_top(id),
            },
        }
        if let Some(window) = self.windows.get_mut(&id) {
            window.update_geometry(geometry);
            if window.is_mapped() {
                self.dirty = true;
            }
        }
        Ok(MirrorChange::Reconfigured(id))
    }

    fn resize_root(&mut self, server: &dyn ServerOps, geometry: Geometry) -> Result<Option<MirrorChange>> {
        if !self.root_geometry.size_differs(&geometry) {
            return Ok(None);
        }
        self.root_geometry = geometry;
        self.root_size_changed = true;
        self.dirty = true;
        self.heads = server.output_heads(self.root)?;
        debug!("Screen {}: root resized to {}x{}", self.index, geometry.width, geometry.height);
        Ok(Some(MirrorChange::RootResized {
            width: geometry.width,
            height: geometry.height,
        }))
    }

    fn root_property(&mut self, server: &dyn ServerOps, atom: u32, deleted: bool) -> Result<Option<MirrorChange>> {
        let root = self.root;
        let read_first = |server: &dyn ServerOps| -> Result<Option<u32>> {
            if deleted {
                return Ok(None);
            }
            Ok(server
                .read_cardinals(root, atom)?
                .and_then(|values| values.first().copied()))
        };

        if atom == self.atoms._NET_ACTIVE_WINDOW {
            let active = read_first(server)?.filter(|&id| id != x11rb::NONE);
            self.active_window = match active {
                Some(id) => self.managed_ancestor(server, id)?,
                None => None,
            };
            trace!("Screen {}: active window {:?}", self.index, self.active_window);
        } else if atom == self.atoms._FLUXBOX_RECONFIGURE_RECT {
            let values = if deleted {
                None
            } else {
                server.read_cardinals(root, atom)?
            };
            let rect = values.as_deref().and_then(parse_reconfigure_rect);
            if rect != self.reconfigure_rect {
                self.reconfigure_rect = rect;
                self.dirty = true;
            }
        } else if atom == self.atoms._XROOTPMAP_ID {
            self.background_changed = true;
            self.dirty = true;
            return Ok(Some(MirrorChange::RootPixmapChanged));
        } else if atom == self.atoms._WIN_WORKSPACE {
            self.workspace = read_first(server)?.unwrap_or(0);
        } else if atom == self.atoms._WIN_WORKSPACE_COUNT {
            self.workspace_count = read_first(server)?.unwrap_or(1);
        }
        Ok(None)
    }

    /// Walk up from `start` to the first window the mirror tracks.
    fn managed_ancestor(&self, server: &dyn ServerOps, start: u32) -> Result<Option<u32>> {
        let mut current = start;
        for _ in 0..MAX_ANCESTOR_DEPTH {
            if self.windows.contains_key(&current) {
                return Ok(Some(current));
            }
            if current == self.root || current == x11rb::NONE {
                return Ok(None);
            }
            match server.parent_of(current)? {
                Some(parent) => current = parent,
                None => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Refresh contents of every renderable window that needs it. A window
    /// whose refresh fails is marked bad and left out of the frame.
    pub fn prepare_frame(&mut self, server: &dyn ServerOps) -> Result<()> {
        for id in self.stacking.iter() {
            if let Some(window) = self.windows.get_mut(&id) {
                if window.is_renderable() && window.needs_contents_update() {
                    if let Err(e) = window.update_contents(server) {
                        warn!("Failed to refresh window 0x{:x}: {:#}", id, e);
                        window.mark_bad();
                    }
                }
            }
        }
        Ok(())
    }

    /// Clear per-frame state and re-arm damage on repainted windows.
    pub fn finish_frame(&mut self, server: &dyn ServerOps) {
        for window in self.windows.values_mut() {
            if window.finish_frame() {
                if let Some(damage) = window.damage() {
                    server.acknowledge_damage(damage);
                }
            }
        }
        self.background_changed = false;
        self.root_size_changed = false;
        self.dirty = false;
    }
}
