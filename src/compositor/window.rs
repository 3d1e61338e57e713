//! Window mirror
//!
//! The compositor's shadow of one X window: geometry, map state, clip
//! shape, opacity, damage and the latest content pixmap. Back-end
//! surfaces live with the back-end, keyed by window id.

use anyhow::Result;
use tracing::{debug, trace};

use super::resource::ResourceHandle;
use super::server::ServerOps;
use crate::shared::{Geometry, Rect};

/// Opacity of a window without `_NET_WM_WINDOW_OPACITY`
pub const OPAQUE: u8 = 255;

/// Window class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowClass {
    InputOutput,
    InputOnly,
}

/// What the server reports about a window when the mirror is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    pub parent: u32,
    pub geometry: Geometry,
    pub depth: u8,
    pub visual: u32,
    pub class: WindowClass,
    pub mapped: bool,
    /// Raw `_NET_WM_WINDOW_OPACITY` cardinal, if set
    pub opacity: Option<u32>,
}

/// Convert a `_NET_WM_WINDOW_OPACITY` cardinal in `[0, 0xFFFFFFFF]` to `[0, 255]`.
pub fn opacity_from_cardinal(raw: u32) -> u8 {
    (raw / 0x0101_0101).min(255) as u8
}

/// Mask alpha for an opacity: `round(opacity * 0xFFFF / 255)`.
pub fn mask_alpha(opacity: u8) -> u16 {
    ((opacity as u32 * 0xFFFF + 127) / 255) as u16
}

/// Mirror state of one window.
#[derive(Debug)]
pub struct WindowState {
    pub id: u32,
    pub parent: u32,
    pub geometry: Geometry,
    pub depth: u8,
    pub visual: u32,
    pub class: WindowClass,
    mapped: bool,
    damaged: bool,
    resized: bool,
    /// A request on this window failed; it is skipped until DestroyNotify
    bad: bool,
    clip_shape: Vec<Rect>,
    clip_shape_changed: bool,
    opacity: u8,
    content_pixmap: Option<ResourceHandle>,
    damage: Option<ResourceHandle>,
}

impl WindowState {
    /// Build the mirror from a server query.
    pub fn new(id: u32, info: WindowInfo) -> Self {
        Self {
            id,
            parent: info.parent,
            geometry: info.geometry,
            depth: info.depth,
            visual: info.visual,
            class: info.class,
            mapped: info.mapped,
            damaged: true,
            resized: true,
            bad: false,
            clip_shape: Vec::new(),
            clip_shape_changed: true,
            opacity: info.opacity.map(opacity_from_cardinal).unwrap_or(OPAQUE),
            content_pixmap: None,
            damage: None,
        }
    }

    /// Query the server and register for property-change and damage
    /// notifications. `None` when the window is gone or reports depth 0.
    pub fn create(server: &dyn ServerOps, id: u32) -> Result<Option<Self>> {
        let Some(info) = server.query_window(id)? else {
            debug!("Window 0x{:x} vanished before it could be mirrored", id);
            return Ok(None);
        };
        if info.depth == 0 {
            debug!("Window 0x{:x} has depth 0, treating as destroyed", id);
            return Ok(None);
        }
        let mut window = Self::new(id, info);
        if window.is_input_output() {
            window.damage = server.watch_window(id)?;
        }
        trace!("Mirrored window 0x{:x}: {:?}", id, window.geometry);
        Ok(Some(window))
    }

    pub fn is_input_output(&self) -> bool {
        self.class == WindowClass::InputOutput
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn is_damaged(&self) -> bool {
        self.damaged
    }

    pub fn is_resized(&self) -> bool {
        self.resized
    }

    pub fn is_bad(&self) -> bool {
        self.bad
    }

    pub fn opacity(&self) -> u8 {
        self.opacity
    }

    pub fn clip_shape(&self) -> &[Rect] {
        &self.clip_shape
    }

    pub fn clip_shape_changed(&self) -> bool {
        self.clip_shape_changed
    }

    pub fn content_pixmap(&self) -> Option<&ResourceHandle> {
        self.content_pixmap.as_ref()
    }

    pub fn damage(&self) -> Option<&ResourceHandle> {
        self.damage.as_ref()
    }

    /// Outer bounding box on screen
    pub fn outer_rect(&self) -> Rect {
        self.geometry.outer_rect()
    }

    /// Whether the window takes part in the frame
    pub fn is_renderable(&self) -> bool {
        self.mapped && self.is_input_output() && !self.bad
    }

    pub fn set_damaged(&mut self) {
        self.damaged = true;
    }

    pub fn add_damage(&mut self) {
        self.set_damaged();
    }

    pub fn set_mapped(&mut self) {
        self.mapped = true;
        self.damaged = true;
    }

    pub fn set_unmapped(&mut self) {
        self.mapped = false;
    }

    pub fn set_clip_shape_changed(&mut self) {
        self.clip_shape_changed = true;
    }

    pub fn set_opacity(&mut self, opacity: u8) {
        self.opacity = opacity;
    }

    pub(crate) fn mark_bad(&mut self) {
        if !self.bad {
            debug!("Window 0x{:x} marked bad", self.id);
        }
        self.bad = true;
    }

    /// Overwrite geometry from a configure event. Returns whether the
    /// outer size changed.
    ///
    /// No ShapeNotify arrives for an unshaped window that changes size, so
    /// a resize also invalidates the clip shape.
    pub fn update_geometry(&mut self, geometry: Geometry) -> bool {
        let resized = self.geometry.size_differs(&geometry);
        self.geometry = geometry;
        if resized {
            self.resized = true;
            self.damaged = true;
            self.clip_shape_changed = true;
        }
        resized
    }

    /// React to a property change. Returns whether the opacity changed.
    pub fn update_property(&mut self, server: &dyn ServerOps, atom: u32, opacity_atom: u32) -> Result<bool> {
        if atom != opacity_atom {
            return Ok(false);
        }
        let raw = server
            .read_cardinals(self.id, opacity_atom)?
            .and_then(|values| values.first().copied());
        let opacity = raw.map(opacity_from_cardinal).unwrap_or(OPAQUE);
        let changed = opacity != self.opacity;
        self.opacity = opacity;
        Ok(changed)
    }

    /// Re-acquire the offscreen content pixmap and refresh the clip
    /// shape when flagged. Bad windows are skipped.
    pub fn update_contents(&mut self, server: &dyn ServerOps) -> Result<()> {
        if self.bad || !self.is_input_output() {
            return Ok(());
        }
        match server.name_window_pixmap(self.id)? {
            Some(pixmap) => self.content_pixmap = Some(pixmap),
            None => {
                self.mark_bad();
                return Ok(());
            }
        }
        if self.clip_shape_changed {
            match server.clip_shape(self.id)? {
                Some(rects) => self.clip_shape = self.normalize_shape(rects),
                None => self.mark_bad(),
            }
        }
        Ok(())
    }

    /// Shape rectangles arrive relative to the window's inner origin;
    /// store them relative to the outer corner, clipped to the outer box.
    fn normalize_shape(&self, rects: Vec<Rect>) -> Vec<Rect> {
        let bw = self.geometry.border_width as i32;
        let outer = Rect::new(0, 0, self.geometry.outer_width(), self.geometry.outer_height());
        rects
            .into_iter()
            .filter_map(|r| r.offset(bw, bw).intersection(&outer))
            .collect()
    }

    /// The clip shape, or the whole outer box when none is known.
    pub fn effective_clip_shape(&self) -> Vec<Rect> {
        if self.clip_shape.is_empty() {
            vec![Rect::new(0, 0, self.geometry.outer_width(), self.geometry.outer_height())]
        } else {
            self.clip_shape.clone()
        }
    }

    /// Whether this frame must refresh the window's contents
    pub fn needs_contents_update(&self) -> bool {
        self.damaged || self.resized || self.clip_shape_changed || self.content_pixmap.is_none()
    }

    /// Clear per-frame flags after a render. Returns whether the window
    /// had been damaged.
    pub fn finish_frame(&mut self) -> bool {
        let was_damaged = self.damaged;
        self.damaged = false;
        self.resized = false;
        self.clip_shape_changed = false;
        was_damaged
    }
}

#[cfg(test)]
pub(crate) fn test_info(x: i32, y: i32, width: u32, height: u32) -> WindowInfo {
    WindowInfo {
        parent: 1,
        geometry: Geometry::new(x, y, width, height, 0),
        depth: 24,
        visual: 0x21,
        class: WindowClass::InputOutput,
        mapped: false,
        opacity: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::server::testing::FakeServer;

    #[test]
    fn test_opacity_cardinal_conversion() {
        assert_eq!(opacity_from_cardinal(0), 0);
        assert_eq!(opacity_from_cardinal(0xFFFF_FFFF), 255);
        for v in 0..=255u32 {
            assert_eq!(opacity_from_cardinal(v * 0x0101_0101), v as u8);
        }
    }

    #[test]
    fn test_opacity_round_trip_and_mask_alpha() {
        let mut window = WindowState::new(5, test_info(0, 0, 10, 10));
        for v in 0..=255u8 {
            window.set_opacity(v);
            assert_eq!(window.opacity(), v);
            let expected = ((v as f64) * 65535.0 / 255.0).round() as u16;
            assert_eq!(mask_alpha(v), expected);
        }
        assert_eq!(mask_alpha(128), 0x8080);
        assert_eq!(mask_alpha(255), 0xFFFF);
        assert_eq!(mask_alpha(0), 0);
    }

    #[test]
    fn test_new_window_starts_dirty() {
        let window = WindowState::new(5, test_info(0, 0, 10, 10));
        assert!(window.clip_shape_changed());
        assert!(window.is_damaged());
        assert_eq!(window.opacity(), OPAQUE);
    }

    #[test]
    fn test_initial_opacity_from_property() {
        let mut info = test_info(0, 0, 10, 10);
        info.opacity = Some(128 * 0x0101_0101);
        let window = WindowState::new(5, info);
        assert_eq!(window.opacity(), 128);
    }

    #[test]
    fn test_damage_is_idempotent() {
        let mut window = WindowState::new(5, test_info(0, 0, 10, 10));
        window.finish_frame();
        for _ in 0..5 {
            window.add_damage();
        }
        assert!(window.finish_frame());
        assert!(!window.is_damaged());
        assert!(!window.finish_frame());
    }

    #[test]
    fn test_update_geometry_flags_resize_only_on_size_change() {
        let mut window = WindowState::new(5, test_info(0, 0, 100, 100));
        window.finish_frame();
        assert!(!window.update_geometry(Geometry::new(20, 30, 100, 100, 0)));
        assert!(!window.is_resized());
        assert!(!window.clip_shape_changed());
        assert!(window.update_geometry(Geometry::new(20, 30, 120, 100, 0)));
        assert!(window.is_resized());
        assert!(window.clip_shape_changed());
    }

    #[test]
    fn test_create_skips_depth_zero_and_vanished() {
        let mut server = FakeServer::new();
        let mut info = test_info(0, 0, 10, 10);
        info.depth = 0;
        server.add_window(7, info);
        assert!(WindowState::create(&server, 7).unwrap().is_none());
        assert!(WindowState::create(&server, 99).unwrap().is_none());
    }

    #[test]
    fn test_input_only_windows_are_not_watched() {
        let mut server = FakeServer::new();
        let mut info = test_info(0, 0, 10, 10);
        info.class = WindowClass::InputOnly;
        server.add_window(8, info);
        let window = WindowState::create(&server, 8).unwrap().unwrap();
        assert!(window.damage().is_none());
        assert!(server.watched().is_empty());
    }

    #[test]
    fn test_update_contents_refreshes_shape_relative_to_border() {
        let mut server = FakeServer::new();
        let mut info = test_info(0, 0, 100, 50);
        info.geometry.border_width = 2;
        server.add_window(9, info);
        server.set_shape(9, vec![Rect::new(-2, -2, 104, 54)]);
        let mut window = WindowState::create(&server, 9).unwrap().unwrap();
        window.update_contents(&server).unwrap();
        assert!(window.content_pixmap().is_some());
        assert_eq!(window.clip_shape(), &[Rect::new(0, 0, 104, 54)]);
    }

    #[test]
    fn test_update_contents_marks_vanished_window_bad() {
        let mut server = FakeServer::new();
        server.add_window(10, test_info(0, 0, 10, 10));
        let mut window = WindowState::create(&server, 10).unwrap().unwrap();
        server.remove_window(10);
        window.set_mapped();
        window.update_contents(&server).unwrap();
        assert!(window.is_bad());
        assert!(!window.is_renderable());
    }

    #[test]
    fn test_opacity_property_rereads_and_resets() {
        let mut server = FakeServer::new();
        let atoms = crate::compositor::atoms::test_atoms();
        let opacity_atom = atoms._NET_WM_WINDOW_OPACITY;
        server.add_window(11, test_info(0, 0, 10, 10));
        let mut window = WindowState::create(&server, 11).unwrap().unwrap();

        server.set_property(11, opacity_atom, vec![0]);
        assert!(window.update_property(&server, opacity_atom, opacity_atom).unwrap());
        assert_eq!(window.opacity(), 0);

        server.delete_property(11, opacity_atom);
        assert!(window.update_property(&server, opacity_atom, opacity_atom).unwrap());
        assert_eq!(window.opacity(), OPAQUE);

        assert!(!window.update_property(&server, 12345, opacity_atom).unwrap());
    }
}
