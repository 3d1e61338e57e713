//! Screen
//!
//! One X screen: its mirror, its back-end and the plugins loaded for it.
//! Mirror changes are forwarded to the back-end (surface lifetime,
//! invalidation) and to the plugins, in that order for creation and in
//! reverse for destruction.

use anyhow::Result;
use tracing::{debug, trace};

use super::backend::picture::PictureBackend;
use super::backend::texture::TextureBackend;
use super::backend::{Backend, BackendKind};
use super::events::MirrorEvent;
use super::mirror::{MirrorChange, ScreenMirror};
use super::server::ServerOps;
use crate::plugin::{Plugin, PluginSet, WindowHooks};

pub struct Screen<B: Backend> {
    pub mirror: ScreenMirror,
    backend: B,
    plugins: PluginSet<B::Plugin>,
}

impl<B: Backend> Screen<B> {
    pub fn new(mirror: ScreenMirror, backend: B, plugins: PluginSet<B::Plugin>) -> Self {
        Self { mirror, backend, plugins }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mirror what is already on screen.
    pub fn start(&mut self, server: &dyn ServerOps) -> Result<()> {
        let changes = self.mirror.populate(server)?;
        self.apply(changes)?;
        debug!(
            "Screen {} started on the {} backend with {} plugins",
            self.mirror.index,
            self.backend.kind(),
            self.plugins.len()
        );
        Ok(())
    }

    /// Stop mirroring a window the compositor owns.
    pub fn ignore(&mut self, id: u32) -> Result<()> {
        let changes = self.mirror.add_ignored(id).into_iter().collect();
        self.apply(changes)
    }

    pub fn handle_event(&mut self, server: &dyn ServerOps, event: &MirrorEvent) -> Result<()> {
        let changes = self.mirror.handle(server, event)?;
        self.apply(changes)
    }

    fn apply(&mut self, changes: Vec<MirrorChange>) -> Result<()> {
        for change in changes {
            trace!("Screen {}: {:?}", self.mirror.index, change);
            match change {
                MirrorChange::Created(id) => {
                    let Some(window) = self.mirror.window(id) else {
                        continue;
                    };
                    self.backend.create_window_object(window)?;
                    let surface = self.backend.window_object(id);
                    self.plugins
                        .dispatch("window_created", |p| p.window_created(window, surface));
                }
                MirrorChange::Destroyed(window) => {
                    let surface = self.backend.window_object(window.id);
                    self.plugins
                        .dispatch("window_destroyed", |p| p.window_destroyed(&window, surface));
                    self.backend.release_window_object(window.id);
                }
                MirrorChange::RootPixmapChanged => {
                    self.backend.set_root_pixmap_changed();
                    self.plugins
                        .dispatch("root_pixmap_changed", |p| p.root_pixmap_changed());
                }
                MirrorChange::RootResized { width, height } => {
                    self.backend.set_root_window_size_changed();
                    self.plugins
                        .dispatch("root_window_resized", |p| p.root_window_resized(width, height));
                }
                MirrorChange::Mapped(id) => self.window_hook(id, "window_mapped", |p, w, s| p.window_mapped(w, s)),
                MirrorChange::Unmapped(id) => {
                    self.window_hook(id, "window_unmapped", |p, w, s| p.window_unmapped(w, s))
                }
                MirrorChange::Damaged(id) => self.window_hook(id, "window_damaged", |p, w, s| p.window_damaged(w, s)),
                MirrorChange::Reconfigured(id) => {
                    self.window_hook(id, "window_reconfigured", |p, w, s| p.window_reconfigured(w, s))
                }
                MirrorChange::PropertyChanged { window, atom } => self.window_hook(
                    window,
                    "window_property_changed",
                    |p, w, s| p.window_property_changed(w, s, atom),
                ),
                MirrorChange::ShapeChanged(id) => {
                    self.window_hook(id, "window_shape_changed", |p, w, s| p.window_shape_changed(w, s))
                }
                // Surfaces pick the new opacity up during the next frame
                MirrorChange::OpacityChanged(_) => {}
            }
        }
        Ok(())
    }

    fn window_hook(
        &mut self,
        id: u32,
        hook: &str,
        mut call: impl FnMut(&mut B::Plugin, &super::window::WindowState, Option<&B::Surface>) -> Result<()>,
    ) {
        let Some(window) = self.mirror.window(id) else {
            return;
        };
        let surface = self.backend.window_object(id);
        self.plugins.dispatch(hook, |p| call(p, window, surface));
    }

    /// Anything to draw: a mirror change or a running animation.
    pub fn wants_frame(&self) -> bool {
        self.mirror.is_dirty() || self.plugins.is_animating()
    }

    /// Refresh window contents, draw, then reset per-frame state.
    pub fn render_screen(&mut self, server: &dyn ServerOps) -> Result<()> {
        self.mirror.prepare_frame(server)?;
        self.plugins.begin_frame();
        self.backend.render_screen(&self.mirror, &mut self.plugins)?;
        self.mirror.finish_frame(server);
        Ok(())
    }
}

/// A screen on either back-end.
pub enum AnyScreen {
    Texture(Screen<TextureBackend>),
    Picture(Screen<PictureBackend>),
}

macro_rules! with_screen {
    ($any:expr, $screen:ident => $body:expr) => {
        match $any {
            AnyScreen::Texture($screen) => $body,
            AnyScreen::Picture($screen) => $body,
        }
    };
}

impl AnyScreen {
    pub fn kind(&self) -> BackendKind {
        match self {
            AnyScreen::Texture(_) => BackendKind::OpenGl,
            AnyScreen::Picture(_) => BackendKind::XRender,
        }
    }

    pub fn mirror(&self) -> &ScreenMirror {
        with_screen!(self, s => &s.mirror)
    }

    pub fn root(&self) -> u32 {
        self.mirror().root
    }

    pub fn start(&mut self, server: &dyn ServerOps) -> Result<()> {
        with_screen!(self, s => s.start(server))
    }

    pub fn ignore(&mut self, id: u32) -> Result<()> {
        with_screen!(self, s => s.ignore(id))
    }

    pub fn handle_event(&mut self, server: &dyn ServerOps, event: &MirrorEvent) -> Result<()> {
        with_screen!(self, s => s.handle_event(server, event))
    }

    pub fn wants_frame(&self) -> bool {
        with_screen!(self, s => s.wants_frame())
    }

    pub fn render_screen(&mut self, server: &dyn ServerOps) -> Result<()> {
        with_screen!(self, s => s.render_screen(server))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A back-end that records what it was asked to draw.

    use std::collections::HashMap;

    use super::*;
    use crate::compositor::backend::{FrameStep, frame_steps};
    use crate::compositor::window::{WindowState, mask_alpha};
    use crate::shared::Rect;

    /// What one frame drew, bottom-to-top.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DrawnWindow {
        pub id: u32,
        pub rect: Rect,
        pub mask_alpha: u16,
        pub clip: Vec<Rect>,
    }

    #[derive(Default)]
    pub struct RecordingBackend {
        pub surfaces: HashMap<u32, u32>,
        pub released: Vec<u32>,
        pub background_uploads: u32,
        pub content_uploads: Vec<u32>,
        pub frames: Vec<Vec<DrawnWindow>>,
        pub steps: Vec<Vec<FrameStep>>,
        pub outlines: Vec<Rect>,
        root_pixmap_changed: bool,
    }

    impl Backend for RecordingBackend {
        type Surface = u32;
        type Plugin = dyn WindowHooks<u32>;

        fn kind(&self) -> BackendKind {
            BackendKind::XRender
        }

        fn create_window_object(&mut self, window: &WindowState) -> Result<()> {
            if window.is_input_output() {
                self.surfaces.insert(window.id, window.id + 1000);
            }
            Ok(())
        }

        fn window_object(&self, id: u32) -> Option<&u32> {
            self.surfaces.get(&id)
        }

        fn release_window_object(&mut self, id: u32) {
            self.surfaces.remove(&id);
            self.released.push(id);
        }

        fn set_root_pixmap_changed(&mut self) {
            self.root_pixmap_changed = true;
        }

        fn set_root_window_size_changed(&mut self) {}

        fn render_screen(&mut self, mirror: &ScreenMirror, _plugins: &mut PluginSet<Self::Plugin>) -> Result<()> {
            if self.root_pixmap_changed || mirror.background_changed() {
                self.background_uploads += 1;
                self.root_pixmap_changed = false;
            }
            let steps = frame_steps(mirror, |id| self.surfaces.contains_key(&id));
            let mut frame = Vec::new();
            for step in &steps {
                match *step {
                    FrameStep::Window(id) => {
                        let Some(window) = mirror.window(id) else {
                            continue;
                        };
                        if window.is_damaged() || window.clip_shape_changed() {
                            self.content_uploads.push(window.id);
                        }
                        frame.push(DrawnWindow {
                            id: window.id,
                            rect: window.outer_rect(),
                            mask_alpha: mask_alpha(window.opacity()),
                            clip: window.effective_clip_shape(),
                        });
                    }
                    FrameStep::Outline(rect) => self.outlines.push(rect),
                    _ => {}
                }
            }
            self.frames.push(frame);
            self.steps.push(steps);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{DrawnWindow, RecordingBackend};
    use super::*;
    use crate::compositor::atoms::test_atoms;
    use crate::compositor::mirror::testing::{ROOT, mirror};
    use crate::compositor::server::testing::FakeServer;
    use crate::compositor::backend::FrameStep;
    use crate::compositor::window::{WindowClass, test_info};
    use crate::plugin::testing::{Log, RecordingPlugin};
    use crate::shared::Rect;

    fn screen_with(plugins: Vec<Box<dyn WindowHooks<u32>>>) -> Screen<RecordingBackend> {
        Screen::new(mirror(), RecordingBackend::default(), PluginSet::new(plugins))
    }

    #[test]
    fn test_translucent_window_over_background() {
        let mut server = FakeServer::new();
        let mut info = test_info(10, 10, 400, 300);
        info.mapped = true;
        info.opacity = Some(128 * 0x0101_0101);
        server.add_window(10, info);

        let mut screen = screen_with(Vec::new());
        screen.start(&server).unwrap();
        assert!(screen.wants_frame());
        screen.render_screen(&server).unwrap();

        let backend = screen.backend();
        assert_eq!(backend.background_uploads, 1);
        assert_eq!(
            backend.frames[0],
            vec![DrawnWindow {
                id: 10,
                rect: Rect::new(10, 10, 400, 300),
                mask_alpha: 0x8080,
                clip: vec![Rect::new(0, 0, 400, 300)],
            }]
        );
        assert!(!screen.wants_frame());
    }

    #[test]
    fn test_opacity_flip_keeps_contents() {
        let atoms = test_atoms();
        let mut server = FakeServer::new();
        let mut info = test_info(0, 0, 100, 100);
        info.mapped = true;
        server.add_window(10, info);
        let mut screen = screen_with(Vec::new());
        screen.start(&server).unwrap();
        screen.render_screen(&server).unwrap();

        let opacity = MirrorEvent::Property {
            window: 10,
            atom: atoms._NET_WM_WINDOW_OPACITY,
            deleted: false,
        };
        server.set_property(10, atoms._NET_WM_WINDOW_OPACITY, vec![0]);
        screen.handle_event(&server, &opacity).unwrap();
        screen.render_screen(&server).unwrap();
        server.set_property(10, atoms._NET_WM_WINDOW_OPACITY, vec![0xFFFF_FFFF]);
        screen.handle_event(&server, &opacity).unwrap();
        screen.render_screen(&server).unwrap();

        let backend = screen.backend();
        let alphas: Vec<u16> = backend.frames.iter().map(|f| f[0].mask_alpha).collect();
        assert_eq!(alphas, vec![0xFFFF, 0, 0xFFFF]);
        assert_eq!(backend.content_uploads, vec![10]);
    }

    #[test]
    fn test_root_pixmap_change_only_touches_background() {
        let atoms = test_atoms();
        let mut server = FakeServer::new();
        let mut info = test_info(0, 0, 100, 100);
        info.mapped = true;
        server.add_window(10, info);
        let mut screen = screen_with(Vec::new());
        screen.start(&server).unwrap();
        screen.render_screen(&server).unwrap();

        screen
            .handle_event(
                &server,
                &MirrorEvent::Property { window: ROOT, atom: atoms._XROOTPMAP_ID, deleted: false },
            )
            .unwrap();
        screen.render_screen(&server).unwrap();

        let backend = screen.backend();
        assert_eq!(backend.background_uploads, 2);
        assert_eq!(backend.content_uploads, vec![10]);
        assert_eq!(backend.frames.len(), 2);
    }

    #[test]
    fn test_outline_drawn_only_while_rect_set() {
        let atoms = test_atoms();
        let mut server = FakeServer::new();
        let mut screen = screen_with(Vec::new());
        screen.start(&server).unwrap();
        let rect_event = MirrorEvent::Property {
            window: ROOT,
            atom: atoms._FLUXBOX_RECONFIGURE_RECT,
            deleted: false,
        };

        server.set_property(ROOT, atoms._FLUXBOX_RECONFIGURE_RECT, vec![5, 5, 50, 40]);
        screen.handle_event(&server, &rect_event).unwrap();
        screen.render_screen(&server).unwrap();

        server.set_property(ROOT, atoms._FLUXBOX_RECONFIGURE_RECT, vec![5, 5, 50]);
        screen.handle_event(&server, &rect_event).unwrap();
        assert!(screen.wants_frame());
        screen.render_screen(&server).unwrap();

        assert_eq!(screen.backend().outlines, vec![Rect::new(5, 5, 50, 40)]);
        assert_eq!(screen.backend().frames.len(), 2);
    }

    #[test]
    fn test_plugins_see_lifecycle_with_surfaces() {
        let log = Log::default();
        let plugin = RecordingPlugin::new("p", log.clone());
        let server = {
            let mut server = FakeServer::new();
            server.add_window(10, test_info(0, 0, 100, 100));
            server
        };
        let mut screen = screen_with(vec![Box::new(plugin)]);
        screen.start(&server).unwrap();
        for event in [
            MirrorEvent::Map { window: 10 },
            MirrorEvent::Damage { window: 10 },
            MirrorEvent::Shape { window: 10 },
            MirrorEvent::Unmap { window: 10 },
            MirrorEvent::Destroy { window: 10 },
        ] {
            screen.handle_event(&server, &event).unwrap();
        }
        assert_eq!(
            *log.borrow(),
            vec![
                "p:created 10",
                "p:mapped 10",
                "p:damaged 10",
                "p:shape 10",
                "p:unmapped 10 surface=true",
                "p:destroyed 10 surface=true",
            ]
        );
        assert_eq!(screen.backend().released, vec![10]);
        assert!(screen.backend().surfaces.is_empty());
    }

    #[test]
    fn test_ignored_window_releases_surface() {
        let server = {
            let mut server = FakeServer::new();
            server.add_window(10, test_info(0, 0, 100, 100));
            server
        };
        let mut screen = screen_with(Vec::new());
        screen.start(&server).unwrap();
        assert!(screen.backend().surfaces.contains_key(&10));
        screen.ignore(10).unwrap();
        assert!(!screen.mirror.contains(10));
        assert_eq!(screen.backend().released, vec![10]);
    }

    #[test]
    fn test_animating_plugin_requests_frames() {
        let log = Log::default();
        let mut plugin = RecordingPlugin::new("p", log);
        plugin.animating = true;
        let server = FakeServer::new();
        let mut screen = screen_with(vec![Box::new(plugin)]);
        screen.start(&server).unwrap();
        screen.render_screen(&server).unwrap();
        assert!(!screen.mirror.is_dirty());
        assert!(screen.wants_frame());
    }

    #[test]
    fn test_input_only_window_has_no_surface_and_is_not_drawn() {
        let log = Log::default();
        let mut server = FakeServer::new();
        let mut info = test_info(0, 0, 100, 100);
        info.mapped = true;
        info.class = WindowClass::InputOnly;
        server.add_window(10, info);

        let mut screen = screen_with(vec![Box::new(RecordingPlugin::new("p", log.clone()))]);
        screen.start(&server).unwrap();
        screen.render_screen(&server).unwrap();

        screen.handle_event(&server, &MirrorEvent::Unmap { window: 10 }).unwrap();

        assert!(screen.backend().surfaces.is_empty());
        assert!(!screen.backend().steps[0].contains(&FrameStep::Window(10)));
        assert_eq!(*log.borrow(), vec!["p:created 10", "p:unmapped 10 surface=false"]);
    }
}
