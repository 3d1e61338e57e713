//! Plugin runtime
//!
//! Plugins are built-in modules registered by name. Each module carries a
//! type tag saying which back-end it draws for, and a factory that builds
//! an instance for one screen from its argument list. Instances are
//! called in load order; a failing callback is logged and the plugin sits
//! out the rest of that frame.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compositor::backend::BackendKind;
use crate::compositor::backend::picture::{PictureOps, PictureSurface, XRenderJob};
use crate::compositor::backend::shaders::ShaderProgram;
use crate::compositor::backend::texture::{GlRenderingJob, TextureSurface};
use crate::compositor::window::WindowState;
use crate::error::CompositorError;
use crate::shared::Rect;

pub mod fade;

/// Callbacks shared by every plugin.
pub trait Plugin {
    fn name(&self) -> &str;

    /// Keep frames coming even when nothing on screen changed.
    fn is_animating(&self) -> bool {
        false
    }

    fn root_pixmap_changed(&mut self) -> Result<()> {
        Ok(())
    }

    fn root_window_resized(&mut self, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }
}

/// Window lifecycle callbacks, given the window's back-end surface when
/// it has one.
#[allow(unused_variables)]
pub trait WindowHooks<S>: Plugin {
    fn window_created(&mut self, window: &WindowState, surface: Option<&S>) -> Result<()> {
        Ok(())
    }

    fn window_mapped(&mut self, window: &WindowState, surface: Option<&S>) -> Result<()> {
        Ok(())
    }

    fn window_unmapped(&mut self, window: &WindowState, surface: Option<&S>) -> Result<()> {
        Ok(())
    }

    fn window_damaged(&mut self, window: &WindowState, surface: Option<&S>) -> Result<()> {
        Ok(())
    }

    fn window_destroyed(&mut self, window: &WindowState, surface: Option<&S>) -> Result<()> {
        Ok(())
    }

    fn window_property_changed(&mut self, window: &WindowState, surface: Option<&S>, atom: u32) -> Result<()> {
        Ok(())
    }

    fn window_shape_changed(&mut self, window: &WindowState, surface: Option<&S>) -> Result<()> {
        Ok(())
    }

    fn window_reconfigured(&mut self, window: &WindowState, surface: Option<&S>) -> Result<()> {
        Ok(())
    }
}

/// Hooks of a plugin drawing through the texture back-end.
///
/// Snippets returned by [`vertex_shader`](Self::vertex_shader) and
/// [`fragment_shader`](Self::fragment_shader) define `void plugin_main()`;
/// the runtime renames it per plugin and calls it after the core stage.
#[allow(unused_variables)]
pub trait TexturePlugin: WindowHooks<TextureSurface> {
    fn vertex_shader(&self) -> Option<String> {
        None
    }

    fn fragment_shader(&self) -> Option<String> {
        None
    }

    fn background_pre_render(&mut self, shader: &ShaderProgram) -> Result<()> {
        Ok(())
    }

    fn background_post_render(&mut self, shader: &ShaderProgram) -> Result<()> {
        Ok(())
    }

    fn window_pre_render(&mut self, window: &WindowState, surface: &TextureSurface, shader: &ShaderProgram) -> Result<()> {
        Ok(())
    }

    fn window_post_render(&mut self, window: &WindowState, surface: &TextureSurface, shader: &ShaderProgram) -> Result<()> {
        Ok(())
    }

    fn rect_pre_render(&mut self, rect: Rect, shader: &ShaderProgram) -> Result<()> {
        Ok(())
    }

    fn rect_post_render(&mut self, rect: Rect, shader: &ShaderProgram) -> Result<()> {
        Ok(())
    }

    fn extra_rendering_jobs(&mut self) -> Result<Vec<GlRenderingJob>> {
        Ok(Vec::new())
    }
}

/// Hooks of a plugin drawing through the picture back-end. Every hook may
/// return jobs, executed in place against the back buffer.
#[allow(unused_variables)]
pub trait PicturePlugin: WindowHooks<PictureSurface> {
    fn background_pre_render(&mut self, ops: &PictureOps) -> Result<Vec<XRenderJob>> {
        Ok(Vec::new())
    }

    fn background_post_render(&mut self, ops: &PictureOps) -> Result<Vec<XRenderJob>> {
        Ok(Vec::new())
    }

    /// May rewrite the window's own job (e.g. swap its mask).
    fn window_pre_render(
        &mut self,
        window: &WindowState,
        surface: &PictureSurface,
        ops: &PictureOps,
        job: &mut XRenderJob,
    ) -> Result<Vec<XRenderJob>> {
        Ok(Vec::new())
    }

    fn window_post_render(&mut self, window: &WindowState, surface: &PictureSurface, ops: &PictureOps) -> Result<Vec<XRenderJob>> {
        Ok(Vec::new())
    }

    fn rect_pre_render(&mut self, rect: Rect, ops: &PictureOps) -> Result<Vec<XRenderJob>> {
        Ok(Vec::new())
    }

    fn rect_post_render(&mut self, rect: Rect, ops: &PictureOps) -> Result<Vec<XRenderJob>> {
        Ok(Vec::new())
    }

    fn extra_rendering_jobs(&mut self, ops: &PictureOps) -> Result<Vec<XRenderJob>> {
        Ok(Vec::new())
    }
}

/// Back-end a plugin module targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginType {
    Texture,
    Picture,
}

impl PluginType {
    pub fn matches(&self, backend: BackendKind) -> bool {
        matches!(
            (self, backend),
            (PluginType::Texture, BackendKind::OpenGl) | (PluginType::Picture, BackendKind::XRender)
        )
    }
}

/// A constructed plugin instance.
pub enum LoadedPlugin {
    Texture(Box<dyn TexturePlugin>),
    Picture(Box<dyn PicturePlugin>),
}

impl LoadedPlugin {
    pub fn plugin_type(&self) -> PluginType {
        match self {
            LoadedPlugin::Texture(_) => PluginType::Texture,
            LoadedPlugin::Picture(_) => PluginType::Picture,
        }
    }
}

/// What a factory is given.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub screen: usize,
    pub args: Vec<String>,
}

/// Plugin name plus its arguments, as written `NAME[:ARG,ARG...]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl PluginSpec {
    pub fn parse(spec: &str) -> Result<Self, CompositorError> {
        let (name, args) = match spec.split_once(':') {
            Some((name, args)) => (
                name,
                args.split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(String::from)
                    .collect(),
            ),
            None => (spec, Vec::new()),
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(CompositorError::config(format!("empty plugin name in {:?}", spec)));
        }
        Ok(Self { name: name.to_string(), args })
    }
}

/// A registered module.
pub struct PluginModule {
    pub name: &'static str,
    pub plugin_type: PluginType,
    pub create: fn(&PluginContext) -> Result<LoadedPlugin>,
}

/// Modules keyed by name.
pub struct PluginRegistry {
    modules: Vec<PluginModule>,
}

impl PluginRegistry {
    pub fn empty() -> Self {
        Self { modules: Vec::new() }
    }

    /// Registry holding the built-in modules
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(fade::TEXTURE_MODULE);
        registry.register(fade::PICTURE_MODULE);
        registry
    }

    pub fn register(&mut self, module: PluginModule) {
        debug!("Registered plugin module {}", module.name);
        self.modules.push(module);
    }

    fn find(&self, name: &str) -> Option<&PluginModule> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Resolve `name` as `<backend>/<name>`, then as the bare name.
    ///
    /// `Ok(None)` when no module has that name; an error when the module
    /// targets another back-end.
    pub fn resolve(&self, name: &str, backend: BackendKind) -> Result<Option<&PluginModule>, CompositorError> {
        let qualified = format!("{}/{}", backend.name(), name);
        let Some(module) = self.find(&qualified).or_else(|| self.find(name)) else {
            return Ok(None);
        };
        if !module.plugin_type.matches(backend) {
            return Err(CompositorError::config(format!(
                "plugin {} is a {:?} plugin and cannot run on the {} backend",
                module.name, module.plugin_type, backend
            )));
        }
        Ok(Some(module))
    }

    /// Build every requested plugin for one screen, in request order.
    /// Unknown names are skipped with a warning.
    pub fn instantiate(&self, specs: &[PluginSpec], backend: BackendKind, screen: usize) -> Result<Vec<LoadedPlugin>> {
        let mut loaded = Vec::with_capacity(specs.len());
        for spec in specs {
            let Some(module) = self.resolve(&spec.name, backend)? else {
                warn!("No plugin module named {}, skipping", spec.name);
                continue;
            };
            let context = PluginContext {
                screen,
                args: spec.args.clone(),
            };
            let plugin = (module.create)(&context).map_err(|e| CompositorError::Plugin {
                plugin: module.name.to_string(),
                message: format!("{:#}", e),
            })?;
            if plugin.plugin_type() != module.plugin_type {
                return Err(CompositorError::config(format!(
                    "plugin {} built a {:?} plugin but is tagged {:?}",
                    module.name,
                    plugin.plugin_type(),
                    module.plugin_type
                ))
                .into());
            }
            info!("Loaded plugin {} on screen {} (args: {:?})", module.name, screen, spec.args);
            loaded.push(plugin);
        }
        Ok(loaded)
    }

    /// Texture instances, failing on any other kind.
    pub fn texture_plugins(loaded: Vec<LoadedPlugin>) -> Result<PluginSet<dyn TexturePlugin>> {
        let mut plugins = Vec::with_capacity(loaded.len());
        for plugin in loaded {
            match plugin {
                LoadedPlugin::Texture(p) => plugins.push(p),
                LoadedPlugin::Picture(p) => {
                    return Err(CompositorError::config(format!(
                        "plugin {} targets the picture backend",
                        p.name()
                    ))
                    .into());
                }
            }
        }
        Ok(PluginSet::new(plugins))
    }

    /// Picture instances, failing on any other kind.
    pub fn picture_plugins(loaded: Vec<LoadedPlugin>) -> Result<PluginSet<dyn PicturePlugin>> {
        let mut plugins = Vec::with_capacity(loaded.len());
        for plugin in loaded {
            match plugin {
                LoadedPlugin::Picture(p) => plugins.push(p),
                LoadedPlugin::Texture(p) => {
                    return Err(CompositorError::config(format!(
                        "plugin {} targets the texture backend",
                        p.name()
                    ))
                    .into());
                }
            }
        }
        Ok(PluginSet::new(plugins))
    }
}

/// Loaded plugins of one screen, in load order.
pub struct PluginSet<P: ?Sized> {
    plugins: Vec<Box<P>>,
    skipped: Vec<bool>,
}

impl<P: Plugin + ?Sized> PluginSet<P> {
    pub fn new(plugins: Vec<Box<P>>) -> Self {
        let skipped = vec![false; plugins.len()];
        Self { plugins, skipped }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &P> {
        self.plugins.iter().map(|p| p.as_ref())
    }

    pub fn is_animating(&self) -> bool {
        self.plugins.iter().any(|p| p.is_animating())
    }

    /// Re-admit plugins that failed during the previous frame.
    pub fn begin_frame(&mut self) {
        self.skipped.iter_mut().for_each(|s| *s = false);
    }

    /// Call `hook` on every plugin not skipped this frame.
    pub fn dispatch(&mut self, hook: &str, mut call: impl FnMut(&mut P) -> Result<()>) {
        for (plugin, skipped) in self.plugins.iter_mut().zip(self.skipped.iter_mut()) {
            if *skipped {
                continue;
            }
            if let Err(e) = call(plugin.as_mut()) {
                let error = CompositorError::Plugin {
                    plugin: plugin.name().to_string(),
                    message: format!("{} hook: {:#}", hook, e),
                };
                warn!("{}", error);
                *skipped = true;
            }
        }
    }

    /// Like [`dispatch`](Self::dispatch), concatenating what each plugin returns.
    pub fn collect<J>(&mut self, hook: &str, mut call: impl FnMut(&mut P) -> Result<Vec<J>>) -> Vec<J> {
        let mut jobs = Vec::new();
        self.dispatch(hook, |plugin| {
            jobs.extend(call(plugin)?);
            Ok(())
        });
        jobs
    }
}
