//! Fade plugin
//!
//! Windows fade in when mapped and fade out when unmapped. A fade-out
//! keeps drawing the window's last textures or pictures, held through
//! their resource handles, until the fade completes.
//!
//! Argument: fade duration in milliseconds (default 200).

use std::collections::HashMap;

use anyhow::{Context, Result};
use tracing::trace;

use super::{LoadedPlugin, Plugin, PluginContext, PluginModule, PluginType, PicturePlugin, TexturePlugin, WindowHooks};
use crate::compositor::backend::picture::{MaskSpec, PictureOps, PictureSurface, XRenderJob};
use crate::compositor::backend::shaders::ShaderProgram;
use crate::compositor::backend::texture::{GlRenderingJob, TextureSurface};
use crate::compositor::resource::ResourceHandle;
use crate::compositor::ticks::{TickTracker, monotonic_micros};
use crate::compositor::window::WindowState;
use crate::shared::Rect;

pub const TEXTURE_MODULE: PluginModule = PluginModule {
    name: "opengl/fade",
    plugin_type: PluginType::Texture,
    create: create_texture_fade,
};

pub const PICTURE_MODULE: PluginModule = PluginModule {
    name: "xrender/fade",
    plugin_type: PluginType::Picture,
    create: create_picture_fade,
};

const DEFAULT_DURATION_MS: u64 = 200;
/// Distinct alpha levels a picture fade draws with
const MASK_STEPS: f32 = 32.0;
/// One tick per millisecond
const TICK_US: u64 = 1_000;

const FRAGMENT_SNIPPET: &str = "\
uniform float fade_Alpha;
void plugin_main() {
    fb_FragColor.a *= fade_Alpha;
}
";

fn create_texture_fade(context: &PluginContext) -> Result<LoadedPlugin> {
    let duration = parse_duration(&context.args)?;
    Ok(LoadedPlugin::Texture(Box::new(TextureFade {
        fades: Fades::new(duration),
    })))
}

fn create_picture_fade(context: &PluginContext) -> Result<LoadedPlugin> {
    let duration = parse_duration(&context.args)?;
    Ok(LoadedPlugin::Picture(Box::new(PictureFade {
        fades: Fades::new(duration),
        masks: MaskCache::default(),
    })))
}

fn parse_duration(args: &[String]) -> Result<u64> {
    match args.first() {
        None => Ok(DEFAULT_DURATION_MS),
        Some(arg) => arg
            .parse()
            .with_context(|| format!("fade duration {:?} is not a number of milliseconds", arg)),
    }
}

/// Opacity factor `elapsed_ms` into a fade lasting `duration_ms`.
pub fn fade_level(elapsed_ms: u64, duration_ms: u64, fading_in: bool) -> f32 {
    let progress = if duration_ms == 0 {
        1.0
    } else {
        (elapsed_ms as f32 / duration_ms as f32).min(1.0)
    };
    if fading_in { progress } else { 1.0 - progress }
}

/// Running fades: fade-ins by window, fade-outs as snapshots of what
/// the window looked like.
struct Fades<S> {
    duration_ms: u64,
    fading_in: HashMap<u32, TickTracker>,
    fading_out: Vec<(TickTracker, S)>,
}

impl<S> Fades<S> {
    fn new(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            fading_in: HashMap::new(),
            fading_out: Vec::new(),
        }
    }

    fn is_active(&self) -> bool {
        !self.fading_in.is_empty() || !self.fading_out.is_empty()
    }

    fn start_in_at(&mut self, window: u32, now_us: u64) {
        let mut timer = TickTracker::with_tick_size(TICK_US);
        timer.start_at(now_us);
        self.fading_in.insert(window, timer);
    }

    fn cancel_in(&mut self, window: u32) {
        self.fading_in.remove(&window);
    }

    fn start_out_at(&mut self, snapshot: S, now_us: u64) {
        let mut timer = TickTracker::with_tick_size(TICK_US);
        timer.start_at(now_us);
        self.fading_out.push((timer, snapshot));
    }

    /// Level of a window fading in, `None` when it is not.
    fn level_in_at(&self, window: u32, now_us: u64) -> Option<f32> {
        let timer = self.fading_in.get(&window)?;
        Some(fade_level(timer.total_at(now_us), self.duration_ms, true))
    }

    /// Fade-outs still running, with their levels.
    fn levels_out_at(&self, now_us: u64) -> impl Iterator<Item = (f32, &S)> {
        self.fading_out
            .iter()
            .filter(move |(timer, _)| timer.total_at(now_us) < self.duration_ms)
            .map(move |(timer, snapshot)| (fade_level(timer.total_at(now_us), self.duration_ms, false), snapshot))
    }

    /// Forget completed fades. Dropping a fade-out releases its snapshot.
    fn purge_at(&mut self, now_us: u64) {
        let duration = self.duration_ms;
        self.fading_in.retain(|_, timer| timer.total_at(now_us) < duration);
        let before = self.fading_out.len();
        self.fading_out.retain(|(timer, _)| timer.total_at(now_us) < duration);
        if before != self.fading_out.len() {
            trace!("{} fade-outs finished", before - self.fading_out.len());
        }
    }
}

/// Fade for the texture back-end: scales the fragment alpha through the
/// `fade_Alpha` uniform.
pub struct TextureFade {
    fades: Fades<Vec<GlRenderingJob>>,
}

impl Plugin for TextureFade {
    fn name(&self) -> &str {
        TEXTURE_MODULE.name
    }

    fn is_animating(&self) -> bool {
        self.fades.is_active()
    }
}

impl WindowHooks<TextureSurface> for TextureFade {
    fn window_mapped(&mut self, window: &WindowState, _surface: Option<&TextureSurface>) -> Result<()> {
        self.fades.start_in_at(window.id, monotonic_micros()?);
        Ok(())
    }

    fn window_unmapped(&mut self, window: &WindowState, surface: Option<&TextureSurface>) -> Result<()> {
        self.fades.cancel_in(window.id);
        let alpha = window.opacity() as f32 / 255.0;
        if let Some(jobs) = surface.map(|s| s.rendering_jobs(alpha)).filter(|j| !j.is_empty()) {
            self.fades.start_out_at(jobs, monotonic_micros()?);
        }
        Ok(())
    }

    fn window_destroyed(&mut self, window: &WindowState, _surface: Option<&TextureSurface>) -> Result<()> {
        self.fades.cancel_in(window.id);
        Ok(())
    }
}

impl TexturePlugin for TextureFade {
    fn fragment_shader(&self) -> Option<String> {
        Some(FRAGMENT_SNIPPET.to_string())
    }

    fn background_pre_render(&mut self, shader: &ShaderProgram) -> Result<()> {
        self.fades.purge_at(monotonic_micros()?);
        shader.set_uniform_f32("fade_Alpha", 1.0);
        Ok(())
    }

    fn window_pre_render(&mut self, window: &WindowState, _surface: &TextureSurface, shader: &ShaderProgram) -> Result<()> {
        if let Some(level) = self.fades.level_in_at(window.id, monotonic_micros()?) {
            shader.set_uniform_f32("fade_Alpha", level);
        }
        Ok(())
    }

    fn window_post_render(&mut self, _window: &WindowState, _surface: &TextureSurface, shader: &ShaderProgram) -> Result<()> {
        shader.set_uniform_f32("fade_Alpha", 1.0);
        Ok(())
    }

    fn extra_rendering_jobs(&mut self) -> Result<Vec<GlRenderingJob>> {
        let now = monotonic_micros()?;
        Ok(self
            .fades
            .levels_out_at(now)
            .flat_map(|(level, jobs)| {
                jobs.iter().map(move |job| GlRenderingJob {
                    alpha: job.alpha * level,
                    ..job.clone()
                })
            })
            .collect())
    }
}

/// What a picture fade-out keeps drawing.
struct PictureSnapshot {
    content: ResourceHandle,
    mask: MaskSpec,
    at: Rect,
}

/// Masks keyed by content. Entries not used for a whole frame are
/// dropped at the next [`MaskCache::next_frame`].
struct MaskCache<H> {
    current: HashMap<MaskSpec, H>,
    previous: HashMap<MaskSpec, H>,
}

impl<H> Default for MaskCache<H> {
    fn default() -> Self {
        Self {
            current: HashMap::new(),
            previous: HashMap::new(),
        }
    }
}

impl<H: Clone> MaskCache<H> {
    fn next_frame(&mut self) {
        self.previous = std::mem::take(&mut self.current);
    }

    fn get_or_create(&mut self, spec: MaskSpec, create: impl FnOnce(&MaskSpec) -> Result<H>) -> Result<H> {
        if let Some(mask) = self.current.get(&spec) {
            return Ok(mask.clone());
        }
        let mask = match self.previous.remove(&spec) {
            Some(mask) => mask,
            None => create(&spec)?,
        };
        self.current.insert(spec, mask.clone());
        Ok(mask)
    }

    fn len(&self) -> usize {
        self.current.len() + self.previous.len()
    }
}

/// Fade for the picture back-end: swaps in a mask with scaled alpha.
pub struct PictureFade {
    fades: Fades<PictureSnapshot>,
    masks: MaskCache<ResourceHandle>,
}

impl PictureFade {
    fn faded_mask(&mut self, spec: &MaskSpec, level: f32, ops: &PictureOps) -> Result<ResourceHandle> {
        let spec = spec.with_alpha(scaled(spec.alpha, level));
        self.masks.get_or_create(spec, |spec| ops.create_mask(spec))
    }
}

/// `alpha` scaled by `level`, with the level rounded to one of
/// `MASK_STEPS` steps so masks can be shared between frames.
fn scaled(alpha: u16, level: f32) -> u16 {
    let level = (level.clamp(0.0, 1.0) * MASK_STEPS).round() / MASK_STEPS;
    (alpha as f32 * level).round() as u16
}

impl Plugin for PictureFade {
    fn name(&self) -> &str {
        PICTURE_MODULE.name
    }

    fn is_animating(&self) -> bool {
        self.fades.is_active()
    }
}

impl WindowHooks<PictureSurface> for PictureFade {
    fn window_mapped(&mut self, window: &WindowState, _surface: Option<&PictureSurface>) -> Result<()> {
        self.fades.start_in_at(window.id, monotonic_micros()?);
        Ok(())
    }

    fn window_unmapped(&mut self, window: &WindowState, surface: Option<&PictureSurface>) -> Result<()> {
        self.fades.cancel_in(window.id);
        let Some(surface) = surface else {
            return Ok(());
        };
        if let (Some(content), Some(mask)) = (surface.content(), surface.mask_spec()) {
            let snapshot = PictureSnapshot {
                content: content.clone(),
                mask: mask.clone(),
                at: surface.placed_at(),
            };
            self.fades.start_out_at(snapshot, monotonic_micros()?);
        }
        Ok(())
    }

    fn window_destroyed(&mut self, window: &WindowState, _surface: Option<&PictureSurface>) -> Result<()> {
        self.fades.cancel_in(window.id);
        Ok(())
    }
}

impl PicturePlugin for PictureFade {
    fn background_pre_render(&mut self, _ops: &PictureOps) -> Result<Vec<XRenderJob>> {
        self.fades.purge_at(monotonic_micros()?);
        self.masks.next_frame();
        if !self.fades.is_active() {
            self.masks.next_frame();
        }
        trace!("{} fade masks cached", self.masks.len());
        Ok(Vec::new())
    }

    fn window_pre_render(
        &mut self,
        window: &WindowState,
        surface: &PictureSurface,
        ops: &PictureOps,
        job: &mut XRenderJob,
    ) -> Result<Vec<XRenderJob>> {
        if let Some(level) = self.fades.level_in_at(window.id, monotonic_micros()?) {
            let spec = surface
                .mask_spec()
                .cloned()
                .unwrap_or_else(|| MaskSpec::for_window(window));
            job.mask = Some(self.faded_mask(&spec, level, ops)?);
        }
        Ok(Vec::new())
    }

    fn extra_rendering_jobs(&mut self, ops: &PictureOps) -> Result<Vec<XRenderJob>> {
        let now = monotonic_micros()?;
        let fading: Vec<(f32, MaskSpec, ResourceHandle, Rect)> = self
            .fades
            .levels_out_at(now)
            .map(|(level, snapshot)| (level, snapshot.mask.clone(), snapshot.content.clone(), snapshot.at))
            .collect();
        let mut jobs = Vec::with_capacity(fading.len());
        for (level, spec, content, at) in fading {
            let mask = self.faded_mask(&spec, level, ops)?;
            jobs.push(XRenderJob::over(content, Some(mask), at));
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::window::test_info;

    #[test]
    fn test_fade_levels() {
        assert_eq!(fade_level(0, 200, true), 0.0);
        assert_eq!(fade_level(100, 200, true), 0.5);
        assert_eq!(fade_level(500, 200, true), 1.0);
        assert_eq!(fade_level(50, 200, false), 0.75);
        assert_eq!(fade_level(200, 200, false), 0.0);
        assert_eq!(fade_level(0, 0, true), 1.0);
    }

    #[test]
    fn test_duration_argument() {
        assert_eq!(parse_duration(&[]).unwrap(), DEFAULT_DURATION_MS);
        assert_eq!(parse_duration(&["350".to_string()]).unwrap(), 350);
        assert!(parse_duration(&["soon".to_string()]).is_err());
    }

    #[test]
    fn test_fade_in_runs_until_duration() {
        let mut fades: Fades<()> = Fades::new(100);
        fades.start_in_at(10, 1_000_000);
        assert!(fades.is_active());
        assert_eq!(fades.level_in_at(10, 1_050_000), Some(0.5));
        assert_eq!(fades.level_in_at(11, 1_050_000), None);

        fades.purge_at(1_099_000);
        assert!(fades.is_active());
        fades.purge_at(1_100_000);
        assert!(!fades.is_active());
        assert_eq!(fades.level_in_at(10, 1_100_000), None);
    }

    #[test]
    fn test_unmap_cancels_fade_in() {
        let mut fades: Fades<()> = Fades::new(100);
        fades.start_in_at(10, 0);
        fades.cancel_in(10);
        assert!(!fades.is_active());
    }

    #[test]
    fn test_fade_out_snapshots_expire() {
        let mut fades = Fades::new(200);
        fades.start_out_at("a", 0);
        fades.start_out_at("b", 100_000);

        let levels: Vec<(f32, &&str)> = fades.levels_out_at(150_000).collect();
        assert_eq!(levels, vec![(0.25, &"a"), (0.75, &"b")]);

        let levels: Vec<(f32, &&str)> = fades.levels_out_at(250_000).collect();
        assert_eq!(levels, vec![(0.25, &"b")]);

        fades.purge_at(250_000);
        assert_eq!(fades.fading_out.len(), 1);
        fades.purge_at(300_000);
        assert!(!fades.is_active());
    }

    #[test]
    fn test_mapping_starts_animation() {
        let module = TEXTURE_MODULE;
        let context = PluginContext { screen: 0, args: vec!["100".into()] };
        let LoadedPlugin::Texture(mut plugin) = (module.create)(&context).unwrap() else {
            panic!("texture fade built a picture plugin");
        };
        assert!(!plugin.is_animating());
        let window = WindowState::new(10, test_info(0, 0, 50, 50));
        plugin.window_mapped(&window, None).unwrap();
        assert!(plugin.is_animating());
        plugin.window_destroyed(&window, None).unwrap();
        assert!(!plugin.is_animating());
    }

    #[test]
    fn test_unmap_without_surface_does_not_fade_out() {
        let context = PluginContext { screen: 0, args: vec![] };
        let LoadedPlugin::Picture(mut plugin) = (PICTURE_MODULE.create)(&context).unwrap() else {
            panic!("picture fade built a texture plugin");
        };
        let window = WindowState::new(10, test_info(0, 0, 50, 50));
        plugin.window_unmapped(&window, None).unwrap();
        assert!(!plugin.is_animating());
    }

    #[test]
    fn test_scaled_mask_alpha() {
        assert_eq!(scaled(0xFFFF, 0.5), 0x8000);
        assert_eq!(scaled(0x8080, 0.0), 0);
        assert_eq!(scaled(0x8080, 1.0), 0x8080);
        // Nearby levels share a step
        assert_eq!(scaled(0xFFFF, 0.501), scaled(0xFFFF, 0.5));
        assert_ne!(scaled(0xFFFF, 0.6), scaled(0xFFFF, 0.5));
    }

    fn spec(alpha: u16) -> MaskSpec {
        MaskSpec {
            width: 10,
            height: 10,
            alpha,
            rects: vec![Rect::new(0, 0, 10, 10)],
        }
    }

    #[test]
    fn test_mask_cache_reuses_masks_across_frames() {
        let mut cache: MaskCache<u32> = MaskCache::default();
        let mut created = 0;
        let mut create = |_: &MaskSpec| {
            created += 1;
            Ok(created)
        };

        assert_eq!(cache.get_or_create(spec(0x8000), &mut create).unwrap(), 1);
        assert_eq!(cache.get_or_create(spec(0x8000), &mut create).unwrap(), 1);
        assert_eq!(cache.get_or_create(spec(0x4000), &mut create).unwrap(), 2);

        cache.next_frame();
        assert_eq!(cache.get_or_create(spec(0x8000), &mut create).unwrap(), 1);
        assert_eq!(created, 2);
    }

    #[test]
    fn test_mask_cache_drops_unused_masks() {
        let mut cache: MaskCache<u32> = MaskCache::default();
        cache.get_or_create(spec(0x8000), |_| Ok(7)).unwrap();
        cache.next_frame();
        assert_eq!(cache.len(), 1);
        cache.next_frame();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get_or_create(spec(0x8000), |_| Ok(8)).unwrap(), 8);
    }
}
