//! GLX context on a private Xlib display
//!
//! The texture back-end talks GLX through x11-dl on its own Xlib
//! connection. Server-side ids (pixmaps, windows) are shared with the
//! x11rb connection, so the caller must flush x11rb before handing a
//! pixmap over here.

use std::ffi::{CStr, CString, c_ulong};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use anyhow::{Context, Result};
use tracing::{debug, error, info, trace, warn};
use x11_dl::glx::{self, Glx};
use x11_dl::xlib::{self, Xlib};

use crate::error::{CompositorError, XErrorSeverity, classify_error_code};

// GLX_EXT_texture_from_pixmap
const GLX_BIND_TO_TEXTURE_RGB_EXT: i32 = 0x20D0;
const GLX_BIND_TO_TEXTURE_RGBA_EXT: i32 = 0x20D1;
const GLX_BIND_TO_MIPMAP_TEXTURE_EXT: i32 = 0x20D2;
const GLX_BIND_TO_TEXTURE_TARGETS_EXT: i32 = 0x20D3;
const GLX_Y_INVERTED_EXT: i32 = 0x20D4;
const GLX_TEXTURE_FORMAT_EXT: i32 = 0x20D5;
const GLX_TEXTURE_TARGET_EXT: i32 = 0x20D6;
const GLX_MIPMAP_TEXTURE_EXT: i32 = 0x20D7;
const GLX_TEXTURE_FORMAT_RGB_EXT: i32 = 0x20D9;
const GLX_TEXTURE_FORMAT_RGBA_EXT: i32 = 0x20DA;
const GLX_TEXTURE_2D_BIT_EXT: i32 = 0x0002;
const GLX_TEXTURE_2D_EXT: i32 = 0x20DC;
const GLX_FRONT_LEFT_EXT: i32 = 0x20DE;

/// `glXChooseFBConfig` attributes of the rendering window's config.
fn window_config_attribs(double_buffered: bool, alpha_size: i32) -> [i32; 15] {
    [
        glx::GLX_DRAWABLE_TYPE, glx::GLX_WINDOW_BIT,
        glx::GLX_RENDER_TYPE, glx::GLX_RGBA_BIT,
        glx::GLX_DOUBLEBUFFER, double_buffered as i32,
        glx::GLX_RED_SIZE, 8,
        glx::GLX_GREEN_SIZE, 8,
        glx::GLX_BLUE_SIZE, 8,
        glx::GLX_ALPHA_SIZE, alpha_size,
        0,
    ]
}

// Error state shared with the Xlib error handler
static ERROR_TRAP_ACTIVE: AtomicBool = AtomicBool::new(false);
static TRAPPED_ERROR: AtomicI32 = AtomicI32::new(0);
static FATAL_ERROR: AtomicI32 = AtomicI32::new(0);
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

unsafe extern "C" fn x_error_handler(_display: *mut xlib::Display, event: *mut xlib::XErrorEvent) -> i32 {
    if event.is_null() {
        return 0;
    }
    let (code, request, minor) = unsafe { ((*event).error_code, (*event).request_code, (*event).minor_code) };

    if ERROR_TRAP_ACTIVE.load(Ordering::Relaxed) {
        trace!("Trapped X error {} (request {}.{})", code, request, minor);
        TRAPPED_ERROR.store(code as i32, Ordering::Relaxed);
        return 0;
    }
    match classify_error_code(code) {
        XErrorSeverity::Transient => {
            debug!("Ignoring X error {} (request {}.{}) on a vanished resource", code, request, minor);
        }
        XErrorSeverity::Fatal => {
            error!("X error {} (request {}.{})", code, request, minor);
            FATAL_ERROR.store(code as i32, Ordering::Relaxed);
        }
    }
    // Handled; keeps Xlib from exiting the process
    0
}

/// A fatal X error seen on the GLX connection since the last call.
pub fn take_fatal_error() -> Option<u8> {
    match FATAL_ERROR.swap(0, Ordering::Relaxed) {
        0 => None,
        code => Some(code as u8),
    }
}

type TexImageFn = unsafe extern "C" fn(*mut xlib::Display, c_ulong, i32, *const i32);
type SwapIntervalFn = unsafe extern "C" fn(*mut xlib::Display, c_ulong, i32);

/// Pixmap FBConfig for one depth
#[derive(Clone, Copy)]
struct DepthFBConfig {
    fb_config: glx::GLXFBConfig,
    texture_format: i32,
    y_inverted: bool,
}

pub struct GlContext {
    glx: Glx,
    xlib: Xlib,
    display: *mut xlib::Display,
    context: glx::GLXContext,
    window: c_ulong,
    colormap: c_ulong,
    screen_num: i32,
    double_buffered: bool,
    window_config: glx::GLXFBConfig,
    depth_configs: [Option<DepthFBConfig>; 33],
    bind_tex_image: TexImageFn,
    release_tex_image: TexImageFn,
}

impl GlContext {
    /// Open the side connection, pick a framebuffer configuration (double
    /// buffered when one exists), create the rendering window as a child
    /// of `parent` and make a context current on it.
    pub fn new(display_name: Option<&str>, screen_num: usize, parent: u32, width: u32, height: u32) -> Result<Self> {
        let xlib = Xlib::open().context("Failed to load libX11")?;
        let glx = Glx::open().context("Failed to load libGL")?;

        let name = display_name.map(CString::new).transpose()?;
        let display = unsafe { (xlib.XOpenDisplay)(name.as_ref().map_or(ptr::null(), |n| n.as_ptr())) };
        if display.is_null() {
            return Err(CompositorError::init("cannot open the X display for GLX").into());
        }
        if !HANDLER_INSTALLED.swap(true, Ordering::Relaxed) {
            unsafe { (xlib.XSetErrorHandler)(Some(x_error_handler)) };
        }

        // From here on failures must close the display
        match Self::setup(&xlib, &glx, display, screen_num as i32, parent, width, height) {
            Ok(parts) => {
                let mut ctx = Self {
                    glx,
                    xlib,
                    display,
                    context: parts.context,
                    window: parts.window,
                    colormap: parts.colormap,
                    screen_num: screen_num as i32,
                    double_buffered: parts.double_buffered,
                    window_config: parts.config,
                    depth_configs: [None; 33],
                    bind_tex_image: parts.bind_tex_image,
                    release_tex_image: parts.release_tex_image,
                };
                ctx.initialize_depth_configs();
                Ok(ctx)
            }
            Err(e) => {
                unsafe { (xlib.XCloseDisplay)(display) };
                Err(e)
            }
        }
    }

    fn setup(
        xlib: &Xlib,
        glx: &Glx,
        display: *mut xlib::Display,
        screen_num: i32,
        parent: u32,
        width: u32,
        height: u32,
    ) -> Result<SetupParts> {
        let (mut major, mut minor) = (0, 0);
        if unsafe { (glx.glXQueryVersion)(display, &mut major, &mut minor) } == 0 {
            return Err(CompositorError::config("GLX is not available").into());
        }
        info!("GLX version {}.{}", major, minor);
        if (major, minor) < (1, 3) {
            return Err(CompositorError::config(format!("GLX {}.{} is older than the required 1.3", major, minor)).into());
        }

        let extensions = unsafe {
            let s = (glx.glXQueryExtensionsString)(display, screen_num);
            if s.is_null() {
                String::new()
            } else {
                CStr::from_ptr(s).to_string_lossy().into_owned()
            }
        };
        if !extensions.split_whitespace().any(|e| e == "GLX_EXT_texture_from_pixmap") {
            return Err(CompositorError::config("GLX_EXT_texture_from_pixmap is not supported").into());
        }

        let (config, double_buffered) = Self::choose_window_config(xlib, glx, display, screen_num)
            .ok_or_else(|| CompositorError::init("no usable GLX framebuffer configuration"))?;
        info!("Using {} GLX framebuffer", if double_buffered { "double-buffered" } else { "single-buffered" });

        let vinfo = unsafe { (glx.glXGetVisualFromFBConfig)(display, config) };
        if vinfo.is_null() {
            return Err(CompositorError::init("framebuffer configuration has no visual").into());
        }

        let (window, colormap) = unsafe {
            let colormap = (xlib.XCreateColormap)(display, parent as c_ulong, (*vinfo).visual, xlib::AllocNone);
            let mut attrs: xlib::XSetWindowAttributes = std::mem::zeroed();
            attrs.colormap = colormap;
            attrs.border_pixel = 0;
            let window = (xlib.XCreateWindow)(
                display,
                parent as c_ulong,
                0,
                0,
                width.max(1),
                height.max(1),
                0,
                (*vinfo).depth,
                xlib::InputOutput as u32,
                (*vinfo).visual,
                xlib::CWColormap | xlib::CWBorderPixel,
                &mut attrs,
            );
            (xlib.XFree)(vinfo as *mut _);
            (xlib.XMapWindow)(display, window);
            (xlib.XSync)(display, 0);
            (window, colormap)
        };
        debug!("Created GLX rendering window 0x{:x}", window);

        let context = unsafe { (glx.glXCreateNewContext)(display, config, glx::GLX_RGBA_TYPE, ptr::null_mut(), 1) };
        if context.is_null() {
            unsafe {
                (xlib.XDestroyWindow)(display, window);
                (xlib.XFreeColormap)(display, colormap);
            }
            return Err(CompositorError::init("glXCreateNewContext failed").into());
        }
        if unsafe { (glx.glXMakeCurrent)(display, window, context) } == 0 {
            unsafe {
                (glx.glXDestroyContext)(display, context);
                (xlib.XDestroyWindow)(display, window);
                (xlib.XFreeColormap)(display, colormap);
            }
            return Err(CompositorError::init("glXMakeCurrent failed on the rendering window").into());
        }

        let proc_address = |name: &str| -> Option<unsafe extern "C" fn()> {
            let symbol = CString::new(name).ok()?;
            unsafe { (glx.glXGetProcAddress)(symbol.as_ptr() as *const _) }
        };

        gl::load_with(|symbol| proc_address(symbol).map_or(ptr::null(), |f| f as *const _));

        let (Some(bind), Some(release)) = (proc_address("glXBindTexImageEXT"), proc_address("glXReleaseTexImageEXT"))
        else {
            unsafe {
                (glx.glXDestroyContext)(display, context);
                (xlib.XDestroyWindow)(display, window);
                (xlib.XFreeColormap)(display, colormap);
            }
            return Err(CompositorError::config("GLX_EXT_texture_from_pixmap entry points missing").into());
        };
        let (bind_tex_image, release_tex_image): (TexImageFn, TexImageFn) =
            unsafe { (std::mem::transmute(bind), std::mem::transmute(release)) };

        if double_buffered {
            match proc_address("glXSwapIntervalEXT") {
                Some(f) => unsafe {
                    let swap_interval: SwapIntervalFn = std::mem::transmute(f);
                    swap_interval(display, window, 1);
                },
                None => warn!("glXSwapIntervalEXT not supported, frames are not synced to vblank"),
            }
        }

        Ok(SetupParts {
            context,
            window,
            colormap,
            config,
            double_buffered,
            bind_tex_image,
            release_tex_image,
        })
    }

    /// First RGBA8 window config with a visual, double-buffered preferred.
    /// Configs without destination alpha are taken only when no RGBA8
    /// config exists.
    fn choose_window_config(
        xlib: &Xlib,
        glx: &Glx,
        display: *mut xlib::Display,
        screen_num: i32,
    ) -> Option<(glx::GLXFBConfig, bool)> {
        for (double_buffered, alpha_size) in [(true, 8), (false, 8), (true, 0), (false, 0)] {
            let attribs = window_config_attribs(double_buffered, alpha_size);
            let mut count = 0;
            let configs = unsafe { (glx.glXChooseFBConfig)(display, screen_num, attribs.as_ptr(), &mut count) };
            if configs.is_null() {
                continue;
            }
            let found = (0..count as usize).map(|i| unsafe { *configs.add(i) }).find(|&config| {
                let vinfo = unsafe { (glx.glXGetVisualFromFBConfig)(display, config) };
                if vinfo.is_null() {
                    return false;
                }
                unsafe { (xlib.XFree)(vinfo as *mut _) };
                true
            });
            unsafe { (xlib.XFree)(configs as *mut _) };
            if let Some(config) = found {
                return Some((config, double_buffered));
            }
        }
        None
    }

    /// Best texture-from-pixmap config per pixmap depth: bindable as
    /// RGB(A), then fewest extras (double buffer, stencil, depth).
    fn initialize_depth_configs(&mut self) {
        let attribs = [
            glx::GLX_DRAWABLE_TYPE, glx::GLX_PIXMAP_BIT,
            glx::GLX_RENDER_TYPE, glx::GLX_RGBA_BIT,
            GLX_BIND_TO_TEXTURE_TARGETS_EXT, GLX_TEXTURE_2D_BIT_EXT,
            0,
        ];
        let mut count = 0;
        let configs = unsafe { (self.glx.glXChooseFBConfig)(self.display, self.screen_num, attribs.as_ptr(), &mut count) };
        if configs.is_null() {
            warn!("No pixmap-capable GLX configs; window textures will fail");
            return;
        }
        let configs_slice: Vec<glx::GLXFBConfig> = (0..count as usize).map(|i| unsafe { *configs.add(i) }).collect();

        for depth in [15u8, 16, 24, 30, 32] {
            let mut best: Option<(DepthFBConfig, (i32, i32, i32))> = None;
            for &config in &configs_slice {
                let vinfo = unsafe { (self.glx.glXGetVisualFromFBConfig)(self.display, config) };
                if vinfo.is_null() {
                    continue;
                }
                let visual_depth = unsafe { (*vinfo).depth };
                unsafe { (self.xlib.XFree)(vinfo as *mut _) };
                if visual_depth != depth as i32 {
                    continue;
                }

                let texture_format = if depth == 32 {
                    if self.fb_attrib(config, GLX_BIND_TO_TEXTURE_RGBA_EXT) == 0 {
                        continue;
                    }
                    GLX_TEXTURE_FORMAT_RGBA_EXT
                } else {
                    if self.fb_attrib(config, GLX_BIND_TO_TEXTURE_RGB_EXT) == 0 {
                        continue;
                    }
                    GLX_TEXTURE_FORMAT_RGB_EXT
                };

                let cost = (
                    self.fb_attrib(config, glx::GLX_DOUBLEBUFFER),
                    self.fb_attrib(config, glx::GLX_STENCIL_SIZE),
                    self.fb_attrib(config, glx::GLX_DEPTH_SIZE),
                );
                if best.as_ref().is_some_and(|(_, best_cost)| cost >= *best_cost) {
                    continue;
                }
                best = Some((
                    DepthFBConfig {
                        fb_config: config,
                        texture_format,
                        y_inverted: self.fb_attrib(config, GLX_Y_INVERTED_EXT) != 0,
                    },
                    cost,
                ));
            }
            if let Some((config, _)) = best {
                debug!(
                    "Pixmap config for depth {}: mipmap={}, y_inverted={}",
                    depth,
                    self.fb_attrib(config.fb_config, GLX_BIND_TO_MIPMAP_TEXTURE_EXT) != 0,
                    config.y_inverted
                );
                self.depth_configs[depth as usize] = Some(config);
            }
        }
        unsafe { (self.xlib.XFree)(configs as *mut _) };
    }

    fn fb_attrib(&self, config: glx::GLXFBConfig, attrib: i32) -> i32 {
        let mut value = 0;
        unsafe { (self.glx.glXGetFBConfigAttrib)(self.display, config, attrib, &mut value) };
        value
    }

    fn config_for_depth(&self, depth: u8) -> DepthFBConfig {
        self.depth_configs
            .get(depth as usize)
            .copied()
            .flatten()
            .unwrap_or(DepthFBConfig {
                fb_config: self.window_config,
                texture_format: if depth == 32 { GLX_TEXTURE_FORMAT_RGBA_EXT } else { GLX_TEXTURE_FORMAT_RGB_EXT },
                y_inverted: false,
            })
    }

    /// Whether textures bound from pixmaps of `depth` have their first
    /// row at `t = 0`.
    pub fn is_y_inverted(&self, depth: u8) -> bool {
        self.config_for_depth(depth).y_inverted
    }

    pub fn rendering_window(&self) -> u32 {
        self.window as u32
    }

    pub fn is_double_buffered(&self) -> bool {
        self.double_buffered
    }

    /// Make this context current unless it already is.
    pub fn make_current(&self) -> Result<()> {
        if unsafe { (self.glx.glXGetCurrentContext)() } == self.context {
            return Ok(());
        }
        if unsafe { (self.glx.glXMakeCurrent)(self.display, self.window, self.context) } == 0 {
            anyhow::bail!("glXMakeCurrent failed");
        }
        Ok(())
    }

    pub fn resize(&self, width: u32, height: u32) {
        unsafe {
            (self.xlib.XResizeWindow)(self.display, self.window, width.max(1), height.max(1));
            (self.xlib.XSync)(self.display, 0);
        }
    }

    /// Show the frame: swap when double-buffered, flush otherwise.
    pub fn present(&self) {
        if self.double_buffered {
            unsafe { (self.glx.glXSwapBuffers)(self.display, self.window) };
        } else {
            unsafe { gl::Flush() };
        }
    }

    /// Run `f` with X errors captured instead of reported.
    fn trap<T>(&self, f: impl FnOnce() -> T) -> (T, Option<u8>) {
        unsafe { (self.xlib.XSync)(self.display, 0) };
        TRAPPED_ERROR.store(0, Ordering::Relaxed);
        ERROR_TRAP_ACTIVE.store(true, Ordering::Relaxed);
        let value = f();
        unsafe { (self.xlib.XSync)(self.display, 0) };
        ERROR_TRAP_ACTIVE.store(false, Ordering::Relaxed);
        let code = TRAPPED_ERROR.swap(0, Ordering::Relaxed);
        (value, (code != 0).then_some(code as u8))
    }

    /// GLX pixmap over an X pixmap of the given depth.
    pub fn create_glx_pixmap(&self, pixmap: u32, depth: u8) -> Result<u32> {
        let config = self.config_for_depth(depth);
        let attribs = [
            GLX_TEXTURE_FORMAT_EXT, config.texture_format,
            GLX_TEXTURE_TARGET_EXT, GLX_TEXTURE_2D_EXT,
            GLX_MIPMAP_TEXTURE_EXT, 0,
            0,
        ];
        let (glx_pixmap, error) = self.trap(|| unsafe {
            (self.glx.glXCreatePixmap)(self.display, config.fb_config, pixmap as c_ulong, attribs.as_ptr())
        });
        match (glx_pixmap, error) {
            (0, _) | (_, Some(_)) => {
                if glx_pixmap != 0 {
                    self.destroy_glx_pixmap(glx_pixmap as u32);
                }
                anyhow::bail!(
                    "glXCreatePixmap failed for pixmap 0x{:x} (depth {}, X error {:?})",
                    pixmap,
                    depth,
                    error
                )
            }
            (id, None) => Ok(id as u32),
        }
    }

    pub fn destroy_glx_pixmap(&self, glx_pixmap: u32) {
        self.trap(|| unsafe { (self.glx.glXDestroyPixmap)(self.display, glx_pixmap as c_ulong) });
    }

    /// Bind a GLX pixmap to the texture bound on the active unit.
    pub fn bind_tex_image(&self, glx_pixmap: u32) {
        unsafe {
            (self.glx.glXWaitX)();
            (self.bind_tex_image)(self.display, glx_pixmap as c_ulong, GLX_FRONT_LEFT_EXT, ptr::null());
        }
    }

    pub fn release_tex_image(&self, glx_pixmap: u32) {
        unsafe { (self.release_tex_image)(self.display, glx_pixmap as c_ulong, GLX_FRONT_LEFT_EXT, ptr::null()) };
    }
}

struct SetupParts {
    context: glx::GLXContext,
    window: c_ulong,
    colormap: c_ulong,
    config: glx::GLXFBConfig,
    double_buffered: bool,
    bind_tex_image: TexImageFn,
    release_tex_image: TexImageFn,
}

impl Drop for GlContext {
    fn drop(&mut self) {
        unsafe {
            (self.glx.glXMakeCurrent)(self.display, 0, ptr::null_mut());
            (self.glx.glXDestroyContext)(self.display, self.context);
            (self.xlib.XDestroyWindow)(self.display, self.window);
            (self.xlib.XFreeColormap)(self.display, self.colormap);
            (self.xlib.XCloseDisplay)(self.display);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_of(attribs: &[i32], key: i32) -> Option<i32> {
        attribs
            .chunks(2)
            .take_while(|pair| pair[0] != 0)
            .find(|pair| pair[0] == key)
            .map(|pair| pair[1])
    }

    #[test]
    fn test_window_config_requests_rgba8() {
        let attribs = window_config_attribs(true, 8);
        assert_eq!(value_of(&attribs, glx::GLX_ALPHA_SIZE), Some(8));
        assert_eq!(value_of(&attribs, glx::GLX_RED_SIZE), Some(8));
        assert_eq!(value_of(&attribs, glx::GLX_DOUBLEBUFFER), Some(1));
        assert_eq!(value_of(&attribs, glx::GLX_RENDER_TYPE), Some(glx::GLX_RGBA_BIT));
    }

    #[test]
    fn test_window_config_fallback_drops_alpha() {
        let attribs = window_config_attribs(false, 0);
        assert_eq!(value_of(&attribs, glx::GLX_ALPHA_SIZE), Some(0));
        assert_eq!(value_of(&attribs, glx::GLX_DOUBLEBUFFER), Some(0));
        assert_eq!(attribs[attribs.len() - 1], 0);
    }
}
