//! Shader program of the texture back-end
//!
//! The core vertex and fragment stages are fixed. Plugins contribute
//! snippets defining `void plugin_main()`; snippet `i` (plugin load
//! index) is compiled as `plugin<i>_main` and called from `main` after
//! the core stage, in load order.
//!
//! Core names available to snippets:
//!
//! | Stage    | Name              | Meaning                                  |
//! |----------|-------------------|------------------------------------------|
//! | vertex   | `fb_InitPrimPos`  | clip-space corner (attribute 0)          |
//! | vertex   | `fb_InitTexCoord` | texture coordinate (attribute 1)         |
//! | both     | `fb_TexCoord`     | interpolated texture coordinate          |
//! | fragment | `fb_Texture`      | content sampler (unit 0)                 |
//! | fragment | `fb_ShapeTexture` | clip-shape sampler (unit 1, red channel) |
//! | fragment | `fb_Alpha`        | window alpha in `[0, 1]`                 |
//! | fragment | `fb_FragColor`    | output colour                            |

use std::ffi::CString;
use std::fmt::Write;
use std::ptr;

use anyhow::Result;
use tracing::{debug, trace};

use crate::error::CompositorError;

pub const POSITION_ATTRIB: u32 = 0;
pub const TEXCOORD_ATTRIB: u32 = 1;
pub const TEXTURE_UNIT: i32 = 0;
pub const SHAPE_TEXTURE_UNIT: i32 = 1;

const VERSION: &str = "#version 330 core\n";

const VERTEX_HEADER: &str = "\
layout (location = 0) in vec2 fb_InitPrimPos;
layout (location = 1) in vec2 fb_InitTexCoord;
out vec2 fb_TexCoord;
";

const VERTEX_CORE: &str = "\
    gl_Position = vec4(fb_InitPrimPos, 0.0, 1.0);
    fb_TexCoord = fb_InitTexCoord;
";

const FRAGMENT_HEADER: &str = "\
in vec2 fb_TexCoord;
uniform sampler2D fb_Texture;
uniform sampler2D fb_ShapeTexture;
uniform float fb_Alpha;
out vec4 fb_FragColor;
";

const FRAGMENT_CORE: &str = "\
    vec4 color = texture(fb_Texture, fb_TexCoord);
    float shape = texture(fb_ShapeTexture, fb_TexCoord).r;
    fb_FragColor = vec4(color.rgb, color.a * fb_Alpha * shape);
";

/// Name snippet `index`'s entry point is compiled under.
pub fn plugin_entry_point(index: usize) -> String {
    format!("plugin{}_main", index)
}

fn assemble(header: &str, core: &str, snippets: &[(usize, &str)]) -> String {
    let mut source = String::from(VERSION);
    source.push_str(header);
    for (index, snippet) in snippets {
        // Writing into a String cannot fail
        let _ = write!(
            source,
            "\n#define plugin_main {}\n{}\n#undef plugin_main\n",
            plugin_entry_point(*index),
            snippet.trim_end()
        );
    }
    source.push_str("\nvoid main() {\n");
    source.push_str(core);
    for (index, _) in snippets {
        let _ = writeln!(source, "    {}();", plugin_entry_point(*index));
    }
    source.push_str("}\n");
    source
}

/// Vertex stage with the given `(load index, snippet)` pairs.
pub fn vertex_source(snippets: &[(usize, &str)]) -> String {
    assemble(VERTEX_HEADER, VERTEX_CORE, snippets)
}

/// Fragment stage with the given `(load index, snippet)` pairs.
pub fn fragment_source(snippets: &[(usize, &str)]) -> String {
    assemble(FRAGMENT_HEADER, FRAGMENT_CORE, snippets)
}

/// A linked program. Requires a current GL context for its whole life.
pub struct ShaderProgram {
    id: u32,
    alpha_location: i32,
}

impl ShaderProgram {
    /// Compile and link the core stages plus plugin snippets.
    pub fn build(vertex_snippets: &[(usize, &str)], fragment_snippets: &[(usize, &str)]) -> Result<Self> {
        let vertex = vertex_source(vertex_snippets);
        let fragment = fragment_source(fragment_snippets);
        trace!("Vertex shader:\n{}", vertex);
        trace!("Fragment shader:\n{}", fragment);

        let vs = compile_shader(&vertex, gl::VERTEX_SHADER)?;
        let fs = match compile_shader(&fragment, gl::FRAGMENT_SHADER) {
            Ok(fs) => fs,
            Err(e) => {
                unsafe { gl::DeleteShader(vs) };
                return Err(e);
            }
        };
        let linked = link_program(vs, fs);
        unsafe {
            gl::DeleteShader(vs);
            gl::DeleteShader(fs);
        }
        let id = linked?;
        let program = Self {
            id,
            alpha_location: location_in(id, "fb_Alpha"),
        };

        program.use_program();
        program.set_uniform_i32("fb_Texture", TEXTURE_UNIT);
        program.set_uniform_i32("fb_ShapeTexture", SHAPE_TEXTURE_UNIT);
        program.set_alpha(1.0);
        debug!(
            "Linked shader program {} ({} vertex, {} fragment plugin snippets)",
            program.id,
            vertex_snippets.len(),
            fragment_snippets.len()
        );
        Ok(program)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn use_program(&self) {
        unsafe { gl::UseProgram(self.id) };
    }

    /// `-1` when the uniform does not exist (or was optimised out).
    pub fn uniform_location(&self, name: &str) -> i32 {
        location_in(self.id, name)
    }

    pub fn set_uniform_f32(&self, name: &str, value: f32) {
        let location = self.uniform_location(name);
        if location >= 0 {
            unsafe { gl::Uniform1f(location, value) };
        }
    }

    pub fn set_uniform_i32(&self, name: &str, value: i32) {
        let location = self.uniform_location(name);
        if location >= 0 {
            unsafe { gl::Uniform1i(location, value) };
        }
    }

    pub fn set_alpha(&self, alpha: f32) {
        if self.alpha_location >= 0 {
            unsafe { gl::Uniform1f(self.alpha_location, alpha.clamp(0.0, 1.0)) };
        }
    }
}

impl Drop for ShaderProgram {
    fn drop(&mut self) {
        unsafe { gl::DeleteProgram(self.id) };
    }
}

fn location_in(program: u32, name: &str) -> i32 {
    let Ok(name) = CString::new(name) else {
        return -1;
    };
    unsafe { gl::GetUniformLocation(program, name.as_ptr()) }
}

fn compile_shader(source: &str, shader_type: u32) -> Result<u32> {
    let c_source = CString::new(source)
        .map_err(|_| CompositorError::init("shader source contains a NUL byte"))?;
    unsafe {
        let shader = gl::CreateShader(shader_type);
        gl::ShaderSource(shader, 1, &c_source.as_ptr(), ptr::null());
        gl::CompileShader(shader);

        let mut success = 0;
        gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut success);
        if success == 0 {
            let mut len = 0;
            gl::GetShaderiv(shader, gl::INFO_LOG_LENGTH, &mut len);
            let mut buffer = vec![0u8; len.max(0) as usize];
            gl::GetShaderInfoLog(shader, len, ptr::null_mut(), buffer.as_mut_ptr() as *mut _);
            gl::DeleteShader(shader);
            let stage = if shader_type == gl::VERTEX_SHADER { "vertex" } else { "fragment" };
            return Err(CompositorError::init(format!(
                "{} shader compilation failed: {}",
                stage,
                String::from_utf8_lossy(&buffer).trim_end_matches('\0')
            ))
            .into());
        }
        Ok(shader)
    }
}

fn link_program(vs: u32, fs: u32) -> Result<u32> {
    unsafe {
        let program = gl::CreateProgram();
        gl::AttachShader(program, vs);
        gl::AttachShader(program, fs);
        gl::LinkProgram(program);

        let mut success = 0;
        gl::GetProgramiv(program, gl::LINK_STATUS, &mut success);
        if success == 0 {
            let mut len = 0;
            gl::GetProgramiv(program, gl::INFO_LOG_LENGTH, &mut len);
            let mut buffer = vec![0u8; len.max(0) as usize];
            gl::GetProgramInfoLog(program, len, ptr::null_mut(), buffer.as_mut_ptr() as *mut _);
            gl::DeleteProgram(program);
            return Err(CompositorError::init(format!(
                "shader program linking failed: {}",
                String::from_utf8_lossy(&buffer).trim_end_matches('\0')
            ))
            .into());
        }
        Ok(program)
    }
}
