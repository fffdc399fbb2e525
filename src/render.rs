//! Render backend collaborator. Rasterization lives behind [`RenderBackend`];
//! the scripting core only decides when draw calls happen and who owns which handle.

use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const WHITE: Color = Color::rgba(255, 255, 255, 255);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Accepts `#rrggbb` and `#rrggbbaa`, with or without the leading `#`.
    pub fn from_hex(text: &str) -> Option<Self> {
        let hex = text.strip_prefix('#').unwrap_or(text);
        if !matches!(hex.len(), 6 | 8) || !hex.is_ascii() {
            return None;
        }
        let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        let a = if hex.len() == 8 { byte(6)? } else { 255 };
        Some(Self::rgba(byte(0)?, byte(2)?, byte(4)?, a))
    }

    pub fn with_alpha_scale(self, scale: f32) -> Self {
        let a = (self.a as f32 * scale.clamp(0.0, 1.0)).round() as u8;
        Self { a, ..self }
    }

    pub fn lerp(self, other: Color, t: f32) -> Color {
        let t = t.clamp(0.0, 1.0);
        let mix = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * t).round() as u8;
        Color::rgba(
            mix(self.r, other.r),
            mix(self.g, other.g),
            mix(self.b, other.b),
            mix(self.a, other.a),
        )
    }

    pub fn to_array(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// Opaque backend handle. Scripts never see these; they get slot ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderHandle(pub u64);

#[derive(Clone, Debug)]
pub enum FontSource {
    Named(String),
    Memory(Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct FontSpec {
    pub source: FontSource,
    pub size: f32,
    pub flags: u32,
    pub glyph_range: (u32, u32),
}

#[derive(Clone, Debug)]
pub struct TextureSpec {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl TextureSpec {
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let img = image::load_from_memory(bytes).map_err(|e| format!("invalid image: {e}"))?;
        let rgba = img.to_rgba8();
        Ok(Self {
            width: rgba.width(),
            height: rgba.height(),
            rgba: rgba.into_raw(),
        })
    }

    pub fn from_rgba(rgba: Vec<u8>, width: u32, height: u32) -> Result<Self, String> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || rgba.len() != expected {
            return Err(format!(
                "rgba buffer holds {} bytes, expected {expected}",
                rgba.len()
            ));
        }
        Ok(Self { width, height, rgba })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DrawCommand {
    Rect { min: [f32; 2], max: [f32; 2], color: Color, filled: bool, rounding: f32 },
    Line { from: [f32; 2], to: [f32; 2], color: Color, thickness: f32 },
    Triangle { points: [[f32; 2]; 3], color: Color, filled: bool },
    Circle { center: [f32; 2], radius: f32, color: Color, filled: bool, segments: u32 },
    Text { pos: [f32; 2], text: String, color: Color, font: Option<RenderHandle>, align: u32 },
    PushClip { min: [f32; 2], max: [f32; 2] },
    PopClip,
    SetTexture(Option<RenderHandle>),
    SetShader(Option<RenderHandle>),
}

/// Draw target for one frame. Alpha and texture stacks apply to every
/// primitive recorded after they are pushed.
#[derive(Default, Debug)]
pub struct DrawList {
    pub frame: u64,
    commands: Vec<DrawCommand>,
    alpha: Vec<f32>,
    textures: Vec<Option<RenderHandle>>,
    clip_depth: usize,
}

impl DrawList {
    pub fn new(frame: u64) -> Self {
        Self {
            frame,
            ..Default::default()
        }
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    pub fn alpha(&self) -> f32 {
        self.alpha.last().copied().unwrap_or(1.0)
    }

    fn tint(&self, color: Color) -> Color {
        color.with_alpha_scale(self.alpha())
    }

    pub fn push_alpha(&mut self, alpha: f32) {
        let combined = self.alpha() * alpha.clamp(0.0, 1.0);
        self.alpha.push(combined);
    }

    pub fn pop_alpha(&mut self) -> bool {
        self.alpha.pop().is_some()
    }

    pub fn push_texture(&mut self, texture: Option<RenderHandle>) {
        self.textures.push(texture);
        self.commands.push(DrawCommand::SetTexture(texture));
    }

    pub fn pop_texture(&mut self) -> bool {
        if self.textures.pop().is_none() {
            return false;
        }
        let current = self.textures.last().copied().flatten();
        self.commands.push(DrawCommand::SetTexture(current));
        true
    }

    pub fn push_clip(&mut self, min: [f32; 2], max: [f32; 2]) {
        self.clip_depth += 1;
        self.commands.push(DrawCommand::PushClip { min, max });
    }

    pub fn pop_clip(&mut self) -> bool {
        if self.clip_depth == 0 {
            return false;
        }
        self.clip_depth -= 1;
        self.commands.push(DrawCommand::PopClip);
        true
    }

    pub fn set_shader(&mut self, shader: Option<RenderHandle>) {
        self.commands.push(DrawCommand::SetShader(shader));
    }

    pub fn add_rect(&mut self, min: [f32; 2], max: [f32; 2], color: Color, filled: bool, rounding: f32) {
        let color = self.tint(color);
        self.commands.push(DrawCommand::Rect { min, max, color, filled, rounding });
    }

    pub fn add_line(&mut self, from: [f32; 2], to: [f32; 2], color: Color, thickness: f32) {
        let color = self.tint(color);
        self.commands.push(DrawCommand::Line { from, to, color, thickness });
    }

    pub fn add_triangle(&mut self, points: [[f32; 2]; 3], color: Color, filled: bool) {
        let color = self.tint(color);
        self.commands.push(DrawCommand::Triangle { points, color, filled });
    }

    pub fn add_circle(&mut self, center: [f32; 2], radius: f32, color: Color, filled: bool, segments: u32) {
        let color = self.tint(color);
        self.commands.push(DrawCommand::Circle { center, radius, color, filled, segments });
    }

    pub fn add_text(&mut self, pos: [f32; 2], text: &str, color: Color, font: Option<RenderHandle>, align: u32) {
        let color = self.tint(color);
        self.commands.push(DrawCommand::Text {
            pos,
            text: text.to_string(),
            color,
            font,
            align,
        });
    }
}

pub trait RenderBackend {
    fn acquire_draw_target(&mut self, frame: u64) -> DrawList;
    fn submit(&mut self, list: DrawList);
    fn create_font(&mut self, spec: FontSpec) -> Result<RenderHandle, String>;
    fn create_texture(&mut self, spec: TextureSpec) -> Result<RenderHandle, String>;
    fn create_shader(&mut self, source: &str) -> Result<RenderHandle, String>;
    fn destroy(&mut self, handle: RenderHandle);
    fn screen_size(&self) -> (f32, f32);
    fn text_size(&self, font: Option<RenderHandle>, text: &str) -> (f32, f32);
    fn texture_size(&self, handle: RenderHandle) -> Option<(u32, u32)>;
}

#[derive(Clone, Debug)]
enum Recorded {
    Font { size: f32 },
    Texture { width: u32, height: u32 },
    Shader,
}

/// Headless backend that keeps the last submitted frame for inspection.
pub struct RecordingRenderer {
    next_handle: u64,
    live: HashMap<RenderHandle, Recorded>,
    pub destroyed: Vec<RenderHandle>,
    pub last_frame: Option<DrawList>,
    pub frames_submitted: u64,
    pub screen: (f32, f32),
}

impl Default for RecordingRenderer {
    fn default() -> Self {
        Self {
            next_handle: 1,
            live: HashMap::new(),
            destroyed: Vec::new(),
            last_frame: None,
            frames_submitted: 0,
            screen: (1920.0, 1080.0),
        }
    }
}

impl RecordingRenderer {
    fn issue(&mut self, recorded: Recorded) -> RenderHandle {
        let handle = RenderHandle(self.next_handle);
        self.next_handle += 1;
        self.live.insert(handle, recorded);
        handle
    }
}

impl RenderBackend for RecordingRenderer {
    fn acquire_draw_target(&mut self, frame: u64) -> DrawList {
        DrawList::new(frame)
    }

    fn submit(&mut self, list: DrawList) {
        self.frames_submitted += 1;
        self.last_frame = Some(list);
    }

    fn create_font(&mut self, spec: FontSpec) -> Result<RenderHandle, String> {
        if let FontSource::Memory(bytes) = &spec.source {
            if bytes.is_empty() {
                return Err("font data is empty".to_string());
            }
        }
        Ok(self.issue(Recorded::Font { size: spec.size }))
    }

    fn create_texture(&mut self, spec: TextureSpec) -> Result<RenderHandle, String> {
        Ok(self.issue(Recorded::Texture {
            width: spec.width,
            height: spec.height,
        }))
    }

    fn create_shader(&mut self, source: &str) -> Result<RenderHandle, String> {
        if source.trim().is_empty() {
            return Err("shader source is empty".to_string());
        }
        Ok(self.issue(Recorded::Shader))
    }

    fn destroy(&mut self, handle: RenderHandle) {
        if self.live.remove(&handle).is_some() {
            self.destroyed.push(handle);
        }
    }

    fn screen_size(&self) -> (f32, f32) {
        self.screen
    }

    fn text_size(&self, font: Option<RenderHandle>, text: &str) -> (f32, f32) {
        let size = match font.and_then(|f| self.live.get(&f)) {
            Some(Recorded::Font { size }) => *size,
            _ => 13.0,
        };
        (text.chars().count() as f32 * size * 0.5, size)
    }

    fn texture_size(&self, handle: RenderHandle) -> Option<(u32, u32)> {
        match self.live.get(&handle) {
            Some(Recorded::Texture { width, height }) => Some((*width, *height)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_colors_parse_with_optional_alpha() {
        assert_eq!(Color::from_hex("#ff8000"), Some(Color::rgba(255, 128, 0, 255)));
        assert_eq!(Color::from_hex("10203040"), Some(Color::rgba(16, 32, 48, 64)));
        assert_eq!(Color::from_hex("#fff"), None);
        assert_eq!(Color::from_hex("#zzzzzz"), None);
    }

    #[test]
    fn alpha_stack_scales_recorded_colors() {
        let mut list = DrawList::new(1);
        list.push_alpha(0.5);
        list.add_rect([0.0, 0.0], [1.0, 1.0], Color::WHITE, true, 0.0);
        assert!(list.pop_alpha());
        assert!(!list.pop_alpha());
        match &list.commands()[0] {
            DrawCommand::Rect { color, .. } => assert_eq!(color.a, 128),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unbalanced_clip_pop_is_ignored() {
        let mut list = DrawList::new(1);
        assert!(!list.pop_clip());
        list.push_clip([0.0, 0.0], [10.0, 10.0]);
        assert!(list.pop_clip());
        assert_eq!(list.commands().len(), 2);
    }

    #[test]
    fn rgba_textures_require_matching_buffer() {
        assert!(TextureSpec::from_rgba(vec![0; 16], 2, 2).is_ok());
        assert!(TextureSpec::from_rgba(vec![0; 15], 2, 2).is_err());
        assert!(TextureSpec::decode(b"not an image").is_err());
    }
}
