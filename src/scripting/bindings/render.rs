use mlua::{Lua, MetaMethod, MultiValue, Table, UserData, UserDataFields, UserDataMethods, Value};

use super::{binding, guarded, nothing, ret, Args, BindingError, BindingResult, Caller};
use crate::render::{Color, FontSource, FontSpec, RenderHandle, TextureSpec};
use crate::scripting::animator::{AnimValue, Animator, Interpolation};
use crate::scripting::sandbox;

#[derive(Clone, Copy, Debug)]
pub(crate) struct LuaColor(pub Color);

impl UserData for LuaColor {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("r", |_, this| Ok(this.0.r));
        fields.add_field_method_get("g", |_, this| Ok(this.0.g));
        fields.add_field_method_get("b", |_, this| Ok(this.0.b));
        fields.add_field_method_get("a", |_, this| Ok(this.0.a));
        fields.add_field_method_set("r", |_, this, v: u8| {
            this.0.r = v;
            Ok(())
        });
        fields.add_field_method_set("g", |_, this, v: u8| {
            this.0.g = v;
            Ok(())
        });
        fields.add_field_method_set("b", |_, this, v: u8| {
            this.0.b = v;
            Ok(())
        });
        fields.add_field_method_set("a", |_, this, v: u8| {
            this.0.a = v;
            Ok(())
        });
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("unpack", |_, this, ()| Ok((this.0.r, this.0.g, this.0.b, this.0.a)));
        methods.add_method("fade", |_, this, alpha: f32| Ok(LuaColor(this.0.with_alpha_scale(alpha))));
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: mlua::UserDataRef<LuaColor>| {
            Ok(this.0 == other.0)
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            let c = this.0;
            Ok(format!("color({}, {}, {}, {})", c.r, c.g, c.b, c.a))
        });
    }
}

#[derive(Clone, Copy)]
enum Owned {
    Font,
    Texture,
    Shader,
}

impl Owned {
    fn label(self) -> &'static str {
        match self {
            Owned::Font => "font",
            Owned::Texture => "texture",
            Owned::Shader => "shader",
        }
    }
}

/// Looks up a render handle the caller created itself. Other scripts' ids are
/// rejected even if they happen to be live.
fn owned_handle(caller: &Caller, class: Owned, id: u64) -> BindingResult<RenderHandle> {
    let owned = caller.owned.borrow();
    let list = match class {
        Owned::Font => &owned.fonts,
        Owned::Texture => &owned.textures,
        Owned::Shader => &owned.shaders,
    };
    if !list.contains(&id) {
        return Err(BindingError::SandboxViolation(format!(
            "{} {id} is not owned by this script",
            class.label()
        )));
    }
    let host = caller.host.borrow();
    let table = match class {
        Owned::Font => &host.fonts,
        Owned::Texture => &host.textures,
        Owned::Shader => &host.shaders,
    };
    table
        .get(id)
        .copied()
        .ok_or_else(|| BindingError::SandboxViolation(format!("{} {id} was released", class.label())))
}

/// Font argument: nil or 0 selects the default font.
fn font_arg(caller: &Caller, args: &Args, index: usize) -> BindingResult<Option<RenderHandle>> {
    match args.opt_integer(index, 0)? {
        0 => Ok(None),
        id if id > 0 => owned_handle(caller, Owned::Font, id as u64).map(Some),
        _ => Err(args.usage()),
    }
}

fn register_font(caller: &Caller, spec: FontSpec) -> BindingResult<u64> {
    let mut host = caller.host.borrow_mut();
    let handle = host
        .renderer
        .create_font(spec)
        .map_err(|e| BindingError::Usage(format!("unable to create font: {e}")))?;
    let id = host.fonts.insert(handle);
    drop(host);
    caller.owned.borrow_mut().fonts.push(id);
    Ok(id)
}

fn register_texture(caller: &Caller, spec: TextureSpec) -> BindingResult<u64> {
    let mut host = caller.host.borrow_mut();
    let handle = host
        .renderer
        .create_texture(spec)
        .map_err(|e| BindingError::Usage(format!("unable to create texture: {e}")))?;
    let id = host.textures.insert(handle);
    drop(host);
    caller.owned.borrow_mut().textures.push(id);
    Ok(id)
}

fn font_spec(args: &Args, source: FontSource) -> BindingResult<FontSpec> {
    let size = args.number(1)?;
    if !(size > 0.0) {
        return Err(BindingError::Usage("font size must be greater than zero".to_string()));
    }
    let flags = args.opt_integer(2, 0)?;
    let from = args.opt_integer(3, 0)?;
    let to = args.opt_integer(4, 255)?;
    if flags < 0 || from < 0 || to < from {
        return Err(args.usage());
    }
    Ok(FontSpec {
        source,
        size: size as f32,
        flags: flags as u32,
        glyph_range: (from as u32, to as u32),
    })
}

fn draw_rect(lua: &Lua, filled: bool, rounded: bool, usage: &'static str) -> mlua::Result<mlua::Function> {
    binding(lua, usage, move |_, caller, args| {
        let min = args.point(0)?;
        let max = args.point(2)?;
        let color = args.color(4)?;
        let rounding = if rounded {
            args.number(5)?
        } else {
            args.opt_number(5, 0.0)?
        };
        caller
            .host
            .borrow_mut()
            .surface
            .add_rect(min, max, color, filled, rounding as f32);
        nothing()
    })
}

fn draw_triangle(lua: &Lua, filled: bool, usage: &'static str) -> mlua::Result<mlua::Function> {
    binding(lua, usage, move |_, caller, args| {
        let points = [args.point(0)?, args.point(2)?, args.point(4)?];
        let color = args.color(6)?;
        caller.host.borrow_mut().surface.add_triangle(points, color, filled);
        nothing()
    })
}

fn draw_circle(lua: &Lua, filled: bool, usage: &'static str) -> mlua::Result<mlua::Function> {
    binding(lua, usage, move |_, caller, args| {
        let center = args.point(0)?;
        let radius = args.number(2)?;
        let color = args.color(3)?;
        let segments = args.opt_integer(4, 24)?.clamp(3, 256) as u32;
        caller
            .host
            .borrow_mut()
            .surface
            .add_circle(center, radius as f32, color, filled, segments);
        nothing()
    })
}

pub(crate) struct AnimatorHandle {
    id: u64,
}

fn owned_animator(caller: &Caller, id: u64) -> BindingResult<()> {
    if caller.owned.borrow().animators.contains(&id) {
        Ok(())
    } else {
        Err(BindingError::SandboxViolation(format!(
            "animator {id} is not owned by this script"
        )))
    }
}

fn anim_value(args: &Args, index: usize, like: AnimValue) -> BindingResult<AnimValue> {
    match like {
        AnimValue::Float(_) => Ok(AnimValue::Float(args.number(index)? as f32)),
        AnimValue::Color(_) => Ok(AnimValue::Color(args.color(index)?)),
    }
}

impl UserData for AnimatorHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("get_value", |lua, this, args: MultiValue| {
            guarded(lua, "usage: animator:get_value(): number | color", args, |caller, _args| {
                owned_animator(caller, this.id)?;
                let host = caller.host.borrow();
                let now = host.globals.realtime;
                let value = host.animators.get(this.id).map(|a| a.value(now));
                drop(host);
                match value {
                    Some(AnimValue::Float(v)) => ret(lua, v),
                    Some(AnimValue::Color(c)) => ret(lua, LuaColor(c)),
                    None => nothing(),
                }
            })
        });
        methods.add_method("direct", |lua, this, args: MultiValue| {
            guarded(lua, "usage: animator:direct(target, from = current)", args, |caller, args| {
                owned_animator(caller, this.id)?;
                let mut host = caller.host.borrow_mut();
                let now = host.globals.realtime;
                let Some(animator) = host.animators.get_mut(this.id) else {
                    return nothing();
                };
                let like = animator.value(now);
                let target = anim_value(&args, 0, like)?;
                let from = if args.is_nil(1) {
                    None
                } else {
                    Some(anim_value(&args, 1, like)?)
                };
                animator.direct(target, from, now).map_err(BindingError::Usage)?;
                nothing()
            })
        });
        methods.add_method("set_duration", |lua, this, args: MultiValue| {
            guarded(lua, "usage: animator:set_duration(seconds: number)", args, |caller, args| {
                owned_animator(caller, this.id)?;
                let duration = args.number(0)?;
                let mut host = caller.host.borrow_mut();
                if let Some(animator) = host.animators.get_mut(this.id) {
                    animator.set_duration(duration).map_err(BindingError::Usage)?;
                }
                nothing()
            })
        });
    }
}

fn create_animator(lua: &Lua, caller: &Caller, args: &Args, initial: AnimValue) -> BindingResult {
    let duration = args.number(1)?;
    let index = args.opt_integer(2, Interpolation::Linear as i64)?;
    let interpolation = Interpolation::from_index(index)
        .ok_or_else(|| BindingError::Usage(format!("invalid interpolation: {index}")))?;
    let animator = Animator::new(initial, duration, interpolation).map_err(BindingError::Usage)?;
    let id = caller.host.borrow_mut().animators.insert(animator);
    caller.owned.borrow_mut().animators.push(id);
    ret(lua, AnimatorHandle { id })
}

fn set_constants(table: &Table) -> mlua::Result<()> {
    for (name, value) in [
        ("align_left", 0),
        ("align_center", 1),
        ("align_right", 2),
        ("align_vcenter", 4),
        ("align_bottom", 8),
        ("font_none", 0),
        ("font_bold", 1),
        ("font_italic", 2),
        ("font_outline", 4),
        ("font_shadow", 8),
        ("font_antialias", 16),
    ] {
        table.set(name, value)?;
    }
    for (name, interpolation) in Interpolation::ALL {
        table.set(name, interpolation as i64)?;
    }
    Ok(())
}

pub(super) fn namespace(lua: &Lua) -> mlua::Result<Table> {
    let render = lua.create_table()?;
    set_constants(&render)?;

    render.set(
        "color",
        binding(lua, "usage: color(r, g, b, a = 255) | color(hex: string): color", |lua, _caller, args| {
            if let Ok(color) = args.color(0) {
                if args.len() == 1 {
                    return ret(lua, LuaColor(color));
                }
            }
            let channel = |i: usize, default: i64| -> BindingResult<u8> {
                let v = args.opt_integer(i, default)?;
                u8::try_from(v).map_err(|_| args.usage())
            };
            let color = Color::rgba(channel(0, -1)?, channel(1, -1)?, channel(2, -1)?, channel(3, 255)?);
            ret(lua, LuaColor(color))
        })?,
    )?;

    render.set("rect", draw_rect(lua, false, false, "usage: rect(x1, y1, x2, y2, color, rounding = 0)")?)?;
    render.set("rect_filled", draw_rect(lua, true, false, "usage: rect_filled(x1, y1, x2, y2, color, rounding = 0)")?)?;
    render.set("rect_rounded", draw_rect(lua, false, true, "usage: rect_rounded(x1, y1, x2, y2, color, rounding)")?)?;
    render.set(
        "rect_filled_rounded",
        draw_rect(lua, true, true, "usage: rect_filled_rounded(x1, y1, x2, y2, color, rounding)")?,
    )?;
    render.set("triangle", draw_triangle(lua, false, "usage: triangle(x1, y1, x2, y2, x3, y3, color)")?)?;
    render.set(
        "triangle_filled",
        draw_triangle(lua, true, "usage: triangle_filled(x1, y1, x2, y2, x3, y3, color)")?,
    )?;
    render.set("circle", draw_circle(lua, false, "usage: circle(x, y, radius, color, segments = 24)")?)?;
    render.set(
        "circle_filled",
        draw_circle(lua, true, "usage: circle_filled(x, y, radius, color, segments = 24)")?,
    )?;

    render.set(
        "line",
        binding(lua, "usage: line(x1, y1, x2, y2, color, thickness = 1)", |_, caller, args| {
            let from = args.point(0)?;
            let to = args.point(2)?;
            let color = args.color(4)?;
            let thickness = args.opt_number(5, 1.0)? as f32;
            caller.host.borrow_mut().surface.add_line(from, to, color, thickness);
            nothing()
        })?,
    )?;

    render.set(
        "text",
        binding(lua, "usage: text(font, x, y, text, color, align = 0)", |_, caller, args| {
            let font = font_arg(caller, &args, 0)?;
            let pos = args.point(1)?;
            let text = args.string(3)?;
            let color = args.color(4)?;
            let align = u32::try_from(args.opt_integer(5, 0)?).map_err(|_| args.usage())?;
            caller
                .host
                .borrow_mut()
                .surface
                .add_text(pos, &text, color, font, align);
            nothing()
        })?,
    )?;

    render.set(
        "get_text_size",
        binding(lua, "usage: get_text_size(font, text): number, number", |lua, caller, args| {
            let font = font_arg(caller, &args, 0)?;
            let text = args.string(1)?;
            let (w, h) = caller.host.borrow().renderer.text_size(font, &text);
            ret(lua, (w, h))
        })?,
    )?;

    render.set(
        "get_screen_size",
        binding(lua, "usage: get_screen_size(): number, number", |lua, caller, _args| {
            let (w, h) = caller.host.borrow().renderer.screen_size();
            ret(lua, (w, h))
        })?,
    )?;

    render.set(
        "create_font",
        binding(
            lua,
            "usage: create_font(font_path, size, flags = none, from = 0, to = 255): number",
            |lua, caller, args| {
                let path = args.string(0)?;
                let spec = font_spec(&args, FontSource::Named(path))?;
                ret(lua, register_font(caller, spec)? as i64)
            },
        )?,
    )?;

    render.set(
        "create_font_stream",
        binding(
            lua,
            "usage: create_font_stream(data: table, size, flags = none, from = 0, to = 255): number",
            |lua, caller, args| {
                let data = args.byte_table(0)?;
                let spec = font_spec(&args, FontSource::Memory(data))?;
                ret(lua, register_font(caller, spec)? as i64)
            },
        )?,
    )?;

    render.set(
        "create_texture",
        binding(lua, "usage: create_texture(path: string): number", |lua, caller, args| {
            let name = args.string(0)?;
            let path = sandbox::sandboxed_path(&caller.host.borrow().storage_dir(), &name)
                .map_err(BindingError::SandboxViolation)?;
            let bytes = std::fs::read(&path).map_err(|e| BindingError::Usage(format!("{name}: {e}")))?;
            let spec = TextureSpec::decode(&bytes).map_err(BindingError::Usage)?;
            ret(lua, register_texture(caller, spec)? as i64)
        })?,
    )?;

    render.set(
        "create_texture_bytes",
        binding(lua, "usage: create_texture_bytes(data: string | table): number", |lua, caller, args| {
            let bytes = match args.value(0) {
                Value::Table(_) => args.byte_table(0)?,
                _ => args.bytes(0)?,
            };
            let spec = TextureSpec::decode(&bytes).map_err(BindingError::Usage)?;
            ret(lua, register_texture(caller, spec)? as i64)
        })?,
    )?;

    render.set(
        "create_texture_rgba",
        binding(
            lua,
            "usage: create_texture_rgba(data: string | table, width, height): number",
            |lua, caller, args| {
                let bytes = match args.value(0) {
                    Value::Table(_) => args.byte_table(0)?,
                    _ => args.bytes(0)?,
                };
                let width = u32::try_from(args.integer(1)?).map_err(|_| args.usage())?;
                let height = u32::try_from(args.integer(2)?).map_err(|_| args.usage())?;
                let spec = TextureSpec::from_rgba(bytes, width, height).map_err(BindingError::Usage)?;
                ret(lua, register_texture(caller, spec)? as i64)
            },
        )?,
    )?;

    render.set(
        "get_texture_size",
        binding(lua, "usage: get_texture_size(texture): number, number", |lua, caller, args| {
            let handle = owned_handle(caller, Owned::Texture, args.handle(0)?)?;
            match caller.host.borrow().renderer.texture_size(handle) {
                Some((w, h)) => ret(lua, (w, h)),
                None => nothing(),
            }
        })?,
    )?;

    let push_texture = binding(lua, "usage: push_texture(texture | nil)", |_, caller, args| {
        let handle = if args.is_nil(0) {
            None
        } else {
            Some(owned_handle(caller, Owned::Texture, args.handle(0)?)?)
        };
        caller.host.borrow_mut().surface.push_texture(handle);
        nothing()
    })?;
    render.set("set_texture", push_texture.clone())?;
    render.set("push_texture", push_texture)?;
    render.set(
        "pop_texture",
        binding(lua, "usage: pop_texture()", |_, caller, _args| {
            caller.host.borrow_mut().surface.pop_texture();
            nothing()
        })?,
    )?;

    render.set(
        "push_clip_rect",
        binding(lua, "usage: push_clip_rect(x1, y1, x2, y2)", |_, caller, args| {
            let min = args.point(0)?;
            let max = args.point(2)?;
            caller.host.borrow_mut().surface.push_clip(min, max);
            nothing()
        })?,
    )?;
    render.set(
        "pop_clip_rect",
        binding(lua, "usage: pop_clip_rect()", |_, caller, _args| {
            caller.host.borrow_mut().surface.pop_clip();
            nothing()
        })?,
    )?;

    let push_alpha = binding(lua, "usage: push_alpha(alpha: number)", |_, caller, args| {
        let alpha = args.number(0)?;
        caller.host.borrow_mut().surface.push_alpha(alpha as f32);
        nothing()
    })?;
    render.set("set_alpha", push_alpha.clone())?;
    render.set("push_alpha", push_alpha)?;
    render.set(
        "pop_alpha",
        binding(lua, "usage: pop_alpha()", |_, caller, _args| {
            caller.host.borrow_mut().surface.pop_alpha();
            nothing()
        })?,
    )?;
    render.set(
        "get_alpha",
        binding(lua, "usage: get_alpha(): number", |lua, caller, _args| {
            let alpha = caller.host.borrow().surface.alpha();
            ret(lua, alpha)
        })?,
    )?;

    render.set(
        "create_animator_float",
        binding(
            lua,
            "usage: create_animator_float(initial: number, duration: number, interpolation = linear): animator",
            |lua, caller, args| {
                let initial = AnimValue::Float(args.number(0)? as f32);
                create_animator(lua, caller, &args, initial)
            },
        )?,
    )?;
    render.set(
        "create_animator_color",
        binding(
            lua,
            "usage: create_animator_color(initial: color, duration: number, interpolation = linear): animator",
            |lua, caller, args| {
                let initial = AnimValue::Color(args.color(0)?);
                create_animator(lua, caller, &args, initial)
            },
        )?,
    )?;

    render.set(
        "create_shader",
        binding(lua, "usage: create_shader(source: string): number", |lua, caller, args| {
            let source = args.string(0)?;
            let mut host = caller.host.borrow_mut();
            let handle = host
                .renderer
                .create_shader(&source)
                .map_err(|e| BindingError::Usage(format!("unable to create shader: {e}")))?;
            let id = host.shaders.insert(handle);
            drop(host);
            caller.owned.borrow_mut().shaders.push(id);
            ret(lua, id as i64)
        })?,
    )?;
    render.set(
        "set_shader",
        binding(lua, "usage: set_shader(shader | nil)", |_, caller, args| {
            let handle = if args.is_nil(0) {
                None
            } else {
                Some(owned_handle(caller, Owned::Shader, args.handle(0)?)?)
            };
            caller.host.borrow_mut().surface.set_shader(handle);
            nothing()
        })?,
    )?;

    Ok(render)
}
