use mlua::{Lua, MultiValue, Table, UserData, UserDataMethods, Value};

use super::{binding, guarded, nothing, ret, Args, BindingError, BindingResult, Caller, LuaColor};
use crate::config::ConfigValue;
use crate::gui::{Control, ControlKind, GuiTree, HotkeyMode};
use crate::hash::fnv1a64;
use crate::render::Color;

pub const MAX_MULTI_OPTIONS: usize = 64;
pub const MAX_LEGACY_OPTIONS: usize = 128;

/// Handle returned to scripts for a control. Lookups always go through the
/// GUI tree, so a handle to a removed control degrades to a usage error.
pub(crate) struct ControlHandle {
    id: u64,
}

fn missing_control(id: u64) -> BindingError {
    BindingError::Usage(format!("control was not found: {id:#x}"))
}

/// Containers accept children directly; any other control redirects to its parent.
fn resolve_container(gui: &dyn GuiTree, container: &str) -> BindingResult<u64> {
    let not_found = || BindingError::Usage(format!("container was not found: {container}"));
    let control = gui.find(fnv1a64(container)).ok_or_else(not_found)?;
    if control.kind.is_container() {
        Ok(control.id)
    } else {
        control.parent.ok_or_else(not_found)
    }
}

fn option_limit(kind: &ControlKind) -> usize {
    match kind {
        ControlKind::List { multi: false, .. } => MAX_LEGACY_OPTIONS,
        _ => MAX_MULTI_OPTIONS,
    }
}

fn check_options(options: &[String], limit: usize) -> BindingResult<()> {
    if options.len() > limit {
        return Err(BindingError::ResourceExhausted(format!(
            "too many options: {} (at most {limit})",
            options.len()
        )));
    }
    for (index, option) in options.iter().enumerate() {
        if options[..index].contains(option) {
            return Err(BindingError::Usage(format!("duplicate option: {option}")));
        }
    }
    Ok(())
}

/// Options given either as trailing string arguments or as one table.
fn options_from(args: &Args, start: usize) -> BindingResult<Vec<String>> {
    if let Value::Table(table) = args.value(start) {
        return table
            .sequence_values::<String>()
            .map(|v| v.map_err(|_| args.usage()))
            .collect();
    }
    (start..args.len()).map(|i| args.string(i)).collect()
}

fn create_control(
    caller: &Caller,
    container: &str,
    control: Control,
    value: Option<ConfigValue>,
) -> BindingResult<u64> {
    if control.name.is_empty() {
        return Err(BindingError::Usage("control id must not be empty".to_string()));
    }
    let id = control.id;
    let mut host = caller.host.borrow_mut();
    let parent = resolve_container(host.gui.as_ref(), container)?;
    if host.gui.find(id).is_some() {
        return Err(BindingError::Usage(format!(
            "control id is already in use: {}",
            control.name
        )));
    }
    host.gui.add(parent, control).map_err(BindingError::Usage)?;
    if let Some(value) = value {
        if let Err(e) = host.config.register(id, value) {
            host.gui.remove(id);
            return Err(BindingError::Usage(e));
        }
    }
    if let Some(binding) = host.config.hotkey_for(id) {
        host.gui.bind_hotkey(id, binding.key, binding.mode);
    }
    host.gui.process_queues();
    host.gui.reset();
    host.gui.highlight_tab(parent);
    drop(host);
    caller.owned.borrow_mut().gui_elements.push(id);
    Ok(id)
}

fn selected_indices(bits: u64) -> Vec<i64> {
    (0..64).filter(|i| bits & (1u64 << i) != 0).collect()
}

fn read_value(lua: &Lua, control: &Control, value: Option<ConfigValue>) -> BindingResult {
    match (&control.kind, value) {
        (_, Some(ConfigValue::Bool(b))) => ret(lua, b),
        (_, Some(ConfigValue::Float(f))) => ret(lua, f),
        (_, Some(ConfigValue::Color([r, g, b, a]))) => ret(lua, LuaColor(Color::rgba(r, g, b, a))),
        (ControlKind::Combobox { multi: false, .. }, Some(ConfigValue::Bits(bits))) => {
            ret(lua, if bits == 0 { 0 } else { bits.trailing_zeros() as i64 })
        }
        (_, Some(ConfigValue::Bits(bits))) => ret(lua, lua.create_sequence_from(selected_indices(bits))?),
        (_, Some(ConfigValue::Index(index))) => ret(lua, index as i64),
        (_, Some(ConfigValue::Text(text))) => ret(lua, text),
        (ControlKind::Label | ControlKind::Button, None) => ret(lua, control.label.clone()),
        _ => nothing(),
    }
}

fn index_in(value: i64, count: usize) -> BindingResult<u32> {
    usize::try_from(value)
        .ok()
        .filter(|i| *i < count)
        .map(|i| i as u32)
        .ok_or_else(|| BindingError::Usage(format!("option index out of range: {value}")))
}

fn selection_bits(args: &Args, count: usize, multi: bool) -> BindingResult<u64> {
    match args.value(0) {
        Value::Table(table) if multi => {
            let mut bits = 0u64;
            for index in table.sequence_values::<i64>() {
                let index = index.map_err(|_| args.usage())?;
                bits |= 1u64 << index_in(index, count)?;
            }
            Ok(bits)
        }
        _ => Ok(1u64 << index_in(args.integer(0)?, count)?),
    }
}

/// Converts a script value into the stored representation for `control`.
/// Labels carry no configuration entry, so `None` means the label text changed.
fn parse_value(control: &mut Control, args: &Args) -> BindingResult<Option<ConfigValue>> {
    let value = match &control.kind {
        ControlKind::Checkbox => ConfigValue::Bool(args.boolean(0)?),
        ControlKind::Slider { min, max, .. } => ConfigValue::Float((args.number(0)? as f32).clamp(*min, *max)),
        ControlKind::ColorPicker => ConfigValue::Color(args.color(0)?.to_array()),
        ControlKind::Textbox => ConfigValue::Text(args.string(0)?),
        ControlKind::Combobox { options, multi } => ConfigValue::Bits(selection_bits(args, options.len(), *multi)?),
        ControlKind::List { options, multi: true } => ConfigValue::Bits(selection_bits(args, options.len(), true)?),
        ControlKind::List { options, multi: false } => {
            ConfigValue::Index(index_in(args.integer(0)?, options.len())?)
        }
        ControlKind::Label => {
            control.label = args.string(0)?;
            return Ok(None);
        }
        _ => return Err(BindingError::Usage(format!("{} has no value", control.kind.name()))),
    };
    Ok(Some(value))
}

/// Shifts stored selection state after option `removed` disappears.
fn drop_option(value: ConfigValue, removed: u32) -> ConfigValue {
    match value {
        ConfigValue::Bits(bits) => {
            let low = bits & ((1u64 << removed) - 1);
            let high = bits.checked_shr(removed + 1).unwrap_or(0) << removed;
            ConfigValue::Bits(low | high)
        }
        ConfigValue::Index(index) if index > removed => ConfigValue::Index(index - 1),
        ConfigValue::Index(index) if index == removed => ConfigValue::Index(0),
        other => other,
    }
}

fn control_method<M, F>(methods: &mut M, name: &'static str, usage: &'static str, body: F)
where
    M: UserDataMethods<ControlHandle>,
    F: Fn(&Lua, &Caller, u64, Args) -> BindingResult + 'static,
{
    methods.add_method(name, move |lua, this, args: MultiValue| {
        let id = this.id;
        guarded(lua, usage, args, |caller, args| body(lua, caller, id, args))
    });
}

impl UserData for ControlHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        let get_value = |lua: &Lua, caller: &Caller, id: u64, _args: Args| -> BindingResult {
            let host = caller.host.borrow();
            let control = host.gui.find(id).cloned().ok_or_else(|| missing_control(id))?;
            let value = host.config.get(id).cloned();
            drop(host);
            read_value(lua, &control, value)
        };
        control_method(methods, "get_value", "usage: obj:get_value(): any", get_value);
        control_method(methods, "get", "usage: obj:get(): any", get_value);

        let set_value = |_: &Lua, caller: &Caller, id: u64, args: Args| -> BindingResult {
            let mut host = caller.host.borrow_mut();
            let control = host.gui.find_mut(id).ok_or_else(|| missing_control(id))?;
            if let Some(value) = parse_value(control, &args)? {
                host.config.set(id, value).map_err(BindingError::Usage)?;
            }
            nothing()
        };
        control_method(methods, "set_value", "usage: obj:set_value(value: any)", set_value);
        control_method(methods, "set", "usage: obj:set(value: any)", set_value);

        control_method(methods, "set_tooltip", "usage: obj:set_tooltip(text: string | nil)", |_, caller, id, args| {
            let tooltip = args.opt_string(0)?;
            let mut host = caller.host.borrow_mut();
            host.gui.find_mut(id).ok_or_else(|| missing_control(id))?.tooltip = tooltip;
            nothing()
        });

        control_method(methods, "set_visible", "usage: obj:set_visible(visible: boolean)", |_, caller, id, args| {
            let visible = args.boolean(0)?;
            let mut host = caller.host.borrow_mut();
            host.gui.find_mut(id).ok_or_else(|| missing_control(id))?.visible = visible;
            host.gui.reset();
            nothing()
        });

        control_method(methods, "add_callback", "usage: obj:add_callback(callback: function)", |_, caller, id, args| {
            let callback = args.function(0)?;
            if caller.host.borrow().gui.find(id).is_none() {
                return Err(missing_control(id));
            }
            let mut owned = caller.owned.borrow_mut();
            if !owned.gui_callback_elements.contains(&id) {
                owned.gui_callback_elements.push(id);
            }
            owned.control_callbacks.push((id, callback));
            nothing()
        });

        control_method(methods, "get_name", "usage: obj:get_name(): string", |lua, caller, id, _args| {
            let name = caller.host.borrow().gui.find(id).map(|c| c.name.clone());
            ret(lua, name.ok_or_else(|| missing_control(id))?)
        });

        control_method(methods, "get_type", "usage: obj:get_type(): string", |lua, caller, id, _args| {
            let kind = caller.host.borrow().gui.find(id).map(|c| c.kind.name());
            ret(lua, kind.ok_or_else(|| missing_control(id))?)
        });

        control_method(methods, "get_options", "usage: obj:get_options(): table", |lua, caller, id, _args| {
            let host = caller.host.borrow();
            let control = host.gui.find(id).ok_or_else(|| missing_control(id))?;
            match &control.kind {
                ControlKind::Combobox { options, .. } | ControlKind::List { options, .. } => {
                    let table = lua.create_sequence_from(options.iter().cloned())?;
                    ret(lua, table)
                }
                kind => Err(BindingError::Usage(format!("{} has no options", kind.name()))),
            }
        });

        control_method(methods, "add", "usage: list:add(option: string)", |_, caller, id, args| {
            let option = args.string(0)?;
            let mut host = caller.host.borrow_mut();
            let control = host.gui.find_mut(id).ok_or_else(|| missing_control(id))?;
            let limit = option_limit(&control.kind);
            let ControlKind::List { options, .. } = &mut control.kind else {
                return Err(BindingError::Usage("only lists accept new options".to_string()));
            };
            if options.contains(&option) {
                return Err(BindingError::Usage(format!("duplicate option: {option}")));
            }
            if options.len() >= limit {
                return Err(BindingError::ResourceExhausted(format!(
                    "list is full ({limit} options)"
                )));
            }
            options.push(option);
            host.gui.reset();
            nothing()
        });

        control_method(methods, "remove", "usage: list:remove(option: string)", |_, caller, id, args| {
            let option = args.string(0)?;
            let mut host = caller.host.borrow_mut();
            let control = host.gui.find_mut(id).ok_or_else(|| missing_control(id))?;
            let ControlKind::List { options, .. } = &mut control.kind else {
                return Err(BindingError::Usage("only lists remove options".to_string()));
            };
            let Some(index) = options.iter().position(|o| *o == option) else {
                return Err(BindingError::Usage(format!("option was not found: {option}")));
            };
            options.remove(index);
            if let Some(value) = host.config.get(id).cloned() {
                host.config
                    .set(id, drop_option(value, index as u32))
                    .map_err(BindingError::Usage)?;
            }
            host.gui.reset();
            nothing()
        });
    }
}

fn control_handle(lua: &Lua, id: u64) -> BindingResult {
    ret(lua, ControlHandle { id })
}

fn getter(lua: &Lua, usage: &'static str, kind: &'static str) -> mlua::Result<mlua::Function> {
    binding(lua, usage, move |lua, caller, args| {
        let name = args.string(0)?;
        let id = fnv1a64(&name);
        let found = caller.host.borrow().gui.find(id).map(|c| c.kind.name());
        match found {
            Some(found) if found == kind => control_handle(lua, id),
            Some(found) => Err(BindingError::Usage(format!("{name} is a {found}, not a {kind}"))),
            None => Err(BindingError::Usage(format!("control was not found: {name}"))),
        }
    })
}

pub(super) fn namespace(lua: &Lua) -> mlua::Result<Table> {
    let gui = lua.create_table()?;
    gui.set("hotkey_toggle", 0)?;
    gui.set("hotkey_hold", 1)?;

    gui.set(
        "checkbox",
        binding(
            lua,
            "usage: checkbox(id: string, container: string, label: string, value = false): checkbox",
            |lua, caller, args| {
                let (name, container, label) = (args.string(0)?, args.string(1)?, args.string(2)?);
                let value = args.opt_boolean(3, false)?;
                let control = Control::new(&name, &label, ControlKind::Checkbox);
                let id = create_control(caller, &container, control, Some(ConfigValue::Bool(value)))?;
                control_handle(lua, id)
            },
        )?,
    )?;

    gui.set(
        "slider",
        binding(
            lua,
            "usage: slider(id: string, container: string, label: string, min: number, max: number, value = min, step = 1, format = \"%.0f\"): slider",
            |lua, caller, args| {
                let (name, container, label) = (args.string(0)?, args.string(1)?, args.string(2)?);
                let min = args.number(3)? as f32;
                let max = args.number(4)? as f32;
                let value = args.opt_number(5, min as f64)? as f32;
                let step = args.opt_number(6, 1.0)? as f32;
                let format = args.opt_string(7)?.unwrap_or_else(|| "%.0f".to_string());
                if !(min < max) || !(step > 0.0) {
                    return Err(args.usage());
                }
                let kind = ControlKind::Slider { min, max, step, format };
                let control = Control::new(&name, &label, kind);
                let stored = ConfigValue::Float(value.clamp(min, max));
                let id = create_control(caller, &container, control, Some(stored))?;
                control_handle(lua, id)
            },
        )?,
    )?;

    gui.set(
        "combobox",
        binding(
            lua,
            "usage: combobox(id: string, container: string, label: string, allow_multiple: boolean, ...options: string): combobox",
            |lua, caller, args| {
                let (name, container, label) = (args.string(0)?, args.string(1)?, args.string(2)?);
                let multi = args.boolean(3)?;
                let options = options_from(&args, 4)?;
                check_options(&options, MAX_MULTI_OPTIONS)?;
                let initial = if multi || options.is_empty() { 0 } else { 1 };
                let control = Control::new(&name, &label, ControlKind::Combobox { options, multi });
                let id = create_control(caller, &container, control, Some(ConfigValue::Bits(initial)))?;
                control_handle(lua, id)
            },
        )?,
    )?;

    gui.set(
        "list",
        binding(
            lua,
            "usage: list(id: string, container: string, label: string, allow_multiple: boolean, ...options: string): list",
            |lua, caller, args| {
                let (name, container, label) = (args.string(0)?, args.string(1)?, args.string(2)?);
                let multi = args.boolean(3)?;
                let options = options_from(&args, 4)?;
                let limit = if multi { MAX_MULTI_OPTIONS } else { MAX_LEGACY_OPTIONS };
                check_options(&options, limit)?;
                let stored = if multi {
                    ConfigValue::Bits(0)
                } else {
                    ConfigValue::Index(0)
                };
                let control = Control::new(&name, &label, ControlKind::List { options, multi });
                let id = create_control(caller, &container, control, Some(stored))?;
                control_handle(lua, id)
            },
        )?,
    )?;

    gui.set(
        "textbox",
        binding(
            lua,
            "usage: textbox(id: string, container: string, value = \"\"): textbox",
            |lua, caller, args| {
                let (name, container) = (args.string(0)?, args.string(1)?);
                let value = args.opt_string(2)?.unwrap_or_default();
                let control = Control::new(&name, "", ControlKind::Textbox);
                let id = create_control(caller, &container, control, Some(ConfigValue::Text(value)))?;
                control_handle(lua, id)
            },
        )?,
    )?;

    gui.set(
        "label",
        binding(lua, "usage: label(id: string, container: string, text: string): label", |lua, caller, args| {
            let (name, container, text) = (args.string(0)?, args.string(1)?, args.string(2)?);
            let control = Control::new(&name, &text, ControlKind::Label);
            let id = create_control(caller, &container, control, None)?;
            control_handle(lua, id)
        })?,
    )?;

    gui.set(
        "button",
        binding(
            lua,
            "usage: button(id: string, container: string, text: string, callback = nil): button",
            |lua, caller, args| {
                let (name, container, text) = (args.string(0)?, args.string(1)?, args.string(2)?);
                let callback = if args.is_nil(3) {
                    None
                } else {
                    Some(args.function(3)?)
                };
                let control = Control::new(&name, &text, ControlKind::Button);
                let id = create_control(caller, &container, control, None)?;
                if let Some(callback) = callback {
                    let mut owned = caller.owned.borrow_mut();
                    owned.gui_callback_elements.push(id);
                    owned.control_callbacks.push((id, callback));
                }
                control_handle(lua, id)
            },
        )?,
    )?;

    gui.set(
        "color_picker",
        binding(
            lua,
            "usage: color_picker(id: string, container: string, label: string, value = color(255, 255, 255)): color_picker",
            |lua, caller, args| {
                let (name, container, label) = (args.string(0)?, args.string(1)?, args.string(2)?);
                let value = args.opt_color(3, Color::WHITE)?;
                let control = Control::new(&name, &label, ControlKind::ColorPicker);
                let stored = ConfigValue::Color(value.to_array());
                let id = create_control(caller, &container, control, Some(stored))?;
                control_handle(lua, id)
            },
        )?,
    )?;

    gui.set("get_checkbox", getter(lua, "usage: get_checkbox(id: string): checkbox", "checkbox")?)?;
    gui.set("get_slider", getter(lua, "usage: get_slider(id: string): slider", "slider")?)?;
    gui.set("get_combobox", getter(lua, "usage: get_combobox(id: string): combobox", "combobox")?)?;
    gui.set(
        "get_color_picker",
        getter(lua, "usage: get_color_picker(id: string): color_picker", "color_picker")?,
    )?;
    gui.set("get_list", getter(lua, "usage: get_list(id: string): list", "list")?)?;

    gui.set(
        "add_notification",
        binding(lua, "usage: add_notification(title: string, body: string)", |_, caller, args| {
            let (title, body) = (args.string(0)?, args.string(1)?);
            caller.host.borrow_mut().gui.notify(&title, &body);
            nothing()
        })?,
    )?;

    gui.set(
        "for_each_hotkey",
        binding(
            lua,
            "usage: for_each_hotkey(callback: function(name: string, key: number, mode: number, active: boolean))",
            |_, caller, args| {
                let callback = args.function(0)?;
                let hotkeys: Vec<_> = {
                    let host = caller.host.borrow();
                    host.gui
                        .hotkeys()
                        .into_iter()
                        .map(|h| {
                            let name = host.gui.find(h.control_id).map(|c| c.name.clone()).unwrap_or_default();
                            let mode = match h.mode {
                                HotkeyMode::Toggle => 0,
                                HotkeyMode::Hold => 1,
                            };
                            (name, h.key, mode, h.active)
                        })
                        .collect()
                };
                for hotkey in hotkeys {
                    callback.call::<()>(hotkey)?;
                }
                nothing()
            },
        )?,
    )?;

    gui.set(
        "is_menu_open",
        binding(lua, "usage: is_menu_open(): boolean", |lua, caller, _args| {
            let open = caller.host.borrow().gui.is_open();
            ret(lua, open)
        })?,
    )?;

    Ok(gui)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removing_an_option_shifts_selection() {
        assert_eq!(drop_option(ConfigValue::Bits(0b1011), 1), ConfigValue::Bits(0b101));
        assert_eq!(drop_option(ConfigValue::Bits(1 << 63), 63), ConfigValue::Bits(0));
        assert_eq!(drop_option(ConfigValue::Index(4), 2), ConfigValue::Index(3));
        assert_eq!(drop_option(ConfigValue::Index(2), 2), ConfigValue::Index(0));
        assert_eq!(drop_option(ConfigValue::Index(1), 2), ConfigValue::Index(1));
    }

    #[test]
    fn option_lists_reject_duplicates_and_overflow() {
        let options: Vec<String> = ["a", "b", "a"].iter().map(|s| s.to_string()).collect();
        assert!(matches!(check_options(&options, 64), Err(BindingError::Usage(_))));
        let many: Vec<String> = (0..65).map(|i| i.to_string()).collect();
        assert!(matches!(
            check_options(&many, MAX_MULTI_OPTIONS),
            Err(BindingError::ResourceExhausted(_))
        ));
        assert!(check_options(&many, MAX_LEGACY_OPTIONS).is_ok());
    }
}
