use mlua::{Lua, LuaSerdeExt, MultiValue, Table, UserData, UserDataMethods, Value};
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{binding, guarded, nothing, ret, Args, BindingError, BindingResult, Caller};
use crate::scripting::LogCategory;

/// Script-side view of a timer in the caller's own timer list.
pub(crate) struct TimerHandle {
    id: u32,
}

fn timer_method<M, F>(methods: &mut M, name: &'static str, usage: &'static str, body: F)
where
    M: UserDataMethods<TimerHandle>,
    F: Fn(&Lua, &Caller, u32, Args) -> BindingResult + 'static,
{
    methods.add_method(name, move |lua, this, args: MultiValue| {
        let id = this.id;
        guarded(lua, usage, args, |caller, args| body(lua, caller, id, args))
    });
}

fn missing_timer(id: u32) -> BindingError {
    BindingError::Usage(format!("timer {id} no longer exists"))
}

fn now(caller: &Caller) -> f64 {
    caller.host.borrow().globals.realtime
}

fn delay_arg(args: &Args, index: usize) -> BindingResult<f64> {
    let delay = args.number(index)?;
    if delay.is_finite() && delay >= 0.0 {
        Ok(delay)
    } else {
        Err(args.usage())
    }
}

impl UserData for TimerHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        timer_method(methods, "start", "usage: tmr:start()", |_, caller, id, _args| {
            let now = now(caller);
            let mut owned = caller.owned.borrow_mut();
            let timer = owned.timers.get_mut(id).ok_or_else(|| missing_timer(id))?;
            timer.run_once = false;
            owned.timers.start(id, now);
            nothing()
        });

        timer_method(methods, "stop", "usage: tmr:stop()", |_, caller, id, _args| {
            if !caller.owned.borrow_mut().timers.stop(id) {
                return Err(missing_timer(id));
            }
            nothing()
        });

        timer_method(methods, "run_once", "usage: tmr:run_once()", |_, caller, id, _args| {
            let now = now(caller);
            let mut owned = caller.owned.borrow_mut();
            let timer = owned.timers.get_mut(id).ok_or_else(|| missing_timer(id))?;
            timer.run_once = true;
            owned.timers.start(id, now);
            nothing()
        });

        timer_method(methods, "set_delay", "usage: tmr:set_delay(time: number)", |_, caller, id, args| {
            let delay = delay_arg(&args, 0)?;
            let mut owned = caller.owned.borrow_mut();
            let timer = owned.timers.get_mut(id).ok_or_else(|| missing_timer(id))?;
            timer.next_fire += delay - timer.delay;
            timer.delay = delay;
            nothing()
        });

        timer_method(methods, "is_active", "usage: tmr:is_active(): boolean", |lua, caller, id, _args| {
            let active = caller.owned.borrow().timers.is_active(id);
            ret(lua, active)
        });
    }
}

/// Wall clock as `HH:MM:SS` (UTC).
fn clock_string(since_epoch: u64) -> String {
    let seconds = since_epoch % 86_400;
    format!("{:02}:{:02}:{:02}", seconds / 3600, (seconds / 60) % 60, seconds % 60)
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub(super) fn namespace(lua: &Lua) -> mlua::Result<Table> {
    let utils = lua.create_table()?;

    utils.set(
        "new_timer",
        binding(lua, "usage: new_timer(delay: number, callback: function): timer", |lua, caller, args| {
            let delay = delay_arg(&args, 0)?;
            let callback = args.function(1)?;
            let id = caller.owned.borrow_mut().timers.create(delay, callback);
            ret(lua, TimerHandle { id })
        })?,
    )?;

    utils.set(
        "run_delayed",
        binding(lua, "usage: run_delayed(delay: number, callback: function)", |_, caller, args| {
            let delay = delay_arg(&args, 0)?;
            let callback = args.function(1)?;
            let now = now(caller);
            caller.owned.borrow_mut().timers.run_delayed(delay, callback, now);
            nothing()
        })?,
    )?;

    utils.set(
        "get_time",
        binding(lua, "usage: get_time(): string", |lua, _caller, _args| {
            ret(lua, clock_string(unix_time()))
        })?,
    )?;

    utils.set(
        "get_unix_time",
        binding(lua, "usage: get_unix_time(): number", |lua, _caller, _args| {
            ret(lua, unix_time() as i64)
        })?,
    )?;

    utils.set(
        "json_encode",
        binding(lua, "usage: json_encode(value: table): string", |lua, _caller, args| {
            let table = args.table(0)?;
            let json: serde_json::Value = lua
                .from_value(Value::Table(table))
                .map_err(|e| BindingError::Usage(format!("json_encode: {e}")))?;
            ret(lua, json.to_string())
        })?,
    )?;

    utils.set(
        "json_decode",
        binding(lua, "usage: json_decode(json: string): table", |lua, _caller, args| {
            let text = args.string(0)?;
            let json: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| BindingError::Usage(format!("json_decode: {e}")))?;
            ret(lua, lua.to_value(&json)?)
        })?,
    )?;

    utils.set(
        "print_console",
        binding(lua, "usage: print_console(text: string, color = white)", |_, caller, args| {
            let text = args.string(0)?;
            caller.report(LogCategory::Print, text);
            nothing()
        })?,
    )?;

    utils.set(
        "error_print",
        binding(lua, "usage: error_print(text: string)", |_, caller, args| {
            let text = args.string(0)?;
            caller.report(LogCategory::Warning, text);
            nothing()
        })?,
    )?;

    utils.set(
        "flags",
        binding(lua, "usage: flags(...: number): number", |lua, _caller, args| {
            let mut flags = 0i64;
            for index in 0..args.len() {
                flags |= args.integer(index)?;
            }
            ret(lua, flags)
        })?,
    )?;

    utils.set(
        "random_int",
        binding(lua, "usage: random_int(min: number, max: number): number", |lua, caller, args| {
            let (min, max) = (args.integer(0)?, args.integer(1)?);
            if min > max {
                return Err(args.usage());
            }
            let value = caller.host.borrow_mut().rng.gen_range(min..=max);
            ret(lua, value)
        })?,
    )?;

    utils.set(
        "random_float",
        binding(lua, "usage: random_float(min: number, max: number): number", |lua, caller, args| {
            let (min, max) = (args.number(0)?, args.number(1)?);
            // rand panics on a non-finite bound or span.
            if !(min <= max && min.is_finite() && max.is_finite() && (max - min).is_finite()) {
                return Err(args.usage());
            }
            if min == max {
                return ret(lua, min);
            }
            let value = caller.host.borrow_mut().rng.gen_range(min..max);
            ret(lua, value)
        })?,
    )?;

    Ok(utils)
}

#[cfg(test)]
mod tests {
    use super::clock_string;

    #[test]
    fn clock_wraps_at_midnight() {
        assert_eq!(clock_string(0), "00:00:00");
        assert_eq!(clock_string(86_399), "23:59:59");
        assert_eq!(clock_string(86_400 + 3_661), "01:01:01");
    }
}
