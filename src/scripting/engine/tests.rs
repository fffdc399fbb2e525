use super::*;
use crate::cipher;
use crate::hash::fnv1a64;
use crate::scripting::catalog::make_id;
use tempfile::TempDir;

fn setup_engine(scripts: &[(&str, &str)]) -> (TempDir, ScriptEngine) {
    let dir = tempfile::tempdir().expect("tempdir");
    let scripts_dir = ScriptKind::Script.dir(dir.path());
    std::fs::create_dir_all(&scripts_dir).expect("scripts dir");
    for (name, source) in scripts {
        std::fs::write(scripts_dir.join(format!("{name}.lua")), source).expect("write script");
    }
    let mut engine = ScriptEngine::new(HostContext::headless(dir.path()));
    engine.refresh_catalog();
    (dir, engine)
}

fn id(name: &str) -> u32 {
    make_id(name, ScriptKind::Script)
}

fn log_count(engine: &ScriptEngine, name: &str, category: LogCategory) -> usize {
    engine.host().borrow().log.count(id(name), category)
}

fn printed(engine: &ScriptEngine, name: &str) -> Vec<String> {
    engine
        .host()
        .borrow()
        .log
        .entries()
        .filter(|e| e.script_id == id(name) && e.category == LogCategory::Print)
        .map(|e| e.message.clone())
        .collect()
}

fn sorted(mut ids: Vec<u32>) -> Vec<u32> {
    ids.sort_unstable();
    ids
}

#[test]
fn failing_forward_does_not_stop_other_scripts() {
    let (_dir, mut engine) = setup_engine(&[
        ("alpha", "function on_paint() print('alpha') end"),
        ("broken", "function on_paint() error('boom') end"),
        ("gamma", "function on_paint() print('gamma') end"),
    ]);
    for name in ["alpha", "broken", "gamma"] {
        engine.run_script(id(name)).expect("start script");
    }

    let report = engine.callback("on_paint");
    assert_eq!(report, DispatchReport { invoked: 2, failed: 1 });
    assert_eq!(printed(&engine, "alpha"), vec!["alpha"]);
    assert_eq!(printed(&engine, "gamma"), vec!["gamma"]);
    assert_eq!(log_count(&engine, "broken", LogCategory::RuntimeError), 1);

    let broken = engine.find_by_id(id("broken")).expect("erroring script stays registered");
    assert_eq!(broken.state(), InstanceState::Erroring);

    let report = engine.callback("on_paint");
    assert_eq!(report, DispatchReport { invoked: 2, failed: 0 });

    engine.maintain();
    assert_eq!(engine.running_ids(), vec![id("alpha"), id("gamma")]);
}

#[test]
fn refresh_twice_yields_identical_catalog() {
    let (_dir, mut engine) = setup_engine(&[
        ("one", "--.name First\n--.author someone\nprint('x')\n"),
        ("two", ""),
    ]);
    let first = engine.catalog().to_vec();
    engine.refresh_catalog();
    assert_eq!(first.len(), 2);
    assert_eq!(first, engine.catalog());
}

#[test]
fn unload_returns_every_slot_once() {
    let (_dir, mut engine) = setup_engine(&[
        (
            "owner",
            r#"
            render.create_font("Verdana", 14)
            render.create_font("Tahoma", 12, render.font_bold)
            render.create_texture_rgba(string.rep("\255", 16), 2, 2)
            render.create_shader("void main() {}")
            render.create_animator_float(0, 1)
            render.create_animator_color(render.color(255, 0, 0), 0.5, render.ease_in)
            "#,
        ),
        ("reuser", "print(render.create_font('Arial', 10))"),
    ]);
    engine.run_script(id("owner")).expect("start owner");
    {
        let owner = engine.find_by_id(id("owner")).expect("running");
        assert_eq!(owner.owned().fonts, vec![1, 2]);
        assert_eq!(owner.owned().animators.len(), 2);
        let host = engine.host().borrow();
        assert_eq!(host.fonts.live_count(), 2);
        assert_eq!(host.textures.live_count(), 1);
        assert_eq!(host.shaders.live_count(), 1);
        assert_eq!(host.animators.live_count(), 2);
    }

    assert!(engine.stop_script(id("owner")));
    assert!(!engine.stop_script(id("owner")));
    {
        let host = engine.host().borrow();
        assert_eq!(host.fonts.live_count(), 0);
        assert_eq!(host.fonts.slots().free_count(), 2);
        assert!(host.fonts.slots().is_free(1) && host.fonts.slots().is_free(2));
        assert_eq!(host.textures.slots().free_count(), 1);
        assert_eq!(host.shaders.slots().free_count(), 1);
        assert_eq!(host.animators.slots().free_count(), 2);
        assert_eq!(host.animators.live_count(), 0);
    }

    engine.run_script(id("reuser")).expect("start reuser");
    assert_eq!(printed(&engine, "reuser"), vec!["1"]);
}

#[test]
fn duplicate_control_id_is_rejected() {
    let (_dir, mut engine) = setup_engine(&[(
        "menu",
        r#"
        gui.checkbox("dup", "scripts.main", "First")
        gui.checkbox("dup", "scripts.main", "Second")
        "#,
    )]);
    engine.run_script(id("menu")).expect("start");

    assert!(engine.find_by_id(id("menu")).is_some_and(ScriptInstance::is_running));
    assert_eq!(log_count(&engine, "menu", LogCategory::UsageError), 1);
    assert_eq!(
        engine.find_by_id(id("menu")).expect("running").owned().gui_elements,
        vec![fnv1a64("dup")]
    );
    {
        let host = engine.host().borrow();
        assert_eq!(host.config.len(), 1);
        let control = host.gui.find(fnv1a64("dup")).expect("first control kept");
        assert_eq!(control.label, "First");
        let tab = host.gui.find(fnv1a64("scripts")).expect("tab");
        assert!(tab.highlighted);
    }

    engine.stop_script(id("menu"));
    assert!(engine.host().borrow().gui.find(fnv1a64("dup")).is_none());
}

#[test]
fn rejected_config_entry_leaves_no_control() {
    let (_dir, mut engine) = setup_engine(&[("menu", r#"gui.checkbox("taken", "scripts.main", "Taken")"#)]);
    engine
        .host()
        .borrow_mut()
        .config
        .define_host(fnv1a64("taken"), crate::config::ConfigValue::Float(1.0));
    engine.run_script(id("menu")).expect("start");

    assert_eq!(log_count(&engine, "menu", LogCategory::UsageError), 1);
    let host = engine.host().borrow();
    assert!(host.gui.find(fnv1a64("taken")).is_none());
    assert_eq!(host.config.get(fnv1a64("taken")), Some(&crate::config::ConfigValue::Float(1.0)));
    drop(host);
    assert!(engine.find_by_id(id("menu")).expect("running").owned().gui_elements.is_empty());
}

#[test]
fn stored_hotkeys_follow_control_lifetime() {
    let (_dir, mut engine) = setup_engine(&[(
        "aimbot",
        r#"
        gui.checkbox("aim", "scripts.main", "Aim")
        gui.for_each_hotkey(function(name, key, mode, active) print(name, key, mode, active) end)
        "#,
    )]);
    engine.host().borrow_mut().config.hotkeys.push(crate::config::HotkeyBinding {
        control: fnv1a64("aim"),
        key: 70,
        mode: crate::gui::HotkeyMode::Hold,
    });

    engine.run_script(id("aimbot")).expect("start");
    assert_eq!(printed(&engine, "aimbot"), vec!["aim 70 1 false"]);

    engine.stop_script(id("aimbot"));
    assert!(engine.host().borrow().gui.hotkeys().is_empty());
    engine.run_script(id("aimbot")).expect("restart");
    assert_eq!(printed(&engine, "aimbot").len(), 2);
}

#[test]
fn missing_container_is_a_usage_error() {
    let (_dir, mut engine) = setup_engine(&[(
        "menu",
        "local c = gui.slider('s', 'nowhere', 'S', 0, 10)\nprint(tostring(c == nil))",
    )]);
    engine.run_script(id("menu")).expect("start");
    assert_eq!(log_count(&engine, "menu", LogCategory::UsageError), 1);
    assert_eq!(printed(&engine, "menu"), vec!["true"]);
}

#[test]
fn filesystem_bindings_refuse_traversal() {
    let (dir, mut engine) = setup_engine(&[(
        "files",
        r#"
        fs.write("../secret", "x")
        fs.write("C:\\x", "x")
        fs.write("a/b", "x")
        fs.write("a\\b", "x")
        database.save("../db", "x")
        fs.write("safe.txt", "ok")
        "#,
    )]);
    engine.run_script(id("files")).expect("start");

    assert_eq!(log_count(&engine, "files", LogCategory::SandboxViolation), 5);
    assert!(!dir.path().join("secret").exists());
    assert!(!dir.path().join("db").exists());
    let safe = std::fs::read_to_string(dir.path().join("storage").join("safe.txt")).expect("safe file");
    assert_eq!(safe, "ok");
}

#[test]
fn database_round_trips_tables() {
    let (dir, mut engine) = setup_engine(&[(
        "db",
        r#"
        database.save("settings", { volume = 3 })
        local loaded = database.load("settings")
        print(loaded.volume)
        database.save("raw", "plain text")
        print(database.load("raw"))
        "#,
    )]);
    engine.run_script(id("db")).expect("start");
    assert_eq!(printed(&engine, "db"), vec!["3", "plain text"]);
    assert!(dir.path().join("database").join("settings").is_file());
}

#[test]
fn autoload_converges_on_configured_set() {
    let (_dir, mut engine) = setup_engine(&[
        ("a", "print('main')"),
        ("b", "print('main')"),
        ("c", "print('main')"),
    ]);
    engine.run_script(id("b")).expect("start b");
    engine.run_script(id("c")).expect("start c");
    engine.host().borrow_mut().config.autoload = vec![id("a"), id("b")];

    engine.run_autoload();

    assert_eq!(sorted(engine.running_ids()), sorted(vec![id("a"), id("b")]));
    assert_eq!(printed(&engine, "b").len(), 1, "b must not be restarted");
    assert_eq!(printed(&engine, "a").len(), 1);
    assert!(engine.is_autoload_enabled(id("a")));
}

#[test]
fn autoload_toggles_are_written_back() {
    let (_dir, mut engine) = setup_engine(&[("a", "")]);
    engine.enable_autoload(id("a"));
    engine.enable_autoload(id("a"));
    assert_eq!(engine.host().borrow().config.autoload, vec![id("a")]);
    engine.disable_autoload(id("a"));
    assert!(engine.host().borrow().config.autoload.is_empty());
    assert!(!engine.is_autoload_enabled(id("a")));
}

#[test]
fn deleted_script_is_reaped_on_refresh() {
    let (dir, mut engine) = setup_engine(&[("gone", "")]);
    engine.run_script(id("gone")).expect("start");
    std::fs::remove_file(ScriptKind::Script.file_path(dir.path(), "gone")).expect("delete");

    engine.refresh_catalog();

    assert!(engine.running_ids().is_empty());
    assert!(!engine.exists(id("gone")));
}

#[test]
fn syntax_error_never_reaches_running_set() {
    let (_dir, mut engine) = setup_engine(&[("bad", "function (")]);
    let err = engine.run_script(id("bad")).expect_err("must fail");
    assert_eq!(err, "Unable to initialize script.");
    assert!(engine.running_ids().is_empty());
    assert_eq!(log_count(&engine, "bad", LogCategory::SyntaxError), 1);
}

#[test]
fn libraries_cannot_run_but_can_be_required() {
    let (dir, mut engine) = setup_engine(&[("user", "local m = require('mathx')\nprint(m.double(21))")]);
    let lib = ScriptKind::Library.dir(dir.path());
    std::fs::create_dir_all(&lib).expect("lib dir");
    std::fs::write(lib.join("mathx.lua"), "return { double = function(x) return x * 2 end }").expect("lib");
    engine.refresh_catalog();

    assert!(engine.run_script(make_id("mathx", ScriptKind::Library)).is_err());
    engine.run_script(id("user")).expect("start");
    assert_eq!(printed(&engine, "user"), vec!["42"]);
}

#[test]
fn required_libraries_run_once_per_script() {
    let (dir, mut engine) = setup_engine(&[(
        "user",
        "local a = require('counter')\nlocal b = require('counter')\nprint(a == b, loads)\nprint(require('selfish').nested)",
    )]);
    let lib = ScriptKind::Library.dir(dir.path());
    std::fs::create_dir_all(&lib).expect("lib dir");
    std::fs::write(lib.join("counter.lua"), "loads = (loads or 0) + 1\nreturn {}").expect("lib");
    std::fs::write(lib.join("selfish.lua"), "return { nested = require('selfish') == nil }").expect("lib");
    engine.refresh_catalog();

    engine.run_script(id("user")).expect("start");
    assert_eq!(printed(&engine, "user"), vec!["true 1", "true"]);
    assert_eq!(log_count(&engine, "user", LogCategory::UsageError), 1);
    assert!(engine.find_by_id(id("user")).is_some_and(ScriptInstance::is_running));
}

#[test]
fn insecure_capabilities_are_denied_by_default() {
    let (_dir, mut engine) = setup_engine(&[(
        "zipper",
        "local z = zip.open('bundle.zip')\nlocal a = zip.create()\na:write('x.txt', 'hi')\nprint(a:read('x.txt'))\na:save('out.zip')",
    )]);
    engine.run_script(id("zipper")).expect("start");
    assert_eq!(log_count(&engine, "zipper", LogCategory::PolicyDenied), 2);
    assert_eq!(printed(&engine, "zipper"), vec!["hi"]);
    assert!(engine.find_by_id(id("zipper")).is_some_and(ScriptInstance::is_running));
}

#[test]
fn shutdown_forward_runs_only_without_prior_error() {
    let (_dir, mut engine) = setup_engine(&[
        ("clean", "function on_shutdown() print('bye') end"),
        (
            "dirty",
            "function on_paint() error('x') end\nfunction on_shutdown() print('bye') end",
        ),
    ]);
    engine.run_script(id("clean")).expect("start clean");
    engine.run_script(id("dirty")).expect("start dirty");
    engine.callback("on_paint");
    engine.stop_all();

    assert_eq!(printed(&engine, "clean"), vec!["bye"]);
    assert!(printed(&engine, "dirty").is_empty());
}

#[test]
fn timers_fire_from_frame_clock() {
    let (_dir, mut engine) = setup_engine(&[(
        "ticker",
        r#"
        utils.run_delayed(0.5, function() print("delayed") end)
        local t = utils.new_timer(0.25, function() print("tick") end)
        t:start()
        "#,
    )]);
    engine.run_script(id("ticker")).expect("start");
    let frame = |realtime: f64, framecount: u64| GlobalVars {
        realtime,
        curtime: realtime,
        framecount,
        ..Default::default()
    };

    engine.run_frame(frame(0.1, 1));
    assert!(printed(&engine, "ticker").is_empty());
    engine.run_frame(frame(0.3, 2));
    engine.run_frame(frame(0.6, 3));
    assert_eq!(printed(&engine, "ticker"), vec!["tick", "delayed", "tick"]);
}

#[test]
fn random_float_rejects_unbounded_ranges() {
    let (_dir, mut engine) = setup_engine(&[(
        "dice",
        r#"
        function on_paint()
            print(utils.random_float(0, math.huge) == nil)
            print(utils.random_float(-1e308, 1e308) == nil)
            local x = utils.random_float(1, 2)
            print(x >= 1 and x < 2)
        end
        "#,
    )]);
    engine.run_script(id("dice")).expect("start");

    let report = engine.callback("on_paint");
    assert_eq!(report, DispatchReport { invoked: 1, failed: 0 });
    assert_eq!(printed(&engine, "dice"), vec!["true", "true", "true"]);
    assert_eq!(log_count(&engine, "dice", LogCategory::UsageError), 2);
    assert_eq!(log_count(&engine, "dice", LogCategory::RuntimeError), 0);
}

#[test]
fn create_callback_extends_forward_list() {
    let (_dir, mut engine) = setup_engine(&[("custom", "function on_custom() print('custom') end")]);
    engine.run_script(id("custom")).expect("start");
    assert_eq!(engine.callback("on_custom").invoked, 0);
    engine.create_callback("on_custom");
    assert_eq!(engine.callback("on_custom").invoked, 1);
    assert_eq!(printed(&engine, "custom"), vec!["custom"]);
}

#[test]
fn control_callbacks_fire_for_value_changes() {
    let (_dir, mut engine) = setup_engine(&[(
        "cb",
        r#"
        local box = gui.checkbox("toggle", "scripts.main", "Toggle")
        box:add_callback(function() print(tostring(box:get_value())) end)
        "#,
    )]);
    engine.run_script(id("cb")).expect("start");
    engine
        .host()
        .borrow_mut()
        .config
        .set(fnv1a64("toggle"), crate::config::ConfigValue::Bool(true))
        .expect("set value");
    engine.fire_control_callbacks(fnv1a64("toggle"));
    assert_eq!(printed(&engine, "cb"), vec!["true"]);
}

#[test]
fn sealed_script_needs_session_key() {
    let key = crate::cipher::SessionKey::derive("session");
    let (dir, mut engine) = setup_engine(&[]);
    let path = ScriptKind::Script.file_path(dir.path(), "sealed");
    std::fs::write(&path, cipher::seal(&key, b"print('opened')")).expect("write sealed");
    engine.refresh_catalog();

    assert!(engine.run_script(id("sealed")).is_err());
    assert_eq!(log_count(&engine, "sealed", LogCategory::InitError), 1);

    engine.set_session_key(Some(key));
    engine.run_script(id("sealed")).expect("start with key");
    assert_eq!(printed(&engine, "sealed"), vec!["opened"]);
}

#[test]
fn global_vars_are_read_only() {
    let (_dir, mut engine) = setup_engine(&[(
        "globals",
        "function on_paint() print(global_vars.framecount) global_vars.framecount = 1 end",
    )]);
    engine.run_script(id("globals")).expect("start");
    let report = engine.run_frame(GlobalVars {
        framecount: 7,
        ..Default::default()
    });
    assert_eq!(report.failed, 1);
    assert_eq!(printed(&engine, "globals"), vec!["7"]);
    assert!(engine.running_ids().is_empty(), "erroring script is reaped after the frame");
}
