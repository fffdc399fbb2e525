use mlua::{Lua, MultiValue, Table, UserData, UserDataMethods, Value};

use super::{binding, byte_table, guarded, nothing, ret, Args, BindingError, BindingResult, Caller};
use crate::archive::Archive;
use crate::scripting::sandbox;

pub(crate) struct ArchiveHandle {
    archive: Archive,
}

fn storage_target(caller: &Caller, name: &str) -> BindingResult<std::path::PathBuf> {
    let root = caller.host.borrow().storage_dir();
    sandbox::sandboxed_path(&root, name).map_err(BindingError::SandboxViolation)
}

fn entry<'a>(archive: &'a Archive, name: &str) -> BindingResult<&'a [u8]> {
    archive
        .read(name)
        .ok_or_else(|| BindingError::Usage(format!("entry not found: {name}")))
}

fn archive_method<M, F>(methods: &mut M, name: &'static str, usage: &'static str, body: F)
where
    M: UserDataMethods<ArchiveHandle>,
    F: Fn(&Lua, &Caller, &mut Archive, Args) -> BindingResult + 'static,
{
    methods.add_method_mut(name, move |lua, this, args: MultiValue| {
        guarded(lua, usage, args, |caller, args| body(lua, caller, &mut this.archive, args))
    });
}

impl UserData for ArchiveHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        archive_method(methods, "get_files", "usage: obj:get_files(): table", |lua, _, archive, _args| {
            let names: Vec<String> = archive.files().map(str::to_string).collect();
            ret(lua, lua.create_sequence_from(names)?)
        });

        archive_method(methods, "read", "usage: obj:read(name: string): string", |lua, _, archive, args| {
            let name = args.string(0)?;
            ret(lua, lua.create_string(entry(archive, &name)?)?)
        });

        archive_method(methods, "read_stream", "usage: obj:read_stream(name: string): table", |lua, _, archive, args| {
            let name = args.string(0)?;
            ret(lua, byte_table(lua, entry(archive, &name)?)?)
        });

        archive_method(methods, "write", "usage: obj:write(name: string, data: string)", |_, _, archive, args| {
            let name = args.string(0)?;
            archive.write(&name, args.bytes(1)?).map_err(BindingError::Usage)?;
            nothing()
        });

        archive_method(
            methods,
            "write_stream",
            "usage: obj:write_stream(name: string, data: table)",
            |_, _, archive, args| {
                let name = args.string(0)?;
                archive.write(&name, args.byte_table(1)?).map_err(BindingError::Usage)?;
                nothing()
            },
        );

        archive_method(methods, "exists", "usage: obj:exists(name: string): boolean", |lua, _, archive, args| {
            let name = args.string(0)?;
            ret(lua, archive.exists(&name))
        });

        archive_method(methods, "save", "usage: obj:save(path: string)", |_, caller, archive, args| {
            let path = args.string(0)?;
            caller.require_insecure("zip save")?;
            let dest = storage_target(caller, &path)?;
            archive.save(&dest).map_err(BindingError::Usage)?;
            nothing()
        });

        archive_method(methods, "extract", "usage: obj:extract(name: string, path: string)", |_, caller, archive, args| {
            let (name, path) = (args.string(0)?, args.string(1)?);
            caller.require_insecure("zip extract")?;
            let dest = storage_target(caller, &path)?;
            archive.extract(&name, &dest).map_err(BindingError::Usage)?;
            nothing()
        });

        archive_method(methods, "extract_all", "usage: obj:extract_all(path: string): number", |lua, caller, archive, args| {
            let path = args.string(0)?;
            caller.require_insecure("zip extract_all")?;
            let dest = storage_target(caller, &path)?;
            let count = archive.extract_all(&dest).map_err(BindingError::Usage)?;
            ret(lua, count as i64)
        });
    }
}

pub(super) fn namespace(lua: &Lua) -> mlua::Result<Table> {
    let zip = lua.create_table()?;

    zip.set(
        "create",
        binding(lua, "usage: create(): zip", |lua, _caller, _args| {
            ret(lua, ArchiveHandle { archive: Archive::new() })
        })?,
    )?;

    zip.set(
        "open",
        binding(lua, "usage: open(path: string): zip", |lua, caller, args| {
            let name = args.string(0)?;
            caller.require_insecure("zip open")?;
            let path = storage_target(caller, &name)?;
            let archive = Archive::open(&path).map_err(BindingError::Usage)?;
            ret(lua, ArchiveHandle { archive })
        })?,
    )?;

    zip.set(
        "open_stream",
        binding(lua, "usage: open_stream(data: string | table): zip", |lua, _caller, args| {
            let bytes = match args.value(0) {
                Value::Table(_) => args.byte_table(0)?,
                _ => args.bytes(0)?,
            };
            let archive = Archive::from_bytes(&bytes).map_err(BindingError::Usage)?;
            ret(lua, ArchiveHandle { archive })
        })?,
    )?;

    Ok(zip)
}
