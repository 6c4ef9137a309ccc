//! The `bk` builder table and its userdata types.
//!
//! Every builder call records the Lua caller's source file and line so
//! the serializer can emit a source map, and converts option tables into
//! the typed option structs of the operation library. Validation
//! failures raise at the failing call site.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::{AnyUserData, Lua, Table, UserData, UserDataMethods, Value, Variadic};

use luakit_llb::{
    diff, exec, file, merge, source, ChownOpt, CopyOptions, ImageConfig, ImageSettings,
    MkdirOptions, MkfileOptions, MountSpec, NetworkMode, Origin, Platform, RmOptions,
    RunOptions, SecurityMode, State, UserOpt,
};
use luakit_llb::exec::CacheSharing;
use luakit_llb::source::{GitOptions, HttpOptions, ImageOptions, LocalOptions};

use crate::eval::{Channels, Exported};

/// A build state as seen by the script.
#[derive(Clone)]
pub struct LuaState(pub(crate) State);

/// A mount description produced by the factories on `bk`.
#[derive(Clone)]
pub struct LuaMount(pub(crate) MountSpec);

impl UserData for LuaMount {}

fn external(err: impl std::error::Error + Send + Sync + 'static) -> mlua::Error {
    mlua::Error::external(err)
}

/// Source file and line of the Lua call that entered this function.
fn caller_origin(lua: &Lua) -> Origin {
    match lua.inspect_stack(1) {
        Some(debug) => {
            let file = debug
                .source()
                .short_src
                .map(|src| src.to_string())
                .unwrap_or_default();
            Origin::new(file, debug.curr_line())
        }
        None => Origin::default(),
    }
}

/// Parse an `os/arch[/variant]` platform string.
fn parse_platform(text: &str) -> mlua::Result<Platform> {
    let mut parts = text.splitn(3, '/');
    let os = parts.next().unwrap_or_default();
    let arch = parts.next().unwrap_or_default();
    if os.is_empty() || arch.is_empty() {
        return Err(mlua::Error::RuntimeError(format!(
            "malformed platform '{text}', expected os/arch[/variant]"
        )));
    }
    let mut platform = Platform::new(os, arch);
    if let Some(variant) = parts.next() {
        platform = platform.with_variant(variant);
    }
    Ok(platform)
}

/// Parse a `user[:group]` ownership string; numeric parts become ids.
fn parse_owner(owner: &str) -> ChownOpt {
    fn to_opt(part: &str) -> Option<UserOpt> {
        if part.is_empty() {
            None
        } else if let Ok(id) = part.parse::<u32>() {
            Some(UserOpt::ById(id))
        } else {
            Some(UserOpt::ByName(part.to_string()))
        }
    }
    let (user, group) = match owner.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (owner, None),
    };
    ChownOpt {
        user: to_opt(user),
        group: group.and_then(to_opt),
    }
}

/// A command is either a shell string or an argv table.
fn command_args(cmd: Value) -> mlua::Result<Vec<String>> {
    match cmd {
        Value::String(text) => Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            text.to_str()?.to_string(),
        ]),
        Value::Table(table) => table.sequence_values::<String>().collect(),
        _ => Err(mlua::Error::RuntimeError(
            "run expects a command string or an argv table".to_string(),
        )),
    }
}

fn state_arg(ud: &AnyUserData) -> mlua::Result<State> {
    Ok(ud.borrow::<LuaState>()?.0.clone())
}

fn run_options(opts: Option<Table>) -> mlua::Result<RunOptions> {
    let mut options = RunOptions::default();
    let Some(opts) = opts else {
        return Ok(options);
    };
    if let Some(env) = opts.get::<_, Option<Vec<String>>>("env")? {
        options.env = env;
    }
    options.cwd = opts.get("cwd")?;
    options.user = opts.get("user")?;
    options.hostname = opts.get("hostname")?;
    options.name = opts.get("name")?;
    options.progress_group = opts.get("group")?;
    if let Some(network) = opts.get::<_, Option<String>>("network")? {
        options.network = NetworkMode::parse(&network);
    }
    if let Some(security) = opts.get::<_, Option<String>>("security")? {
        options.security = SecurityMode::parse(&security);
    }
    if let Some(codes) = opts.get::<_, Option<Vec<i32>>>("valid_exit_codes")? {
        options.valid_exit_codes = codes;
    }
    if let Some(hosts) = opts.get::<_, Option<Table>>("extra_hosts")? {
        for entry in hosts.sequence_values::<Table>() {
            let entry = entry?;
            let host: String = entry.get("host")?;
            let ip: String = entry.get("ip")?;
            options.extra_hosts.push((host, ip));
        }
    }
    if let Some(mounts) = opts.get::<_, Option<Table>>("mounts")? {
        for mount in mounts.sequence_values::<AnyUserData>() {
            options.mounts.push(mount?.borrow::<LuaMount>()?.0.clone());
        }
    }
    Ok(options)
}

fn copy_options(opts: Option<Table>) -> mlua::Result<CopyOptions> {
    let mut options = CopyOptions::default();
    let Some(opts) = opts else {
        return Ok(options);
    };
    if let Some(value) = opts.get::<_, Option<bool>>("follow_symlink")? {
        options.follow_symlink = value;
    }
    if let Some(value) = opts.get::<_, Option<bool>>("dir_copy_contents")? {
        options.dir_copy_contents = value;
    }
    if let Some(value) = opts.get::<_, Option<bool>>("create_dest_path")? {
        options.create_dest_path = value;
    }
    if let Some(value) = opts.get::<_, Option<bool>>("allow_wildcard")? {
        options.allow_wildcard = value;
    }
    if let Some(value) = opts.get::<_, Option<bool>>("allow_empty_wildcard")? {
        options.allow_empty_wildcard = value;
    }
    options.mode = opts.get("mode")?;
    if let Some(owner) = opts.get::<_, Option<String>>("owner")? {
        options.owner = parse_owner(&owner);
    }
    if let Some(patterns) = opts.get::<_, Option<Vec<String>>>("include")? {
        options.include_patterns = patterns;
    }
    if let Some(patterns) = opts.get::<_, Option<Vec<String>>>("exclude")? {
        options.exclude_patterns = patterns;
    }
    Ok(options)
}

/// The image config recorded by `bk.export`.
fn image_config_from_opts(opts: &Table) -> mlua::Result<ImageConfig> {
    let mut settings = ImageSettings::default();
    if let Some(user) = opts.get::<_, Option<String>>("user")? {
        settings.user = user;
    }
    if let Some(env) = opts.get::<_, Option<Vec<String>>>("env")? {
        settings.env = env;
    }
    settings.entrypoint = opts.get("entrypoint")?;
    settings.cmd = opts.get("cmd")?;
    if let Some(workdir) = opts.get::<_, Option<String>>("workdir")? {
        settings.working_dir = workdir;
    }
    settings.labels = opts.get("labels")?;
    if let Some(ports) = opts.get::<_, Option<Vec<String>>>("ports")? {
        settings.exposed_ports = Some(
            ports
                .into_iter()
                .map(|port| (port, serde_json::json!({})))
                .collect(),
        );
    }
    let platform = match opts.get::<_, Option<String>>("platform")? {
        Some(text) => Some(parse_platform(&text)?),
        None => None,
    };
    let (os, architecture, variant) = match platform {
        Some(platform) => (platform.os, platform.architecture, platform.variant),
        None => (String::new(), String::new(), None),
    };
    Ok(ImageConfig {
        os,
        architecture,
        variant,
        config: Some(settings),
    })
}

impl UserData for LuaState {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("run", |lua, this, (cmd, opts): (Value, Option<Table>)| {
            let origin = caller_origin(lua);
            let args = command_args(cmd)?;
            let options = run_options(opts)?;
            let state = exec::run(&this.0, args, options, origin).map_err(external)?;
            Ok(LuaState(state))
        });

        methods.add_method(
            "copy",
            |lua, this, (from, src, dest, opts): (AnyUserData, String, String, Option<Table>)| {
                let origin = caller_origin(lua);
                let from = state_arg(&from)?;
                let options = copy_options(opts)?;
                let state =
                    file::copy(&this.0, &from, &src, &dest, options, origin).map_err(external)?;
                Ok(LuaState(state))
            },
        );

        methods.add_method("mkdir", |lua, this, (path, opts): (String, Option<Table>)| {
            let origin = caller_origin(lua);
            let mut options = MkdirOptions::default();
            if let Some(opts) = &opts {
                if let Some(mode) = opts.get::<_, Option<i32>>("mode")? {
                    options.mode = mode;
                }
                if let Some(parents) = opts.get::<_, Option<bool>>("parents")? {
                    options.make_parents = parents;
                }
                if let Some(owner) = opts.get::<_, Option<String>>("owner")? {
                    options.owner = parse_owner(&owner);
                }
            }
            let state = file::mkdir(&this.0, &path, options, origin).map_err(external)?;
            Ok(LuaState(state))
        });

        methods.add_method(
            "mkfile",
            |lua, this, (path, data, opts): (String, mlua::String, Option<Table>)| {
                let origin = caller_origin(lua);
                let mut options = MkfileOptions::default();
                if let Some(opts) = &opts {
                    if let Some(mode) = opts.get::<_, Option<i32>>("mode")? {
                        options.mode = mode;
                    }
                    if let Some(owner) = opts.get::<_, Option<String>>("owner")? {
                        options.owner = parse_owner(&owner);
                    }
                }
                let state =
                    file::mkfile(&this.0, &path, data.as_bytes().to_vec(), options, origin)
                        .map_err(external)?;
                Ok(LuaState(state))
            },
        );

        methods.add_method("rm", |lua, this, (path, opts): (String, Option<Table>)| {
            let origin = caller_origin(lua);
            let mut options = RmOptions::default();
            if let Some(opts) = &opts {
                if let Some(value) = opts.get::<_, Option<bool>>("allow_not_found")? {
                    options.allow_not_found = value;
                }
                if let Some(value) = opts.get::<_, Option<bool>>("allow_wildcard")? {
                    options.allow_wildcard = value;
                }
            }
            let state = file::rm(&this.0, &path, options, origin).map_err(external)?;
            Ok(LuaState(state))
        });

        methods.add_method(
            "symlink",
            |lua, this, (oldpath, newpath, opts): (String, String, Option<Table>)| {
                let origin = caller_origin(lua);
                let mut owner = ChownOpt::default();
                if let Some(opts) = &opts {
                    if let Some(text) = opts.get::<_, Option<String>>("owner")? {
                        owner = parse_owner(&text);
                    }
                }
                let state =
                    file::symlink(&this.0, &oldpath, &newpath, owner, origin).map_err(external)?;
                Ok(LuaState(state))
            },
        );

        methods.add_method("with_platform", |_, this, platform: String| {
            let platform = parse_platform(&platform)?;
            Ok(LuaState(this.0.with_platform(platform)))
        });
    }
}

/// Install the `bk` table into `lua`'s globals.
pub(crate) fn install_bk(lua: &Lua, channels: &Rc<RefCell<Channels>>) -> mlua::Result<()> {
    let bk = lua.create_table()?;

    bk.set(
        "image",
        lua.create_function(|lua, (reference, opts): (String, Option<Table>)| {
            let origin = caller_origin(lua);
            let mut options = ImageOptions::default();
            if let Some(opts) = &opts {
                if let Some(resolve) = opts.get::<_, Option<bool>>("resolve_digest")? {
                    options.resolve_digest = resolve;
                }
                if let Some(platform) = opts.get::<_, Option<String>>("platform")? {
                    options.platform = Some(parse_platform(&platform)?);
                }
            }
            let state = source::image(&reference, options, origin).map_err(external)?;
            Ok(LuaState(state))
        })?,
    )?;

    let local_fn = lua.create_function(|lua, (name, opts): (String, Option<Table>)| {
        let origin = caller_origin(lua);
        let mut options = LocalOptions::default();
        if let Some(opts) = &opts {
            if let Some(patterns) = opts.get::<_, Option<Vec<String>>>("include")? {
                options.include_patterns = patterns;
            }
            if let Some(patterns) = opts.get::<_, Option<Vec<String>>>("exclude")? {
                options.exclude_patterns = patterns;
            }
            options.shared_key_hint = opts.get("shared_key_hint")?;
        }
        let state = source::local(&name, options, origin).map_err(external)?;
        Ok(LuaState(state))
    })?;
    // `local` is a Lua keyword, so the canonical name carries a trailing
    // underscore; the bare key still works via bk["local"].
    bk.set("local_", local_fn.clone())?;
    bk.set("local", local_fn)?;

    bk.set(
        "git",
        lua.create_function(|lua, (url, opts): (String, Option<Table>)| {
            let origin = caller_origin(lua);
            let mut options = GitOptions::default();
            if let Some(opts) = &opts {
                options.reference = opts.get("ref")?;
                if let Some(keep) = opts.get::<_, Option<bool>>("keep_git_dir")? {
                    options.keep_git_dir = keep;
                }
            }
            let state = source::git(&url, options, origin).map_err(external)?;
            Ok(LuaState(state))
        })?,
    )?;

    bk.set(
        "http",
        lua.create_function(|lua, (url, opts): (String, Option<Table>)| {
            let origin = caller_origin(lua);
            let mut options = HttpOptions::default();
            if let Some(opts) = &opts {
                options.checksum = opts.get("checksum")?;
                options.filename = opts.get("filename")?;
                options.mode = opts.get("mode")?;
                if let Some(headers) = opts.get::<_, Option<Table>>("headers")? {
                    for pair in headers.pairs::<String, String>() {
                        let (name, value) = pair?;
                        options.headers.push((name, value));
                    }
                    options.headers.sort();
                }
                let username = opts.get::<_, Option<String>>("username")?;
                let password = opts.get::<_, Option<String>>("password")?;
                if let (Some(username), Some(password)) = (username, password) {
                    options.basic_auth = Some((username, password));
                }
            }
            let state = source::http(&url, options, origin).map_err(external)?;
            Ok(LuaState(state))
        })?,
    )?;

    bk.set(
        "scratch",
        lua.create_function(|lua, ()| {
            let origin = caller_origin(lua);
            Ok(LuaState(source::scratch(origin)))
        })?,
    )?;

    bk.set(
        "merge",
        lua.create_function(|lua, states: Variadic<AnyUserData>| {
            let origin = caller_origin(lua);
            let states = states
                .iter()
                .map(state_arg)
                .collect::<mlua::Result<Vec<_>>>()?;
            let state = merge(&states, origin).map_err(external)?;
            Ok(LuaState(state))
        })?,
    )?;

    bk.set(
        "diff",
        lua.create_function(
            |lua, (lower, upper): (Option<AnyUserData>, Option<AnyUserData>)| {
                let origin = caller_origin(lua);
                let lower = lower.as_ref().map(state_arg).transpose()?;
                let upper = upper.as_ref().map(state_arg).transpose()?;
                let state = diff(lower.as_ref(), upper.as_ref(), origin).map_err(external)?;
                Ok(LuaState(state))
            },
        )?,
    )?;

    bk.set(
        "cache",
        lua.create_function(|_, (dest, opts): (String, Option<Table>)| {
            let mut id = dest.clone();
            let mut sharing = CacheSharing::default();
            if let Some(opts) = &opts {
                if let Some(value) = opts.get::<_, Option<String>>("id")? {
                    id = value;
                }
                if let Some(value) = opts.get::<_, Option<String>>("sharing")? {
                    sharing = CacheSharing::parse(&value);
                }
            }
            Ok(LuaMount(MountSpec::Cache { dest, id, sharing }))
        })?,
    )?;

    bk.set(
        "tmpfs",
        lua.create_function(|_, (dest, opts): (String, Option<Table>)| {
            let mut size = 0;
            if let Some(opts) = &opts {
                if let Some(value) = opts.get::<_, Option<i64>>("size")? {
                    size = value;
                }
            }
            Ok(LuaMount(MountSpec::Tmpfs { dest, size }))
        })?,
    )?;

    bk.set(
        "secret",
        lua.create_function(|_, (dest, opts): (String, Option<Table>)| {
            let default_id = dest.rsplit('/').next().unwrap_or_default().to_string();
            let mut mount = MountSpec::Secret {
                dest,
                id: if default_id.is_empty() { "default".to_string() } else { default_id },
                uid: 0,
                gid: 0,
                mode: 0o400,
                optional: false,
            };
            if let (Some(opts), MountSpec::Secret { id, uid, gid, mode, optional, .. }) =
                (&opts, &mut mount)
            {
                if let Some(value) = opts.get::<_, Option<String>>("id")? {
                    *id = value;
                }
                if let Some(value) = opts.get::<_, Option<u32>>("uid")? {
                    *uid = value;
                }
                if let Some(value) = opts.get::<_, Option<u32>>("gid")? {
                    *gid = value;
                }
                if let Some(value) = opts.get::<_, Option<u32>>("mode")? {
                    *mode = value;
                }
                if let Some(value) = opts.get::<_, Option<bool>>("optional")? {
                    *optional = value;
                }
            }
            Ok(LuaMount(mount))
        })?,
    )?;

    bk.set(
        "ssh",
        lua.create_function(|_, opts: Option<Table>| {
            let mut mount = MountSpec::Ssh {
                dest: "/run/buildkit/ssh_agent.0".to_string(),
                id: "default".to_string(),
                uid: 0,
                gid: 0,
                mode: 0o600,
                optional: false,
            };
            if let (Some(opts), MountSpec::Ssh { dest, id, uid, gid, mode, optional }) =
                (&opts, &mut mount)
            {
                if let Some(value) = opts.get::<_, Option<String>>("dest")? {
                    *dest = value;
                }
                if let Some(value) = opts.get::<_, Option<String>>("id")? {
                    *id = value;
                }
                if let Some(value) = opts.get::<_, Option<u32>>("uid")? {
                    *uid = value;
                }
                if let Some(value) = opts.get::<_, Option<u32>>("gid")? {
                    *gid = value;
                }
                if let Some(value) = opts.get::<_, Option<u32>>("mode")? {
                    *mode = value;
                }
                if let Some(value) = opts.get::<_, Option<bool>>("optional")? {
                    *optional = value;
                }
            }
            Ok(LuaMount(mount))
        })?,
    )?;

    bk.set(
        "bind",
        lua.create_function(|_, (state, dest, opts): (AnyUserData, String, Option<Table>)| {
            let state = state_arg(&state)?;
            let mut readonly = true;
            let mut selector = None;
            if let Some(opts) = &opts {
                if let Some(value) = opts.get::<_, Option<bool>>("readonly")? {
                    readonly = value;
                }
                selector = opts.get("selector")?;
            }
            Ok(LuaMount(MountSpec::Bind {
                state,
                dest,
                readonly,
                selector,
            }))
        })?,
    )?;

    let ch = Rc::clone(channels);
    bk.set(
        "export",
        lua.create_function(move |_, (state, opts): (AnyUserData, Option<Table>)| {
            let state = state_arg(&state)?;
            let image_config = opts.as_ref().map(image_config_from_opts).transpose()?;
            // Last call wins.
            ch.borrow_mut().exported = Some(Exported {
                state,
                image_config,
            });
            Ok(())
        })?,
    )?;

    lua.globals().set("bk", bk)
}
