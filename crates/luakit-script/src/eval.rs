//! Script evaluation: the evaluator object and its side channels.
//!
//! A script does not return its result; it records the exported state
//! (and optionally an image config) through `bk.export`. Those side
//! channels are scoped to the [`Evaluator`] rather than the process, so
//! embedding programs can drive sequential evaluations with
//! [`Evaluator::reset`] in between.

use std::cell::RefCell;
use std::env;
use std::path::Path;
use std::rc::Rc;

use mlua::Lua;
use tracing::debug;

use luakit_llb::{ImageConfig, State};

use crate::error::{ScriptError, ScriptResult};
use crate::surface::install_bk;

/// Environment variable overriding the search path for script-side
/// library files.
pub const STDLIB_DIR_ENV: &str = "LUAKIT_STDLIB_DIR";

pub(crate) struct Exported {
    pub(crate) state: State,
    pub(crate) image_config: Option<ImageConfig>,
}

/// Side channels filled during evaluation.
#[derive(Default)]
pub(crate) struct Channels {
    pub(crate) exported: Option<Exported>,
    pub(crate) sources: Vec<(String, Vec<u8>)>,
}

/// Result of one script evaluation.
#[derive(Debug)]
pub struct EvalOutput {
    /// The state recorded by the script's last `bk.export` call.
    pub exported: State,
    /// Image config recorded alongside the export, if any.
    pub image_config: Option<ImageConfig>,
    /// Registered script payloads for the source-map section.
    pub sources: Vec<(String, Vec<u8>)>,
}

/// One Lua interpreter wired up with the `bk` builder table.
///
/// Not reentrant: one evaluation at a time. Distinct evaluators are
/// independent and may run concurrently on separate threads of the
/// embedding program.
pub struct Evaluator {
    lua: Lua,
    channels: Rc<RefCell<Channels>>,
}

impl Evaluator {
    pub fn new() -> ScriptResult<Self> {
        let lua = Lua::new();
        let channels = Rc::new(RefCell::new(Channels::default()));
        install_bk(&lua, &channels)?;
        configure_stdlib_path(&lua)?;
        Ok(Self { lua, channels })
    }

    /// Clear the exported slot and the source registry so this
    /// evaluator can drive another run.
    pub fn reset(&self) {
        *self.channels.borrow_mut() = Channels::default();
    }

    /// Register a source payload for the source map. Scripts evaluated
    /// through [`Evaluator::evaluate_file`] / [`Evaluator::evaluate_source`]
    /// are registered implicitly.
    pub fn register_source(&self, path: impl Into<String>, data: Vec<u8>) {
        let path = path.into();
        let mut channels = self.channels.borrow_mut();
        if channels.sources.iter().any(|(existing, _)| existing == &path) {
            return;
        }
        channels.sources.push((path, data));
    }

    /// Evaluate the script at `path`.
    pub fn evaluate_file(&self, path: &Path) -> ScriptResult<EvalOutput> {
        let code = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.evaluate_source(&path.display().to_string(), &code)
    }

    /// Evaluate `code` registered under `name`.
    ///
    /// Fails with [`ScriptError::NoExport`] when the script finishes
    /// without calling `bk.export`; when it calls it more than once the
    /// last call wins.
    pub fn evaluate_source(&self, name: &str, code: &str) -> ScriptResult<EvalOutput> {
        self.channels.borrow_mut().exported = None;
        self.register_source(name, code.as_bytes().to_vec());
        debug!(script = name, "evaluating build script");

        // The '@' prefix marks the chunk name as a file path, so call
        // sites report "name:line" instead of a string chunk.
        self.lua.load(code).set_name(format!("@{name}")).exec()?;

        let mut channels = self.channels.borrow_mut();
        let sources = channels.sources.clone();
        match channels.exported.take() {
            Some(exported) => Ok(EvalOutput {
                exported: exported.state,
                image_config: exported.image_config,
                sources,
            }),
            None => Err(ScriptError::NoExport),
        }
    }
}

fn configure_stdlib_path(lua: &Lua) -> mlua::Result<()> {
    let Ok(dir) = env::var(STDLIB_DIR_ENV) else {
        return Ok(());
    };
    if dir.is_empty() {
        return Ok(());
    }
    let package: mlua::Table = lua.globals().get("package")?;
    let existing: String = package.get("path")?;
    package.set("path", format!("{dir}/?.lua;{existing}"))
}
