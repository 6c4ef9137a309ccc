//! Error types for script evaluation.

use thiserror::Error;

/// Errors produced while evaluating a build script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script file could not be read.
    #[error("read script {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The script raised, or a builder call failed validation.
    #[error("script error: {0}")]
    Lua(#[from] mlua::Error),

    /// The script finished without exporting a state.
    #[error("no bk.export() call")]
    NoExport,
}

pub type ScriptResult<T> = std::result::Result<T, ScriptError>;
