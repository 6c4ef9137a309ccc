//! luakit script surface
//!
//! Lua bindings that turn builder calls into LLB graph operations. The
//! script sees a single `bk` table; the embedding program drives an
//! [`Evaluator`] and consumes the exported state it returns.

pub mod error;
pub mod eval;
pub mod surface;

pub use error::{ScriptError, ScriptResult};
pub use eval::{EvalOutput, Evaluator, STDLIB_DIR_ENV};
pub use surface::{LuaMount, LuaState};

/// luakit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
