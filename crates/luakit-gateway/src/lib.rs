//! luakit gateway adapter
//!
//! Runs the engine behind BuildKit's gateway contract. The RPC transport
//! is delegated to a [`GatewayClient`] implementation; this crate fixes
//! only the frontend behavior: check capabilities, read the script from
//! the build context, evaluate, serialize, hand the definition to solve.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use luakit_llb::{pb, serialize, BoxError, ConfigResolver, SerializeOptions};
use luakit_script::{Evaluator, ScriptError};

/// Capabilities the daemon must advertise before a build is attempted.
pub const REQUIRED_CAPS: &[&str] = &["file.base"];
/// Build input carrying the script.
pub const CONTEXT_INPUT: &str = "context";
/// Default script filename inside the build context.
pub const DEFAULT_FILENAME: &str = "build.lua";

/// Errors produced while driving a gateway build.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The daemon lacks a capability the emitted definition relies on.
    #[error("daemon does not advertise required capability '{0}'")]
    MissingCapability(String),

    /// The script could not be read from the build context.
    #[error("read '{filename}' from '{input}' input: {source}")]
    ContextRead {
        input: String,
        filename: String,
        #[source]
        source: BoxError,
    },

    /// Script evaluation failed.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// Definition assembly failed.
    #[error(transparent)]
    Serialize(#[from] luakit_llb::SerializeError),

    /// The daemon rejected the solve request.
    #[error("solve: {0}")]
    Solve(#[source] BoxError),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Reference to the solved result, as returned by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveReference(pub String);

/// Transport seam to the BuildKit daemon.
///
/// The wire encoding lives entirely behind this trait; the frontend only
/// needs capability probing, context-file reads and a solve call.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// True when the daemon advertises `capability`.
    fn has_capability(&self, capability: &str) -> bool;

    /// Read one file from a named build input.
    async fn read_context_file(
        &self,
        input: &str,
        filename: &str,
    ) -> Result<Vec<u8>, BoxError>;

    /// Ask the daemon to solve `definition`.
    async fn solve(&self, definition: pb::Definition) -> Result<SolveReference, BoxError>;
}

/// Per-build configuration of the frontend.
pub struct FrontendConfig {
    /// Script filename read from the context input.
    pub filename: String,
    /// Resolver used for image-config resolution during serialization.
    pub resolver: Option<Arc<dyn ConfigResolver>>,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            filename: DEFAULT_FILENAME.to_string(),
            resolver: None,
        }
    }
}

/// Strip a leading `# syntax=...` directive.
///
/// Docker's frontend dispatch injects the directive on the first line;
/// it is replaced with a blank line so source-map line numbers still
/// point at the author's script.
pub fn strip_syntax_directive(script: &str) -> Cow<'_, str> {
    let first_line = script.lines().next().unwrap_or("");
    if first_line.trim_start().starts_with("# syntax=") {
        match script.split_once('\n') {
            Some((_, rest)) => Cow::Owned(format!("\n{rest}")),
            None => Cow::Borrowed(""),
        }
    } else {
        Cow::Borrowed(script)
    }
}

/// Drive one gateway build: evaluate the context script and solve the
/// resulting definition.
pub async fn run_frontend(
    client: &dyn GatewayClient,
    config: FrontendConfig,
) -> GatewayResult<SolveReference> {
    for capability in REQUIRED_CAPS {
        if !client.has_capability(capability) {
            return Err(GatewayError::MissingCapability(capability.to_string()));
        }
    }

    let raw = client
        .read_context_file(CONTEXT_INPUT, &config.filename)
        .await
        .map_err(|source| GatewayError::ContextRead {
            input: CONTEXT_INPUT.to_string(),
            filename: config.filename.clone(),
            source,
        })?;

    let output = {
        let text = String::from_utf8_lossy(&raw);
        let script = strip_syntax_directive(&text);
        debug!(filename = %config.filename, bytes = raw.len(), "evaluating context script");
        let evaluator = Evaluator::new()?;
        evaluator.evaluate_source(&config.filename, &script)?
    };

    let opts = SerializeOptions {
        image_config: output.image_config.clone(),
        source_files: output.sources.clone(),
        resolver: config.resolver.clone(),
        ..Default::default()
    };
    let definition = serialize(&output.exported, opts).await?;
    info!(ops = definition.def.len(), "definition assembled, handing off to solve");

    client.solve(definition).await.map_err(GatewayError::Solve)
}

/// luakit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
