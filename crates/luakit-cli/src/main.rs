//! luakit - compile Lua build scripts into BuildKit LLB definitions.
//!
//! ## Commands
//!
//! - `build`: evaluate a script and write the marshaled definition
//! - `dag`: render the operation graph as DOT or JSON
//! - `validate`: evaluate a script and confirm it exports a state

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info, Level};

use luakit_llb::{
    init_tracing, render_dot, render_json, serialize, write_definition, SerializeOptions,
};
use luakit_resolver::Resolver;
use luakit_script::{EvalOutput, Evaluator};

#[derive(Parser)]
#[command(name = "luakit")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compile Lua build scripts into BuildKit LLB definitions", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a script and write the LLB definition
    Build {
        /// Path to the build script
        #[arg(default_value = "build.lua")]
        script: PathBuf,

        /// Output path; '-' writes to stdout
        #[arg(short, long, default_value = "-")]
        output: String,

        /// Frontend argument, exported to the script as an environment
        /// variable (repeatable)
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Skip image-config resolution over the network
        #[arg(long)]
        no_resolve: bool,

        /// Registry request timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Render the operation graph of a script
    Dag {
        /// Path to the build script
        #[arg(default_value = "build.lua")]
        script: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value_t = DagFormat::Dot)]
        format: DagFormat,

        /// Restrict output to one operation type (source, exec, file,
        /// merge, diff)
        #[arg(long)]
        filter: Option<String>,

        /// Frontend argument, exported to the script as an environment
        /// variable (repeatable)
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,
    },

    /// Evaluate a script and confirm it exports a state
    Validate {
        /// Path to the build script
        #[arg(default_value = "build.lua")]
        script: PathBuf,

        /// Frontend argument, exported to the script as an environment
        /// variable (repeatable)
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DagFormat {
    Dot,
    Json,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json_logs, level);

    match cli.command {
        Commands::Build {
            script,
            output,
            args,
            no_resolve,
            timeout,
        } => {
            export_frontend_args(&args)?;
            let evaluated = evaluate(&script)?;
            let resolver: Option<Arc<dyn luakit_llb::ConfigResolver>> = if no_resolve {
                None
            } else {
                Some(Arc::new(Resolver::new(Some(Duration::from_secs(timeout)))))
            };
            let opts = SerializeOptions {
                image_config: evaluated.image_config.clone(),
                source_files: evaluated.sources.clone(),
                resolver,
                ..Default::default()
            };
            let definition = serialize(&evaluated.exported, opts)
                .await
                .context("serialize definition")?;
            info!(ops = definition.def.len(), "definition assembled");
            write_definition(&definition, &output)
                .with_context(|| format!("write definition to '{output}'"))?;
        }

        Commands::Dag {
            script,
            format,
            filter,
            args,
        } => {
            export_frontend_args(&args)?;
            let evaluated = evaluate(&script)?;
            let rendered = match format {
                DagFormat::Dot => render_dot(&evaluated.exported, filter.as_deref()),
                DagFormat::Json => render_json(&evaluated.exported, filter.as_deref())
                    .context("render graph as JSON")?,
            };
            println!("{rendered}");
        }

        Commands::Validate { script, args } => {
            export_frontend_args(&args)?;
            let evaluated = evaluate(&script)?;
            debug!(kind = evaluated.exported.node().kind(), "exported state present");
            println!("ok: {} exports a state", script.display());
        }
    }
    Ok(())
}

fn evaluate(script: &PathBuf) -> Result<EvalOutput> {
    let evaluator = Evaluator::new().context("initialize script engine")?;
    evaluator
        .evaluate_file(script)
        .with_context(|| format!("evaluate {}", script.display()))
}

/// Each `--arg KEY=VALUE` becomes an environment variable the script can
/// read through `os.getenv`.
fn export_frontend_args(args: &[String]) -> Result<()> {
    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            bail!("malformed --arg '{arg}', expected KEY=VALUE");
        };
        if key.is_empty() {
            bail!("malformed --arg '{arg}', empty key");
        }
        std::env::set_var(key, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn frontend_args_require_key_value_form() {
        assert!(export_frontend_args(&["A=1".to_string()]).is_ok());
        assert_eq!(std::env::var("A").unwrap(), "1");
        assert!(export_frontend_args(&["broken".to_string()]).is_err());
        assert!(export_frontend_args(&["=x".to_string()]).is_err());
    }
}
