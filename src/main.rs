//! php-embed CLI entry point.
//!
//! Runs one script file or code string in the embedded engine, writing
//! script output to stdout and the runtime log to stderr.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use php_embed::runtime::LibphpRuntime;
use php_embed::{ConfigFile, Engine, ExecutionContext, HostValue, init_tracing, parse_binding};

#[derive(Debug, Parser)]
#[command(name = "php-embed", version, about = "Run PHP in an embedded engine")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "PHP_EMBED_CONFIG")]
    config: Option<PathBuf>,

    /// Ini file handed to the engine.
    #[arg(long, env = "PHP_EMBED_INI")]
    ini: Option<PathBuf>,

    /// Document root for the request.
    #[arg(long)]
    document_root: Option<String>,

    /// Bind a variable before the script runs.
    #[arg(long = "bind", value_name = "NAME=JSON", value_parser = parse_binding, global = true)]
    bindings: Vec<(String, HostValue)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a script file.
    Exec { path: PathBuf },
    /// Evaluate code and print its result as JSON.
    Eval { code: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)?,
        None => ConfigFile::default(),
    };
    init_tracing(&config.logging).context("Failed to install tracing subscriber")?;

    if let Some(document_root) = cli.document_root {
        config.runtime.request.document_root = Some(document_root);
    }

    let mut engine = Engine::new(Arc::new(LibphpRuntime::new()), &config.runtime);
    if let Some(ini) = cli.ini {
        engine.set_ini_path(ini)?;
    }
    engine.initialize()?;
    info!(command = ?cli.command, "Engine ready");

    let mut builder = ExecutionContext::builder()
        .output(io::stdout())
        .log(io::stderr());
    if let Command::Exec { path } = &cli.command {
        builder = builder.script_filename(path.display().to_string());
    }
    let mut ctx = builder.build();
    engine.request_startup(&mut ctx)?;

    let result = run(&mut engine, &mut ctx, &cli.command, &cli.bindings);
    engine.request_shutdown(&mut ctx);
    engine.destroy();
    result
}

fn run(
    engine: &mut Engine,
    ctx: &mut ExecutionContext,
    command: &Command,
    bindings: &[(String, HostValue)],
) -> anyhow::Result<()> {
    for (name, value) in bindings {
        engine
            .bind(ctx, name, value)
            .with_context(|| format!("Failed to bind '{name}'"))?;
    }

    match command {
        Command::Exec { path } => engine.exec(ctx, path)?,
        Command::Eval { code } => {
            let value = engine.eval(ctx, code)?.as_native();
            println!("{}", serde_json::to_string(&value)?);
        }
    }
    Ok(())
}
