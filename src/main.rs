//! Spotlight CLI
//!
//! - `key` - print the artifact key for a method
//! - `weave` - weave one class file offline and list the probed methods
//! - `sync` - run subscription sync against a control plane until Ctrl-C

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use spotlight::config::AgentConfig;
use spotlight::descriptor::format_artifact_key;
use spotlight::weaver::{TransformOutcome, Weaver};
use spotlight::{metrics, Agent, TickOutcome};

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Spotlight - selective method tracing agent
#[derive(Parser, Debug)]
#[command(name = "spotlight")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Format the artifact key of a method
    Key {
        /// Class name, internal (a/b/C) or dotted (a.b.C)
        class: String,
        method: String,
        /// JVM method descriptor, e.g. "(I[Ljava/lang/String;)V"
        descriptor: String,
    },
    /// Weave a single class file
    Weave {
        /// Agent configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Extra inclusion pattern (repeatable)
        #[arg(short, long = "pattern")]
        patterns: Vec<String>,
        /// Input .class file
        input: PathBuf,
        /// Where to write the woven class (defaults to stdout-only report)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Weave even if the class name does not match the patterns
        #[arg(long)]
        force: bool,
    },
    /// Sync subscriptions with the control plane
    Sync {
        #[arg(short, long)]
        config: PathBuf,
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
        /// Log to the console only, no OTLP export
        #[arg(long)]
        no_export: bool,
    },
}

#[tokio::main]
async fn main() -> CliResult {
    let args = Args::parse();

    match args.command {
        Command::Key {
            class,
            method,
            descriptor,
        } => {
            println!("{}", format_artifact_key(&class, &method, &descriptor)?);
            Ok(())
        }
        Command::Weave {
            config,
            patterns,
            input,
            output,
            force,
        } => {
            spotlight::tracing::init_console(args.json)?;
            weave(config.as_deref(), patterns, &input, output.as_deref(), force)
        }
        Command::Sync {
            config,
            once,
            no_export,
        } => sync(&config, once, no_export, args.json).await,
    }
}

fn weave(
    config: Option<&Path>,
    patterns: Vec<String>,
    input: &Path,
    output: Option<&Path>,
    force: bool,
) -> CliResult {
    let mut config = match config {
        Some(path) => AgentConfig::load(path)?,
        None => {
            let mut config = AgentConfig::default();
            config.apply_env()?;
            config
        }
    };
    config.patterns.extend(patterns);
    if !force {
        config.validate_weaving()?;
    }

    let bytes = std::fs::read(input)?;
    let weaver = Weaver::new(config.gate.clone(), config.method_filter());

    if !force {
        let class_name = spotlight::classfile::ClassFile::parse(&bytes)?.name()?;
        if !config.matcher()?.is_eligible(&class_name) {
            warn!(class = %class_name, "Class does not match any pattern, nothing to do");
            return Ok(());
        }
    }

    let name = input.display().to_string();
    let transformed = weaver.transform(&name, &bytes);
    match transformed.outcome {
        TransformOutcome::Woven { instrumented } => {
            for key in &instrumented {
                println!("{}", key);
            }
            if let Some(output) = output {
                std::fs::write(output, transformed.bytes.as_ref())?;
                info!(output = %output.display(), methods = instrumented.len(), "Wrote woven class");
            }
            Ok(())
        }
        TransformOutcome::Unchanged => {
            info!(input = %name, "No weavable methods");
            Ok(())
        }
        TransformOutcome::Failed(e) => Err(e.into()),
    }
}

async fn sync(path: &Path, once: bool, no_export: bool, json: bool) -> CliResult {
    let config = AgentConfig::load(path)?;
    config.validate()?;

    if no_export {
        spotlight::tracing::init_console(json)?;
    } else {
        spotlight::tracing::init_tracing("spotlight", config.otlp_endpoint.as_deref())?;
    }

    let agent = Agent::from_config(config)?;

    if once {
        match agent.synchronizer().tick().await {
            TickOutcome::Completed(diff) => {
                for key in &diff.added {
                    println!("+ {}", key);
                }
                for key in &diff.removed {
                    println!("- {}", key);
                }
            }
            TickOutcome::Failed(e) => return Err(e.into()),
            other => info!(outcome = ?other, "Tick did not run"),
        }
    } else {
        agent.start()?;
        tokio::signal::ctrl_c().await?;
        info!(subscriptions = agent.registry().len(), "Shutting down");
        agent.shutdown();
    }

    if !no_export {
        spotlight::tracing::shutdown_tracing();
    }
    if let Ok(text) = metrics::render() {
        tracing::debug!(metrics = %text, "Final metrics");
    }
    Ok(())
}
