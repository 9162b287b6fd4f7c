//! uiforge CLI
//!
//! Usage:
//!   uiforge generate --map caps.json --request "a kanban board of my tasks"
//!   uiforge check --map caps.json --script fragment.js
//!   uiforge run --map caps.json --request "..." --surface main

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use uiforge::arbiter::create_provider;
use uiforge::pipeline::{PipelineStep, ProgressReporter, StepStatus};
use uiforge::sandbox::{HttpHostClient, ProcessLauncher, SessionManager, SurfaceId};
use uiforge::{validate_references, CapabilityMap, ForgeConfig, Pipeline, PipelineResult};

#[derive(Parser, Debug)]
#[command(name = "uiforge")]
#[command(about = "Generate API-bound UI fragments and run them in a capability-scoped sandbox")]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(long, global = true, env = "UIFORGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the generation pipeline and print the result as JSON
    Generate {
        /// Capability map JSON
        #[arg(long, env = "UIFORGE_CAPABILITY_MAP")]
        map: PathBuf,
        /// Natural-language request
        #[arg(long)]
        request: String,
        /// Write the result here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate the host calls made by an existing script
    Check {
        #[arg(long, env = "UIFORGE_CAPABILITY_MAP")]
        map: PathBuf,
        #[arg(long)]
        script: PathBuf,
    },
    /// Generate, then run the fragment in a sandbox session until Ctrl-C
    Run {
        #[arg(long, env = "UIFORGE_CAPABILITY_MAP")]
        map: PathBuf,
        #[arg(long)]
        request: String,
        /// Rendering surface the session is bound to
        #[arg(long, default_value = "main")]
        surface: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ForgeConfig> {
    let config = ForgeConfig::load(path.map(PathBuf::as_path))?;
    if let Err(problems) = config.validate() {
        for problem in &problems {
            error!("config: {}", problem);
        }
        anyhow::bail!("Invalid configuration ({} problem(s))", problems.len());
    }
    Ok(config)
}

fn load_map(path: &Path) -> anyhow::Result<Arc<CapabilityMap>> {
    let map = CapabilityMap::from_file(path)
        .with_context(|| format!("Failed to load capability map {}", path.display()))?;
    Ok(Arc::new(map))
}

fn build_pipeline(config: &ForgeConfig, map: Arc<CapabilityMap>) -> anyhow::Result<Pipeline> {
    let provider = create_provider(&config.llm)?;
    let provider_info = provider.info();
    info!("Using LLM provider {} with model {}", provider_info.name, provider_info.model);
    let progress = ProgressReporter::new(Arc::new(|step: PipelineStep, status: StepStatus| {
        info!("[{}] {:?}", step, status);
    }));
    Ok(Pipeline::new(Arc::from(provider), map)
        .with_provider_config(config.llm.clone())
        .with_prompts(config.prompts.manager())
        .with_progress(progress))
}

async fn generate(config: &ForgeConfig, map: &Path, request: &str) -> anyhow::Result<PipelineResult> {
    let pipeline = build_pipeline(config, load_map(map)?)?;
    let result = pipeline.run(request).await;
    let tokens = result.tokens_used();
    info!(
        "Pipeline finished: {} prompt + {} completion tokens",
        tokens.prompt, tokens.completion
    );
    Ok(result)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("uiforge=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Generate {
            map,
            request,
            output,
        } => {
            let config = load_config(args.config.as_ref())?;
            let result = generate(&config, &map, &request).await?;
            let json = serde_json::to_string_pretty(&result)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!("Result written to {}", path.display());
                }
                None => println!("{}", json),
            }
            if matches!(result, PipelineResult::Error { .. }) {
                std::process::exit(1);
            }
        }
        Command::Check { map, script } => {
            let map = load_map(&map)?;
            let script = std::fs::read_to_string(&script)
                .with_context(|| format!("Failed to read {}", script.display()))?;
            let report = validate_references(&script, &map);
            let summary = serde_json::json!({
                "queries": report.references.queries,
                "actions": report.references.actions,
                "errors": report.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
                "apiBindings": report.bindings,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !report.is_valid() {
                std::process::exit(1);
            }
        }
        Command::Run {
            map,
            request,
            surface,
        } => {
            let config = load_config(args.config.as_ref())?;
            let fragment = match generate(&config, &map, &request).await? {
                PipelineResult::Success(fragment) => fragment,
                PipelineResult::Clarification {
                    question, options, ..
                } => {
                    println!("Clarification needed: {}", question);
                    for option in options {
                        println!("  - {}", option);
                    }
                    return Ok(());
                }
                PipelineResult::Error { message, .. } => anyhow::bail!(message),
            };

            let host = Arc::new(HttpHostClient::new(&config.host)?);
            let launcher = Arc::new(ProcessLauncher::new(config.sandbox.clone()));
            let sessions = SessionManager::new(launcher, host);
            let surface = SurfaceId::new(surface);
            let mut session = sessions.start(surface.clone(), &fragment).await?;
            info!(
                "Session {} running on '{}'; press Ctrl-C to stop",
                session.context_id(),
                surface
            );

            loop {
                tokio::select! {
                    report = session.next_error() => match report {
                        Some(report) => warn!(
                            "sandbox error: {} (line {:?}, col {:?})",
                            report.message, report.line, report.col
                        ),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("Stopping session");
                        break;
                    }
                }
            }
            sessions.stop_all().await;
        }
    }

    Ok(())
}
