#![deny(unsafe_code)]
use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mge_config::EngineConfig;
use mge_core::CanonicalId;
use mge_engine::inputs::load_inputs;
use mge_engine::{CleanOptions, PlanRequest, Workspace};
use mge_provider::{simulated_registry, ProviderKey, ProviderRegistry};
use mge_run::cancel::CancellationToken;
use mge_run::RunnerOptions;
use mge_storage::{LocalBackend, MovieStorage};
use tracing_subscriber::EnvFilter;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "mge", version, about = "Media-generation build engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to an `EngineConfig` TOML file.
    #[arg(long, global = true, default_value = "mge.toml")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compute an execution plan for a movie and persist it, without running it.
    Plan {
        #[arg(long)]
        movie_id: String,
        #[arg(long)]
        blueprint: PathBuf,
        #[arg(long)]
        inputs: PathBuf,
        /// Catalog root for resolving producer imports.
        #[arg(long)]
        catalog_root: Option<PathBuf>,
        /// Force every job at or above this prior-plan layer index dirty.
        #[arg(long)]
        re_run_from_layer: Option<usize>,
        /// Force dirty any job producing one of these canonical artifact IDs. Repeatable.
        #[arg(long = "target")]
        targets: Vec<String>,
        /// Print machine-readable JSON instead of a human summary.
        #[arg(long)]
        json: bool,
    },

    /// Plan, persist, and run a movie's dirty jobs.
    Execute {
        #[arg(long)]
        movie_id: String,
        #[arg(long)]
        blueprint: PathBuf,
        #[arg(long)]
        inputs: PathBuf,
        #[arg(long)]
        catalog_root: Option<PathBuf>,
        #[arg(long)]
        re_run_from_layer: Option<usize>,
        #[arg(long = "target")]
        targets: Vec<String>,
        #[arg(long)]
        json: bool,
    },

    /// List the revisions a movie has built so far.
    List {
        #[arg(long)]
        movie_id: String,
        #[arg(long)]
        json: bool,
    },

    /// Run the recovery pre-pass and show why the next plan would do what it does.
    Explain {
        #[arg(long)]
        movie_id: String,
        #[arg(long)]
        blueprint: PathBuf,
        #[arg(long)]
        inputs: PathBuf,
        #[arg(long)]
        catalog_root: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },

    /// Delete a movie's on-disk state.
    Clean {
        #[arg(long)]
        movie_id: String,
        /// Report what would be removed without touching storage.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("mge=debug")
    } else {
        EnvFilter::new("mge=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&cli.config);

    let result = match cli.command {
        Commands::Plan {
            movie_id,
            blueprint,
            inputs,
            catalog_root,
            re_run_from_layer,
            targets,
            json,
        } => {
            cmd_plan(
                &config,
                &movie_id,
                &blueprint,
                &inputs,
                catalog_root,
                re_run_from_layer,
                &targets,
                json,
            )
            .await
        }
        Commands::Execute {
            movie_id,
            blueprint,
            inputs,
            catalog_root,
            re_run_from_layer,
            targets,
            json,
        } => {
            cmd_execute(
                &config,
                &movie_id,
                &blueprint,
                &inputs,
                catalog_root,
                re_run_from_layer,
                &targets,
                json,
            )
            .await
        }
        Commands::List { movie_id, json } => cmd_list(&config, &movie_id, json).await,
        Commands::Explain {
            movie_id,
            blueprint,
            inputs,
            catalog_root,
            json,
        } => cmd_explain(&config, &movie_id, &blueprint, &inputs, catalog_root, json).await,
        Commands::Clean { movie_id, dry_run } => cmd_clean(&config, &movie_id, dry_run).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

fn load_config(path: &PathBuf) -> EngineConfig {
    if path.is_file() {
        match EngineConfig::load(path) {
            Ok(config) => return config,
            Err(e) => eprintln!("warning: failed to load {}: {e}, using defaults", path.display()),
        }
    }
    EngineConfig::default()
}

fn workspace_for(config: &EngineConfig, movie_id: &str, catalog_root: Option<PathBuf>) -> Workspace<LocalBackend> {
    let backend = LocalBackend::new(config.workspace_root.clone());
    let storage = MovieStorage::new(backend, config.base_path.clone(), movie_id.to_string());
    Workspace::new(storage, catalog_root)
}

fn parse_targets(targets: &[String]) -> Result<BTreeSet<CanonicalId>> {
    targets
        .iter()
        .map(|raw| raw.parse::<CanonicalId>().with_context(|| format!("invalid target id '{raw}'")))
        .collect()
}

fn registry_for(config: &EngineConfig, provider_options: &std::collections::BTreeMap<String, mge_core::ProviderMapping>) -> ProviderRegistry {
    let environment = if config.simulated { "simulated" } else { "default" };
    let keys = provider_options
        .values()
        .map(|m| ProviderKey::new(m.provider.clone(), m.model.clone(), environment));
    if config.simulated {
        simulated_registry(keys)
    } else {
        ProviderRegistry::new()
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_plan(
    config: &EngineConfig,
    movie_id: &str,
    blueprint: &PathBuf,
    inputs_path: &PathBuf,
    catalog_root: Option<PathBuf>,
    re_run_from_layer: Option<usize>,
    targets: &[String],
    json: bool,
) -> Result<()> {
    let raw_inputs = std::fs::read_to_string(inputs_path)
        .with_context(|| format!("reading inputs file {}", inputs_path.display()))?;
    let resolved = load_inputs(&raw_inputs).context("parsing inputs file")?;

    let workspace = workspace_for(config, movie_id, catalog_root);

    let request = PlanRequest {
        re_run_from_layer,
        target_artifact_ids: parse_targets(targets)?,
        collect_explanation: !json,
    };

    let outcome = workspace.plan(blueprint, &resolved, &request).await?;
    workspace.persist_plan(&outcome, &resolved).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.plan)?);
    } else {
        println!("revision: {}", outcome.plan.revision);
        println!("jobs: {}", outcome.plan.job_count());
        println!("layers: {}", outcome.plan.layers.len());
        if let Some(explanation) = &outcome.explanation {
            for reason in &explanation.job_reasons {
                println!("  {} dirty: {:?}", reason.job_id, reason.reason);
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_execute(
    config: &EngineConfig,
    movie_id: &str,
    blueprint: &PathBuf,
    inputs_path: &PathBuf,
    catalog_root: Option<PathBuf>,
    re_run_from_layer: Option<usize>,
    targets: &[String],
    json: bool,
) -> Result<()> {
    let raw_inputs = std::fs::read_to_string(inputs_path)
        .with_context(|| format!("reading inputs file {}", inputs_path.display()))?;
    let resolved = load_inputs(&raw_inputs).context("parsing inputs file")?;

    let workspace = workspace_for(config, movie_id, catalog_root);

    let request = PlanRequest {
        re_run_from_layer,
        target_artifact_ids: parse_targets(targets)?,
        collect_explanation: false,
    };

    let outcome = workspace.plan(blueprint, &resolved, &request).await?;
    workspace.persist_plan(&outcome, &resolved).await?;

    let registry = registry_for(config, &resolved.provider_options);
    let runner_options = RunnerOptions {
        concurrency: config.concurrency as usize,
        environment: if config.simulated { "simulated".to_string() } else { "default".to_string() },
    };
    let token = CancellationToken::new();

    let execution = workspace
        .execute(&outcome.plan, &resolved.values, &registry, &runner_options, &token)
        .await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "revision": execution.manifest.revision,
                "advanced": execution.advanced,
                "cancelled": execution.run.cancelled,
                "jobCount": execution.run.job_outcomes.len(),
            }))?
        );
    } else {
        println!("revision: {}", execution.manifest.revision);
        println!("jobs run: {}", execution.run.job_outcomes.len());
        for outcome in &execution.run.job_outcomes {
            println!("  {} -> {:?}", outcome.job_id, outcome.status);
        }
    }
    Ok(())
}

async fn cmd_list(config: &EngineConfig, movie_id: &str, json: bool) -> Result<()> {
    let workspace = workspace_for(config, movie_id, None);
    let builds = workspace.list().await?;

    if json {
        let rows: Vec<_> = builds
            .iter()
            .map(|b| {
                serde_json::json!({
                    "revision": b.revision,
                    "createdAt": b.created_at,
                    "inputs": b.input_count,
                    "succeeded": b.succeeded_count,
                    "failed": b.failed_count,
                    "skipped": b.skipped_count,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for build in &builds {
            println!(
                "{} | {} inputs | {} succeeded | {} failed | {} skipped",
                build.revision, build.input_count, build.succeeded_count, build.failed_count, build.skipped_count
            );
        }
    }
    Ok(())
}

async fn cmd_explain(
    config: &EngineConfig,
    movie_id: &str,
    blueprint: &PathBuf,
    inputs_path: &PathBuf,
    catalog_root: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let raw_inputs = std::fs::read_to_string(inputs_path)
        .with_context(|| format!("reading inputs file {}", inputs_path.display()))?;
    let resolved = load_inputs(&raw_inputs).context("parsing inputs file")?;

    let workspace = workspace_for(config, movie_id, catalog_root);

    let outcome = workspace
        .explain(blueprint, &resolved, &PlanRequest::default())
        .await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "explanation": outcome.explanation,
                "recovery": outcome.recovery,
            }))?
        );
    } else {
        println!("recovered artifacts: {}", outcome.recovery.recovered_artifact_ids.len());
        println!("failed recoveries: {}", outcome.recovery.failed_recoveries.len());
        for reason in &outcome.explanation.job_reasons {
            println!("  {} dirty: {:?}", reason.job_id, reason.reason);
        }
    }
    Ok(())
}

async fn cmd_clean(config: &EngineConfig, movie_id: &str, dry_run: bool) -> Result<()> {
    let workspace = workspace_for(config, movie_id, None);
    workspace.clean(CleanOptions { dry_run }).await?;
    if dry_run {
        println!("dry run: would remove all state for movie '{movie_id}'");
    } else {
        println!("removed all state for movie '{movie_id}'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_targets_accepts_canonical_ids() {
        let targets = vec!["Artifact:Script.NarrationScript".to_string()];
        let parsed = parse_targets(&targets).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn parse_targets_rejects_malformed_ids() {
        let targets = vec!["not a canonical id".to_string()];
        assert!(parse_targets(&targets).is_err());
    }

    #[test]
    fn load_config_falls_back_to_defaults_when_missing() {
        let config = load_config(&PathBuf::from("/nonexistent/mge.toml"));
        assert_eq!(config.base_path, "movies");
    }
}
