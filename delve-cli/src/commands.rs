//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::RunArgs;
use delve_core::config::{HypothesisMode, ResearchConfig, load_config, load_config_file};
use delve_core::oracle::{HeuristicOracle, HttpOracle, Oracle};
use delve_core::sources::{CorpusSource, SourceRegistry};
use delve_core::{ReportGenerator, ResearchEngine, ResearchRun};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable holding the bearer token for `--oracle-url`.
const ORACLE_API_KEY_ENV: &str = "DELVE_ORACLE_API_KEY";

const ORACLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => handle_run(args, workspace, config_file).await,
        Commands::Config { action } => handle_config(action, workspace, config_file).await,
    }
}

fn resolve_config(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<ResearchConfig> {
    let config = match config_file {
        Some(path) => load_config_file(path),
        None => load_config(Some(workspace), None),
    };
    config.map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
}

async fn handle_run(
    args: RunArgs,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    let summary = args.summary;
    let run = run_research(args, workspace, config_file).await?;

    if summary {
        println!("{}", ReportGenerator::summary(&run));
    } else {
        println!("{}", ReportGenerator::render(&run));
    }
    if let Some(paths) = &run.artifacts {
        println!("Artifacts written to {}", paths.dir.display());
        println!("  findings: {}", paths.findings.display());
        println!("  metrics:  {}", paths.metrics.display());
        println!("  events:   {}", paths.events.display());
        println!("  report:   {}", paths.report.display());
    }
    Ok(())
}

/// Build the engine from configuration and flags, then run one question.
async fn run_research(
    args: RunArgs,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<ResearchRun> {
    let mut config = resolve_config(workspace, config_file)?;
    apply_overrides(&mut config, &args)?;

    let oracle = build_oracle(args.oracle_url.as_deref())?;
    let registry = build_registry(args.corpus.as_deref())?;
    if registry.is_empty() {
        anyhow::bail!("No sources available; pass --corpus with a JSON document file");
    }

    let engine = ResearchEngine::new(config, oracle, registry)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    Ok(engine.run(&args.question).await)
}

fn apply_overrides(config: &mut ResearchConfig, args: &RunArgs) -> anyhow::Result<()> {
    if let Some(mode) = &args.mode {
        config.hypotheses.mode = mode
            .parse::<HypothesisMode>()
            .map_err(|e| anyhow::anyhow!("{}", e))?;
    }
    if let Some(max_cost) = args.max_cost {
        config.budget.max_cost_usd = max_cost;
    }
    if let Some(max_depth) = args.max_depth {
        config.budget.max_depth = max_depth;
    }
    if let Some(out) = &args.out {
        config.artifacts_dir = Some(out.clone());
    }
    Ok(())
}

fn build_oracle(url: Option<&str>) -> anyhow::Result<Arc<dyn Oracle>> {
    match url {
        Some(url) => {
            let mut oracle = HttpOracle::new(url, ORACLE_TIMEOUT)?;
            if let Ok(key) = std::env::var(ORACLE_API_KEY_ENV) {
                oracle = oracle.with_api_key(key);
            }
            tracing::info!(endpoint = url, "Using HTTP oracle");
            Ok(Arc::new(oracle))
        }
        None => Ok(Arc::new(HeuristicOracle::new())),
    }
}

fn build_registry(corpus: Option<&Path>) -> anyhow::Result<SourceRegistry> {
    let mut registry = SourceRegistry::new();
    if let Some(path) = corpus {
        let source = CorpusSource::load(path)
            .map_err(|e| anyhow::anyhow!("Failed to load corpus {}: {}", path.display(), e))?;
        if source.is_empty() {
            tracing::warn!(path = %path.display(), "Corpus has no documents");
        }
        registry.register(Arc::new(source));
    }
    Ok(registry)
}

async fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".delve");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let default_config = ResearchConfig::default();
            let toml_str = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = resolve_config(workspace, config_file)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}
