use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use nlexec_core::generator::normalize::{inspect_entry, normalize};
use nlexec_core::{
    ArtifactOrigin, CodeArtifact, ConfigLoader, DependencyRepairer, HeuristicAnalyzer,
    NlexecConfig, Pipeline, PipelineOutcome, ProcessResponse, Query, QueryAnalysis,
    QueryAnalyzer, QueryOptions, SandboxBackend,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_FILE: &str = "nlexec.yaml";

#[derive(Parser, Debug)]
#[clap(name = "nlexec", author, version, about = "Natural-language requests to sandboxed Python")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, help = "YAML configuration file (default: ./nlexec.yaml when present)")]
    config: Option<PathBuf>,

    #[clap(long, short, default_value = "info")]
    log_level: String,

    #[clap(long, help = "Write logs to this file instead of stderr")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate, repair and execute code for a request
    Run {
        query: String,
        #[clap(flatten)]
        exec: ExecArgs,
    },
    /// Print the structured analysis of a request
    Analyze { query: String },
    /// Add missing imports to a Python file and print the result
    Repair {
        file: PathBuf,
        #[clap(long, help = "Print the dependency report as JSON")]
        json: bool,
    },
    /// Repair and execute an existing Python file
    Exec {
        file: PathBuf,
        #[clap(flatten)]
        exec: ExecArgs,
    },
}

#[derive(clap::Args, Debug)]
struct ExecArgs {
    #[clap(long, help = "Wall clock limit in seconds")]
    timeout: Option<u64>,
    #[clap(long, help = "Model identifier overriding the configured one")]
    model: Option<String>,
    #[clap(long)]
    allow_network: bool,
    #[clap(long)]
    max_repair_attempts: Option<u32>,
    #[clap(long, help = "Execute even when static repair leaves names unresolved")]
    no_static_repair: bool,
    #[clap(long, value_enum)]
    backend: Option<Backend>,
    #[clap(long = "arg", value_name = "NAME=VALUE", help = "Override a parameter default")]
    args: Vec<String>,
    #[clap(long, help = "Print the response as JSON")]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Docker,
    Process,
}

impl From<Backend> for SandboxBackend {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Docker => SandboxBackend::Docker,
            Backend::Process => SandboxBackend::Process,
        }
    }
}

impl ExecArgs {
    fn options(&self) -> Result<QueryOptions> {
        let mut arguments = BTreeMap::new();
        for arg in &self.args {
            let (name, value) = arg
                .split_once('=')
                .with_context(|| format!("Argument '{}' is not NAME=VALUE", arg))?;
            let value = serde_json::from_str(value)
                .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
            arguments.insert(name.trim().to_string(), value);
        }
        Ok(QueryOptions {
            timeout_seconds: self.timeout,
            model_id: self.model.clone(),
            allow_network: self.allow_network.then_some(true),
            max_repair_attempts: self.max_repair_attempts,
            static_repair: self.no_static_repair.then_some(false),
            sandbox: self.backend.map(SandboxBackend::from),
            arguments,
        })
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log_level_filter);
    if let Some(path) = &cli.log_file {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

async fn load_config(path: Option<&Path>) -> Result<NlexecConfig> {
    let config = match path {
        Some(path) => ConfigLoader::from_file(path).await?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            ConfigLoader::from_file(DEFAULT_CONFIG_FILE).await?
        }
        None => ConfigLoader::defaults()?,
    };
    Ok(config)
}

/// Cancels the token on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted; cancelling");
            trigger.cancel();
        }
    });
    cancel
}

fn provided_artifact(source: &str) -> CodeArtifact {
    match inspect_entry(source) {
        Some((entry_point_name, parameters)) => CodeArtifact {
            source_text: source.to_string(),
            entry_point_name,
            parameters,
            description: "Provided program".to_string(),
            origin: ArtifactOrigin::Provided,
        },
        None => {
            let normalized = normalize(source, &QueryAnalysis::generic(), "Provided program.");
            CodeArtifact {
                source_text: normalized.source_text,
                entry_point_name: normalized.entry_point_name,
                parameters: normalized.parameters,
                description: "Provided program".to_string(),
                origin: ArtifactOrigin::Provided,
            }
        }
    }
}

fn print_response(response: &ProcessResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }
    if let Some(code) = &response.code {
        println!("```python\n{}\n```", code.trim_end());
    }
    if let Some(result) = response.result.as_ref().filter(|r| !r.stdout.is_empty()) {
        println!("--- stdout ---\n{}", result.stdout.trim_end());
    }
    match (&response.output, &response.error) {
        (Some(output), _) => println!("Result: {}", output),
        (None, Some(error)) => println!("Error: {}", error),
        (None, None) => {}
    }
    println!("{}", response.explanation);
    Ok(())
}

fn finish(outcome: PipelineOutcome, json: bool) -> Result<()> {
    let response = outcome.response();
    print_response(&response, json)?;
    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;
    let config = load_config(cli.config.as_deref()).await?;

    match &cli.command {
        Commands::Analyze { query } => {
            let analysis = HeuristicAnalyzer::new().analyze(query);
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Commands::Repair { file, json } => {
            let source = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let repairer = DependencyRepairer::new(Arc::new(config.imports.build_table()));
            let (repaired, report) = repairer.repair(&provided_artifact(&source));
            if *json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "code": repaired.source_text,
                        "report": report,
                    }))?
                );
            } else {
                print!("{}", repaired.source_text);
                if !report.unresolved.is_empty() {
                    eprintln!(
                        "Unresolved: {}",
                        report.unresolved.iter().cloned().collect::<Vec<_>>().join(", ")
                    );
                }
            }
            if !report.is_resolved() {
                std::process::exit(1);
            }
        }
        Commands::Run { query, exec } => {
            let pipeline = Pipeline::from_config(config)?;
            let query = Query::new(query.clone()).with_options(exec.options()?);
            let cancel = cancel_on_interrupt();
            let outcome = pipeline.process(&query, &cancel).await;
            finish(outcome, exec.json)?;
        }
        Commands::Exec { file, exec } => {
            let source = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let pipeline = Pipeline::from_config(config)?;
            let query = Query::new(file.display().to_string()).with_options(exec.options()?);
            let cancel = cancel_on_interrupt();
            let outcome = pipeline
                .execute_artifact(&query, provided_artifact(&source), &cancel)
                .await;
            finish(outcome, exec.json)?;
        }
    }
    Ok(())
}
