//! verdict CLI - canonical test result reconciliation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use verdict::config::{self, Config};
use verdict::model::{DiscoveredTest, TestId};
use verdict::orchestrator::Coordinator;
use verdict::provider::local::LocalLauncher;
use verdict::report::{ConsoleReporter, JUnitReporter, JsonReporter, MultiReporter, NullReporter};

#[derive(Parser)]
#[command(name = "verdict")]
#[command(about = "Run test frameworks and reconcile their results", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "verdict.toml", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        /// Zero-based shard index of this agent
        #[arg(long, requires = "shard_count")]
        shard_index: Option<usize>,

        /// Number of parallel agents
        #[arg(long)]
        shard_count: Option<usize>,

        /// Override attempts per test (1 disables retries)
        #[arg(long)]
        max_attempts: Option<u32>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,

        /// JSON report output path
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Discover tests without running them
    Collect {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Show how discovered tests would be split across agents
    Partition {
        /// Number of parallel agents
        #[arg(long)]
        shard_count: usize,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Test framework (rspec, cucumber, playwright, cypress, generic)
        #[arg(short, long, default_value = "rspec")]
        framework: String,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("verdict={}", default_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            shard_index,
            shard_count,
            max_attempts,
            junit,
            json,
        } => {
            let overrides = RunOverrides {
                shard_index,
                shard_count,
                max_attempts,
                junit,
                json,
            };
            run_tests(&cli.config, overrides, cli.verbose).await
        }
        Commands::Collect { format } => collect_tests(&cli.config, format).await,
        Commands::Partition {
            shard_count,
            format,
        } => partition_tests(&cli.config, shard_count, format).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { framework } => init_config(&cli.config, &framework),
    }
}

struct RunOverrides {
    shard_index: Option<usize>,
    shard_count: Option<usize>,
    max_attempts: Option<u32>,
    junit: Option<PathBuf>,
    json: Option<PathBuf>,
}

impl RunOverrides {
    fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(count) = self.shard_count {
            config.verdict.shard_count = count;
            config.verdict.shard_index = self.shard_index.unwrap_or(0);
        }
        if let Some(attempts) = self.max_attempts {
            config.verdict.max_attempts_per_test = attempts;
        }
        config.validate().context("Invalid command-line overrides")?;
        Ok(())
    }
}

async fn run_tests(config_path: &Path, overrides: RunOverrides, verbose: bool) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    overrides.apply(&mut config)?;

    info!("Loaded configuration from {}", config_path.display());

    let launcher = LocalLauncher::new(config.launcher.clone());
    let reporter = create_reporter(&config, &overrides, verbose);

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            ctrl_c.cancel();
        }
    });

    let report = Coordinator::new(&config, &launcher, &reporter)
        .with_cancellation_token(token)
        .run()
        .await?;
    std::process::exit(report.exit_code());
}

async fn discover(config: &Config) -> Result<Vec<(String, Vec<DiscoveredTest>)>> {
    let launcher = LocalLauncher::new(config.launcher.clone());
    let coordinator = Coordinator::new(config, &launcher, &NullReporter);
    let discovery = coordinator.discover().await;

    if let Some(error) = discovery.errors.first() {
        anyhow::bail!("[{}] {}", error.group, error.message);
    }
    Ok(discovery
        .groups
        .into_iter()
        .map(|g| (g.name, g.tests))
        .collect())
}

async fn collect_tests(config_path: &Path, format: Format) -> Result<()> {
    let config = config::load_config(config_path)?;
    let groups = discover(&config).await?;

    match format {
        Format::Json => {
            let tests: Vec<serde_json::Value> = groups
                .iter()
                .flat_map(|(group, tests)| {
                    tests.iter().map(move |t| {
                        serde_json::json!({
                            "group": group,
                            "id": t.id,
                            "name": t.name,
                            "skip_declared": t.skip_declared,
                        })
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&tests)?);
        }
        Format::Text => {
            let total: usize = groups.iter().map(|(_, t)| t.len()).sum();
            println!("Discovered {} tests:", total);
            for (group, tests) in &groups {
                for test in tests {
                    let marker = if test.skip_declared { " [skip]" } else { "" };
                    println!("  [{}] {}{}", group, test.id, marker);
                }
            }
        }
    }

    Ok(())
}

async fn partition_tests(config_path: &Path, shard_count: usize, format: Format) -> Result<()> {
    let config = config::load_config(config_path)?;
    let launcher = LocalLauncher::new(config.launcher.clone());
    let coordinator = Coordinator::new(&config, &launcher, &NullReporter);

    let discovery = coordinator.discover().await;
    if let Some(error) = discovery.errors.first() {
        anyhow::bail!("[{}] {}", error.group, error.message);
    }
    let durations = coordinator.durations();
    let groups = coordinator.shards(&discovery, shard_count, &durations)?;

    match format {
        Format::Json => {
            let shards: serde_json::Map<String, serde_json::Value> = groups
                .into_iter()
                .map(|(group, shards)| Ok::<_, serde_json::Error>((group, serde_json::to_value(shards)?)))
                .collect::<Result<_, _>>()?;
            println!("{}", serde_json::to_string_pretty(&shards)?);
        }
        Format::Text => {
            for (group, shards) in &groups {
                println!("[{}]", group);
                for shard in shards {
                    println!(
                        "  shard {}: {} test(s), estimated {:.1}s",
                        shard.index,
                        shard.tests.len(),
                        shard.estimated.as_secs_f64()
                    );
                    for id in &shard.tests {
                        println!("    {}", id);
                    }
                }
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            let v = &config.verdict;
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Max attempts per test: {}", v.max_attempts_per_test);
            println!("  Max retries per run: {}", v.max_retries_per_run);
            if v.shard_count > 0 {
                println!("  Shard: {} of {}", v.shard_index, v.shard_count);
            }
            if let Some(timeout) = v.run_timeout_secs {
                println!("  Run timeout: {}s", timeout);
            }
            for id in v.muted.iter().filter_map(|m| m.parse::<TestId>().ok()) {
                println!("  Muted: {}", id);
            }

            println!("  Groups:");
            for (name, group) in &config.groups {
                println!("    {}: {}", name, group.framework.type_name());
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path, framework: &str) -> Result<()> {
    let group = match framework {
        "rspec" => {
            r#"[groups.specs.framework]
type = "rspec""#
        }
        "cucumber" => {
            r#"[groups.features.framework]
type = "cucumber"
skip_tags = ["@skip", "@wip"]"#
        }
        "playwright" => {
            r#"[groups.e2e.framework]
type = "playwright""#
        }
        "cypress" => {
            r#"[groups.e2e.framework]
type = "cypress"
test_file_pattern = "cypress/e2e/**/*.cy.{js,ts}""#
        }
        "generic" => {
            r#"[groups.unit.framework]
type = "generic"
discover_command = "./scripts/list-tests.sh"
run_command = "./scripts/run-tests.sh {result_path} {tests}"
result_file = "tmp/junit.xml""#
        }
        _ => {
            eprintln!(
                "Unknown framework: {}. Use: rspec, cucumber, playwright, cypress, generic",
                framework
            );
            std::process::exit(1);
        }
    };

    let config = format!(
        r#"# verdict configuration file

[verdict]
max_attempts_per_test = 2
max_retries_per_run = 100
durations_file = ".verdict/durations.json"
record_durations = true

{}

[report]
output_dir = "test-results"
junit = true
junit_file = "junit.xml"
"#,
        group
    );

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, config)?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  verdict run");

    Ok(())
}

fn create_reporter(config: &Config, overrides: &RunOverrides, verbose: bool) -> MultiReporter {
    let mut multi = MultiReporter::new();

    multi = multi.with_reporter(ConsoleReporter::new(verbose));

    if config.report.junit || overrides.junit.is_some() {
        let junit_path = overrides
            .junit
            .clone()
            .unwrap_or_else(|| config.report.output_dir.join(&config.report.junit_file));
        multi = multi.with_reporter(JUnitReporter::new(junit_path));
    }

    if config.report.json || overrides.json.is_some() {
        let json_path = overrides
            .json
            .clone()
            .unwrap_or_else(|| config.report.output_dir.join(&config.report.json_file));
        multi = multi.with_reporter(JsonReporter::new(json_path));
    }

    multi
}

