use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use botload::config::LoadTestConfig;
use botload::runner::{ProfileReport, RunMode};

#[derive(Parser)]
#[command(
    name = "botload",
    about = "Load-testing harness for meeting-bot REST APIs",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (TOML, or JSON with camelCase keys)
    #[arg(long, global = true, env = "BOTLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Emit diagnostics as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run load profiles against the bot API
    Run {
        /// Only run the named profile (repeatable)
        #[arg(long = "profile")]
        profiles: Vec<String>,

        /// Fan-out mode: serial or concurrent
        #[arg(long)]
        mode: Option<RunMode>,

        /// Cap simultaneously running bots in concurrent mode
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Metric log file
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Authorization header value, overrides the config file
        #[arg(long, env = "BOTLOAD_AUTH_TOKEN", hide_env_values = true)]
        auth_token: Option<String>,

        /// Print profile reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// List configured load profiles
    Profiles,

    /// Check the configuration without calling the API
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = LoadTestConfig::load_resolved(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            profiles,
            mode,
            max_concurrency,
            log_file,
            auth_token,
            json,
        } => {
            if let Some(token) = auth_token {
                config.api.auth_token = token;
            }
            if let Some(mode) = mode {
                config.run.mode = mode;
            }
            if max_concurrency.is_some() {
                config.run.max_concurrency = max_concurrency;
            }
            if let Some(path) = log_file {
                config.log.path = path;
            }
            config.validate()?;

            let mut selected = config.load_profiles();
            if !profiles.is_empty() {
                for name in &profiles {
                    if !selected.iter().any(|p| &p.name == name) {
                        bail!("unknown profile `{}`", name);
                    }
                }
                selected.retain(|p| profiles.contains(&p.name));
            }

            tracing::info!(
                profiles = selected.len(),
                mode = %config.run.mode,
                log = %config.log.path.display(),
                "Starting load test"
            );
            let runner = botload::build_runner(&config)?;
            let reports = botload::run_profiles(&runner, &selected).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                print_reports(&reports);
            }

            let failed: Vec<_> = reports.iter().filter_map(|r| r.error()).collect();
            if !failed.is_empty() {
                for e in &failed {
                    eprintln!("error: {}", e);
                }
                bail!("{} of {} load profiles failed", failed.len(), reports.len());
            }
        }
        Commands::Profiles => {
            let profiles = config.load_profiles();
            if profiles.is_empty() {
                println!("No profiles configured.");
            } else {
                println!("{:<25} | {:<8} | Timeout", "Profile", "Bots");
                println!("{:-<25}-|-{:-<8}-|-{:-<10}", "", "", "");
                for p in profiles {
                    let timeout = p
                        .timeout
                        .map(|t| format!("{}ms", t.as_millis()))
                        .unwrap_or_else(|| "none".to_string());
                    println!("{:<25} | {:<8} | {}", p.name, p.num_bots, timeout);
                }
            }
        }
        Commands::Validate => {
            config.validate()?;
            println!(
                "Configuration OK: {} profile(s), mode {}, log {}",
                config.profiles.len(),
                config.run.mode,
                config.log.path.display()
            );
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_reports(reports: &[ProfileReport]) {
    println!("\n=== botload Profile Report ===");
    println!(
        "{:<20} | {:<10} | {:>5} | {:>6} | {:>6} | {:>9} | Status",
        "Profile", "Mode", "Bots", "OK", "Failed", "Elapsed"
    );
    println!(
        "{:-<20}-|-{:-<10}-|-{:->5}-|-{:->6}-|-{:->6}-|-{:->9}-|-{:-<8}",
        "", "", "", "", "", "", ""
    );
    for r in reports {
        let status = if r.is_success() {
            "PASS"
        } else if r.timed_out {
            "TIMEOUT"
        } else {
            "FAIL"
        };
        println!(
            "{:<20} | {:<10} | {:>5} | {:>6} | {:>6} | {:>7}ms | {}",
            r.profile,
            r.mode.to_string(),
            r.num_bots,
            r.succeeded.len(),
            r.failed.len(),
            r.elapsed_ms,
            status
        );
        if let Some(join) = &r.stats.join {
            println!(
                "{:<20} |   join ms min/mean/p50/max: {}/{:.0}/{}/{}",
                "", join.min, join.mean, join.p50, join.max
            );
        }
        for f in &r.failed {
            println!("{:<20} |   -> {}", "", f.message);
        }
    }
    println!();
}
