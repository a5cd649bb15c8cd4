//! tpgate: transparent proxy gateway rule engine
//!
//! Command-line entry point.
//!
//! # Usage
//!
//! ```bash
//! # Install rules, sets and routes; start proxy and resolver
//! sudo tpgate start
//!
//! # Show what would be installed without touching the host
//! tpgate start --dry-run
//! tpgate plan
//!
//! # Remove everything, leaving the fail-safe DNS redirect
//! sudo tpgate stop
//!
//! # Run with environment overrides
//! TPGATE_LOG_LEVEL=debug sudo tpgate -c /path/to/config.json restart
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use tpgate::compiler::{compile, compile_failsafe};
use tpgate::config::{create_default_config, load_config_with_env, Config};
use tpgate::kernel::{MemoryKernel, SystemKernel};
use tpgate::lifecycle::{Lifecycle, StopReport};
use tpgate::lock::InvocationLock;
use tpgate::policy::Policy;
use tpgate::process::{MemoryProcesses, SystemProcesses};
use tpgate::sets::{load_sources, SystemResolver};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "tpgate", version, about = "Transparent proxy gateway rule engine")]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", default_value = "/etc/tpgate/config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install everything and start the proxy and resolver
    Start {
        /// Run against an in-memory kernel and print the result
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove everything and install the fail-safe
    Stop {
        /// Run against an in-memory kernel and print the result
        #[arg(long)]
        dry_run: bool,
    },
    /// Stop, then start
    Restart,
    /// Restart only the proxy
    RestartProxy,
    /// Restart only the resolver
    RestartDns,
    /// Show the probed state
    Status {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the compiled rules without touching the host
    Plan {
        /// Print the stopped-state fail-safe rules instead
        #[arg(long)]
        failsafe: bool,
    },
    /// Validate configuration, lists and host environment
    Check,
    /// Write a default configuration file
    InitConfig,
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_writer(std::io::stderr);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Check system prerequisites
fn check_prerequisites() {
    if !tpgate::is_root() {
        warn!("Not running as root; iptables, ipset and ip will likely fail");
    }
}

fn report_stop(report: &StopReport) {
    if !report.is_clean() {
        warn!(
            "Stop finished with {} warning(s)",
            report.teardown_errors.len() + usize::from(report.failsafe_error.is_some())
        );
    }
}

fn dry_run(config: &Config, stop: bool) -> Result<()> {
    // runtime files must not clobber those of a real run
    let scratch = std::env::temp_dir().join(format!("tpgate-dry-run-{}", std::process::id()));
    let mut config = config.clone();
    config.runtime.record_path = scratch.join("state");
    config.runtime.work_dir = scratch.clone();

    let kernel = MemoryKernel::new();
    let processes = MemoryProcesses::new();
    let engine = Lifecycle::new(&config, &kernel, &processes)?.with_command_lookup(|_| true);

    let result = if stop {
        report_stop(&engine.stop());
        Ok(())
    } else {
        engine.start().map(drop)
    };
    let _ = std::fs::remove_dir_all(&scratch);
    result?;

    print!("{}", kernel.snapshot());
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    if let Command::InitConfig = cli.command {
        create_default_config(&cli.config)?;
        println!("Generated default configuration at {}", cli.config.display());
        return Ok(());
    }

    let config = load_config_with_env(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    init_logging(&config);

    match cli.command {
        Command::Plan { failsafe } => {
            let policy = Policy::resolve(&config)?;
            let plan = if failsafe {
                compile_failsafe(&policy)
            } else {
                compile(&policy)
            };
            print!("{plan}");
            return Ok(());
        }
        Command::Start { dry_run: true } => return dry_run(&config, false),
        Command::Stop { dry_run: true } => return dry_run(&config, true),
        _ => {}
    }

    info!("tpgate v{}", tpgate::VERSION);
    check_prerequisites();

    let _lock = InvocationLock::acquire_or_wait(&config.runtime.lock_path)
        .with_context(|| format!("Failed to lock {}", config.runtime.lock_path.display()))?;

    let kernel = SystemKernel::new();
    let processes = SystemProcesses::new();
    let engine = Lifecycle::new(&config, &kernel, &processes)?;

    match cli.command {
        Command::Start { .. } => {
            let report = engine.start()?;
            if !report.process_errors.is_empty() {
                warn!("Started with {} process failure(s)", report.process_errors.len());
            }
        }
        Command::Stop { .. } => report_stop(&engine.stop()),
        Command::Restart => {
            engine.restart()?;
        }
        Command::RestartProxy => {
            if !engine.restart_proxy()? {
                println!("tpgate is not started");
            }
        }
        Command::RestartDns => {
            if !engine.restart_dns()? {
                println!("tpgate is not started");
            }
        }
        Command::Status { json } => {
            let status = engine.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                let running = |alive: bool| if alive { "running" } else { "stopped" };
                println!("state:    {}", status.state);
                println!(
                    "kernel:   chains={} policy_rule={} table_routes={}",
                    status.facts.chains, status.facts.policy_rule, status.facts.table_routes
                );
                match status.resolver_pid {
                    Some(pid) => println!("resolver: {} (pid {})", running(status.resolver_running), pid),
                    None => println!("resolver: {}", running(status.resolver_running)),
                }
                match status.proxy_running {
                    Some(alive) => println!("proxy:    {}", running(alive)),
                    None => println!("proxy:    unknown"),
                }
            }
        }
        Command::Check => {
            load_sources(&config, engine.policy(), &SystemResolver)?;
            engine.check_environment()?;
            println!("Configuration is valid");
        }
        Command::Plan { .. } | Command::InitConfig => {}
    }
    Ok(())
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tpgate: {e:#}");
            ExitCode::FAILURE
        }
    }
}
