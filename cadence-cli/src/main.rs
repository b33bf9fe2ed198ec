use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use schemars::schema_for;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence_cli::completions;
use cadence_cli::config::ProfileConfig;
use cadence_cli::diagnostics::{self, DelayCheck};
use cadence_cli::output::{self, FlowResults, SendResults};
use cadence_core::threading::{lock_memory, pin_to_core, set_realtime_priority};
use cadence_core::timing::{delay::set_default_strategy, DelayStrategy};
use cadence_core::{Client, Server};

/// Cadence: paced UDP/TCP traffic and receive-side measurement
///
/// `serve` and `send` read an optional TOML profile with [server] and
/// [client] sections; every value can be overridden with --set.
///
/// Example usage:
///   cadence serve -P profiles/udp-server.toml
///   cadence send --set client.target=192.168.1.10:5001 --set client.rate=50000000
///   cadence send -P profiles/isoch-client.toml --set client.isochronous.fps=30
///   cadence check-delay -d 10 -i 100000 -r
///   cadence check-isoch -c 61 -f 60
///   cadence completions bash > ~/.local/share/bash-completion/completions/cadence
#[derive(Parser)]
#[command(name = "cadence")]
#[command(version, about = "Paced traffic generator and measurement receiver", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive flows and report their statistics
    Serve {
        /// Path to TOML profile configuration file
        #[arg(short = 'P', long)]
        profile: Option<PathBuf>,

        /// Override any configuration value using dot notation (can be specified multiple times)
        ///
        /// Examples:
        ///   --set server.bind=0.0.0.0:5001
        ///   --set server.interval=1s
        ///   --set server.histogram.bincount=500
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// Send a paced UDP or TCP flow
    Send {
        /// Path to TOML profile configuration file
        #[arg(short = 'P', long)]
        profile: Option<PathBuf>,

        /// Override any configuration value using dot notation (can be specified multiple times)
        ///
        /// Examples:
        ///   --set client.target=127.0.0.1:5001
        ///   --set client.duration=30s
        ///   --set client.isochronous.fps=60
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// Measure how long the delay engine really blocks
    CheckDelay {
        /// Requested delay in microseconds
        #[arg(short = 'd', long = "delay", default_value_t = 1)]
        delay_us: u64,

        /// Number of delays to measure
        #[arg(short = 'i', long, default_value_t = 1_000_000)]
        iterations: u64,

        /// Pin the measuring thread to this core
        #[arg(short = 'a', long)]
        affinity: Option<usize>,

        /// Run under SCHED_RR with locked memory
        #[arg(short = 'r', long)]
        realtime: bool,

        /// Time a clock read instead of a delay
        #[arg(short = 'c', long = "clock")]
        clock_overhead: bool,

        #[arg(short = 's', long, value_enum, default_value_t = StrategyArg::Auto)]
        strategy: StrategyArg,
    },

    /// Tick a frame counter and show slip detection
    CheckIsoch {
        /// Number of ticks
        #[arg(short = 'c', long, default_value_t = 61)]
        count: u64,

        /// Frames per second
        #[arg(short = 'f', long, default_value_t = 60.0)]
        fps: f64,

        #[arg(short = 's', long, value_enum, default_value_t = StrategyArg::Auto)]
        strategy: StrategyArg,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Generate JSON Schema for profile files
    Schema,

    /// List all valid config paths for --set flag (used by shell completions)
    #[command(hide = true)]
    CompletePaths,
}

/// Delay strategy as spelled on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Auto,
    BusyLoop,
    Sleep,
    Hybrid,
    Kalman,
}

impl From<StrategyArg> for DelayStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Auto => DelayStrategy::Auto,
            StrategyArg::BusyLoop => DelayStrategy::BusyLoop,
            StrategyArg::Sleep => DelayStrategy::Sleep,
            StrategyArg::Hybrid => DelayStrategy::Hybrid,
            StrategyArg::Kalman => DelayStrategy::Kalman,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Completions { shell } => {
            let bin_name = "cadence";
            match shell {
                Shell::Bash => {
                    println!("{}", completions::generate_bash_completion(bin_name));
                }
                Shell::Zsh => {
                    println!("{}", completions::generate_zsh_completion(bin_name));
                }
                _ => {
                    let mut cmd = Cli::command();
                    generate(shell, &mut cmd, bin_name.to_string(), &mut io::stdout());
                }
            }
            Ok(())
        }
        Commands::Schema => {
            let schema = schema_for!(ProfileConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Commands::CompletePaths => {
            for path in completions::get_config_paths() {
                println!("{}", path);
            }
            Ok(())
        }
        Commands::Serve { profile, set } => serve(profile, set),
        Commands::Send { profile, set } => send(profile, set),
        Commands::CheckDelay {
            delay_us,
            iterations,
            affinity,
            realtime,
            clock_overhead,
            strategy,
        } => check_delay(
            DelayCheck { delay_us, iterations, strategy: strategy.into(), clock_overhead },
            affinity,
            realtime,
        ),
        Commands::CheckIsoch { count, fps, strategy } => {
            set_default_strategy(strategy.into());
            diagnostics::check_isoch(count, fps, strategy.into(), &mut io::stdout().lock())?;
            Ok(())
        }
    }
}

fn load_profile(profile: Option<PathBuf>, set: &[String]) -> anyhow::Result<ProfileConfig> {
    if let Some(path) = &profile {
        tracing::info!("Loading profile: {}", path.display());
    }
    let config = ProfileConfig::load(profile.as_deref(), set)?;
    if let Some(name) = &config.name {
        tracing::info!("Profile: {}", name);
    }
    if let Some(desc) = &config.description {
        tracing::info!("Description: {}", desc);
    }
    Ok(config)
}

fn serve(profile: Option<PathBuf>, set: Vec<String>) -> anyhow::Result<()> {
    let config = load_profile(profile, &set)?;
    set_default_strategy(config.server.delay_strategy);

    let mut server = Server::bind(config.server.clone())?;
    let flows = server.run()?;

    let results: Vec<FlowResults> = flows.iter().map(FlowResults::from_report).collect();
    for flow in &results {
        flow.print_human();
    }
    if let Some(path) = &config.output.file {
        output::write_json(&results, path)?;
    }
    Ok(())
}

fn send(profile: Option<PathBuf>, set: Vec<String>) -> anyhow::Result<()> {
    let config = load_profile(profile, &set)?;
    set_default_strategy(config.client.delay_strategy);
    let target = config.client.target;

    let client = Client::new(config.client.clone())?;
    let report = client.run()?;

    let results = SendResults::from_report(target.to_string(), &report);
    results.print_human();
    if let Some(path) = &config.output.file {
        output::write_json(&results, path)?;
    }
    Ok(())
}

fn check_delay(check: DelayCheck, affinity: Option<usize>, realtime: bool) -> anyhow::Result<()> {
    if realtime {
        println!("Setting scheduler to realtime via SCHED_RR");
        if let Err(e) = set_realtime_priority() {
            tracing::warn!("Realtime scheduling not enabled: {}", e);
        }
        if let Err(e) = lock_memory() {
            tracing::warn!("Memory not locked: {}", e);
        }
    }
    if let Some(core) = affinity {
        println!("CPU affinity set to {}", core);
        if let Err(e) = pin_to_core(core) {
            tracing::warn!("CPU affinity not applied: {}", e);
        }
    }

    let what = if check.clock_overhead { "clock read" } else { "delay" };
    if check.iterations > 1000 {
        println!(
            "Measuring {} over {:.0e} iterations using {} usec delay",
            what, check.iterations as f64, check.delay_us
        );
    } else {
        println!(
            "Measuring {} over {} iterations using {} usec delay",
            what, check.iterations, check.delay_us
        );
    }

    let measurement = diagnostics::measure_delay(&check)?;
    println!("{}", measurement);
    println!("{}", measurement.errors);
    Ok(())
}
