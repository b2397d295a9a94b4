//! Command-line interface for the applycar driver.
//!
//! Runs the command sender and the debounce filter against in-process
//! simulated records, which is handy for checking timing and failure
//! handling without a control system.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use applycar_commands::{
    Behaviour, CarValue, CommandSender, Responder, SenderConfig, SimulatedApply, SimulatedCar,
};
use applycar_core::config::{self, defaults, env_vars};
use applycar_core::{
    Attribute, DebounceFilter, MemoryAttribute, StabilizerConfig, TokioScheduler, value_listener,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

/// applycar - Apply/CAR command sender and signal debouncer.
#[derive(Parser, Debug)]
#[command(name = "applycar")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Post commands to a simulated Apply/CAR pair.
    Simulate {
        /// How the simulated system answers.
        #[arg(short, long, value_enum, default_value_t = Mode::Accept)]
        behaviour: Mode,
        /// Delay before the CAR record reacts, in milliseconds.
        #[arg(long, default_value_t = 20)]
        delay_ms: u64,
        /// Command timeout in milliseconds (0 disables it).
        #[arg(short, long, default_value_t = 1000)]
        timeout_ms: u64,
        /// Number of commands to post, one after another.
        #[arg(short, long, default_value_t = 1)]
        count: u32,
        /// Error message reported by the simulated system.
        #[arg(long, default_value = "simulated failure")]
        message: String,
        /// Also print the recorded state transitions.
        #[arg(long)]
        transitions: bool,
    },
    /// Feed a sequence of values through a debounce filter.
    Debounce {
        /// Values to feed, in order.
        #[arg(required = true, value_delimiter = ',')]
        values: Vec<String>,
        /// Settle window in milliseconds. Defaults to the environment setting.
        #[arg(short, long)]
        settle_ms: Option<u64>,
        /// Interval between fed values in milliseconds.
        #[arg(short, long, default_value_t = 1)]
        interval_ms: u64,
    },
    /// Show effective configuration defaults.
    Config,
}

/// Simulated system behaviour.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Accept every command
    Accept,
    /// Reject at the Apply record
    Reject,
    /// Accept, then report a CAR error
    Fault,
    /// Never answer
    Silent,
}

#[derive(Serialize)]
struct CommandReport {
    command: u32,
    id: String,
    success: bool,
    error: Option<String>,
    elapsed_ms: u128,
}

#[derive(Serialize)]
struct Published {
    value: String,
    elapsed_ms: u128,
}

#[derive(Serialize)]
struct ConfigReport {
    trace: bool,
    log_json: bool,
    command_timeout_ms: u64,
    settle_ms: u64,
    transition_channel_capacity: usize,
    env: Vec<&'static str>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Simulate {
            behaviour,
            delay_ms,
            timeout_ms,
            count,
            message,
            transitions,
        } => {
            let behaviour = to_behaviour(behaviour, Duration::from_millis(delay_ms), message);
            run_simulate(behaviour, timeout_ms, count, transitions, args.json).await
        }
        Command::Debounce {
            values,
            settle_ms,
            interval_ms,
        } => {
            let settle = settle_ms
                .map(|settle_ms| StabilizerConfig { settle_ms })
                .unwrap_or_else(StabilizerConfig::from_env);
            run_debounce(values, settle, interval_ms, args.json).await
        }
        Command::Config => show_config(args.json),
    }
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "applycar=debug" } else { "applycar=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    if config::log_json() {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .init();
    }
}

fn to_behaviour(mode: Mode, delay: Duration, message: String) -> Behaviour {
    match mode {
        Mode::Accept => Behaviour::Accept { delay },
        Mode::Reject => Behaviour::Reject { message },
        Mode::Fault => Behaviour::CarFault { delay, message },
        Mode::Silent => Behaviour::Silent,
    }
}

/// Post `count` commands to a simulated record pair and report each outcome.
async fn run_simulate(
    behaviour: Behaviour,
    timeout_ms: u64,
    count: u32,
    transitions: bool,
    json: bool,
) -> Result<()> {
    if behaviour == Behaviour::Silent && timeout_ms == 0 {
        anyhow::bail!("A silent system with no timeout never completes a command");
    }

    let scheduler = TokioScheduler::shared().context("Failed to create scheduler")?;
    let apply = Arc::new(SimulatedApply::new("sim:apply"));
    let car = Arc::new(SimulatedCar::with_state("sim:car", CarValue::Idle));
    let _responder = Responder::attach(apply.clone(), car.clone(), scheduler.clone(), behaviour);

    let config = SenderConfig::new("sim")
        .with_description("simulated Apply/CAR pair")
        .with_timeout(Duration::from_millis(timeout_ms));
    let sender = CommandSender::<CarValue>::new(config, apply, car, scheduler)
        .context("Failed to bind command sender")?;
    info!(
        "Posting {} command(s) through {} / {}",
        count,
        sender.apply_name(),
        sender.car_name()
    );

    for command in 1..=count {
        let start = Instant::now();
        let monitor = sender.post_wait().await;
        let error = monitor.error();
        let report = CommandReport {
            command,
            id: monitor.id().to_string(),
            success: error.is_none(),
            error: error.map(|e| e.to_string()),
            elapsed_ms: start.elapsed().as_millis(),
        };

        if json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            match &report.error {
                None => println!("command {}: ok ({} ms)", command, report.elapsed_ms),
                Some(e) => println!("command {}: {} ({} ms)", command, e, report.elapsed_ms),
            }
        }
    }

    if transitions {
        for event in sender.recent_transitions(defaults::TRANSITION_CHANNEL_CAPACITY) {
            if json {
                println!("{}", serde_json::to_string(&event)?);
            } else {
                println!("  {:?}: {} -> {}", event.trigger, event.from, event.to);
            }
        }
    }

    sender.unbind();
    Ok(())
}

/// Feed `values` into a debounce filter and print what it publishes.
async fn run_debounce(
    values: Vec<String>,
    settle: StabilizerConfig,
    interval_ms: u64,
    json: bool,
) -> Result<()> {
    let scheduler = TokioScheduler::shared().context("Failed to create scheduler")?;
    let source = Arc::new(MemoryAttribute::<String>::new("sim:signal"));
    let filter = DebounceFilter::<String>::new(source.clone(), settle.settle_time(), scheduler);

    let start = Instant::now();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    filter.add_listener(value_listener(move |published: &[String]| {
        if let Some(value) = published.first() {
            let _ = tx.send(Published {
                value: value.clone(),
                elapsed_ms: start.elapsed().as_millis(),
            });
        }
    }));

    info!(
        "Feeding {} value(s) every {} ms, settle window {} ms",
        values.len(),
        interval_ms,
        settle.settle_ms
    );
    for (i, value) in values.into_iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
        source.set(value);
    }

    // Let the last value settle
    tokio::time::sleep(settle.settle_time() + Duration::from_millis(20)).await;
    filter.unbind();

    while let Ok(published) = rx.try_recv() {
        if json {
            println!("{}", serde_json::to_string(&published)?);
        } else {
            println!("{} ms: {}", published.elapsed_ms, published.value);
        }
    }
    Ok(())
}

fn show_config(json: bool) -> Result<()> {
    let report = ConfigReport {
        trace: config::trace_enabled(),
        log_json: config::log_json(),
        command_timeout_ms: config::command_timeout_ms(),
        settle_ms: config::settle_ms(),
        transition_channel_capacity: defaults::TRANSITION_CHANNEL_CAPACITY,
        env: vec![
            env_vars::TRACE,
            env_vars::COMMAND_TIMEOUT_MS,
            env_vars::SETTLE_MS,
            env_vars::LOG_JSON,
        ],
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("trace: {}", report.trace);
        println!("log_json: {}", report.log_json);
        println!("command_timeout_ms: {}", report.command_timeout_ms);
        println!("settle_ms: {}", report.settle_ms);
        println!(
            "transition_channel_capacity: {}",
            report.transition_channel_capacity
        );
        println!("environment: {}", report.env.join(", "));
    }
    Ok(())
}
