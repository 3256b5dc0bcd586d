//! Topology simulation application.
#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::default_trait_access)]

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::mpsc;

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use itertools::Itertools;

use toposim::{adapter, ChannelListener, Scenario, SimulationState};

/// Runs topology simulations and the boundary adapter.
#[derive(Parser)]
#[command(version, author)]
struct Opt {
    /// Verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Store the logs in this file.
    #[arg(long)]
    log_output: Option<PathBuf>,

    /// Do not log to the stderr.
    #[arg(long)]
    no_stderr: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs a scenario file to completion and prints a metrics snapshot.
    Run {
        /// Path to the scenario file in JSON format.
        scenario: PathBuf,

        /// Write every dispatched event to this file as JSON lines.
        #[arg(long)]
        events_output: Option<PathBuf>,
    },
    /// Serves the boundary adapter (health probe and echo stream).
    Serve,
}

/// Set up a logger based on the given user options.
fn set_up_logger(opt: &Opt) -> Result<(), fern::InitError> {
    let log_level = match opt.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let dispatch = fern::Dispatch::new()
        .format(|out, message, record| out.finish(format_args!("[{}] {}", record.level(), message)))
        .level(log_level);
    let dispatch = if let Some(path) = &opt.log_output {
        let _ = std::fs::remove_file(path);
        dispatch.chain(
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .append(false)
                .open(path)?,
        )
    } else {
        dispatch
    };
    let dispatch = if opt.no_stderr {
        dispatch
    } else {
        dispatch.chain(std::io::stderr())
    };
    dispatch.apply()?;
    Ok(())
}

fn run_scenario(scenario: &PathBuf, events_output: Option<&PathBuf>) -> eyre::Result<()> {
    let scenario = Scenario::from_file(scenario)?;
    let mut engine = scenario.build()?;

    let writer = events_output
        .map(|path| -> eyre::Result<_> {
            let file = File::create(path)
                .wrap_err_with(|| format!("unable to create {}", path.display()))?;
            let (sender, receiver) = mpsc::channel();
            engine.add_listener(Box::new(ChannelListener::new(sender)));
            Ok(toposim::write_from_channel(io::BufWriter::new(file), receiver))
        })
        .transpose()?;

    engine.run()?;
    if engine.state() == SimulationState::Error {
        eyre::bail!("simulation ended in error state");
    }

    let metrics = engine.metrics();
    let component_metrics = engine.component_metrics();
    let snapshot = serde_json::json!({
        "engine": metrics,
        "components": component_metrics
            .iter()
            .sorted_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(id, metrics)| (id.clone(), serde_json::to_value(metrics).unwrap_or_default()))
            .collect::<serde_json::Map<_, _>>(),
        "queue": engine.queue_stats(),
    });
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    // The engine is dropped here, which disconnects the listener channel and
    // lets the writer thread drain and exit.
    drop(engine);
    if let Some(writer) = writer {
        let _ = writer.join();
    }
    Ok(())
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let opt = Opt::parse();
    set_up_logger(&opt).wrap_err("unable to set up logger")?;
    match &opt.command {
        Command::Run {
            scenario,
            events_output,
        } => run_scenario(scenario, events_output.as_ref()),
        Command::Serve => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(adapter::serve(adapter::AdapterConfig::from_env()))
        }
    }
}
