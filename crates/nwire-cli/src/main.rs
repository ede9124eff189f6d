//! # nwire CLI
//!
//! Assemble a network file and inspect the reduced system.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use nwire_components::{models::NeuronModel, ChemicalParams, Component, SynapseKind};
use nwire_network::{
    build_network_with, extract_voltages, inspect_network, resolve_network, Connections,
    Strategy,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "nwire")]
#[command(version)]
#[command(about = "Neuron network assembly and structural reduction", long_about = None)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble and reduce a network, then print its summary
    Build {
        /// Network file (JSON)
        network: PathBuf,
        /// Reduce each piece separately before the global pass
        #[arg(long, conflicts_with = "standard")]
        split: bool,
        /// Reduce the whole graph in one pass
        #[arg(long)]
        standard: bool,
    },

    /// List the canonical membrane voltage of every neuron
    Voltages {
        /// Network file (JSON)
        network: PathBuf,
    },

    /// Print the reduced equations
    Equations {
        /// Network file (JSON)
        network: PathBuf,
        /// Print the unreduced graph instead
        #[arg(long)]
        graph: bool,
    },

    /// Print the synapse preset table
    Presets,
}

/// One neuron of a network file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NeuronEntry {
    name: String,
    model: NeuronModel,
    /// Parameter overrides by path (`soma.i_app`)
    #[serde(default)]
    params: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NetworkFile {
    neurons: Vec<NeuronEntry>,
    #[serde(default)]
    connections: Connections,
}

impl NetworkFile {
    fn components(&self) -> anyhow::Result<Vec<Component>> {
        self.neurons
            .iter()
            .map(|entry| -> anyhow::Result<Component> {
                let mut component = entry.model.build(&entry.name)?;
                for (path, value) in &entry.params {
                    component = component.with_parameter(path, *value)?;
                }
                Ok(component)
            })
            .collect()
    }
}

fn load(path: &Path) -> anyhow::Result<(Vec<Component>, Connections)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: NetworkFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    let neurons = file.components()?;
    info!(path = %path.display(), neurons = neurons.len(), "loaded network file");
    Ok((neurons, file.connections))
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    if let Err(err) = run(cli.command) {
        error!("command failed: {:#}", err);
        eprintln!("{} {:#}", "error:".red().bold(), err);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Build {
            network,
            split,
            standard,
        } => {
            let (neurons, connections) = load(&network)?;
            let strategy = if split {
                Strategy::Split
            } else if standard {
                Strategy::Standard
            } else {
                Strategy::recommended(neurons.len())
            };
            let system = build_network_with(&connections, &neurons, strategy)?;
            let summary = inspect_network(&system)?;

            println!(
                "{} {} ({} strategy)",
                "Built network:".green().bold(),
                network.display(),
                strategy.to_string().cyan()
            );
            println!("{}", summary);
            println!("Observed: {}", system.observed().len());
            println!("Parameters: {}", system.parameter_count());
        }

        Commands::Voltages { network } => {
            let (neurons, connections) = load(&network)?;
            let strategy = Strategy::recommended(neurons.len());
            let system = build_network_with(&connections, &neurons, strategy)?;
            println!("{}", "Membrane voltages:".green().bold());
            for voltage in extract_voltages(&system)? {
                let role = match voltage.state_index {
                    Some(k) => format!("state {}", k),
                    None => "observed".to_string(),
                };
                println!("  {:<12} {} ({})", voltage.neuron.cyan(), voltage.name, role);
            }
        }

        Commands::Equations { network, graph } => {
            let (neurons, connections) = load(&network)?;
            let lines = if graph {
                resolve_network(&connections, &neurons)?.render_equations()
            } else {
                let strategy = Strategy::recommended(neurons.len());
                build_network_with(&connections, &neurons, strategy)?.render_equations()
            };
            for line in lines {
                println!("{}", line);
            }
        }

        Commands::Presets => {
            println!("{}", "Synapse presets:".green().bold());
            println!();
            println!(
                "  {:<10} {:>10} {:>8} {:>8} {:>10}",
                "type", "e_rev", "k", "delta", "v_th"
            );
            for kind in SynapseKind::ALL {
                match ChemicalParams::preset(kind) {
                    Some(p) => println!(
                        "  {:<10} {:>10.1} {:>8.3} {:>8.1} {:>10.1}",
                        kind.tag().cyan(),
                        p.e_rev,
                        p.k,
                        p.delta,
                        p.v_th
                    ),
                    None if kind == SynapseKind::Custom => println!(
                        "  {:<10} {}",
                        kind.tag().cyan(),
                        "all of e_rev, k, delta, v_th required".yellow()
                    ),
                    None => println!(
                        "  {:<10} {}",
                        kind.tag().cyan(),
                        "gap junction (v_half = 20 mV, g_min = 0.25)".yellow()
                    ),
                }
            }
        }
    }

    Ok(())
}
