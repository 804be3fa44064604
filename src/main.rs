//! CLI Entry Point for daq-scan
//!
//! Runs one SPEC-style scan command against simulated axes and an in-process
//! execution engine, then prints the collected data.
//!
//! # Usage
//!
//! ```bash
//! daq-scan run "dscan x -1 1 4 det" --axes x,det
//! daq-scan run "mesh x 0 1 2 y 0 1 2 0.1" --axes x,y
//! daq-scan run "scan x 0 3 1 peak" --axes x,y --nested peak=y
//! daq-scan list
//! daq-scan config
//! ```
//!
//! Ctrl+C halts the running scan; collected points are still printed.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use daq_scan::config::{ScanConfig, DEFAULT_CONFIG_PATH};
use daq_scan::hardware::{Axis, MockAxis, MockNestedScan};
use daq_scan::logging;
use daq_scan::scan::{
    DataLocationListener, ListenerOutput, RunMetadata, ScanArg, ScanCommand, SimulatedEngine,
    SyntaxRegistry,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "daq-scan")]
#[command(about = "Run SPEC-style scan commands against simulated axes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scan command, e.g. "dscan x -1 1 10"
    Run {
        /// Command line: scan type followed by its arguments
        line: String,

        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Names of the simulated axes, comma separated
        #[arg(long, value_delimiter = ',', default_value = "x,y,det")]
        axes: Vec<String>,

        /// Nested-scan axes as name=inner_axis, comma separated
        #[arg(long, value_delimiter = ',')]
        nested: Vec<String>,

        /// Move duration of every simulated axis in milliseconds
        #[arg(long, default_value = "0")]
        move_ms: u64,
    },

    /// List the available scan commands and their usage
    List,

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            line,
            config,
            axes,
            nested,
            move_ms,
        } => run(&line, config, &axes, &nested, move_ms).await,
        Commands::List => {
            let registry = SyntaxRegistry::with_defaults();
            for name in registry.commands() {
                if let Some(syntax) = registry.get(&name) {
                    println!("{:<8} {}", name, syntax.usage());
                }
            }
            Ok(())
        }
        Commands::Config { config } => {
            let config = ScanConfig::load_from(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            if let Err(e) = config.validate() {
                eprintln!("⚠️  {e}");
            }
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(
    line: &str,
    config_path: PathBuf,
    axis_names: &[String],
    nested: &[String],
    move_ms: u64,
) -> Result<()> {
    let config = ScanConfig::load_or_default(&config_path);
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    let axes = build_axes(axis_names, nested, Duration::from_millis(move_ms))?;
    let (scan_type, args) = tokenize(line, &axes)?;

    let registry = SyntaxRegistry::with_defaults();
    let syntax = registry
        .get(&scan_type)
        .ok_or_else(|| anyhow!("unknown scan command '{}'", scan_type))?;

    let engine = Arc::new(SimulatedEngine::new());
    let metadata = RunMetadata::new();
    let command = Arc::new(
        ScanCommand::from_config(syntax, engine.clone(), &config)
            .with_listener(Arc::new(DataLocationListener))
            .with_metadata_sink(Arc::new(metadata.clone())),
    );

    let halt = command.halt_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received, halting scan");
            halt.request();
        }
    });

    let report = command
        .invoke(args)
        .await
        .with_context(|| format!("'{}' failed", line))?;
    info!(outcome = %report.outcome, "Scan finished");

    if let Some(writer) = engine.last_writer() {
        println!("{}", writer.columns().join("\t"));
        for row in writer.rows() {
            let cells: Vec<String> = row.iter().map(|v| format!("{v:.4}")).collect();
            println!("{}", cells.join("\t"));
        }
    }
    if let ListenerOutput::One(result) = &report.results {
        println!("{result}");
    }
    for (name, axis) in &axes {
        if axis.nested_scan().is_none() {
            println!("{name} = {}", axis.position().await?);
        }
    }
    Ok(())
}

fn build_axes(
    names: &[String],
    nested: &[String],
    move_duration: Duration,
) -> Result<HashMap<String, Arc<dyn Axis>>> {
    let mut axes: HashMap<String, Arc<dyn Axis>> = HashMap::new();
    for name in names.iter().filter(|n| !n.is_empty()) {
        let axis = MockAxis::new(name, 0.0).with_move_duration(move_duration);
        axes.insert(name.clone(), Arc::new(axis));
    }
    for entry in nested.iter().filter(|s| !s.is_empty()) {
        let (name, inner) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("nested axis '{}' must look like name=inner", entry))?;
        let inner = axes
            .get(inner)
            .cloned()
            .ok_or_else(|| anyhow!("nested axis '{}' refers to unknown axis '{}'", name, inner))?;
        let scan = MockNestedScan::new(name, inner, &[-1.0, 0.0, 1.0]);
        axes.insert(name.to_string(), Arc::new(scan));
    }
    Ok(axes)
}

/// Split a command line into its scan type and arguments.
///
/// Known axis names become axes, numbers become numbers, `[..]` lists and
/// `(..)` tuples may nest. Anything else is kept as text for the grouper to
/// reject with its position.
fn tokenize(line: &str, axes: &HashMap<String, Arc<dyn Axis>>) -> Result<(String, Vec<ScanArg>)> {
    let chars: Vec<char> = line.chars().collect();
    let mut pos = 0;
    let mut items = parse_items(&chars, &mut pos, None, axes)?;
    if items.is_empty() {
        bail!("empty command line");
    }
    let scan_type = match items.remove(0) {
        ScanArg::Text(name) => name,
        other => bail!("expected a scan command, got {}", other),
    };
    Ok((scan_type, items))
}

fn parse_items(
    chars: &[char],
    pos: &mut usize,
    close: Option<char>,
    axes: &HashMap<String, Arc<dyn Axis>>,
) -> Result<Vec<ScanArg>> {
    let mut items = Vec::new();
    while *pos < chars.len() {
        let c = chars[*pos];
        match c {
            c if c.is_whitespace() || c == ',' => *pos += 1,
            '[' | '(' => {
                *pos += 1;
                let end = if c == '[' { ']' } else { ')' };
                let inner = parse_items(chars, pos, Some(end), axes)?;
                items.push(if c == '[' {
                    ScanArg::List(inner)
                } else {
                    ScanArg::Tuple(inner)
                });
            }
            ']' | ')' => {
                if close != Some(c) {
                    bail!("unexpected '{}' at column {}", c, *pos + 1);
                }
                *pos += 1;
                return Ok(items);
            }
            _ => {
                let start = *pos;
                while *pos < chars.len()
                    && !chars[*pos].is_whitespace()
                    && !matches!(chars[*pos], ',' | '[' | ']' | '(' | ')')
                {
                    *pos += 1;
                }
                let word: String = chars[start..*pos].iter().collect();
                items.push(word_to_arg(&word, axes));
            }
        }
    }
    match close {
        Some(end) => bail!("missing '{}'", end),
        None => Ok(items),
    }
}

fn word_to_arg(word: &str, axes: &HashMap<String, Arc<dyn Axis>>) -> ScanArg {
    if let Some(axis) = axes.get(word) {
        return ScanArg::Axis(axis.clone());
    }
    match word.parse::<f64>() {
        Ok(value) => ScanArg::Number(value),
        Err(_) => ScanArg::Text(word.to_string()),
    }
}
