//! CLI entry point for transport_daq.
//!
//! Provides command-line tools for checking a measurement before it touches
//! a real device:
//! - `validate`: parse a parameter file and list the roles
//! - `plan`: build the sweep plans and report their size and warnings
//! - `buffer`: resolve buffered acquisition settings
//! - `dry-run`: execute the plans against simulated instruments
//!
//! # Usage
//!
//! ```bash
//! transport_daq validate demos/gate_sweep.yaml
//! transport_daq plan demos/gate_sweep.yaml --mode parallel
//! transport_daq buffer demos/buffer.yaml --capacity 8192
//! transport_daq dry-run demos/gate_sweep.yaml --readings 0.5,0.7,1.0 --csv out/run.csv
//! TRANSPORT_DAQ_TIMETRACE__DURATION_SECS=2 transport_daq dry-run demos/gate_sweep.yaml --timetrace
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use transport_daq::buffer::{BufferSettingsResolver, RawBufferSettings};
use transport_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use transport_daq::data::{DataSink, MemorySink};
use transport_daq::experiment::{MeasurementOrchestrator, RunMode, SweepBuilder, SweepMode};
use transport_daq::hardware::mock::{MockDac, MockDmm};
use transport_daq::hardware::ChannelRegistry;
use transport_daq::logging::{self, OutputFormat, TracingConfig};
use transport_daq::parameter::{ParameterModel, Value};

#[derive(Parser)]
#[command(name = "transport_daq")]
#[command(about = "Sweep planning and orchestration for electronic transport measurements", long_about = None)]
struct Cli {
    /// Settings file (TOML); TRANSPORT_DAQ_* variables override it
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a parameter file and print every parameter with its role
    Validate {
        /// Parameter file (.yaml, .yml or .json)
        parameters: PathBuf,
    },

    /// Build sweep plans and print their size
    Plan {
        /// Parameter file (.yaml, .yml or .json)
        parameters: PathBuf,

        /// Sweep geometry (defaults to the settings value)
        #[arg(long)]
        mode: Option<SweepMode>,

        /// Print the plan summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resolve buffered acquisition settings
    Buffer {
        /// Buffer settings file (YAML)
        settings: PathBuf,

        /// Largest number of points the buffer holds
        #[arg(long, default_value = "16384")]
        capacity: usize,

        /// Parameter file to reconcile the sweep against
        #[arg(long)]
        parameters: Option<PathBuf>,
    },

    /// Run the plans against simulated instruments
    DryRun {
        /// Parameter file (.yaml, .yml or .json)
        parameters: PathBuf,

        /// Sweep geometry (defaults to the settings value)
        #[arg(long)]
        mode: Option<SweepMode>,

        /// Readings returned by every simulated gettable, in order; the last repeats
        #[arg(long, value_delimiter = ',', default_value = "0.0")]
        readings: Vec<f64>,

        /// Record a timetrace with the [timetrace] settings instead of sweeping
        #[arg(long, conflicts_with = "mode")]
        timetrace: bool,

        /// Also write the records to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid settings: {e}"))?;
    let level = logging::parse_log_level(&settings.log_level).map_err(anyhow::Error::msg)?;
    logging::init(TracingConfig::new(level).with_format(cli.log_format));

    match cli.command {
        Commands::Validate { parameters } => validate(parameters),
        Commands::Plan {
            parameters,
            mode,
            json,
        } => plan(parameters, mode.unwrap_or(settings.sweep_mode), json, &settings),
        Commands::Buffer {
            settings: path,
            capacity,
            parameters,
        } => buffer(path, capacity, parameters),
        Commands::DryRun {
            parameters,
            mode,
            readings,
            timetrace,
            csv,
        } => {
            let mode = if timetrace {
                None
            } else {
                Some(mode.unwrap_or(settings.sweep_mode))
            };
            dry_run(parameters, mode, readings, csv, settings).await
        }
    }
}

fn load_model(path: &Path) -> Result<ParameterModel> {
    ParameterModel::load(path).with_context(|| format!("loading parameters from {}", path.display()))
}

fn validate(path: PathBuf) -> Result<()> {
    let model = load_model(&path)?;
    for (name, terminal) in model.terminals() {
        println!("{name}");
        for spec in terminal.parameters.values() {
            let locked = if spec.locked() { " (locked)" } else { "" };
            println!("  {:<24} {}{locked}", spec.key().parameter, spec.role().name());
        }
    }
    println!(
        "{} parameters: {} swept, {} recorded, {} compensating",
        model.len(),
        model.dynamic().len(),
        model.gettables().len(),
        model.compensating().len()
    );
    Ok(())
}

fn plan(path: PathBuf, mode: SweepMode, json: bool, settings: &Settings) -> Result<()> {
    let model = load_model(&path)?;
    let plans = SweepBuilder::new(&model)
        .with_grid_warning_threshold(settings.grid_warning_threshold)
        .with_idle_params_recorded(settings.log_idle_params)
        .build(mode)?;

    if json {
        let summary = plans
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name(),
                    "steps": p.len(),
                    "delay": p.delay(),
                    "recorded": p.recorded().iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "warnings": p.warnings(),
                })
            })
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Mode: {mode}");
    for p in &plans {
        println!("Plan '{}': {} steps, delay {} s", p.name(), p.len(), p.delay());
        for (key, value) in p.initial_targets() {
            println!("  start  {key} = {value}");
        }
        for (key, value) in p.final_targets() {
            println!("  end    {key} = {value}");
        }
        for warning in p.warnings() {
            println!("  warning: {warning}");
        }
    }
    Ok(())
}

fn buffer(path: PathBuf, capacity: usize, parameters: Option<PathBuf>) -> Result<()> {
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading buffer settings from {}", path.display()))?;
    let raw: RawBufferSettings = serde_yaml::from_str(&text)?;
    let resolver = BufferSettingsResolver::default();
    let config = resolver.resolve(&raw, capacity)?;
    println!("{}", serde_yaml::to_string(&config)?);

    if let Some(parameters) = parameters {
        let model = load_model(&parameters)?;
        let plan = SweepBuilder::new(&model).build_buffered(&config)?;
        println!("Buffered plan: {} samples", plan.len());
        for warning in plan.warnings() {
            println!("warning: {warning}");
        }
    }
    Ok(())
}

/// Sweep in `mode`, or record a timetrace when `mode` is `None`.
async fn dry_run(
    path: PathBuf,
    mode: Option<SweepMode>,
    readings: Vec<f64>,
    csv: Option<PathBuf>,
    settings: Settings,
) -> Result<()> {
    let model = load_model(&path)?;
    let builder = SweepBuilder::new(&model)
        .with_grid_warning_threshold(settings.grid_warning_threshold)
        .with_idle_params_recorded(settings.log_idle_params);
    let plans = match mode {
        Some(mode) => builder.build(mode)?,
        None => vec![builder.build_timetrace(&settings.timetrace)?],
    };

    let mut registry = ChannelRegistry::new();
    for spec in model.specs() {
        let role = spec.role();
        if role.settable() {
            let start = match spec.initial_value() {
                Some(Value::Float(v)) => v,
                _ => 0.0,
            };
            registry.register_rampable(spec.key().clone(), Arc::new(MockDac::new(start)));
        } else if role.recorded() {
            registry.register_readable(
                spec.key().clone(),
                Arc::new(MockDmm::scripted(readings.clone())),
            );
        }
    }

    let memory = MemorySink::new();
    let sink: Box<dyn DataSink> = match csv {
        #[cfg(feature = "storage_csv")]
        Some(path) => Box::new(Tee {
            first: memory.clone(),
            second: transport_daq::data::CsvSink::create(path)?,
        }),
        #[cfg(not(feature = "storage_csv"))]
        Some(_) => anyhow::bail!("CSV output requires the storage_csv feature"),
        None => Box::new(memory.clone()),
    };

    let mut orchestrator = MeasurementOrchestrator::new(model, registry, settings, sink);
    let summary = orchestrator.execute(plans, RunMode::Unbuffered).await?;

    for record in memory.records().await {
        let readings = record
            .readings
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!("{:>6} {:?} {}", record.step, record.direction, readings);
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Writes every record to two sinks.
#[cfg(feature = "storage_csv")]
struct Tee<A, B> {
    first: A,
    second: B,
}

#[cfg(feature = "storage_csv")]
#[async_trait::async_trait]
impl<A: DataSink, B: DataSink> DataSink for Tee<A, B> {
    async fn write(
        &mut self,
        record: &transport_daq::data::MeasurementRecord,
    ) -> transport_daq::error::AppResult<()> {
        self.first.write(record).await?;
        self.second.write(record).await
    }

    async fn flush(&mut self) -> transport_daq::error::AppResult<()> {
        self.first.flush().await?;
        self.second.flush().await
    }
}
