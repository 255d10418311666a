//! CLI binary for inspecting VASP job logs, handlers and catflow protocols.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use catflow_catalog::{classify_detailed, SignatureCatalog};
use catflow_pipeline::{
    cathode_properties, default_registry, list_checkpoints, load_checkpoint, Anode,
    CalculatedState, PipelineCheckpoint, PipelineConfig, ProtocolTemplate, StagePlan,
};
use catflow_types::{LogStream, Parameters, Structure};

#[derive(Parser)]
#[command(name = "catflow", version, about = "Error recovery and staging for VASP jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the logs of a finished job
    Classify {
        /// Scheduler stdout of the job
        #[arg(long)]
        stdout: PathBuf,

        /// Scheduler stderr of the job
        #[arg(long)]
        stderr: PathBuf,

        /// Run configuration (for a custom signature catalog)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print matches as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the error signatures of the active catalog
    Catalog {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List error handlers in dispatch order
    Handlers {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Inspect protocol templates
    Protocol {
        #[command(subcommand)]
        action: ProtocolAction,
    },

    /// Show the checkpoints of interrupted runs
    Checkpoint {
        /// Checkpoint directory
        dir: PathBuf,

        /// Only show this run
        #[arg(long)]
        run: Option<String>,
    },

    /// Cathode properties from relaxed discharged and charged structures
    Cathode {
        /// Discharged structure (JSON)
        #[arg(long)]
        discharged: PathBuf,

        /// Total energy of the discharged structure in eV
        #[arg(long, allow_negative_numbers = true)]
        discharged_energy: f64,

        /// Charged structure (JSON)
        #[arg(long)]
        charged: PathBuf,

        /// Total energy of the charged structure in eV
        #[arg(long, allow_negative_numbers = true)]
        charged_energy: f64,

        /// Intercalating element
        #[arg(long, default_value = "Li")]
        anode: String,

        /// Anode chemical potential in eV per atom
        #[arg(long, allow_negative_numbers = true)]
        mu: f64,
    },
}

#[derive(Subcommand)]
enum ProtocolAction {
    /// Check a template for unsupported stages and bad policy
    Validate { template: PathBuf },

    /// Show stage typing and the parameters each stage starts from
    Explain {
        template: PathBuf,

        /// Structure (JSON) to specialize the template for
        #[arg(long)]
        structure: Option<PathBuf>,

        /// User parameters (JSON object) merged into every stage
        #[arg(long)]
        parameters: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Classify {
            stdout,
            stderr,
            config,
            json,
        } => cmd_classify(&stdout, &stderr, config.as_deref(), json)?,
        Commands::Catalog { config } => cmd_catalog(config.as_deref())?,
        Commands::Handlers { config } => cmd_handlers(config.as_deref())?,
        Commands::Protocol { action } => match action {
            ProtocolAction::Validate { template } => cmd_protocol_validate(&template)?,
            ProtocolAction::Explain {
                template,
                structure,
                parameters,
            } => cmd_protocol_explain(&template, structure.as_deref(), parameters.as_deref())?,
        },
        Commands::Checkpoint { dir, run } => cmd_checkpoint(&dir, run.as_deref()).await?,
        Commands::Cathode {
            discharged,
            discharged_energy,
            charged,
            charged_energy,
            anode,
            mu,
        } => cmd_cathode(
            &discharged,
            discharged_energy,
            &charged,
            charged_energy,
            Anode::new(anode, mu),
        )?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    Ok(match path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    })
}

fn cmd_classify(
    stdout: &Path,
    stderr: &Path,
    config: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    let catalog = load_config(config)?.load_catalog()?;
    let out = std::fs::read_to_string(stdout)?;
    let err = std::fs::read_to_string(stderr)?;
    let matches = classify_detailed(&out, &err, &catalog);
    tracing::debug!(catalog = catalog.version(), matched = matches.len(), "Classified logs");

    if json {
        println!("{}", serde_json::to_string_pretty(&matches)?);
        return Ok(());
    }
    if matches.is_empty() {
        println!("No known error signatures found");
        return Ok(());
    }
    for m in matches.values() {
        println!(
            "{:<20} {}:{:<6} {}",
            m.signature, m.source, m.line, m.pattern
        );
    }
    Ok(())
}

fn cmd_catalog(config: Option<&Path>) -> anyhow::Result<()> {
    let catalog: SignatureCatalog = load_config(config)?.load_catalog()?;
    println!("Catalog {} ({} signatures)", catalog.version(), catalog.len());
    for stream in [LogStream::Stdout, LogStream::Stderr] {
        println!("\n{stream}:");
        for sig in catalog.for_stream(stream) {
            println!("  {:<20} {}", sig.name, sig.patterns.join(" | "));
        }
    }
    Ok(())
}

fn cmd_handlers(config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let mut registry = default_registry();
    config.apply_handler_overrides(&mut registry)?;
    println!("{:>8}  {:<8} handler", "priority", "enabled");
    for d in registry.descriptors() {
        let enabled = if d.enabled { "yes" } else { "no" };
        println!("{:>8}  {:<8} {}", d.priority, enabled, d.name);
    }
    Ok(())
}

fn cmd_protocol_validate(path: &Path) -> anyhow::Result<()> {
    match ProtocolTemplate::load(path) {
        Ok(template) => {
            println!(
                "Protocol '{}' is valid ({} stages)",
                template.name.as_deref().unwrap_or("unnamed"),
                template.stage_count()
            );
            Ok(())
        }
        Err(e) => {
            println!("[ERROR] {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_protocol_explain(
    path: &Path,
    structure: Option<&Path>,
    parameters: Option<&Path>,
) -> anyhow::Result<()> {
    let mut template = ProtocolTemplate::load(path)?;
    if let Some(path) = structure {
        let structure = load_structure(path)?;
        let user: Parameters = match parameters {
            Some(p) => serde_json::from_str(&std::fs::read_to_string(p)?)?,
            None => Parameters::new(),
        };
        template = template.specialize(&structure, &user);
    }

    println!(
        "Protocol: {}",
        template.name.as_deref().unwrap_or("unnamed")
    );
    println!("Carry-over: {}", template.carry_over.join(", "));
    for plan in template.plan()? {
        print_stage(&template, &plan);
    }
    Ok(())
}

fn print_stage(template: &ProtocolTemplate, plan: &StagePlan) {
    let mut flags = Vec::new();
    if plan.single_shot {
        flags.push("single-shot".to_string());
    }
    if let Some(cap) = plan.stage_cap {
        flags.push(format!("cap={cap}"));
    }
    println!(
        "\n{} [{:?}{}]",
        plan.label(),
        plan.role,
        if flags.is_empty() {
            String::new()
        } else {
            format!(", {}", flags.join(", "))
        }
    );
    if let Some(params) = template.stage(plan.tag) {
        for (key, value) in params.iter() {
            println!("  {key} = {value}");
        }
    }
}

async fn cmd_checkpoint(dir: &Path, run: Option<&str>) -> anyhow::Result<()> {
    let checkpoints = match run {
        Some(run) => load_checkpoint(dir, run).await?.into_iter().collect(),
        None => list_checkpoints(dir).await?,
    };
    if checkpoints.is_empty() {
        println!("No checkpoint in {}", dir.display());
        return Ok(());
    }
    for checkpoint in &checkpoints {
        print_checkpoint(checkpoint);
    }
    Ok(())
}

fn print_checkpoint(checkpoint: &PipelineCheckpoint) {
    let state = &checkpoint.state;
    println!(
        "Run: {} (protocol {})",
        checkpoint.run(),
        checkpoint.protocol.as_deref().unwrap_or("unnamed")
    );
    println!("Saved: {}", checkpoint.timestamp);
    println!("Next stage: {}", state.current);
    for result in state.results.values() {
        println!(
            "  {:<24} attempts={} outputs={}",
            result.label(),
            result.attempts,
            result.outputs
        );
    }
    if let Some(restart) = &state.restart {
        println!("Restart from: {restart}");
    }
}

fn load_structure(path: &Path) -> anyhow::Result<Structure> {
    Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
}

fn cmd_cathode(
    discharged: &Path,
    discharged_energy: f64,
    charged: &Path,
    charged_energy: f64,
    anode: Anode,
) -> anyhow::Result<()> {
    let discharged = CalculatedState {
        energy: discharged_energy,
        structure: load_structure(discharged)?,
    };
    let charged = CalculatedState {
        energy: charged_energy,
        structure: load_structure(charged)?,
    };
    let props = cathode_properties(&discharged, &charged, &anode)?;
    println!("{}", serde_json::to_string_pretty(&props)?);
    Ok(())
}
