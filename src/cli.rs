use crate::capability::{Capability, CapabilitySet, WITHHELD};
use crate::config::types::{ExecutionRequest, SandboxConfig, TestCase};
use crate::config::validator::validate_config;
use crate::engine::Engine;
use crate::limiter::supervisor::WORKER_ROLE;
use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "snakebox", author, version, about, long_about = None)]
struct Cli {
    /// Internal role selector (hidden; used by the worker re-exec path)
    #[arg(long, hide = true)]
    internal_role: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a submission and print the result as JSON
    Execute(ExecuteArgs),
    /// Validate configuration and run a smoke test through a real worker
    Check {
        /// Configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List built-ins and whether they are granted
    Capabilities {
        /// Configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ExecuteArgs {
    /// Request JSON ({source, tests}) from a file, or `-` for stdin
    #[arg(long, conflicts_with = "source")]
    request: Option<String>,
    /// Source file, or `-` for stdin
    #[arg(long)]
    source: Option<String>,
    /// Test case; split at the last `=`
    #[arg(long = "test", value_name = "EXPR=EXPECTED")]
    tests: Vec<String>,
    /// Configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// CPU time limit for the source in milliseconds
    #[arg(long)]
    cpu_ms: Option<u64>,
    /// Wall clock limit for the source in milliseconds
    #[arg(long)]
    wall_ms: Option<u64>,
    /// Memory limit for the source in MiB
    #[arg(long)]
    mem_mb: Option<u64>,
    /// Grant only the narrow teaching set of built-ins
    #[arg(long)]
    minimal: bool,
    /// Pretty-print the result
    #[arg(long)]
    pretty: bool,
}

pub fn run() -> Result<ExitCode> {
    env_logger::init();

    let cli = Cli::parse();
    if let Some(role) = cli.internal_role.as_deref() {
        if role == WORKER_ROLE {
            let status = crate::worker::run();
            return Ok(ExitCode::from(status as u8));
        }
        bail!("unsupported internal role: {}", role);
    }

    match cli.command.ok_or_else(|| anyhow!("missing command"))? {
        Commands::Execute(args) => execute(args),
        Commands::Check { config } => check(config.as_deref()),
        Commands::Capabilities { config } => capabilities(config.as_deref()),
    }
}

fn execute(args: ExecuteArgs) -> Result<ExitCode> {
    let mut config = SandboxConfig::load(args.config.as_deref())?;
    if let Some(ms) = args.cpu_ms {
        config.budget.cpu_time_limit_ms = ms;
    }
    if let Some(ms) = args.wall_ms {
        config.budget.wall_time_limit_ms = ms;
    }
    if let Some(mb) = args.mem_mb {
        config.budget.memory_limit_bytes = mb.saturating_mul(1024 * 1024);
    }
    if args.minimal {
        config.capabilities = Some(
            Capability::MINIMAL
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        );
    }

    let request = build_request(&args)?;
    let engine = Engine::new(config).context("failed to build engine")?;
    let result = engine.execute(&request);

    let rendered = if args.pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    println!("{}", rendered);

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn build_request(args: &ExecuteArgs) -> Result<ExecutionRequest> {
    let extra_tests = args
        .tests
        .iter()
        .map(|raw| parse_test(raw))
        .collect::<Result<Vec<_>>>()?;

    let mut request = match (&args.request, &args.source) {
        (Some(location), _) => {
            let text = read_input(location)?;
            serde_json::from_str::<ExecutionRequest>(&text)
                .with_context(|| format!("invalid request JSON in {}", location))?
        }
        (None, Some(location)) => ExecutionRequest::new(read_input(location)?, Vec::new()),
        (None, None) => bail!("one of --request or --source is required"),
    };
    request.tests.extend(extra_tests);
    Ok(request)
}

fn read_input(location: &str) -> Result<String> {
    if location == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(location).with_context(|| format!("failed to read {}", location))
}

fn parse_test(raw: &str) -> Result<TestCase> {
    let (expression, expected) = raw
        .rsplit_once('=')
        .ok_or_else(|| anyhow!("test '{}' is not of the form EXPR=EXPECTED", raw))?;
    let expression = expression.trim();
    if expression.is_empty() {
        bail!("test '{}' has an empty expression", raw);
    }
    Ok(TestCase::new(expression, expected))
}

fn check(config_path: Option<&Path>) -> Result<ExitCode> {
    let config = SandboxConfig::load(config_path)?;
    let validation = validate_config(&config);
    for warning in &validation.warnings {
        println!("warning: {}", warning);
    }
    for error in &validation.errors {
        println!("error: {}", error);
    }
    if !validation.is_valid() {
        println!("configuration: invalid");
        return Ok(ExitCode::FAILURE);
    }
    println!("configuration: ok");
    println!("worker: {}", config.resolve_worker_program()?.display());

    let engine = Engine::new(config)?;
    let smoke = ExecutionRequest::new(
        "answer = 6 * 7\nprint('smoke')\n",
        vec![TestCase::new("answer", "42")],
    );
    let result = engine.execute(&smoke);
    let healthy = result.is_success() && result.feedback == crate::engine::reporter::ALL_PASSED;
    if healthy {
        println!("smoke: ok");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("smoke: failed ({})", result.feedback);
        Ok(ExitCode::FAILURE)
    }
}

fn capabilities(config_path: Option<&Path>) -> Result<ExitCode> {
    let config = SandboxConfig::load(config_path)?;
    let granted = CapabilitySet::from_config(config.capabilities.as_deref())?;
    for capability in Capability::ALL {
        let mark = if granted.allows(capability) {
            "granted"
        } else {
            "-"
        };
        println!("{:<10} {}", mark, capability);
    }
    for name in WITHHELD {
        println!("{:<10} {}", "withheld", name);
    }
    Ok(ExitCode::SUCCESS)
}
