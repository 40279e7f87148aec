use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};

use blockflow_core::blocks::claude::ClaudeClient;
use blockflow_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use blockflow_core::executor::{EntryValues, FlowExecutor, FlowSession, UpstreamPolicy};
use blockflow_core::graph::FlowGraph;
use blockflow_core::logging;
use blockflow_core::registry::build_default_registry;
use blockflow_core::runner::LocalBlockRunner;
use blockflow_core::server::{app_router, app_state_with_config};
use blockflow_core::types::ScalarValue;

#[derive(Parser)]
#[command(
    name = "blockflow",
    about = "AI block marketplace and workflow engine",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(help = "Path to a flow JSON document ({nodes, edges})")]
    flow: PathBuf,

    #[arg(
        long = "entry",
        value_name = "NODE.KEY=VALUE",
        help = "Supply a manual entry value (repeatable)"
    )]
    entries: Vec<String>,

    #[arg(
        long,
        help = "Fail when a connected input has no cached upstream value"
    )]
    strict: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let _log_guard = logging::init(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );

    match cli.command {
        Some(Commands::Run(run)) => run_flow(run, resolved_data_dir).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(&data_dir);
    let config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let state = app_state_with_config(config, cfg_path, data_dir);
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting blockflow server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Accept both a bare `{nodes, edges}` document and a `{workflow: ...}`
/// envelope as written by exports.
fn unwrap_flow_document(value: serde_json::Value) -> serde_json::Value {
    if value.get("nodes").is_some() {
        return value;
    }
    if let Some(inner) = value.get("workflow").cloned() {
        if inner.get("nodes").is_some() {
            return inner;
        }
    }
    value
}

/// Parse repeated `--entry NODE.KEY=VALUE` arguments into the nested
/// entry-value map the executor expects.
fn parse_entry_args(raw_entries: &[String]) -> Result<EntryValues> {
    let mut values = EntryValues::new();

    for item in raw_entries {
        let (target, value) = item
            .split_once('=')
            .with_context(|| format!("invalid --entry '{item}' (expected NODE.KEY=VALUE)"))?;
        let (node_id, input_key) = target
            .split_once('.')
            .with_context(|| format!("invalid --entry target '{target}' (expected NODE.KEY)"))?;

        if node_id.is_empty() || input_key.is_empty() {
            bail!("invalid --entry target '{target}' (expected NODE.KEY)");
        }

        values
            .entry(node_id.to_string())
            .or_insert_with(HashMap::new)
            .insert(input_key.to_string(), value.to_string());
    }

    Ok(values)
}

fn format_scalar(value: &ScalarValue) -> String {
    match value {
        ScalarValue::Str(v) => format!("\"{v}\""),
        ScalarValue::Number(_) | ScalarValue::Bool(_) => value.to_text(),
    }
}

async fn run_flow(args: RunArgs, data_dir: PathBuf) -> Result<()> {
    if !args.flow.exists() {
        bail!("Flow file does not exist: {}", args.flow.display());
    }

    info!("Loading flow: {}", args.flow.display());
    let json_str = std::fs::read_to_string(&args.flow)
        .with_context(|| format!("Failed to read flow file: {}", args.flow.display()))?;
    let document: serde_json::Value = serde_json::from_str(&json_str)
        .with_context(|| format!("Failed to parse flow JSON: {}", args.flow.display()))?;
    let document = unwrap_flow_document(document);

    let graph: FlowGraph = serde_json::from_value(document)
        .with_context(|| format!("Failed to parse flow JSON: {}", args.flow.display()))?;

    let registry = build_default_registry();
    graph.validate(&registry).context("Flow validation failed")?;

    let config = AppConfig::load_from_path(&config_path(&data_dir)).unwrap_or_else(|err| {
        warn!(error = %err, "Failed to load config file, using defaults");
        AppConfig::default()
    });

    let policy = if args.strict || config.execution.strict_upstream {
        UpstreamPolicy::Strict
    } else {
        UpstreamPolicy::Permissive
    };

    let executor = FlowExecutor::with_policy(&registry, policy);
    let plan = executor.plan(&graph).context("Flow planning failed")?;
    if plan.order.is_empty() {
        info!("Nothing to run");
        return Ok(());
    }

    let entry_values = parse_entry_args(&args.entries)?;

    let missing: Vec<String> = plan
        .entry_inputs
        .iter()
        .filter(|field| field.required)
        .filter(|field| {
            entry_values
                .get(&field.node_id)
                .and_then(|values| values.get(&field.input_key))
                .map(|value| value.trim().is_empty())
                .unwrap_or(true)
        })
        .map(|field| format!("--entry {}.{}=VALUE ({})", field.node_id, field.input_key, field.label))
        .collect();
    if !missing.is_empty() {
        bail!(
            "Missing required entry inputs:\n  {}",
            missing.join("\n  ")
        );
    }

    let runner = LocalBlockRunner::new(ClaudeClient::from_config(&config.ai));
    let mut session = FlowSession::new();

    info!("Executing flow...");
    let report = executor
        .run(&mut session, &graph, &runner, &entry_values)
        .await
        .context("Flow execution failed")?;

    if let Some(failure) = report.failure {
        bail!("Run failed at '{}': {}", failure.node_label, failure.error);
    }

    info!("Flow completed successfully");
    let mut node_ids: Vec<&String> = session.cache().snapshot().keys().collect();
    node_ids.sort();
    for node_id in node_ids {
        if let Some(outputs) = session.cache().node_outputs(node_id) {
            let mut keys: Vec<&String> = outputs.keys().collect();
            keys.sort();
            for key in keys {
                info!("  {}:{} = {}", node_id, key, format_scalar(&outputs[key]));
            }
        }
    }

    Ok(())
}
