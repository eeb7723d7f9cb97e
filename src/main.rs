use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;

use assessment_flow::api::{FlowEndpoints, HttpApiClient};
use assessment_flow::config::Config;
use assessment_flow::logging;
use assessment_flow::orchestrator::{FlowOrchestrator, FlowServices};
use assessment_flow::services::{push_heartbeat, HeartbeatIdentity, HeartbeatPayload};
use assessment_flow::store::{FileFlowCache, FlowCache, ProgressStore};
use assessment_flow::submodules::{PagedSubmodule, SubmoduleRegistry};
use assessment_flow::types::page_num;

#[derive(Parser)]
#[command(name = "flowctl")]
#[command(about = "Inspect and drive multi-step assessment flows")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a flow from the backend and show the step to display
    Load {
        flow_id: String,

        /// Treat these submodule ids as registered paged submodules
        #[arg(long = "paged", value_name = "SUBMODULE_ID")]
        paged: Vec<String>,
    },

    /// Show cached progress for a flow
    Status { flow_id: String },

    /// Clear cached definition and progress for a flow
    Reset { flow_id: String },

    /// Encode a step index and sub-page into a composite page number
    Encode { step_index: usize, page: String },

    /// Decode a composite page number
    Decode { token: String },

    /// Push one heartbeat built from cached progress
    Heartbeat {
        flow_id: String,

        #[arg(long)]
        exam_no: Option<String>,

        #[arg(long)]
        batch_code: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration first (needed for logging setup)
    let config = Config::load(cli.config.as_deref())?;
    let logging_handle = logging::init_logging(&config, cli.debug)?;

    let result = match cli.command {
        Commands::Load { flow_id, paged } => cmd_load(&config, &flow_id, &paged).await,
        Commands::Status { flow_id } => cmd_status(&config, &flow_id),
        Commands::Reset { flow_id } => cmd_reset(&config, &flow_id),
        Commands::Encode { step_index, page } => {
            println!("{}", page_num::encode(step_index, &page));
            Ok(())
        }
        Commands::Decode { token } => cmd_decode(&token),
        Commands::Heartbeat {
            flow_id,
            exam_no,
            batch_code,
        } => cmd_heartbeat(&config, &flow_id, exam_no, batch_code).await,
    };

    if let Some(log_path) = logging_handle.log_file_path {
        if log_path.metadata().is_ok_and(|m| m.len() > 0) {
            eprintln!("Session log: {}", log_path.display());
        }
    }

    result
}

fn file_cache(config: &Config) -> Arc<dyn FlowCache> {
    Arc::new(FileFlowCache::in_dir(&config.state_path()))
}

fn api_client(config: &Config) -> Result<Arc<HttpApiClient>> {
    let client = HttpApiClient::from_config(&config.api).context("Failed to build HTTP client")?;
    Ok(Arc::new(client))
}

async fn cmd_load(config: &Config, flow_id: &str, paged: &[String]) -> Result<()> {
    let registry = Arc::new(SubmoduleRegistry::new());
    for id in paged {
        registry
            .register(Arc::new(PagedSubmodule::new(id.clone(), id.clone())))
            .with_context(|| format!("Invalid submodule id {id:?}"))?;
    }

    let services = FlowServices::new(
        api_client(config)?,
        FlowEndpoints::from_config(&config.endpoints),
        registry,
        file_cache(config),
    );
    let orchestrator = FlowOrchestrator::new(flow_id, services);

    let loaded = orchestrator
        .load()
        .await
        .with_context(|| format!("Failed to load flow {flow_id}"))?;
    let resolved = orchestrator.resolve(&loaded.definition, &loaded.progress)?;

    let summary = json!({
        "flowId": loaded.definition.flow_id,
        "name": loaded.definition.name,
        "stepCount": loaded.definition.step_count(),
        "stepIndex": resolved.step_index,
        "submoduleId": resolved.submodule_id,
        "registered": resolved.has_submodule(),
        "modulePageNum": resolved.module_page_num,
        "initialPageId": resolved.initial_page_id,
        "completed": orchestrator.is_completed(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_status(config: &Config, flow_id: &str) -> Result<()> {
    let store = ProgressStore::new(flow_id, file_cache(config));

    let Some(progress) = store.load_progress() else {
        println!("No cached progress for {flow_id}");
        return Ok(());
    };

    let step_count = store.load_definition().map(|d| d.step_count());
    println!("Flow:      {flow_id}");
    match step_count {
        Some(count) => println!("Step:      {} of {count}", progress.step_index + 1),
        None => println!("Step:      {}", progress.step_index + 1),
    }
    println!(
        "Page:      {}",
        progress.module_page_num.as_deref().unwrap_or("-")
    );
    println!("Completed: {}", store.is_completed());
    Ok(())
}

fn cmd_reset(config: &Config, flow_id: &str) -> Result<()> {
    ProgressStore::new(flow_id, file_cache(config)).clear();
    println!("Cleared cached state for {flow_id}");
    Ok(())
}

fn cmd_decode(token: &str) -> Result<()> {
    let Some(composite) = page_num::decode(token) else {
        bail!("{token:?} is not a composite page number");
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&composite).context("Failed to serialize page number")?
    );
    Ok(())
}

async fn cmd_heartbeat(
    config: &Config,
    flow_id: &str,
    exam_no: Option<String>,
    batch_code: Option<String>,
) -> Result<()> {
    let store = ProgressStore::new(flow_id, file_cache(config));
    let Some(progress) = store.load_progress() else {
        bail!("No cached progress for {flow_id}; run `flowctl load {flow_id}` first");
    };

    let identity = HeartbeatIdentity {
        exam_no,
        batch_code,
    };
    let payload = HeartbeatPayload::new(flow_id, &progress, &identity);
    let path = FlowEndpoints::from_config(&config.endpoints).progress(flow_id);
    let api = api_client(config)?;

    push_heartbeat(api.as_ref(), &path, &payload)
        .await
        .with_context(|| format!("Heartbeat for {flow_id} failed"))?;
    println!(
        "Heartbeat sent: step {} page {}",
        payload.step_index, payload.module_page_num
    );
    Ok(())
}
