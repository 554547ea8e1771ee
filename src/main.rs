//! `kernel-agent` - recover and supervise the kernels on this node.
//!
//! - `recover`: rebuild the registry from scratch storage and the container
//!   engine, print a summary, and exit.
//! - `serve`: recover, then persist the registry periodically until Ctrl-C,
//!   save once more and close every kernel.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use kernel_agent::backends::{BackendContext, BackendRestorer, DockerCli, EngineEnumerator};
use kernel_agent::events::TracingEventProducer;
use kernel_agent::kernel::{
    KernelRegistry, KernelRegistryLoader, KernelRegistryWriter, RegistryPersistence, SaveMetadata,
};
use kernel_agent::repl::TcpReplTransport;
use kernel_agent::scratch::ScratchStore;
use kernel_agent::types::AgentId;
use kernel_agent::Config;

#[derive(Parser)]
#[command(name = "kernel-agent", version, about = "Compute-node kernel agent")]
struct Args {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(short, long, env = "KERNEL_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Container engine CLI.
    #[arg(long, default_value = "docker")]
    docker: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load the registry and print what was recovered.
    Recover,
    /// Load the registry and keep it persisted until interrupted.
    Serve,
}

async fn load(args: &Args, config: Arc<Config>) -> kernel_agent::Result<KernelRegistry> {
    let events = Arc::new(TracingEventProducer);
    let engine = Arc::new(DockerCli::new(args.docker.clone()));
    let ctx = BackendContext::new(config.clone(), Arc::new(TcpReplTransport::default()), events.clone());
    let loader = KernelRegistryLoader::new(
        ScratchStore::new(&config.container.scratch_root),
        Arc::new(EngineEnumerator::new(engine.clone())),
        Arc::new(BackendRestorer::new(ctx, engine)),
        events,
    );
    loader.load_kernel_registry().await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    }
    .apply_env_overrides();
    kernel_agent::observability::init_tracing(&config.logging);
    let config = Arc::new(config);

    let registry = load(&args, config.clone()).await?;

    match args.command {
        Command::Recover => {
            for kernel_id in registry.ids().await {
                if let Some(kernel) = registry.get(&kernel_id).await {
                    println!("{}\t{}\t{:?}", kernel_id, kernel.backend().as_str(), kernel.state());
                }
            }
            println!("recovered {} kernel(s)", registry.len().await);
        }
        Command::Serve => {
            let agent_id = AgentId::from_string(config.agent.agent_id.clone())?;
            let mut persistence = RegistryPersistence::new(
                registry.clone(),
                KernelRegistryWriter::new(ScratchStore::new(&config.container.scratch_root)),
                SaveMetadata { agent_id },
                config.agent.registry_save_interval,
            );
            persistence.start();
            tracing::info!(
                "agent_serving: kernels={} save_interval={:?}",
                registry.len().await,
                config.agent.registry_save_interval
            );

            tokio::signal::ctrl_c().await?;
            tracing::info!("agent_shutdown_requested");

            persistence.stop().await;
            registry.close_all().await;
        }
    }

    Ok(())
}
