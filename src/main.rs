//! Heartbeat master entry point.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use cadence::adapters::{MemoryGraphStore, Neo4jGraphStore, ResilientStore};
use cadence::cli::{print_cycle_summary, print_task_list, Cli};
use cadence::domain::models::{AgentId, Config};
use cadence::domain::ports::GraphStore;
use cadence::infrastructure::http::AppState;
use cadence::infrastructure::{http, logging, ConfigLoader, GatewayClient, KeyDerivation,
    MessageSigner, MessageVerifier};
use cadence::services::{
    exit_code_for, register_builtin_tasks, BuiltinDeps, CancelToken, CycleRunner, Daemon,
    DelegationService, FailoverManager, InfraHeartbeatSidecar, MessageDispatcher, RegistryFilter,
    TaskRegistry,
};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("cadence: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<u8> {
    let cli = Cli::parse();
    let config = ConfigLoader::load().context("configuration")?;
    let _log_guard = logging::init(&config.logging).context("logging")?;
    let agent_filter = cli.agent_filter()?;

    // Listing the registry needs no live graph; everything else does. The
    // concrete resilient handle is kept so the daemon can drive its probe.
    let mut resilient: Option<Arc<ResilientStore<Neo4jGraphStore>>> = None;
    let graph: Arc<dyn GraphStore> = if cli.list_tasks && !(cli.cycle || cli.daemon || cli.setup) {
        Arc::new(MemoryGraphStore::new())
    } else {
        let inner = Neo4jGraphStore::connect(&config.graph)
            .await
            .context("graph connection")?;
        let store = Arc::new(ResilientStore::new(Arc::new(inner)));
        resilient = Some(store.clone());
        store
    };

    let wiring = Wiring::build(&config, graph.clone())?;
    register_builtin_tasks(&wiring.registry, &wiring.deps).await?;

    let shutdown = CancelToken::new();
    let runner = Arc::new(CycleRunner::new(
        graph.clone(),
        wiring.registry.clone(),
        config.cycle.clone(),
        shutdown.clone(),
    ));

    if cli.setup {
        graph.ensure_schema().await.context("graph schema")?;
        for agent in AgentId::ALL {
            let material = wiring.deps.key_derivation.key_for(agent);
            graph.upsert_agent_key(agent, &material).await?;
        }
        println!("setup complete: schema ensured, {} tasks registered", wiring.registry.len().await);
        return Ok(0);
    }

    if cli.list_tasks {
        let tasks = wiring
            .registry
            .list(RegistryFilter {
                agent: agent_filter,
                ..Default::default()
            })
            .await;
        print_task_list(&tasks);
        return Ok(0);
    }

    if cli.trigger_reflection {
        let result = runner.run_task_by_name("weekly_reflection").await?;
        println!("{}: {}", result.status.as_str(), result.summary);
        return Ok(u8::from(result.status.is_failure()) * 2);
    }

    if cli.cycle {
        let summary = runner.run_cycle(agent_filter).await?;
        print_cycle_summary(&summary, cli.json);
        return Ok(exit_code_for(&summary) as u8);
    }

    if cli.daemon {
        run_daemon(&config, graph, resilient, wiring, runner, shutdown).await?;
        return Ok(0);
    }

    // No command given: show usage.
    use clap::CommandFactory;
    Cli::command().print_help().ok();
    Ok(0)
}

struct Wiring {
    registry: Arc<TaskRegistry>,
    deps: BuiltinDeps,
    verifier: Arc<MessageVerifier>,
}

impl Wiring {
    fn build(config: &Config, graph: Arc<dyn GraphStore>) -> Result<Self> {
        let key_derivation = KeyDerivation::new(config.hmac_secret.as_bytes().to_vec());
        let signer = MessageSigner::new(&key_derivation, AgentId::Main);
        let dispatcher: Arc<dyn MessageDispatcher> = Arc::new(
            GatewayClient::new(&config.gateway, signer).context("gateway client")?,
        );
        let failover = Arc::new(FailoverManager::new(graph.clone()));
        let delegation = Arc::new(DelegationService::new(
            graph.clone(),
            dispatcher.clone(),
            failover.clone(),
        ));
        let verifier = Arc::new(MessageVerifier::new(key_derivation.clone(), graph.clone()));

        Ok(Self {
            registry: Arc::new(TaskRegistry::new()),
            deps: BuiltinDeps {
                failover,
                dispatcher,
                delegation,
                key_derivation,
            },
            verifier,
        })
    }
}

async fn run_daemon(
    config: &Config,
    graph: Arc<dyn GraphStore>,
    resilient: Option<Arc<ResilientStore<Neo4jGraphStore>>>,
    wiring: Wiring,
    runner: Arc<CycleRunner>,
    shutdown: CancelToken,
) -> Result<()> {
    let state = AppState {
        graph: graph.clone(),
        verifier: wiring.verifier.clone(),
        gateway_token: Arc::from(config.gateway.token.as_str()),
    };
    let http_cancel = shutdown.clone();
    let bind = config.http.bind.clone();
    let http_task = tokio::spawn(async move {
        if let Err(err) = http::serve(state, &bind, http_cancel).await {
            tracing::error!(error = %err, "http surface exited");
        }
    });

    let sidecar = InfraHeartbeatSidecar::new(graph.clone());
    let sidecar_cancel = shutdown.clone();
    let sidecar_task = tokio::spawn(async move { sidecar.run(sidecar_cancel).await });

    // Degraded-mode recovery probe.
    let probe_task = resilient.map(|store| {
        let cancel = shutdown.clone();
        tokio::spawn(async move { store.run_probe_loop(cancel).await })
    });

    let daemon = Daemon::new(runner, config.cycle.interval_minutes, shutdown.clone());
    tokio::select! {
        () = daemon.run(None) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("signal handler")?;
            tracing::info!("interrupt received; shutting down");
            shutdown.cancel();
        }
    }

    shutdown.cancel();
    let _ = sidecar_task.await;
    if let Some(probe) = probe_task {
        let _ = probe.await;
    }
    let _ = http_task.await;
    Ok(())
}
