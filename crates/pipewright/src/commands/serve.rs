//! Serve command - runs the engine service.
//!
//! Wires storage, SLA calendar, delegations, the function bus and the HTTP
//! API, then runs until Ctrl+C. Parked inbox messages are replayed before
//! any consumer starts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::Args;
use pipewright_bus::{
    ConsumerGate, ConsumerPool, FUNCTION_RESULT_PREFIX, HealthProber, HttpPinger, Inbox,
    MemoryTransport, RUN_TASK_PREFIX, Relay, StorePinger, Topics, Transport,
};
use pipewright_config::{KafkaConfig, PipewrightConfig};
use pipewright_delegation::{DelegationResolver, HttpDelegationSource};
use pipewright_engine::{Engine, EngineOptions, FunctionReplyHandler, RunTaskHandler, Services};
use pipewright_server::{Server, ServerConfig};
use pipewright_sla::{CalendarSource, HttpCalendarSource, SlaService};
use pipewright_store::Store;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Context;

/// Deadlines delivered per sweep round.
const SLA_SWEEP_BATCH: u32 = 500;

/// Stalled tasks restarted per sweep round.
const RETRY_BATCH: usize = 100;

/// Arguments for the serve command.
///
/// CLI arguments override config file values.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind the HTTP API to (overrides config)
    #[arg(short, long)]
    pub bind: Option<String>,
}

pub async fn run(args: ServeArgs, ctx: &Context) -> Result<()> {
    let config = &ctx.loaded.config;

    let mut http = config.http.clone();
    if let Some(bind) = args.bind {
        http.addr = bind;
    }
    let server_config = ServerConfig::from_http(&http)?;

    // ── Storage ─────────────────────────────────────────────────────────
    let storage_path = ctx.storage_path();
    let store = Arc::new(
        Store::open_pooled(&storage_path, config.storage.pool_size)
            .with_context(|| format!("failed to open {}", storage_path.display()))?,
    );

    // ── SLA calendar ────────────────────────────────────────────────────
    let integration_timeout = Duration::from_secs(config.integrations.timeout_secs.max(1));
    let calendar_source: Option<Arc<dyn CalendarSource>> = match &config.integrations.calendar_url {
        Some(url) => Some(Arc::new(HttpCalendarSource::new(url.as_str(), integration_timeout)?)),
        None => None,
    };
    let sla = Arc::new(SlaService::new(calendar_source));
    if let Err(e) = sla.refresh(Utc::now().date_naive()).await {
        warn!(error = %e, "starting without a production calendar");
    }

    // ── Bus ─────────────────────────────────────────────────────────────
    let topics = topics_of(&config.kafka);
    let transport = build_transport(config)?;
    let relay = Relay::new(store.clone(), transport.clone())
        .with_interval(Duration::from_millis(config.kafka.resend_delay_ms.max(10)));

    // ── Engine ──────────────────────────────────────────────────────────
    let options = EngineOptions {
        max_recursion_depth: config.engine.max_recursion_depth,
        expose_placeholder: config.engine.expose_placeholder,
        topics: topics.clone(),
    };
    // Resuming a task wakes the function pool so deferred replies apply.
    let inbox_wake = Arc::new(Notify::new());
    let mut engine = Engine::new(store.clone(), Services::basic().with_sla(sla.clone()))
        .with_options(options)
        .with_relay_waker(relay.waker())
        .with_inbox_waker(inbox_wake.clone());
    if let Some(url) = &config.integrations.delegations_url {
        let source = Arc::new(HttpDelegationSource::new(url.as_str(), integration_timeout)?);
        let ttl = Duration::from_secs(config.cache.delegations_ttl_secs);
        engine = engine.with_delegations(Arc::new(DelegationResolver::new(
            source,
            Some(ttl),
            config.cache.delegations_capacity,
        )));
    }
    let engine = Arc::new(engine);

    // ── Consumers ───────────────────────────────────────────────────────
    let gate = ConsumerGate::new();
    let inbox = Inbox::new(store.clone());
    let function_pool = ConsumerPool::new(
        "function-result",
        FUNCTION_RESULT_PREFIX,
        inbox.clone(),
        Arc::new(FunctionReplyHandler::new(engine.clone())),
    )
    .with_workers(config.kafka.function_workers)
    .with_gate(gate.clone())
    .with_waker(inbox_wake);
    let run_task_pool = ConsumerPool::new(
        "run-task",
        RUN_TASK_PREFIX,
        inbox,
        Arc::new(RunTaskHandler::new(engine.clone())),
    )
    .with_workers(config.kafka.run_task_workers)
    .with_gate(gate.clone());

    let replayed = function_pool.recover().await? + run_task_pool.recover().await?;
    if replayed > 0 {
        info!(replayed, "replayed parked messages");
    }

    let function_sub = transport.subscribe(&[topics.function_in.clone()]).await?;
    let run_task_sub = transport.subscribe(&[topics.run_task.clone()]).await?;

    // ── Health prober ───────────────────────────────────────────────────
    let ping = &config.services_ping;
    let mut prober = HealthProber::new(
        gate,
        Duration::from_secs(ping.interval_secs),
        ping.max_failed,
        ping.max_ok,
    )
    .with_pinger(Arc::new(StorePinger(store.clone())));
    for (name, url) in [
        ("calendar", &config.integrations.calendar_url),
        ("delegations", &config.integrations.delegations_url),
    ] {
        if let Some(url) = url {
            prober = prober.with_pinger(Arc::new(HttpPinger::new(
                name,
                url.as_str(),
                integration_timeout,
            )?));
        }
    }

    // ── Background work ─────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let mut workers: Vec<JoinHandle<()>> = vec![
        tokio::spawn(relay.run(cancel.clone())),
        tokio::spawn(function_pool.run(function_sub, cancel.clone())),
        tokio::spawn(run_task_pool.run(run_task_sub, cancel.clone())),
        tokio::spawn(prober.run(cancel.clone())),
    ];
    if let Some(addr) = config.metrics_socket()? {
        let health = Server::new(engine.clone(), server_config.clone());
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            if let Err(e) = health.run_health(addr, cancel).await {
                warn!(error = %e, "health listener stopped");
            }
        }));
    }
    workers.push(tokio::spawn(sweep_loop(
        engine.clone(),
        sla,
        config.clone(),
        cancel.clone(),
    )));

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("shutdown requested");
            cancel.cancel();
        }
    });

    if ctx.verbose {
        println!(
            "Storage: {}\nConfig: {}",
            storage_path.display(),
            ctx.loaded
                .source
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(defaults)".to_string())
        );
    }
    println!("pipewright listening on http://{}", server_config.bind_address);
    println!("Press Ctrl+C to stop");

    let served = Server::new(engine, server_config).run(cancel.clone()).await;

    // ── Graceful shutdown ───────────────────────────────────────────────
    cancel.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "background worker panicked");
        }
    }
    served?;
    info!("pipewright stopped");
    Ok(())
}

fn topics_of(kafka: &KafkaConfig) -> Topics {
    Topics {
        function_out: kafka.function_out_topic.clone(),
        function_in: kafka.function_in_topic.clone(),
        run_task: kafka.run_task_topic.clone(),
        sd_events: kafka.sd_events_topic.clone(),
    }
}

/// Kafka when brokers are configured, otherwise the in-process transport.
fn build_transport(config: &PipewrightConfig) -> Result<Arc<dyn Transport>> {
    if config.kafka.brokers.is_empty() {
        info!("no kafka brokers configured, using in-process bus");
        return Ok(Arc::new(MemoryTransport::new()));
    }
    kafka_transport(&config.kafka)
}

#[cfg(feature = "kafka")]
fn kafka_transport(kafka: &KafkaConfig) -> Result<Arc<dyn Transport>> {
    let transport = pipewright_bus::KafkaTransport::new(&kafka.brokers, &kafka.consumer_group)?;
    info!(brokers = ?kafka.brokers, group = %kafka.consumer_group, "kafka bus");
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "kafka"))]
fn kafka_transport(_kafka: &KafkaConfig) -> Result<Arc<dyn Transport>> {
    anyhow::bail!("kafka brokers are configured but pipewright was built without the `kafka` feature")
}

/// Deliver due SLA deadlines, restart stalled tasks and refresh the
/// calendar once a day.
async fn sweep_loop(
    engine: Arc<Engine>,
    sla: Arc<SlaService>,
    config: PipewrightConfig,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(config.engine.sla_sweep_interval_secs.max(1));
    let min_lifetime = chrono::Duration::seconds(config.task_retry.min_lifetime_secs as i64);
    let max_lifetime = chrono::Duration::seconds(config.task_retry.max_lifetime_secs as i64);
    let mut calendar_day = Utc::now().date_naive();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match engine.sla_sweep(SLA_SWEEP_BATCH).await {
            Ok(fired) if fired > 0 => info!(fired, "sla deadlines delivered"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "sla sweep failed"),
        }

        match engine
            .retry_stalled_tasks(min_lifetime, max_lifetime, RETRY_BATCH)
            .await
        {
            Ok(started) if started > 0 => info!(started, "stalled tasks restarted"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "stalled task retry failed"),
        }

        let today = Utc::now().date_naive();
        if today != calendar_day && sla.refresh(today).await.is_ok() {
            debug!(%today, "calendar refreshed");
            calendar_day = today;
        }
    }
    debug!("sweep loop stopped");
}
