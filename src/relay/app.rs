use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::relay::{
    bridge::BridgeOptions,
    config,
    control::ControlOptions,
    discovery::DiscoveryIndex,
    dispatch::{DispatchOptions, Dispatcher},
    logging, net,
    notifier::Notifier,
    server,
    session::SessionStore,
    telemetry,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt_guard = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let listen_addr = net::normalize_bind_addr(&cfg.listen_addr);
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr: {}", cfg.listen_addr))?;

    tracing::info!(
        config = %resolved.path.display(),
        listen_addr = %addr,
        client_to_target = cfg.bridge.client_to_target,
        close_on_host_disconnect = cfg.sessions.close_on_host_disconnect,
        sweep_interval = %humantime::format_duration(cfg.sweep_interval),
        "lanrelay: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(SessionStore::new()),
        Arc::new(DiscoveryIndex::new()),
        Arc::new(Notifier::new()),
        DispatchOptions {
            bridge: BridgeOptions {
                connect_timeout: cfg.bridge.connect_timeout,
                buffer_size: cfg.bridge.buffer_size,
            },
            client_to_target: cfg.bridge.client_to_target,
            max_frame_bytes: cfg.control.max_frame_bytes,
            close_on_host_disconnect: cfg.sessions.close_on_host_disconnect,
            session_idle_timeout: cfg.sessions.idle_timeout,
            discovery_ttl: cfg.discovery.ttl,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = JoinSet::new();

    {
        let state = server::AppState {
            dispatcher: dispatcher.clone(),
            prom: Some(prom.clone()),
            control: ControlOptions {
                outbound_queue: cfg.control.outbound_queue,
            },
            max_frame_bytes: cfg.control.max_frame_bytes,
            shutdown: shutdown_rx.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server::serve_with_shutdown(addr, state, shutdown).await });
    }

    {
        let dispatcher = dispatcher.clone();
        let interval = cfg.sweep_interval;
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            sweep_loop(dispatcher, interval, &mut shutdown).await;
            Ok(())
        });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async {
        while let Some(_res) = tasks.join_next().await {
            // Best-effort: tasks are expected to observe shutdown; ignore errors during teardown.
        }
    };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!("lanrelay: stopped");
    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn sweep_loop(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let report = dispatcher.sweep(telemetry::now_unix_ms());
                if report.sessions_expired > 0 || report.discovery_evicted > 0 {
                    tracing::info!(
                        sessions_expired = report.sessions_expired,
                        discovery_evicted = report.discovery_evicted,
                        sessions = dispatcher.sessions().len(),
                        connections = dispatcher.notifier().len(),
                        "sweep: done"
                    );
                }
            }
        }
    }
}
