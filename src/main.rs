use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;

use layer4_lb::common::error::{LbError, Result as LbResult};
use layer4_lb::config::Config;
use layer4_lb::core::backend::Backend;
use layer4_lb::core::relay::RelayHandler;
use layer4_lb::core::resolver::Resolver;
use layer4_lb::metrics;
use layer4_lb::net::pool::TcpConnectionPool;
use layer4_lb::net::{edge, health};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "lb.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config).context("failed to load configuration")?;
    init_logging(config.log.as_ref().map(|l| l.level.as_str()));
    info!(
        "loaded configuration: {} backends, listening on {}",
        config.backends.len(),
        config.listen
    );

    let backends: Vec<Backend> = config.backends.iter().map(|b| Backend::new(b.host.clone(), b.port)).collect();
    let assignment_path = config.assignment_path.clone().map(PathBuf::from);
    let resolver = Resolver::new(backends, assignment_path, config.rebalance.clone());

    // The background timers driving rebalancing and persistence (spec §4.4,
    // §5). None of these can kill the process; each catches and logs its own
    // failures.
    let _background = resolver.spawn_background_tasks();

    if let Some(hc_config) = &config.health_check {
        for backend in resolver.server_index() {
            health::start_health_check(backend.clone(), hc_config.clone());
        }
    }

    let pool = Arc::new(TcpConnectionPool::new());
    let handler = Arc::new(RelayHandler::new(resolver.clone(), pool));

    if let Some(metrics_addr) = &config.metrics_listen {
        spawn_metrics_endpoint(metrics_addr.clone());
    }

    let listener = edge::bind(&config.listen).await.with_context(|| format!("failed to bind {}", config.listen))?;
    edge::serve(listener, handler).await;

    Ok(())
}

/// Initializes `env_logger`, honoring `log.level` from the config file when
/// present and otherwise deferring to `RUST_LOG` / the crate default.
fn init_logging(level: Option<&str>) {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(level) = level {
        builder.parse_filters(level);
    }
    builder.init();
}

/// Loads and validates the configuration, propagating failures through the
/// crate's own `thiserror` error type (spec §7's one legitimate fatal path:
/// there is nothing sensible to run without configuration). `main` adds
/// `anyhow` context at the call site, exactly where the teacher does.
fn load_config(path: &PathBuf) -> LbResult<Config> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&content)?;
    config.validate().map_err(|e| LbError::Config(e.to_string()))?;
    Ok(config)
}

/// Serves the Prometheus text endpoint (spec §4.9), mirroring the teacher's
/// own `metrics_handler` wiring. Failure to bind is logged, not fatal — the
/// resolver and relay run fine without it.
fn spawn_metrics_endpoint(addr: String) {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("failed to bind metrics endpoint on {}: {}", addr, e);
                return;
            }
        };
        info!("serving metrics on {}", addr);

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("metrics endpoint accept error: {}", e);
                    continue;
                }
            };
            tokio::spawn(async move {
                let io = hyper_util::rt::TokioIo::new(stream);
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, hyper::service::service_fn(metrics::metrics_handler))
                    .await
                {
                    log::debug!("metrics connection error: {}", e);
                }
            });
        }
    });
}
