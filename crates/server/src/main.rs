//! Thin binary wiring: load `GEODB_*` configuration, open the substrate, start
//! the background writer, compaction task and RPC listener. Transport wiring
//! (length-delimited framing, JSON-over-tarpc) is grounded on
//! `spatio-server::transport::rpc::run_server`.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::prelude::*;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Json;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use geodb_core::{Config, EventBus, GeocodingCache, GeofenceEvaluator, NullProvider, ObjectBus, ObjectStore, Substrate};
use geodb_server::handler::Handler;
use geodb_server::protocol::GeodbService;
use geodb_server::writer::spawn_background_writer;

const WRITE_QUEUE_DEPTH: usize = 256;
const GEOFENCE_WORKER_POOL: usize = 8;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();
    if let Err(e) = config.validate() {
        log::error!("geodb: invalid configuration: {e}");
        std::process::exit(1);
    }

    log::info!("geodb: opening substrate at {}", config.path);
    let substrate = Arc::new(Substrate::open(&config.path).expect("failed to open substrate"));
    let store = Arc::new(ObjectStore::new(substrate.clone()));
    let object_bus = Arc::new(ObjectBus::new(geodb_core::DEFAULT_QUEUE_DEPTH));
    let event_bus = Arc::new(EventBus::new(geodb_core::DEFAULT_QUEUE_DEPTH));

    let cache = if config.gmaps_key.is_some() {
        log::warn!("geodb: GEODB_GMAPS_KEY is set, but this build wires no real Maps provider; geocoding features remain disabled");
        None
    } else {
        log::info!("geodb: GEODB_GMAPS_KEY unset; geocoding cache falls back to a null provider");
        Some(Arc::new(GeocodingCache::new(
            substrate.clone(),
            Arc::new(NullProvider),
            config.gmaps_cache_duration().as_secs(),
        )))
    };

    let mut evaluator = GeofenceEvaluator::new(store.clone(), event_bus.clone(), GEOFENCE_WORKER_POOL);
    if let Some(cache) = &cache {
        evaluator = evaluator.with_cache(cache.clone());
    }
    let evaluator = Arc::new(evaluator);

    let write_tx = spawn_background_writer(store.clone(), object_bus.clone(), evaluator, WRITE_QUEUE_DEPTH);

    spawn_compaction_task(substrate.clone(), config.gc_interval());

    let handler = Handler::new(store, write_tx, object_bus, event_bus, cache);

    let addr: SocketAddr = parse_listen_addr(&config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("geodb: RPC listener bound on {}", listener.local_addr()?);

    let shutdown = async {
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl_c");
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((socket, _)) => {
                        let server = handler.clone();
                        tokio::spawn(async move {
                            let framed = Framed::new(socket, LengthDelimitedCodec::new());
                            let transport = tarpc::serde_transport::new(framed, Json::default());
                            server::BaseChannel::with_defaults(transport)
                                .execute(server.serve())
                                .for_each(|response| async move {
                                    tokio::spawn(response);
                                })
                                .await;
                        });
                    }
                    Err(e) => log::error!("geodb: accept error: {e}"),
                }
            }
            _ = &mut shutdown => {
                log::info!("geodb: shutdown signal received, stopping server");
                break;
            }
        }
    }

    Ok(())
}

/// `GEODB_PORT` follows the original source's `:8080` convention (a bare
/// port with a leading colon, meaning "bind all interfaces").
fn parse_listen_addr(port: &str) -> SocketAddr {
    let port = port.trim_start_matches(':');
    format!("0.0.0.0:{port}")
        .parse()
        .unwrap_or_else(|_| "0.0.0.0:8080".parse().unwrap())
}

fn spawn_compaction_task(substrate: Arc<Substrate>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = geodb_core::store::now_unix();
            match substrate.evict_expired(now) {
                Ok(n) if n > 0 => log::info!("geodb: evicted {n} expired entries"),
                Ok(_) => {}
                Err(e) => log::error!("geodb: eviction failed: {e}"),
            }
            if let Err(e) = substrate.run_gc(0.5) {
                log::error!("geodb: compaction failed: {e}");
            }
        }
    });
}
