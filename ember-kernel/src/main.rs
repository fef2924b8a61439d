/**
 * EMBER KERNEL - Point d'entrée principal du control plane Emberpanel
 *
 * RÔLE : Orchestration de tous les modules : config, stores persistants,
 * registry Docker, collecteur de stats, streamer console, API HTTP/WS.
 *
 * ARCHITECTURE : Un kernel central qui pilote des daemons Docker (local +
 * nodes distants) hébergeant des serveurs de jeu conteneurisés.
 * UTILITÉ : Point d'administration unique du parc de serveurs de jeu.
 */

mod config;
mod docker;
mod error;
mod http;
mod lifecycle;
mod models;
mod state;
mod stats;
mod storage;
mod streamer;
mod ws;

use crate::config::{load_config, KernelConfig};
use crate::docker::DockerRegistry;
use crate::http::AppState;
use crate::lifecycle::LifecycleController;
use crate::models::{NodeStatsMap, ServerStatsMap};
use crate::state::{new_state, Shared};
use crate::stats::StatsCollector;
use crate::storage::{NodeStore, ServerStore, SharedNodeStore, SharedServerStore};
use crate::streamer::LogStreamer;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok(); // Ok si .env n'existe pas

    let cfg_loaded: KernelConfig = load_config().await;
    let cfg: Shared<KernelConfig> = new_state(cfg_loaded.clone());

    std::fs::create_dir_all(&cfg_loaded.data_dir).unwrap_or_else(|e| {
        eprintln!("[kernel] warning: failed to create data dir: {}", e);
    });

    // stores persistants (JSON sur disque)
    let servers: SharedServerStore = Arc::new(ServerStore::new(&format!(
        "{}/servers.json",
        cfg_loaded.data_dir
    )));
    if let Err(e) = servers.load().await {
        eprintln!("[kernel] failed to load servers: {}", e);
    }
    let nodes: SharedNodeStore =
        Arc::new(NodeStore::new(&format!("{}/nodes.json", cfg_loaded.data_dir)));
    if let Err(e) = nodes.load().await {
        eprintln!("[kernel] failed to load nodes: {}", e);
    }

    // registry des clients Docker (node local + distants) ; les clients
    // sont créés paresseusement, un socket local absent n'empêche pas de
    // piloter des nodes distants
    let docker = Arc::new(DockerRegistry::new(cfg_loaded.docker.clone()));

    // caches de stats partagés avec l'API
    let server_stats = new_state::<ServerStatsMap>(HashMap::new());
    let node_stats = new_state::<NodeStatsMap>(HashMap::new());

    let stats = Arc::new(StatsCollector::new(
        docker.clone(),
        servers.clone(),
        nodes.clone(),
        server_stats,
        node_stats,
    ));
    stats::spawn_stats_collector(stats.clone(), cfg_loaded.stats_interval_secs);

    // probe périodique des nodes (online/offline persistés)
    docker::spawn_node_monitor(docker.clone(), nodes.clone(), cfg_loaded.node_check_interval_secs);

    let streamer = Arc::new(LogStreamer::new(
        docker.clone(),
        servers.clone(),
        nodes.clone(),
        Duration::from_secs(cfg_loaded.command_timeout_secs),
    ));

    let lifecycle = Arc::new(LifecycleController::new(
        docker.clone(),
        servers.clone(),
        nodes.clone(),
        streamer.clone(),
        stats.clone(),
    ));

    // fabrique l'état unique pour Axum
    let app_state = AppState { cfg, servers, nodes, docker, stats, streamer, lifecycle };

    // HTTP + WebSocket
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg_loaded.http_port));
    println!("[kernel] listening on http://{addr}");
    let listener = TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
