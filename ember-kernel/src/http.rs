/**
 * API REST EMBERPANEL - Serveur HTTP principal du kernel
 *
 * RÔLE :
 * Expose l'API REST sécurisée du panel : CRUD nodes/serveurs, actions de
 * cycle de vie, lecture des stats en cache et upgrade WebSocket console.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth x-api-key
 * - Routes organisées : /health, /nodes, /servers, /stats, /ws
 * - Réponses d'action au format { ok, msg }
 * - Codes HTTP portés par ControlError::status_code()
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - EMBER_API_KEY = clé maître (accès total), sinon clés opérateur de la
 *   config avec liste blanche de serveurs
 * - Un serveur hors liste blanche répond 404, jamais 403 : un opérateur
 *   ne peut pas sonder l'existence des serveurs des autres
 */

use crate::config::{KernelConfig, OperatorConf};
use crate::docker::SharedDockerRegistry;
use crate::error::ControlError;
use crate::lifecycle::LifecycleController;
use crate::models::{
    Actor, CommandIn, NewNode, NewServer, Node, NodeStats, NodeStatsMap, NodeStatus, Server,
    ServerStats, ServerStatsMap, ServerStatus,
};
use crate::state::Shared;
use crate::stats::StatsCollector;
use crate::storage::{SharedNodeStore, SharedServerStore};
use crate::streamer::SharedLogStreamer;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Shared<KernelConfig>,
    pub servers: SharedServerStore,
    pub nodes: SharedNodeStore,
    pub docker: SharedDockerRegistry,
    pub stats: Arc<StatsCollector>,
    pub streamer: SharedLogStreamer,
    pub lifecycle: Arc<LifecycleController>,
}

/// Résout l'acteur associé à une clé API. Clé maître d'abord, puis les
/// clés opérateur déclarées en config.
fn resolve_actor(master: Option<&str>, operators: &[OperatorConf], key: &str) -> Option<Actor> {
    if let Some(master) = master {
        if !master.is_empty() && key == master {
            return Some(Actor { name: "root".to_string(), allowed_servers: None });
        }
    }
    operators.iter().find(|op| op.key == key).map(|op| Actor {
        name: op.name.clone(),
        allowed_servers: op.allowed_servers.clone(),
    })
}

async fn require_api_key(
    State(app): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path.starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let master = std::env::var("EMBER_API_KEY").unwrap_or_default();
    let operators = app.cfg.lock().operators.clone();
    if master.is_empty() && operators.is_empty() {
        eprintln!("SECURITY: no EMBER_API_KEY and no operators configured - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match resolve_actor(Some(&master), &operators, provided) {
        Some(actor) => {
            req.extensions_mut().insert(actor);
            Ok(next.run(req).await)
        }
        None => Err(StatusCode::UNAUTHORIZED),
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/nodes", get(get_nodes).post(create_node))
        .route("/nodes/check", post(check_all_nodes))
        .route("/nodes/{id}", delete(delete_node))
        .route("/nodes/{id}/check", post(check_node))
        .route("/nodes/{id}/stats", get(get_node_stats))
        .route("/servers", get(get_servers).post(create_server))
        .route("/servers/{id}", delete(delete_server))
        .route("/servers/{id}/start", post(start_server))
        .route("/servers/{id}/stop", post(stop_server))
        .route("/servers/{id}/restart", post(restart_server))
        .route("/servers/{id}/command", post(send_command))
        .route("/servers/{id}/stats", get(get_server_stats))
        .route("/stats", get(get_all_stats))
        .route("/ws", get(crate::ws::ws_handler))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

fn action_ok(msg: &str) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({ "ok": true, "msg": msg })))
}

fn action_err(e: ControlError) -> (StatusCode, Json<serde_json::Value>) {
    (e.status_code(), Json(json!({ "ok": false, "msg": e.to_string() })))
}

// GET /nodes (liste)
async fn get_nodes(State(app): State<AppState>) -> Json<Vec<Node>> {
    Json(app.nodes.list().await)
}

// POST /nodes (enregistrement, probé ensuite par le monitor)
async fn create_node(
    State(app): State<AppState>,
    Json(body): Json<NewNode>,
) -> (StatusCode, Json<Node>) {
    let node = Node {
        id: Uuid::new_v4().to_string(),
        name: body.name,
        ip: body.ip,
        port: body.port,
        status: NodeStatus::Offline,
        cpu_cores: body.cpu_cores,
        ram_total: body.ram_total,
        disk_total: body.disk_total,
        created_at: OffsetDateTime::now_utc(),
    };
    app.nodes.insert(node.clone()).await;
    println!("[http] node {} registered ({}:{})", node.name, node.ip, node.port);
    (StatusCode::CREATED, Json(node))
}

// DELETE /nodes/{id}
async fn delete_node(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    // refusé tant que des serveurs y sont encore assignés
    let in_use = app.servers.list().await.iter().any(|s| s.node_id == id);
    if in_use {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "ok": false, "msg": "node still has servers assigned" })),
        );
    }
    match app.nodes.delete(&id).await {
        Some(_) => {
            app.docker.remove_connection(&id);
            app.stats.forget_node(&id);
            action_ok("node deleted")
        }
        None => action_err(ControlError::NodeNotFound),
    }
}

// POST /nodes/{id}/check (probe unitaire)
async fn check_node(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(node) = app.nodes.get(&id).await else {
        return action_err(ControlError::NodeNotFound);
    };
    let online = app.docker.check_connection(&node).await;
    let status = if online { NodeStatus::Online } else { NodeStatus::Offline };
    app.nodes.update(&id, |n| n.status = status).await;
    (StatusCode::OK, Json(json!({ "ok": true, "online": online })))
}

// POST /nodes/check (probe de tous les nodes, persiste les statuts)
async fn check_all_nodes(State(app): State<AppState>) -> Json<HashMap<String, bool>> {
    let nodes = app.nodes.list().await;
    let results = app.docker.check_all(&nodes).await;
    for (node_id, online) in &results {
        let status = if *online { NodeStatus::Online } else { NodeStatus::Offline };
        app.nodes.update(node_id, |n| n.status = status).await;
    }
    Json(results)
}

// GET /nodes/{id}/stats (dernier snapshot en cache)
async fn get_node_stats(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NodeStats>, StatusCode> {
    let stats = app.stats.node_stats.lock();
    match stats.get(&id) {
        Some(s) => Ok(Json(s.clone())),
        None => Err(StatusCode::NOT_FOUND),
    }
}

// GET /servers (liste restreinte à ce que l'acteur a le droit de voir)
async fn get_servers(
    State(app): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Json<Vec<Server>> {
    let list = app
        .servers
        .list()
        .await
        .into_iter()
        .filter(|s| actor.can_access(&s.id))
        .collect();
    Json(list)
}

// POST /servers (enregistrement, conteneur créé au premier start)
async fn create_server(
    State(app): State<AppState>,
    Json(body): Json<NewServer>,
) -> Result<(StatusCode, Json<Server>), (StatusCode, Json<serde_json::Value>)> {
    if app.nodes.get(&body.node_id).await.is_none() {
        return Err(action_err(ControlError::NodeNotFound));
    }
    let server = Server {
        id: Uuid::new_v4().to_string(),
        name: body.name,
        game_type: body.game_type,
        node_id: body.node_id,
        container_id: None,
        status: ServerStatus::Stopped,
        cpu_limit: body.cpu_limit,
        ram_limit: body.ram_limit,
        disk_limit: body.disk_limit,
        port: body.port,
        created_at: OffsetDateTime::now_utc(),
    };
    app.servers.insert(server.clone()).await;
    println!("[http] server {} created ({} on node {})", server.name, server.game_type, server.node_id);
    Ok((StatusCode::CREATED, Json(server)))
}

// DELETE /servers/{id}
async fn delete_server(
    State(app): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    if !actor.can_access(&id) {
        return action_err(ControlError::ServerNotFound);
    }
    match app.lifecycle.delete(&id).await {
        Ok(()) => action_ok("server deleted"),
        Err(e) => action_err(e),
    }
}

// POST /servers/{id}/start
async fn start_server(
    State(app): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    if !actor.can_access(&id) {
        return action_err(ControlError::ServerNotFound);
    }
    match app.lifecycle.start(&id).await {
        Ok(()) => action_ok("server started"),
        Err(e) => action_err(e),
    }
}

// POST /servers/{id}/stop
async fn stop_server(
    State(app): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    if !actor.can_access(&id) {
        return action_err(ControlError::ServerNotFound);
    }
    match app.lifecycle.stop(&id).await {
        Ok(()) => action_ok("server stopped"),
        Err(e) => action_err(e),
    }
}

// POST /servers/{id}/restart
async fn restart_server(
    State(app): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    if !actor.can_access(&id) {
        return action_err(ControlError::ServerNotFound);
    }
    match app.lifecycle.restart(&id).await {
        Ok(()) => action_ok("server restarted"),
        Err(e) => action_err(e),
    }
}

// POST /servers/{id}/command (console via stdin attaché)
async fn send_command(
    State(app): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Json(body): Json<CommandIn>,
) -> (StatusCode, Json<serde_json::Value>) {
    match app.streamer.send_command(&id, &body.command, &actor).await {
        Ok(()) => action_ok("command sent"),
        Err(e) => action_err(e),
    }
}

// GET /servers/{id}/stats (dernier snapshot en cache)
async fn get_server_stats(
    State(app): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<Json<ServerStats>, StatusCode> {
    if !actor.can_access(&id) {
        return Err(StatusCode::NOT_FOUND);
    }
    let stats = app.stats.server_stats.lock();
    match stats.get(&id) {
        Some(s) => Ok(Json(s.clone())),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(serde::Serialize)]
struct StatsView {
    servers: ServerStatsMap,
    nodes: NodeStatsMap,
}

// GET /stats (vue globale, filtrée par les droits de l'acteur)
async fn get_all_stats(
    State(app): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Json<StatsView> {
    let servers: ServerStatsMap = app
        .stats
        .server_stats
        .lock()
        .iter()
        .filter(|(id, _)| actor.can_access(id))
        .map(|(id, s)| (id.clone(), s.clone()))
        .collect();
    let nodes = app.stats.node_stats.lock().clone();
    Json(StatsView { servers, nodes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operators() -> Vec<OperatorConf> {
        vec![OperatorConf {
            name: "alice".into(),
            key: "op-key".into(),
            allowed_servers: Some(vec!["srv-1".into()]),
        }]
    }

    #[test]
    fn master_key_grants_full_access() {
        let actor = resolve_actor(Some("root-key"), &operators(), "root-key").unwrap();
        assert_eq!(actor.name, "root");
        assert!(actor.allowed_servers.is_none());
        assert!(actor.can_access("anything"));
    }

    #[test]
    fn operator_key_is_scoped() {
        let actor = resolve_actor(Some("root-key"), &operators(), "op-key").unwrap();
        assert_eq!(actor.name, "alice");
        assert!(actor.can_access("srv-1"));
        assert!(!actor.can_access("srv-2"));
    }

    #[test]
    fn unknown_or_empty_key_is_rejected() {
        assert!(resolve_actor(Some("root-key"), &operators(), "wrong").is_none());
        // clé maître absente de l'env = jamais un passe-droit
        assert!(resolve_actor(Some(""), &operators(), "").is_none());
        assert!(resolve_actor(None, &[], "anything").is_none());
    }
}
