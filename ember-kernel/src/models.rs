use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Running,
    Error,
}

/// Node = machine hôte avec un daemon Docker joignable (socket local ou TCP).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,              // 2375 HTTP, 2376 TLS (convention Docker)
    pub status: NodeStatus,
    pub cpu_cores: u32,
    pub ram_total: f64,         // GB déclarés
    pub disk_total: f64,        // GB déclarés
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Server = instance de serveur de jeu, un conteneur par serveur.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub game_type: String,
    pub node_id: String,
    pub container_id: Option<String>,  // absent tant que jamais démarré
    pub status: ServerStatus,
    pub cpu_limit: f64,         // % du host
    pub ram_limit: f64,         // GB
    pub disk_limit: f64,        // GB
    pub port: u16,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// Stats éphémères : jamais persistées, écrasées à chaque cycle de collecte
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub server_id: String,
    pub cpu_usage: f64,         // % plafonné au cpu_limit
    pub ram_usage: f64,         // GB plafonné au ram_limit
    pub disk_usage: f64,        // GB plafonné au disk_limit
    pub network_rx: u64,        // bytes cumulés toutes interfaces
    pub network_tx: u64,
    pub uptime_seconds: u64,
    pub timestamp: i64,         // unix ms
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub node_id: String,
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub disk_usage: f64,
    pub servers_running: u32,
    pub timestamp: i64,
}

pub type ServersMap = HashMap<String, Server>;
pub type NodesMap = HashMap<String, Node>;
pub type ServerStatsMap = HashMap<String, ServerStats>;
pub type NodeStatsMap = HashMap<String, NodeStats>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Info,
    Warn,
    Error,
    System,
}

/// Une ligne de console capturée, horodatée côté kernel.
#[derive(Debug, Clone, Serialize)]
pub struct ConsoleLog {
    pub timestamp: i64,         // unix ms à la capture
    pub message: String,
    pub kind: LogKind,
}

/// Acteur résolu par le middleware API key. `allowed_servers: None` = accès
/// à tous les serveurs (clé master ou opérateur sans restriction).
#[derive(Debug, Clone)]
pub struct Actor {
    pub name: String,
    pub allowed_servers: Option<Vec<String>>,
}

impl Actor {
    pub fn can_access(&self, server_id: &str) -> bool {
        match &self.allowed_servers {
            None => true,
            Some(list) => list.iter().any(|s| s == server_id),
        }
    }
}

// Payloads de création côté API
#[derive(Debug, Deserialize)]
pub struct NewNode {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub cpu_cores: u32,
    pub ram_total: f64,
    pub disk_total: f64,
}

#[derive(Debug, Deserialize)]
pub struct NewServer {
    pub name: String,
    pub game_type: String,
    pub node_id: String,
    pub cpu_limit: f64,
    pub ram_limit: f64,
    pub disk_limit: f64,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct CommandIn {
    pub command: String,
}

pub fn now_unix_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
