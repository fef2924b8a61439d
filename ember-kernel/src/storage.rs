/**
 * STORES PERSISTANTS - Registres nodes et serveurs avec persistance JSON
 *
 * RÔLE : CRUD simple des enregistrements Node et Server. Collaborateurs
 * "hors coeur" du plan de contrôle : le registry Docker, le collecteur de
 * stats et le streamer ne connaissent que get/list/update.
 *
 * ARCHITECTURE : map en mémoire sous RwLock + snapshot JSON sur disque.
 * Les échecs de sauvegarde sont loggés, jamais fatals.
 */

use crate::models::{Node, NodesMap, Server, ServersMap};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct ServerStore {
    servers: RwLock<ServersMap>,
    data_file: String,
}

impl ServerStore {
    pub fn new(data_file: &str) -> Self {
        Self { servers: RwLock::new(HashMap::new()), data_file: data_file.to_string() }
    }

    pub async fn load(&self) -> Result<()> {
        if !std::path::Path::new(&self.data_file).exists() {
            println!("[storage] no existing servers file, starting fresh");
            return Ok(());
        }
        let content = tokio::fs::read_to_string(&self.data_file).await?;
        let servers: ServersMap = serde_json::from_str(&content)?;
        let mut map = self.servers.write().await;
        println!("[storage] loaded {} servers from {}", servers.len(), self.data_file);
        *map = servers;
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let map = self.servers.read().await;
        let content = serde_json::to_string_pretty(&*map)?;
        tokio::fs::write(&self.data_file, content).await?;
        Ok(())
    }

    async fn save_logged(&self) {
        if let Err(e) = self.save().await {
            eprintln!("[storage] failed to save servers: {e}");
        }
    }

    pub async fn list(&self) -> Vec<Server> {
        self.servers.read().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<Server> {
        self.servers.read().await.get(id).cloned()
    }

    pub async fn insert(&self, server: Server) {
        {
            let mut map = self.servers.write().await;
            map.insert(server.id.clone(), server);
        }
        self.save_logged().await;
    }

    /// Mutation en place puis snapshot. Retourne la version mise à jour,
    /// None si l'id est inconnu.
    pub async fn update<F>(&self, id: &str, f: F) -> Option<Server>
    where
        F: FnOnce(&mut Server),
    {
        let updated = {
            let mut map = self.servers.write().await;
            let server = map.get_mut(id)?;
            f(server);
            Some(server.clone())
        };
        if updated.is_some() {
            self.save_logged().await;
        }
        updated
    }

    pub async fn delete(&self, id: &str) -> Option<Server> {
        let removed = { self.servers.write().await.remove(id) };
        if removed.is_some() {
            self.save_logged().await;
        }
        removed
    }
}

pub struct NodeStore {
    nodes: RwLock<NodesMap>,
    data_file: String,
}

impl NodeStore {
    pub fn new(data_file: &str) -> Self {
        Self { nodes: RwLock::new(HashMap::new()), data_file: data_file.to_string() }
    }

    pub async fn load(&self) -> Result<()> {
        if !std::path::Path::new(&self.data_file).exists() {
            println!("[storage] no existing nodes file, starting fresh");
            return Ok(());
        }
        let content = tokio::fs::read_to_string(&self.data_file).await?;
        let nodes: NodesMap = serde_json::from_str(&content)?;
        let mut map = self.nodes.write().await;
        println!("[storage] loaded {} nodes from {}", nodes.len(), self.data_file);
        *map = nodes;
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let map = self.nodes.read().await;
        let content = serde_json::to_string_pretty(&*map)?;
        tokio::fs::write(&self.data_file, content).await?;
        Ok(())
    }

    async fn save_logged(&self) {
        if let Err(e) = self.save().await {
            eprintln!("[storage] failed to save nodes: {e}");
        }
    }

    pub async fn list(&self) -> Vec<Node> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<Node> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn insert(&self, node: Node) {
        {
            let mut map = self.nodes.write().await;
            map.insert(node.id.clone(), node);
        }
        self.save_logged().await;
    }

    pub async fn update<F>(&self, id: &str, f: F) -> Option<Node>
    where
        F: FnOnce(&mut Node),
    {
        let updated = {
            let mut map = self.nodes.write().await;
            let node = map.get_mut(id)?;
            f(node);
            Some(node.clone())
        };
        if updated.is_some() {
            self.save_logged().await;
        }
        updated
    }

    pub async fn delete(&self, id: &str) -> Option<Node> {
        let removed = { self.nodes.write().await.remove(id) };
        if removed.is_some() {
            self.save_logged().await;
        }
        removed
    }
}

pub type SharedServerStore = Arc<ServerStore>;
pub type SharedNodeStore = Arc<NodeStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeStatus, ServerStatus};
    use tempfile::TempDir;
    use time::OffsetDateTime;

    fn test_server(id: &str) -> Server {
        Server {
            id: id.to_string(),
            name: format!("srv {id}"),
            game_type: "minecraft".into(),
            node_id: "node-1".into(),
            container_id: None,
            status: ServerStatus::Stopped,
            cpu_limit: 200.0,
            ram_limit: 4.0,
            disk_limit: 10.0,
            port: 25565,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn server_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.json");
        let store = ServerStore::new(path.to_str().unwrap());
        store.insert(test_server("a")).await;
        store.update("a", |s| s.status = ServerStatus::Running).await.unwrap();

        // relecture depuis le fichier par un second store
        let store2 = ServerStore::new(path.to_str().unwrap());
        store2.load().await.unwrap();
        let loaded = store2.get("a").await.unwrap();
        assert_eq!(loaded.status, ServerStatus::Running);
        assert!(loaded.container_id.is_none());
    }

    #[tokio::test]
    async fn update_unknown_id_is_none() {
        let dir = TempDir::new().unwrap();
        let store = ServerStore::new(dir.path().join("s.json").to_str().unwrap());
        assert!(store.update("nope", |s| s.status = ServerStatus::Error).await.is_none());
    }

    #[tokio::test]
    async fn node_store_delete() {
        let dir = TempDir::new().unwrap();
        let store = NodeStore::new(dir.path().join("n.json").to_str().unwrap());
        store
            .insert(Node {
                id: "n1".into(),
                name: "local".into(),
                ip: "127.0.0.1".into(),
                port: 2375,
                status: NodeStatus::Online,
                cpu_cores: 8,
                ram_total: 32.0,
                disk_total: 500.0,
                created_at: OffsetDateTime::now_utc(),
            })
            .await;
        assert!(store.delete("n1").await.is_some());
        assert!(store.delete("n1").await.is_none());
        assert!(store.get("n1").await.is_none());
    }
}
