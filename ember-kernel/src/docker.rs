/**
 * DOCKER REGISTRY - Clients Docker par node (local + distants)
 *
 * RÔLE : Résoudre un node logique vers un client Docker vivant. Un
 * singleton pour le node local (socket unix), un client mis en cache par
 * node distant, créé paresseusement selon la convention de port :
 * 2376 = TLS, tout le reste = HTTP en clair.
 *
 * FONCTIONNEMENT : cache `node_id -> connexion` muté uniquement dans des
 * sections synchrones (parking_lot), probe ping() jamais fatal. Un échec
 * de lookup reste une erreur "pour ce serveur seulement" : les composants
 * dépendants n'avortent jamais un batch à cause d'un node.
 */

use crate::config::DockerConf;
use crate::error::ControlError;
use crate::models::Node;
use bollard::{Docker, API_DEFAULT_VERSION};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;

pub struct DockerConnection {
    pub client: Docker,
    pub last_checked: OffsetDateTime,
    pub connected: bool,
}

pub struct DockerRegistry {
    connections: Mutex<HashMap<String, DockerConnection>>,
    local: Mutex<Option<Docker>>,
    conf: DockerConf,
}

impl DockerRegistry {
    pub fn new(conf: DockerConf) -> Self {
        Self { connections: Mutex::new(HashMap::new()), local: Mutex::new(None), conf }
    }

    pub fn is_local_node(node: &Node) -> bool {
        matches!(node.ip.as_str(), "127.0.0.1" | "localhost" | "::1")
    }

    /// Singleton local (socket /var/run/docker.sock), construit au premier
    /// usage : un kernel qui ne pilote que des nodes distants doit pouvoir
    /// démarrer sur une machine sans daemon local.
    fn local_client(&self) -> Result<Docker, ControlError> {
        let mut local = self.local.lock();
        if let Some(client) = &*local {
            return Ok(client.clone());
        }
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| ControlError::Connect(format!("local docker socket: {e}")))?;
        *local = Some(client.clone());
        Ok(client)
    }

    /// Client pour un node : singleton local, sinon cache par node_id.
    pub fn client_for(&self, node: &Node) -> Result<Docker, ControlError> {
        if Self::is_local_node(node) {
            return self.local_client();
        }

        let mut connections = self.connections.lock();
        if let Some(conn) = connections.get(&node.id) {
            return Ok(conn.client.clone());
        }

        let client = self.dial(node)?;
        connections.insert(
            node.id.clone(),
            DockerConnection {
                client: client.clone(),
                last_checked: OffsetDateTime::now_utc(),
                connected: false, // mis à jour au prochain probe
            },
        );
        Ok(client)
    }

    fn dial(&self, node: &Node) -> Result<Docker, ControlError> {
        let timeout = self.conf.timeout_secs;
        if node.port == 2376 {
            let Some(tls) = &self.conf.tls else {
                return Err(ControlError::Connect(format!(
                    "node {} requires TLS (port 2376) but no certificates are configured",
                    node.name
                )));
            };
            Docker::connect_with_ssl(
                &format!("https://{}:{}", node.ip, node.port),
                Path::new(&tls.key),
                Path::new(&tls.cert),
                Path::new(&tls.ca),
                timeout,
                API_DEFAULT_VERSION,
            )
            .map_err(|e| ControlError::Connect(format!("node {}: {e}", node.name)))
        } else {
            Docker::connect_with_http(
                &format!("http://{}:{}", node.ip, node.port),
                timeout,
                API_DEFAULT_VERSION,
            )
            .map_err(|e| ControlError::Connect(format!("node {}: {e}", node.name)))
        }
    }

    /// Probe de vie. Met à jour l'état de la connexion en cache et retourne
    /// un booléen : ne lève jamais, l'appelant s'en sert pour basculer le
    /// statut online/offline du node.
    pub async fn check_connection(&self, node: &Node) -> bool {
        let client = match self.client_for(node) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("[docker] cannot build client for node {} ({}:{}): {e}", node.name, node.ip, node.port);
                self.mark(&node.id, false);
                return false;
            }
        };

        match client.ping().await {
            Ok(_) => {
                self.mark(&node.id, true);
                true
            }
            Err(e) => {
                eprintln!("[docker] ping failed for node {} ({}:{}): {e}", node.name, node.ip, node.port);
                self.mark(&node.id, false);
                false
            }
        }
    }

    fn mark(&self, node_id: &str, connected: bool) {
        let mut connections = self.connections.lock();
        if let Some(conn) = connections.get_mut(node_id) {
            conn.connected = connected;
            conn.last_checked = OffsetDateTime::now_utc();
        }
    }

    /// Probe concurrent de tous les nodes. L'échec d'un node n'avorte
    /// jamais le batch : chaque entrée du résultat est indépendante.
    pub async fn check_all(&self, nodes: &[Node]) -> HashMap<String, bool> {
        let probes = nodes.iter().map(|node| async move {
            (node.id.clone(), self.check_connection(node).await)
        });
        futures_util::future::join_all(probes).await.into_iter().collect()
    }

    /// Oublie le client d'un node supprimé. Recréé paresseusement si le
    /// node réapparaît ; supprimer une clé absente est un no-op.
    pub fn remove_connection(&self, node_id: &str) {
        self.connections.lock().remove(node_id);
    }

    #[cfg(test)]
    pub fn cached_count(&self) -> usize {
        self.connections.lock().len()
    }
}

pub type SharedDockerRegistry = Arc<DockerRegistry>;

/// Monitor périodique : probe tous les nodes et persiste online/offline.
pub fn spawn_node_monitor(
    registry: SharedDockerRegistry,
    nodes: crate::storage::SharedNodeStore,
    interval_secs: u64,
) {
    println!("[docker] starting node monitor (interval: {interval_secs}s)");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            let known = nodes.list().await;
            let results = registry.check_all(&known).await;
            for (node_id, online) in results {
                let status = if online {
                    crate::models::NodeStatus::Online
                } else {
                    crate::models::NodeStatus::Offline
                };
                nodes.update(&node_id, |n| n.status = status).await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeStatus;

    fn test_node(id: &str, ip: &str, port: u16) -> Node {
        Node {
            id: id.to_string(),
            name: format!("node {id}"),
            ip: ip.to_string(),
            port,
            status: NodeStatus::Online,
            cpu_cores: 4,
            ram_total: 16.0,
            disk_total: 100.0,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn registry() -> DockerRegistry {
        DockerRegistry::new(DockerConf { timeout_secs: 2, tls: None })
    }

    #[test]
    fn registry_builds_without_local_daemon() {
        // la construction ne touche jamais le socket local : un kernel qui
        // ne pilote que des nodes distants démarre sur une machine sans
        // Docker, et un échec local reste scopé au node concerné
        let reg = registry();
        let remote = test_node("n0", "192.0.2.9", 2375);
        reg.client_for(&remote).unwrap();
        assert_eq!(reg.cached_count(), 1);
    }

    #[test]
    fn loopback_addresses_never_enter_remote_cache() {
        let reg = registry();
        for ip in ["127.0.0.1", "localhost", "::1"] {
            let node = test_node("local", ip, 2375);
            assert!(DockerRegistry::is_local_node(&node));
            // Ok ou Connect selon la présence du socket sur la machine,
            // dans les deux cas rien n'entre dans le cache distant
            let _ = reg.client_for(&node);
        }
        assert_eq!(reg.cached_count(), 0);
    }

    #[test]
    fn remote_client_is_cached_once() {
        let reg = registry();
        let node = test_node("n1", "192.0.2.10", 2375);
        reg.client_for(&node).unwrap();
        reg.client_for(&node).unwrap();
        assert_eq!(reg.cached_count(), 1);
    }

    #[test]
    fn tls_port_without_certs_is_refused() {
        let reg = registry();
        let node = test_node("n2", "192.0.2.11", 2376);
        let err = reg.client_for(&node).unwrap_err();
        assert!(matches!(err, ControlError::Connect(_)));
        assert_eq!(reg.cached_count(), 0);
    }

    #[test]
    fn remove_connection_is_idempotent() {
        let reg = registry();
        let node = test_node("n3", "192.0.2.12", 2375);
        reg.client_for(&node).unwrap();
        reg.remove_connection("n3");
        reg.remove_connection("n3");
        assert_eq!(reg.cached_count(), 0);
        // recréation paresseuse après suppression
        reg.client_for(&node).unwrap();
        assert_eq!(reg.cached_count(), 1);
    }

    #[tokio::test]
    async fn check_connection_on_dead_endpoint_returns_false() {
        let reg = registry();
        // rien n'écoute sur cette adresse : le probe échoue sans paniquer
        let node = test_node("dead", "127.0.0.2", 2375);
        assert!(!reg.check_connection(&node).await);
    }

    #[tokio::test]
    async fn check_all_covers_every_node() {
        let reg = registry();
        let nodes = vec![
            test_node("a", "127.0.0.2", 2375),
            test_node("b", "127.0.0.2", 2376), // TLS non configuré -> false
        ];
        let results = reg.check_all(&nodes).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results.get("a"), Some(&false));
        assert_eq!(results.get("b"), Some(&false));
    }
}
