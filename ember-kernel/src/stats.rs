/**
 * STATS COLLECTOR - Télémétrie des serveurs et nodes depuis Docker
 *
 * RÔLE : Dériver des métriques normalisées (CPU %, RAM/disque GB, réseau,
 * uptime) depuis les compteurs bruts du daemon, et les écrire dans des
 * caches éphémères dernière-valeur-seulement.
 *
 * FONCTIONNEMENT : task périodique (réf : 5s). Chaque sous-mesure est
 * best-effort indépendante : un timeout du probe disque ne jette pas le
 * reste de l'échantillon, un passage raté laisse simplement l'ancien
 * échantillon en place jusqu'au prochain passage.
 */

use crate::docker::SharedDockerRegistry;
use crate::error::ControlError;
use crate::models::{now_unix_ms, Node, NodeStats, NodeStatsMap, Server, ServerStats, ServerStatsMap, ServerStatus};
use crate::state::Shared;
use crate::storage::{SharedNodeStore, SharedServerStore};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCpuStats, ContainerSummaryStateEnum};
use bollard::query_parameters::{InspectContainerOptionsBuilder, ListContainersOptionsBuilder, StatsOptionsBuilder};
use bollard::Docker;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

// Commande df exécutée dans le conteneur : les compteurs du daemon
// n'exposent pas le disque à coût raisonnable.
const DISK_USAGE_CMD: &str = "df -BG /data 2>/dev/null | tail -1 | awk '{print $3}' | sed 's/G//'";
const DISK_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

pub struct StatsCollector {
    docker: SharedDockerRegistry,
    servers: SharedServerStore,
    nodes: SharedNodeStore,
    pub server_stats: Shared<ServerStatsMap>,
    pub node_stats: Shared<NodeStatsMap>,
}

impl StatsCollector {
    pub fn new(
        docker: SharedDockerRegistry,
        servers: SharedServerStore,
        nodes: SharedNodeStore,
        server_stats: Shared<ServerStatsMap>,
        node_stats: Shared<NodeStatsMap>,
    ) -> Self {
        Self { docker, servers, nodes, server_stats, node_stats }
    }

    /// Échantillon pour un serveur. Absent (pas une erreur) si le serveur
    /// n'a pas de conteneur ou n'est pas `running`.
    pub async fn collect_server_stats(&self, server: &Server, node: &Node) -> Option<ServerStats> {
        let container_id = server.container_id.as_deref()?;
        if server.status != ServerStatus::Running {
            return None;
        }

        let docker = self.docker.client_for(node).ok()?;

        let options = StatsOptionsBuilder::new().stream(false).one_shot(true).build();
        let mut stream = docker.stats(container_id, Some(options));
        let raw = match stream.next().await {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => {
                eprintln!("[stats] stats call failed for server {}: {e}", server.id);
                return None;
            }
            None => return None,
        };

        // CPU : delta conteneur / delta système entre deux lectures du daemon
        let (cpu_delta, system_delta) = cpu_deltas(raw.cpu_stats.as_ref(), raw.precpu_stats.as_ref());
        let cpu_usage = scale_to_limit(cpu_percent(cpu_delta, system_delta), server.cpu_limit);

        // RAM : bytes bruts -> GB, plafonné au ram_limit déclaré même si le
        // daemon rapporte plus (comptabilité cache partagé)
        let ram_bytes = raw.memory_stats.as_ref().and_then(|m| m.usage).unwrap_or(0);
        let ram_usage = clamp_to_limit(ram_bytes as f64 / GB, server.ram_limit);

        // Réseau : somme rx/tx de toutes les interfaces virtuelles
        let (network_rx, network_tx) = raw
            .networks
            .as_ref()
            .map(|nets| {
                nets.values().fold((0u64, 0u64), |(rx, tx), net| {
                    (rx + net.rx_bytes.unwrap_or(0), tx + net.tx_bytes.unwrap_or(0))
                })
            })
            .unwrap_or((0, 0));

        // Uptime et disque : best-effort indépendants, 0 en cas d'échec
        let uptime_seconds = container_uptime(&docker, container_id).await;
        let disk_usage = clamp_to_limit(
            container_disk_usage(&docker, container_id).await,
            server.disk_limit,
        );

        Some(ServerStats {
            server_id: server.id.clone(),
            cpu_usage,
            ram_usage,
            disk_usage,
            network_rx,
            network_tx,
            uptime_seconds,
            timestamp: now_unix_ms(),
        })
    }

    /// Échantillon pour un node : somme des échantillons des serveurs
    /// running du node (pas de métriques host fiables sans agent), disque
    /// approximé par les tailles de conteneurs, count = conteneurs non
    /// stoppés côté daemon.
    pub async fn collect_node_stats(&self, node: &Node) -> Option<NodeStats> {
        let docker = match self.docker.client_for(node) {
            Ok(d) => d,
            Err(e) => {
                eprintln!("[stats] no client for node {}: {e}", node.id);
                return None;
            }
        };

        let options = ListContainersOptionsBuilder::new().all(true).build();
        let containers = match docker.list_containers(Some(options)).await {
            Ok(list) => list,
            Err(e) => {
                eprintln!("[stats] list_containers failed for node {}: {e}", node.id);
                return None;
            }
        };
        let running = containers
            .iter()
            .filter(|c| c.state == Some(ContainerSummaryStateEnum::RUNNING))
            .count() as u32;

        // Somme CPU/RAM depuis le cache par serveur (rempli juste avant par
        // le même passage de collecte)
        let servers = self.servers.list().await;
        let (mut total_cpu, mut total_ram) = (0.0f64, 0.0f64);
        {
            let cache = self.server_stats.lock();
            for server in &servers {
                if server.node_id == node.id && server.status == ServerStatus::Running {
                    if let Some(sample) = cache.get(&server.id) {
                        total_cpu += sample.cpu_usage;
                        total_ram += sample.ram_usage;
                    }
                }
            }
        }

        // Disque : somme size_root_fs + size_rw, échec par conteneur ignoré
        let mut disk_gb = 0.0f64;
        let inspect_options = InspectContainerOptionsBuilder::new().size(true).build();
        for container in &containers {
            let Some(id) = container.id.as_deref() else { continue };
            match docker.inspect_container(id, Some(inspect_options.clone())).await {
                Ok(inspect) => {
                    let size = inspect.size_root_fs.unwrap_or(0) + inspect.size_rw.unwrap_or(0);
                    disk_gb += size as f64 / GB;
                }
                Err(e) => {
                    eprintln!("[stats] size inspect failed for container {id} on node {}: {e}", node.id);
                }
            }
        }

        Some(NodeStats {
            node_id: node.id.clone(),
            cpu_usage: total_cpu.min(100.0),
            ram_usage: total_ram.min(node.ram_total),
            disk_usage: disk_gb.min(node.disk_total),
            servers_running: running,
            timestamp: now_unix_ms(),
        })
    }

    /// Un passage complet : tous les serveurs running, puis tous les nodes.
    /// Idempotent, échecs isolés par serveur/node.
    pub async fn update_all(&self) {
        for server in self.servers.list().await {
            if server.status != ServerStatus::Running || server.container_id.is_none() {
                continue;
            }
            let Some(node) = self.nodes.get(&server.node_id).await else {
                continue;
            };
            if let Some(sample) = self.collect_server_stats(&server, &node).await {
                self.server_stats.lock().insert(server.id.clone(), sample);
            }
        }

        for node in self.nodes.list().await {
            if let Some(sample) = self.collect_node_stats(&node).await {
                self.node_stats.lock().insert(node.id.clone(), sample);
            }
        }
    }

    /// Oublie les échantillons d'un serveur supprimé.
    pub fn forget_server(&self, server_id: &str) {
        self.server_stats.lock().remove(server_id);
    }

    /// Oublie les échantillons d'un node supprimé.
    pub fn forget_node(&self, node_id: &str) {
        self.node_stats.lock().remove(node_id);
    }
}

/// Démarre la collecte périodique.
pub fn spawn_stats_collector(collector: Arc<StatsCollector>, interval_secs: u64) {
    println!("[stats] starting stats collector (interval: {interval_secs}s)");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            collector.update_all().await;
        }
    });
}

/// Uptime = horloge murale depuis started_at. 0 si non running ou
/// indisponible.
async fn container_uptime(docker: &Docker, container_id: &str) -> u64 {
    let inspect = match docker
        .inspect_container(container_id, None::<bollard::query_parameters::InspectContainerOptions>)
        .await
    {
        Ok(inspect) => inspect,
        Err(_) => return 0,
    };
    let Some(state) = inspect.state else { return 0 };
    if !state.running.unwrap_or(false) {
        return 0;
    }
    let Some(started_at) = state.started_at.as_deref() else { return 0 };
    match OffsetDateTime::parse(started_at, &Rfc3339) {
        Ok(start) => (OffsetDateTime::now_utc() - start).whole_seconds().max(0) as u64,
        Err(_) => 0,
    }
}

/// Usage disque via df dans le conteneur, borné par un timeout. Toute
/// faute (exec refusé, sortie imparsable, timeout) retourne 0 : champ
/// numérique toujours présent, politique degrade-gracefully assumée.
async fn container_disk_usage(docker: &Docker, container_id: &str) -> f64 {
    let probe = async {
        let exec = docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/sh", "-c", DISK_USAGE_CMD]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ControlError::Stream(e.to_string()))?;

        let mut collected = String::new();
        if let StartExecResults::Attached { mut output, .. } = docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ControlError::Stream(e.to_string()))?
        {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(log) => collected.push_str(&log.to_string()),
                    Err(_) => break, // erreurs de lecture ignorées
                }
            }
        }
        Ok::<String, ControlError>(collected)
    };

    match tokio::time::timeout(DISK_PROBE_TIMEOUT, probe).await {
        Ok(Ok(output)) => parse_df_gb(&output),
        _ => 0.0,
    }
}

/// Deltas bruts depuis deux lectures consécutives du daemon. Tout champ
/// absent vaut 0, compteurs qui reculent écrasés à 0 (saturating).
pub(crate) fn cpu_deltas(
    cur: Option<&ContainerCpuStats>,
    prev: Option<&ContainerCpuStats>,
) -> (u64, u64) {
    match (cur, prev) {
        (Some(cur), Some(prev)) => {
            let total = cur.cpu_usage.as_ref().and_then(|u| u.total_usage).unwrap_or(0);
            let prev_total = prev.cpu_usage.as_ref().and_then(|u| u.total_usage).unwrap_or(0);
            let system = cur.system_cpu_usage.unwrap_or(0);
            let prev_system = prev.system_cpu_usage.unwrap_or(0);
            (total.saturating_sub(prev_total), system.saturating_sub(prev_system))
        }
        _ => (0, 0),
    }
}

/// CPU % = (delta conteneur / delta système) * 100, garde anti division
/// par zéro, toujours dans [0, 100].
pub(crate) fn cpu_percent(cpu_delta: u64, system_delta: u64) -> f64 {
    if system_delta == 0 {
        return 0.0;
    }
    ((cpu_delta as f64 / system_delta as f64) * 100.0).clamp(0.0, 100.0)
}

/// Ramène le % host vers la part du cpu_limit du serveur, plafonné.
pub(crate) fn scale_to_limit(percent: f64, limit: f64) -> f64 {
    ((percent / 100.0) * limit).min(limit)
}

pub(crate) fn clamp_to_limit(value: f64, limit: f64) -> f64 {
    value.min(limit)
}

pub(crate) fn parse_df_gb(output: &str) -> f64 {
    output.trim().parse::<f64>().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_percent_guards_zero_system_delta() {
        assert_eq!(cpu_percent(1_000, 0), 0.0);
        assert_eq!(cpu_percent(0, 0), 0.0);
    }

    #[test]
    fn cpu_percent_stays_in_range() {
        assert_eq!(cpu_percent(50, 100), 50.0);
        // compteur aberrant : delta conteneur > delta système
        assert_eq!(cpu_percent(500, 100), 100.0);
        assert_eq!(cpu_percent(0, 100), 0.0);
    }

    #[test]
    fn scale_caps_at_limit() {
        assert_eq!(scale_to_limit(100.0, 200.0), 200.0);
        assert_eq!(scale_to_limit(50.0, 200.0), 100.0);
        assert_eq!(scale_to_limit(100.0, 50.0), 50.0);
    }

    #[test]
    fn clamp_never_reports_above_limit() {
        // le daemon peut rapporter plus que la limite (cache partagé) :
        // on plafonne, comportement lossy assumé
        assert_eq!(clamp_to_limit(8.5, 4.0), 4.0);
        assert_eq!(clamp_to_limit(2.0, 4.0), 2.0);
    }

    fn cpu_sample(total: u64, system: u64) -> ContainerCpuStats {
        use bollard::models::ContainerCpuUsage;
        ContainerCpuStats {
            cpu_usage: Some(ContainerCpuUsage {
                total_usage: Some(total),
                ..Default::default()
            }),
            system_cpu_usage: Some(system),
            ..Default::default()
        }
    }

    #[test]
    fn cpu_pipeline_from_raw_counters() {
        // 250ms de conteneur sur 1s système = 25% host, puis mise à
        // l'échelle sur la limite du serveur (200% = 2 cœurs -> 50.0)
        let (cpu_delta, system_delta) =
            cpu_deltas(Some(&cpu_sample(1_250_000_000, 2_000_000_000)), Some(&cpu_sample(1_000_000_000, 1_000_000_000)));
        assert_eq!((cpu_delta, system_delta), (250_000_000, 1_000_000_000));
        let percent = cpu_percent(cpu_delta, system_delta);
        assert!((percent - 25.0).abs() < 1e-9);
        assert!((scale_to_limit(percent, 200.0) - 50.0).abs() < 1e-9);

        // compteurs qui reculent (restart du daemon) : deltas saturés à 0,
        // le pourcentage reste dans [0, 100]
        let (cpu_delta, system_delta) =
            cpu_deltas(Some(&cpu_sample(100, 100)), Some(&cpu_sample(1_000, 1_000)));
        assert_eq!((cpu_delta, system_delta), (0, 0));
        assert_eq!(cpu_percent(cpu_delta, system_delta), 0.0);

        // champs absents ou lecture précédente manquante = 0
        assert_eq!(cpu_deltas(Some(&ContainerCpuStats::default()), Some(&ContainerCpuStats::default())), (0, 0));
        assert_eq!(cpu_deltas(Some(&cpu_sample(5, 5)), None), (0, 0));
    }

    #[test]
    fn df_output_parsing() {
        assert_eq!(parse_df_gb("12\n"), 12.0);
        assert_eq!(parse_df_gb("  3  "), 3.0);
        assert_eq!(parse_df_gb(""), 0.0);
        assert_eq!(parse_df_gb("df: /data: No such file or directory"), 0.0);
    }

    mod collect {
        use super::super::*;
        use crate::config::DockerConf;
        use crate::docker::DockerRegistry;
        use crate::models::{NodeStatus, ServerStatus};
        use crate::state::new_state;
        use crate::storage::{NodeStore, ServerStore};
        use std::collections::HashMap;
        use tempfile::TempDir;

        fn collector(dir: &TempDir) -> StatsCollector {
            let docker = Arc::new(DockerRegistry::new(DockerConf { timeout_secs: 2, tls: None }));
            let servers = Arc::new(ServerStore::new(dir.path().join("s.json").to_str().unwrap()));
            let nodes = Arc::new(NodeStore::new(dir.path().join("n.json").to_str().unwrap()));
            StatsCollector::new(docker, servers, nodes, new_state(HashMap::new()), new_state(HashMap::new()))
        }

        fn server(status: ServerStatus, container: Option<&str>) -> Server {
            Server {
                id: "srv-1".into(),
                name: "mc".into(),
                game_type: "minecraft".into(),
                node_id: "n1".into(),
                container_id: container.map(String::from),
                status,
                cpu_limit: 200.0,
                ram_limit: 4.0,
                disk_limit: 10.0,
                port: 25565,
                created_at: OffsetDateTime::now_utc(),
            }
        }

        fn node() -> Node {
            Node {
                id: "n1".into(),
                name: "local".into(),
                ip: "127.0.0.2".into(),
                port: 2375,
                status: NodeStatus::Online,
                cpu_cores: 8,
                ram_total: 32.0,
                disk_total: 500.0,
                created_at: OffsetDateTime::now_utc(),
            }
        }

        #[tokio::test]
        async fn non_running_server_yields_absent() {
            let dir = TempDir::new().unwrap();
            let c = collector(&dir);
            assert!(c.collect_server_stats(&server(ServerStatus::Stopped, Some("abc")), &node()).await.is_none());
            assert!(c.collect_server_stats(&server(ServerStatus::Error, Some("abc")), &node()).await.is_none());
        }

        #[tokio::test]
        async fn missing_container_yields_absent() {
            let dir = TempDir::new().unwrap();
            let c = collector(&dir);
            assert!(c.collect_server_stats(&server(ServerStatus::Running, None), &node()).await.is_none());
        }

        #[tokio::test]
        async fn forget_server_drops_cache_entry() {
            let dir = TempDir::new().unwrap();
            let c = collector(&dir);
            c.server_stats.lock().insert(
                "srv-1".into(),
                ServerStats {
                    server_id: "srv-1".into(),
                    cpu_usage: 1.0,
                    ram_usage: 1.0,
                    disk_usage: 1.0,
                    network_rx: 0,
                    network_tx: 0,
                    uptime_seconds: 1,
                    timestamp: now_unix_ms(),
                },
            );
            c.forget_server("srv-1");
            c.forget_server("srv-1"); // idempotent
            assert!(c.server_stats.lock().is_empty());
        }

        #[tokio::test]
        async fn forget_node_drops_cache_entry() {
            let dir = TempDir::new().unwrap();
            let c = collector(&dir);
            c.node_stats.lock().insert(
                "n1".into(),
                NodeStats {
                    node_id: "n1".into(),
                    cpu_usage: 10.0,
                    ram_usage: 2.0,
                    disk_usage: 20.0,
                    servers_running: 1,
                    timestamp: now_unix_ms(),
                },
            );
            c.forget_node("n1");
            c.forget_node("n1"); // idempotent
            assert!(c.node_stats.lock().is_empty());
        }
    }
}
