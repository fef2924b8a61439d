/**
 * LIFECYCLE CONTROLLER - Machine à états des serveurs de jeu
 *
 * RÔLE : Lier un enregistrement Server à un conteneur concret via le
 * registry Docker du node propriétaire.
 *
 * ÉTATS : stopped -> running -> stopped (normal),
 *         stopped -> running -> error (échec start/commande),
 *         error -> running (retry après correction), deleted (terminal).
 *
 * Chaque transition qui touche un conteneur est précédée d'un probe du
 * node : node injoignable = échec immédiat (le node passe offline, un
 * serveur resté `running` est réconcilié en `error`), jamais d'appel
 * runtime tenté à l'aveugle.
 */

use crate::docker::SharedDockerRegistry;
use crate::error::ControlError;
use crate::models::{Node, NodeStatus, Server, ServerStatus};
use crate::stats::StatsCollector;
use crate::storage::{SharedNodeStore, SharedServerStore};
use crate::streamer::SharedLogStreamer;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, RemoveContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

pub struct LifecycleController {
    docker: SharedDockerRegistry,
    servers: SharedServerStore,
    nodes: SharedNodeStore,
    streamer: SharedLogStreamer,
    stats: Arc<StatsCollector>,
}

impl LifecycleController {
    pub fn new(
        docker: SharedDockerRegistry,
        servers: SharedServerStore,
        nodes: SharedNodeStore,
        streamer: SharedLogStreamer,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self { docker, servers, nodes, streamer, stats }
    }

    /// Probe le node et persiste son statut. Si le probe échoue alors que
    /// le serveur se croit `running`, l'invariant est réconcilié en `error`.
    async fn require_reachable(&self, server: &Server, node: &Node) -> Result<(), ControlError> {
        if self.docker.check_connection(node).await {
            self.nodes.update(&node.id, |n| n.status = NodeStatus::Online).await;
            return Ok(());
        }
        self.nodes.update(&node.id, |n| n.status = NodeStatus::Offline).await;
        if server.status == ServerStatus::Running {
            self.servers.update(&server.id, |s| s.status = ServerStatus::Error).await;
        }
        Err(ControlError::NodeUnreachable(node.name.clone()))
    }

    async fn resolve(&self, server_id: &str) -> Result<(Server, Node), ControlError> {
        let server = self.servers.get(server_id).await.ok_or(ControlError::ServerNotFound)?;
        let node = self.nodes.get(&server.node_id).await.ok_or(ControlError::NodeNotFound)?;
        Ok((server, node))
    }

    /// Démarre un serveur, en créant le conteneur au premier start.
    pub async fn start(&self, server_id: &str) -> Result<(), ControlError> {
        let (server, node) = self.resolve(server_id).await?;
        self.require_reachable(&server, &node).await?;
        let docker = self.docker.client_for(&node)?;

        let result = async {
            let container_id = match &server.container_id {
                Some(id) => id.clone(),
                None => {
                    let id = self.create_game_container(&server, &node, &docker).await?;
                    self.servers.update(server_id, |s| s.container_id = Some(id.clone())).await;
                    id
                }
            };
            docker
                .start_container(&container_id, None::<bollard::query_parameters::StartContainerOptions>)
                .await
                .map_err(|e| ControlError::Lifecycle(format!("start on node {}: {e}", node.name)))
        }
        .await;

        match result {
            Ok(()) => {
                self.servers.update(server_id, |s| s.status = ServerStatus::Running).await;
                println!("[lifecycle] server {server_id} started on node {}", node.name);
                Ok(())
            }
            Err(e) => {
                self.servers.update(server_id, |s| s.status = ServerStatus::Error).await;
                Err(e)
            }
        }
    }

    pub async fn stop(&self, server_id: &str) -> Result<(), ControlError> {
        let (server, node) = self.resolve(server_id).await?;
        let container_id = server.container_id.clone().ok_or(ControlError::ContainerMissing)?;
        self.require_reachable(&server, &node).await?;
        let docker = self.docker.client_for(&node)?;

        match docker
            .stop_container(&container_id, None::<bollard::query_parameters::StopContainerOptions>)
            .await
        {
            Ok(()) => {
                self.servers.update(server_id, |s| s.status = ServerStatus::Stopped).await;
                self.streamer.teardown(server_id).await;
                println!("[lifecycle] server {server_id} stopped");
                Ok(())
            }
            Err(e) => {
                self.servers.update(server_id, |s| s.status = ServerStatus::Error).await;
                Err(ControlError::Lifecycle(format!("stop on node {}: {e}", node.name)))
            }
        }
    }

    pub async fn restart(&self, server_id: &str) -> Result<(), ControlError> {
        let (server, node) = self.resolve(server_id).await?;
        let container_id = server.container_id.clone().ok_or(ControlError::ContainerMissing)?;
        self.require_reachable(&server, &node).await?;
        let docker = self.docker.client_for(&node)?;

        match docker
            .restart_container(&container_id, None::<bollard::query_parameters::RestartContainerOptions>)
            .await
        {
            Ok(()) => {
                self.servers.update(server_id, |s| s.status = ServerStatus::Running).await;
                println!("[lifecycle] server {server_id} restarted");
                Ok(())
            }
            Err(e) => {
                self.servers.update(server_id, |s| s.status = ServerStatus::Error).await;
                Err(ControlError::Lifecycle(format!("restart on node {}: {e}", node.name)))
            }
        }
    }

    /// Supprime l'enregistrement quoi qu'il arrive ; le conteneur est
    /// stoppé puis retiré en best-effort (un "déjà stoppé" est ignoré).
    pub async fn delete(&self, server_id: &str) -> Result<(), ControlError> {
        let server = self.servers.get(server_id).await.ok_or(ControlError::ServerNotFound)?;

        if let Some(container_id) = &server.container_id {
            match self.nodes.get(&server.node_id).await {
                Some(node) => match self.docker.client_for(&node) {
                    Ok(docker) => {
                        if let Err(e) = docker
                            .stop_container(container_id, None::<bollard::query_parameters::StopContainerOptions>)
                            .await
                        {
                            eprintln!("[lifecycle] container stop warning for {server_id}: {e}");
                        }
                        let options = RemoveContainerOptionsBuilder::new().force(true).build();
                        if let Err(e) = docker.remove_container(container_id, Some(options)).await {
                            eprintln!("[lifecycle] container remove failed for {server_id}: {e}");
                        }
                    }
                    Err(e) => eprintln!("[lifecycle] no client to clean container of {server_id}: {e}"),
                },
                None => eprintln!("[lifecycle] node of server {server_id} is gone, skipping container cleanup"),
            }
        }

        self.streamer.teardown(server_id).await;
        self.stats.forget_server(server_id);
        self.servers.delete(server_id).await;
        println!("[lifecycle] server {server_id} deleted");
        Ok(())
    }

    async fn create_game_container(
        &self,
        server: &Server,
        node: &Node,
        docker: &Docker,
    ) -> Result<String, ControlError> {
        let image = game_image(&server.game_type);
        let (repo, tag) = split_image_ref(image);

        // pull best-effort : en prod les images sont pré-tirées, on tente
        // quand même et on retombe sur le cache local en cas d'échec
        println!("[lifecycle] pulling image {image} on node {}...", node.name);
        let pull = CreateImageOptionsBuilder::new().from_image(repo).tag(tag).build();
        let mut progress = docker.create_image(Some(pull), None, None);
        while let Some(step) = progress.next().await {
            if let Err(e) = step {
                eprintln!("[lifecycle] pull failed, will use cached image: {e}");
                break;
            }
        }

        let options = CreateContainerOptionsBuilder::new().name(&container_name(&server.id)).build();
        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            env: Some(container_env(server)),
            host_config: Some(build_host_config(server)),
            ..Default::default()
        };

        let created = docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| ControlError::Lifecycle(format!("create on node {}: {e}", node.name)))?;
        println!("[lifecycle] created container {} for server {}", created.id, server.id);
        Ok(created.id)
    }
}

/// Type de jeu -> image runtime ; inconnu = image custom.
pub(crate) fn game_image(game_type: &str) -> &'static str {
    match game_type {
        "minecraft" => "itzg/minecraft-server",
        "csgo" => "cm2network/csgo",
        "rust" => "didstopia/rust-server",
        "ark" => "turzam/ark",
        "valheim" => "lloesche/valheim-server",
        "terraria" => "ryshe/terraria",
        "gmod" => "cm2network/gmod",
        _ => "ubuntu:latest",
    }
}

pub(crate) fn split_image_ref(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) => (repo, tag),
        None => (image, "latest"),
    }
}

pub(crate) fn container_name(server_id: &str) -> String {
    format!("ember-{server_id}")
}

/// Environnement minimal requis par les images de serveurs de jeu.
pub(crate) fn container_env(server: &Server) -> Vec<String> {
    vec!["EULA=TRUE".to_string(), format!("SERVER_PORT={}", server.port)]
}

pub(crate) fn build_host_config(server: &Server) -> HostConfig {
    let mut port_bindings = HashMap::new();
    port_bindings.insert(
        format!("{}/tcp", server.port),
        Some(vec![PortBinding { host_ip: None, host_port: Some(server.port.to_string()) }]),
    );
    HostConfig {
        memory: Some((server.ram_limit * GB) as i64),
        nano_cpus: Some(((server.cpu_limit / 100.0) * 1_000_000_000.0) as i64),
        port_bindings: Some(port_bindings),
        ..HostConfig::default()
    }
}
