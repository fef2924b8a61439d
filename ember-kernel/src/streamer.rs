/**
 * LOG STREAMER - Console temps réel et injection de commandes
 *
 * RÔLE : Multiplexer UN stream attach par serveur vers N observateurs, et
 * pousser les commandes opérateur dans le stdin du conteneur.
 *
 * FONCTIONNEMENT :
 * - premier abonné = attach stdout/stderr + task de lecture unique ;
 *   abonnés suivants réutilisent le stream existant. La session est
 *   réservée de façon synchrone AVANT l'attach : deux premiers abonnés
 *   concurrents ne peuvent pas attacher deux streams
 * - chaque chunk est découpé en lignes non vides, classées par sévérité
 *   (heuristique mots-clés, fonction pure remplaçable) puis diffusées à
 *   tous les abonnés courants avec horodatage de capture
 * - stream stdin séparé, créé paresseusement à la première commande, mis
 *   en cache par serveur derrière un verrou PAR SERVEUR : un conteneur
 *   suspendu ne bloque que ses propres appelants
 * - end/error = teardown complet (handlers + caches), sinon fuite socket
 *
 * ORDRE : préservé par serveur (un stream, une task de dispatch). Aucune
 * garantie inter-serveurs.
 */

use crate::docker::SharedDockerRegistry;
use crate::error::ControlError;
use crate::models::{now_unix_ms, Actor, ConsoleLog, LogKind, ServerStatus};
use crate::state::{new_state, Shared};
use crate::storage::{SharedNodeStore, SharedServerStore};
use bollard::query_parameters::AttachContainerOptionsBuilder;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Évènement poussé aux observateurs d'un serveur.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Log { server_id: String, log: ConsoleLog },
    Error { server_id: String, reason: String },
}

pub type ObserverSender = UnboundedSender<StreamEvent>;

type SubscribersMap = HashMap<String, HashMap<Uuid, ObserverSender>>;
// None = session réservée, attach en cours
type TasksMap = HashMap<String, Option<JoinHandle<()>>>;
type CommandInput = Arc<tokio::sync::Mutex<Option<Pin<Box<dyn AsyncWrite + Send>>>>>;
type InputsMap = HashMap<String, CommandInput>;

pub struct LogStreamer {
    docker: SharedDockerRegistry,
    servers: SharedServerStore,
    nodes: SharedNodeStore,
    subscribers: Shared<SubscribersMap>,
    log_tasks: Shared<TasksMap>,
    command_tasks: Shared<TasksMap>,
    command_inputs: Shared<InputsMap>,
    command_timeout: Duration,
    classify: fn(&str) -> LogKind,
}

impl LogStreamer {
    pub fn new(
        docker: SharedDockerRegistry,
        servers: SharedServerStore,
        nodes: SharedNodeStore,
        command_timeout: Duration,
    ) -> Self {
        Self {
            docker,
            servers,
            nodes,
            subscribers: new_state(HashMap::new()),
            log_tasks: new_state(HashMap::new()),
            command_tasks: new_state(HashMap::new()),
            command_inputs: new_state(HashMap::new()),
            command_timeout,
            classify: classify_line,
        }
    }

    /// Heuristique de sévérité remplaçable sans toucher au fan-out.
    pub fn with_classifier(mut self, classify: fn(&str) -> LogKind) -> Self {
        self.classify = classify;
        self
    }

    /// Abonne un observateur. Serveur inconnu ou non running : no-op
    /// silencieux (fail closed, rien ne fuit). L'échec d'attach, lui, est
    /// remonté à l'appelant, observateur désinscrit.
    pub async fn subscribe(
        &self,
        server_id: &str,
        observer: Uuid,
        sender: ObserverSender,
    ) -> Result<(), ControlError> {
        let Some(server) = self.servers.get(server_id).await else {
            return Ok(());
        };

        self.subscribers
            .lock()
            .entry(server_id.to_string())
            .or_default()
            .insert(observer, sender);

        if server.status != ServerStatus::Running {
            return Ok(());
        }
        let Some(container_id) = server.container_id.clone() else {
            return Ok(());
        };
        let Some(node) = self.nodes.get(&server.node_id).await else {
            return Ok(());
        };

        // réservation synchrone avant tout await : un seul stream attach
        // par serveur, quel que soit N
        {
            let mut tasks = self.log_tasks.lock();
            if tasks.contains_key(server_id) {
                return Ok(());
            }
            tasks.insert(server_id.to_string(), None);
        }

        let attached = async {
            let docker = self.docker.client_for(&node)?;
            let options = AttachContainerOptionsBuilder::new()
                .stream(true)
                .stdout(true)
                .stderr(true)
                .logs(false) // uniquement les nouvelles lignes
                .build();
            docker
                .attach_container(&container_id, Some(options))
                .await
                .map_err(|e| ControlError::Stream(e.to_string()))
        }
        .await;

        let results = match attached {
            Ok(results) => results,
            Err(e) => {
                // rollback complet : ni réservation ni observateur fantôme
                self.log_tasks.lock().remove(server_id);
                self.remove_observer(server_id, &observer);
                return Err(e);
            }
        };

        let handle = tokio::spawn(run_log_stream(
            results.output,
            self.subscribers.clone(),
            self.log_tasks.clone(),
            server_id.to_string(),
            self.classify,
        ));
        self.log_tasks.lock().insert(server_id.to_string(), Some(handle));
        Ok(())
    }

    fn remove_observer(&self, server_id: &str, observer: &Uuid) {
        let mut map = self.subscribers.lock();
        if let Some(observers) = map.get_mut(server_id) {
            observers.remove(observer);
            if observers.is_empty() {
                map.remove(server_id);
            }
        }
    }

    /// Retire un observateur ; dernier parti = destruction du stream.
    pub fn unsubscribe(&self, server_id: &str, observer: &Uuid) {
        let now_empty = {
            let mut map = self.subscribers.lock();
            match map.get_mut(server_id) {
                Some(observers) => {
                    observers.remove(observer);
                    if observers.is_empty() {
                        map.remove(server_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if now_empty {
            if let Some(Some(handle)) = self.log_tasks.lock().remove(server_id) {
                handle.abort();
            }
        }
    }

    /// Injecte une commande dans la console du conteneur. Refus d'accès =
    /// ServerNotFound (fail closed). Le stream stdin est créé une fois puis
    /// réutilisé ; l'écriture est bornée par le timeout configuré et
    /// sérialisée par serveur uniquement.
    pub async fn send_command(
        &self,
        server_id: &str,
        command: &str,
        actor: &Actor,
    ) -> Result<(), ControlError> {
        let Some(server) = self.servers.get(server_id).await else {
            return Err(ControlError::ServerNotFound);
        };
        if !actor.can_access(server_id) {
            return Err(ControlError::ServerNotFound);
        }
        let container_id = server.container_id.clone().ok_or(ControlError::ContainerMissing)?;
        if server.status != ServerStatus::Running {
            return Err(ControlError::NotRunning);
        }
        let node = self.nodes.get(&server.node_id).await.ok_or(ControlError::NodeNotFound)?;

        // verrou par serveur : un conteneur qui ne lit plus son stdin ne
        // bloque que les commandes de ce serveur
        let entry: CommandInput = self
            .command_inputs
            .lock()
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone();
        let mut input = entry.lock().await;

        if input.is_none() {
            let docker = self.docker.client_for(&node)?;
            let options = AttachContainerOptionsBuilder::new()
                .stream(true)
                .stdin(true)
                .stdout(true)
                .stderr(true)
                .build();
            let results = docker
                .attach_container(&container_id, Some(options))
                .await
                .map_err(|e| ControlError::Stream(e.to_string()))?;

            let mut output = results.output;
            let subscribers = self.subscribers.clone();
            let command_tasks = self.command_tasks.clone();
            let command_inputs = self.command_inputs.clone();
            let classify = self.classify;
            let sid = server_id.to_string();

            // la sortie produite par les commandes repasse par le fan-out
            // ordinaire, puis teardown sur end/error
            let handle = tokio::spawn(async move {
                while let Some(item) = output.next().await {
                    match item {
                        Ok(chunk) => {
                            dispatch_chunk(&subscribers, &sid, &chunk.to_string(), classify);
                        }
                        Err(e) => {
                            eprintln!("[streamer] command stream error for server {sid}: {e}");
                            break;
                        }
                    }
                }
                println!("[streamer] command stream ended for server {sid}");
                command_tasks.lock().remove(&sid);
                command_inputs.lock().remove(&sid);
            });

            self.command_tasks.lock().insert(server_id.to_string(), Some(handle));
            *input = Some(results.input);
        }

        let Some(writer) = input.as_mut() else {
            return Err(ControlError::Stream("command stream could not be initialized".into()));
        };

        let payload = format!("{command}\n");
        let write = async {
            writer.write_all(payload.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.command_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // écriture morte : on jette le stream, il sera recréé
                *input = None;
                self.command_inputs.lock().remove(server_id);
                if let Some(Some(handle)) = self.command_tasks.lock().remove(server_id) {
                    handle.abort();
                }
                Err(ControlError::Stream(e.to_string()))
            }
            Err(_) => Err(ControlError::Stream("command write timed out".into())),
        }
    }

    /// Teardown complet d'un serveur (stop/delete). Idempotent : supprimer
    /// une clé absente est un no-op.
    pub async fn teardown(&self, server_id: &str) {
        if let Some(Some(handle)) = self.log_tasks.lock().remove(server_id) {
            handle.abort();
        }
        if let Some(Some(handle)) = self.command_tasks.lock().remove(server_id) {
            handle.abort();
        }
        self.subscribers.lock().remove(server_id);
        self.command_inputs.lock().remove(server_id);
    }

    #[cfg(test)]
    fn subscriber_count(&self, server_id: &str) -> usize {
        self.subscribers.lock().get(server_id).map_or(0, |s| s.len())
    }

    #[cfg(test)]
    fn broadcast_test(&self, server_id: &str, event: StreamEvent) {
        broadcast(&self.subscribers, server_id, event);
    }
}

pub type SharedLogStreamer = Arc<LogStreamer>;

/// Task de lecture unique d'un serveur : chaque chunk part dans le fan-out,
/// une erreur de stream est diffusée aux abonnés restants, end/error
/// détruit la session. Générique sur le stream pour rester testable sans
/// daemon.
async fn run_log_stream<S, C, E>(
    mut output: S,
    subscribers: Shared<SubscribersMap>,
    log_tasks: Shared<TasksMap>,
    server_id: String,
    classify: fn(&str) -> LogKind,
) where
    S: Stream<Item = Result<C, E>> + Unpin,
    C: ToString,
    E: std::fmt::Display,
{
    while let Some(item) = output.next().await {
        match item {
            Ok(chunk) => {
                dispatch_chunk(&subscribers, &server_id, &chunk.to_string(), classify);
            }
            Err(e) => {
                eprintln!("[streamer] log stream error for server {server_id}: {e}");
                broadcast(
                    &subscribers,
                    &server_id,
                    StreamEvent::Error { server_id: server_id.clone(), reason: e.to_string() },
                );
                break;
            }
        }
    }
    println!("[streamer] log stream ended for server {server_id}");
    log_tasks.lock().remove(&server_id);
    subscribers.lock().remove(&server_id);
}

/// Diffuse aux abonnés courants ; les senders morts sont purgés au passage.
fn broadcast(subscribers: &Shared<SubscribersMap>, server_id: &str, event: StreamEvent) {
    let mut map = subscribers.lock();
    if let Some(observers) = map.get_mut(server_id) {
        observers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

fn dispatch_chunk(
    subscribers: &Shared<SubscribersMap>,
    server_id: &str,
    text: &str,
    classify: fn(&str) -> LogKind,
) {
    for line in chunk_lines(text) {
        let log = ConsoleLog {
            timestamp: now_unix_ms(),
            message: line.to_string(),
            kind: classify(line),
        };
        broadcast(subscribers, server_id, StreamEvent::Log { server_id: server_id.to_string(), log });
    }
}

pub(crate) fn chunk_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|line| !line.is_empty())
}

/// Sévérité par mots-clés. Approximatif par nature : volontairement une
/// fonction pure pour pouvoir en brancher une autre.
pub(crate) fn classify_line(line: &str) -> LogKind {
    let lower = line.to_lowercase();
    if lower.contains("error") || lower.contains("exception") || lower.contains("fatal") {
        LogKind::Error
    } else if lower.contains("warn") {
        LogKind::Warn
    } else if lower.contains("[system]") || lower.contains("[server]") {
        LogKind::System
    } else {
        LogKind::Info
    }
}
