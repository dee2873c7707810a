//! Container monitor (spec.md §4.J): discovers containers via a one-time
//! startup listing plus an ongoing Docker event stream, and follows each
//! matched container's log stream.

mod filter;
mod framing;
mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use bollard::container::LogsOptions;
use bollard::system::EventsOptions;
use dashmap::DashMap;
use futures_util::StreamExt;
use logbeam_core::entry::SourceKind;
use logbeam_core::position::ContainerPosition;
use logbeam_core::LogEntry;
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub use filter::{should_monitor, ContainerMeta};
pub use framing::{parse_header, StreamKind};
pub use pool::{ContainerClientPool, PoolError};

use crate::config::ContainerMonitorConfig;

#[derive(Debug, Snafu)]
pub enum ContainerMonitorError {
    #[snafu(display("docker pool error: {source}"))]
    Pool { source: PoolError },
    #[snafu(display("docker api error: {source}"))]
    Docker { source: bollard::errors::Error },
}

/// Tracks live container follow-log tasks and their positions, keyed by
/// container id.
pub struct ContainerMonitor {
    config: ContainerMonitorConfig,
    pool: Arc<ContainerClientPool>,
    positions: Arc<DashMap<String, ContainerPosition>>,
    followed: Arc<DashMap<String, tokio::task::JoinHandle<()>>>,
    sender: mpsc::Sender<LogEntry>,
}

impl ContainerMonitor {
    pub async fn new(config: ContainerMonitorConfig, sender: mpsc::Sender<LogEntry>) -> Result<Self, ContainerMonitorError> {
        let pool = ContainerClientPool::connect(&config.socket_path, config.pool.size, config.pool.health_check_interval)
            .await
            .context(PoolSnafu)?;
        Ok(Self {
            config,
            pool: Arc::new(pool),
            positions: Arc::new(DashMap::new()),
            followed: Arc::new(DashMap::new()),
            sender,
        })
    }

    /// Lists running containers once at startup and begins following any
    /// that match the filter, then hands control to the event-stream loop.
    pub async fn run(&self) -> Result<(), ContainerMonitorError> {
        self.initial_list().await?;
        self.watch_events().await
    }

    async fn initial_list(&self) -> Result<(), ContainerMonitorError> {
        let client = self.pool.acquire().await.context(PoolSnafu)?;
        let containers = client
            .list_containers::<String>(None)
            .await
            .context(DockerSnafu)?;
        for container in containers {
            let id = match &container.id {
                Some(id) => id.clone(),
                None => continue,
            };
            let name = container
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| id.clone());
            let labels = container
                .labels
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect();
            let image = container.image.clone().unwrap_or_default();
            self.maybe_follow(id, name, image, labels).await;
        }
        Ok(())
    }

    async fn watch_events(&self) -> Result<(), ContainerMonitorError> {
        let client = self.pool.acquire().await.context(PoolSnafu)?;
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let mut stream = client.events(Some(EventsOptions::<String> {
            filters,
            ..Default::default()
        }));

        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    error!(error = %err, "docker event stream error");
                    continue;
                }
            };
            let action = event.action.unwrap_or_default();
            let actor = match event.actor {
                Some(actor) => actor,
                None => continue,
            };
            let id = actor.id.unwrap_or_default();
            let attrs = actor.attributes.unwrap_or_default();
            let name = attrs.get("name").cloned().unwrap_or_else(|| id.clone());
            let image = attrs.get("image").cloned().unwrap_or_default();

            match action.as_str() {
                "start" | "unpause" => {
                    let labels: std::collections::BTreeMap<String, String> = attrs.into_iter().collect();
                    self.maybe_follow(id, name, image, labels).await;
                }
                "die" | "stop" | "destroy" | "pause" => {
                    self.stop_following(&id);
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn maybe_follow(&self, id: String, name: String, image: String, labels: std::collections::BTreeMap<String, String>) {
        if self.followed.contains_key(&id) {
            return;
        }
        let meta = ContainerMeta { name: &name, labels: &labels };
        if !should_monitor(&self.config, &meta) {
            debug!(container = %name, "container excluded by filter");
            return;
        }

        self.positions
            .entry(id.clone())
            .or_insert_with(|| ContainerPosition::new(id.clone(), name.clone(), image.clone()));

        let pool = self.pool.clone();
        let positions = self.positions.clone();
        let sender = self.sender.clone();
        let container_id = id.clone();
        let container_name = name.clone();

        info!(container = %container_name, "following container logs");
        let handle = tokio::spawn(async move {
            if let Err(err) = follow_logs(pool, positions, sender, container_id, container_name).await {
                error!(error = %err, "container log follow task ended with error");
            }
        });
        self.followed.insert(id, handle);
    }

    fn stop_following(&self, id: &str) {
        if let Some((_, handle)) = self.followed.remove(id) {
            handle.abort();
            info!(container_id = %id, "stopped following container");
        }
    }
}

async fn follow_logs(
    pool: Arc<ContainerClientPool>,
    positions: Arc<DashMap<String, ContainerPosition>>,
    sender: mpsc::Sender<LogEntry>,
    container_id: String,
    container_name: String,
) -> Result<(), ContainerMonitorError> {
    let client = pool.acquire().await.context(PoolSnafu)?;
    let options = LogsOptions::<String> {
        follow: true,
        stdout: true,
        stderr: true,
        tail: "0".to_string(),
        ..Default::default()
    };
    let mut stream = client.logs(&container_id, Some(options));

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(container = %container_name, error = %err, "container log stream error");
                break;
            }
        };
        let bytes = chunk.into_bytes();
        if bytes.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(&bytes);
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            match LogEntry::new(SourceKind::Container, container_id.clone(), line) {
                Ok(entry) => {
                    if let Some(mut pos) = positions.get_mut(&container_id) {
                        pos.advance(entry.event_timestamp, line.len() as u64);
                    }
                    if sender.send(entry).await.is_err() {
                        return Ok(());
                    }
                }
                Err(err) => warn!(container = %container_name, error = %err, "dropping invalid container log line"),
            }
        }
    }
    Ok(())
}
