//! A small round-robin pool of Docker client connections (spec.md §4.J),
//! health-checked on an interval so a wedged connection is dropped and
//! redialed rather than silently serving every request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bollard::Docker;
use snafu::{ResultExt, Snafu};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Snafu)]
pub enum PoolError {
    #[snafu(display("failed to connect to docker socket {}: {}", socket_path, source))]
    Connect { socket_path: String, source: bollard::errors::Error },
    #[snafu(display("docker connection pool is empty"))]
    Empty,
}

struct Member {
    client: Docker,
    healthy: bool,
}

pub struct ContainerClientPool {
    socket_path: String,
    members: RwLock<Vec<Member>>,
    next: AtomicUsize,
    health_check_interval: Duration,
}

impl ContainerClientPool {
    pub async fn connect(socket_path: &str, size: usize, health_check_interval: Duration) -> Result<Self, PoolError> {
        let mut members = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            let client = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .context(ConnectSnafu { socket_path })?;
            members.push(Member { client, healthy: true });
        }
        Ok(Self {
            socket_path: socket_path.to_string(),
            members: RwLock::new(members),
            next: AtomicUsize::new(0),
            health_check_interval,
        })
    }

    /// Returns a client chosen round-robin among healthy members.
    pub async fn acquire(&self) -> Result<Docker, PoolError> {
        let members = self.members.read().await;
        let healthy_count = members.iter().filter(|m| m.healthy).count();
        if healthy_count == 0 {
            return Err(PoolError::Empty);
        }
        let len = members.len();
        loop {
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % len;
            if members[idx].healthy {
                return Ok(members[idx].client.clone());
            }
        }
    }

    /// Pings every member and marks unhealthy ones; redials on failure.
    pub async fn check_health(&self) {
        let mut members = self.members.write().await;
        for member in members.iter_mut() {
            match member.client.ping().await {
                Ok(_) => member.healthy = true,
                Err(err) => {
                    warn!(error = %err, "docker pool member unhealthy, redialing");
                    member.healthy = false;
                    if let Ok(client) =
                        Docker::connect_with_socket(&self.socket_path, 120, bollard::API_DEFAULT_VERSION)
                    {
                        member.client = client;
                    }
                }
            }
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        self.health_check_interval
    }
}
