use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Client, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use super::{Agent, ControlError, TaskResult, Website};

/// The control plane the agent reports to
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Sites this agent should register adapters for
    async fn websites(&self) -> Result<Vec<Website>, ControlError>;

    /// Look up the active agent registered under `name` at `ip_address`
    async fn resolve_agent(&self, name: &str, ip_address: &str) -> Result<Agent, ControlError>;

    async fn heartbeat(&self, agent_id: Uuid) -> Result<(), ControlError>;

    async fn is_agent_active(&self, agent_id: Uuid) -> Result<bool, ControlError>;

    /// Record the outcome of a task
    async fn report(&self, result: &TaskResult) -> Result<(), ControlError>;
}

/// Control plane reached over its REST API
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
}

impl HttpControlPlane {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, ControlError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        if !api_key.is_empty() {
            let value = HeaderValue::from_str(api_key)
                .map_err(|e| ControlError::Config(format!("invalid API key: {}", e)))?;
            headers.insert(HeaderName::from_static("api-key"), value);
        }

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Turn a non-2xx response into [`ControlError::Status`], keeping the body
async fn check_status(response: Response) -> Result<Response, ControlError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ControlError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn websites(&self) -> Result<Vec<Website>, ControlError> {
        let response = self.client.get(self.endpoint("/api/websites")).send().await?;
        let websites = check_status(response).await?.json::<Vec<Website>>().await?;
        debug!("Control API returned {} websites", websites.len());
        Ok(websites)
    }

    async fn resolve_agent(&self, name: &str, ip_address: &str) -> Result<Agent, ControlError> {
        let response = self
            .client
            .get(self.endpoint("/api/agents"))
            .query(&[("only_active", "true"), ("ip_address", ip_address), ("name", name)])
            .send()
            .await?;

        let mut agents = check_status(response).await?.json::<Vec<Agent>>().await?;
        if agents.len() != 1 {
            return Err(ControlError::AgentCount(agents.len()));
        }
        Ok(agents.remove(0))
    }

    async fn heartbeat(&self, agent_id: Uuid) -> Result<(), ControlError> {
        let response = self
            .client
            .post(self.endpoint(&format!("/api/agents/{}/heartbeat", agent_id)))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn is_agent_active(&self, agent_id: Uuid) -> Result<bool, ControlError> {
        let response = self
            .client
            .get(self.endpoint(&format!("/api/agents/{}", agent_id)))
            .send()
            .await?;
        let agent = check_status(response).await?.json::<Agent>().await?;
        Ok(agent.is_active)
    }

    async fn report(&self, result: &TaskResult) -> Result<(), ControlError> {
        let response = self
            .client
            .post(self.endpoint("/api/task-results"))
            .json(result)
            .send()
            .await?;
        check_status(response).await?;
        debug!("Reported result for task {}", result.task_id);
        Ok(())
    }
}

/// Stand-in used when no control API is configured
pub struct DetachedControlPlane {
    websites: Vec<Website>,
}

impl DetachedControlPlane {
    pub fn new(websites: Vec<Website>) -> Self {
        Self { websites }
    }
}

#[async_trait]
impl ControlPlane for DetachedControlPlane {
    async fn websites(&self) -> Result<Vec<Website>, ControlError> {
        Ok(self.websites.clone())
    }

    async fn resolve_agent(&self, name: &str, ip_address: &str) -> Result<Agent, ControlError> {
        Ok(Agent {
            id: Uuid::new_v4(),
            name: name.to_string(),
            ip_address: ip_address.to_string(),
            is_active: true,
        })
    }

    async fn heartbeat(&self, _agent_id: Uuid) -> Result<(), ControlError> {
        Ok(())
    }

    async fn is_agent_active(&self, _agent_id: Uuid) -> Result<bool, ControlError> {
        Ok(true)
    }

    async fn report(&self, result: &TaskResult) -> Result<(), ControlError> {
        info!(
            task_id = %result.task_id,
            status = ?result.status,
            "Task finished: {}",
            result.message
        );
        Ok(())
    }
}

/// Send a heartbeat every `interval` until `shutdown` flips to true
pub async fn heartbeat_loop(
    control: Arc<dyn ControlPlane>,
    agent_id: Uuid,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = control.heartbeat(agent_id).await {
                    error!("Error sending heartbeat: {}", e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Heartbeat loop stopped");
}
