/// Client for the remote rig-management service.
///
/// Every request goes to `<api_base>/<resource>.php?token=<access_key>&worker=<worker_id>`.
use crate::catalog::{MinerCatalog, MinerDescriptor};
use crate::config::IdentityConfig;
use reqwest::Url;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// An instruction fetched from the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteCommand {
    /// Miner the service wants running, if any.
    pub coin: Option<MinerDescriptor>,
}

/// What the core needs from the remote service.
pub trait RemoteClient: Send + Sync + 'static {
    /// Ship collected miner output. Logs the outcome; never fails the caller.
    fn send_telemetry(&self, data: &str) -> impl Future<Output = ()> + Send;

    /// Ask the service what to do next.
    fn fetch_remote_command(
        &self,
    ) -> impl Future<Output = Result<Option<RemoteCommand>, RemoteError>> + Send;

    /// Query the service's algorithm profitability endpoints.
    fn check_algorithms(&self) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// Wire shape of the control endpoint's response.
#[derive(Debug, Deserialize)]
struct CommandPayload {
    #[serde(default)]
    coin: Option<String>,
}

/// Extract the requested coin name from a control response body.
fn parse_command(body: &str) -> Result<Option<Option<String>>, RemoteError> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(None);
    }
    let payload: CommandPayload =
        serde_json::from_str(body).map_err(|e| RemoteError::Decode { source: e })?;
    let coin = payload.coin.filter(|name| !name.trim().is_empty());
    Ok(Some(coin))
}

/// `RemoteClient` over HTTP.
pub struct HttpRemote {
    client: reqwest::Client,
    base: Url,
    access_key: String,
    worker_id: String,
    catalog: Arc<dyn MinerCatalog>,
}

impl HttpRemote {
    pub fn new(
        identity: &IdentityConfig,
        timeout: Duration,
        catalog: Arc<dyn MinerCatalog>,
    ) -> Result<Self, RemoteError> {
        let base = Url::parse(&identity.api_base)
            .map_err(|e| RemoteError::Url(format!("{}: {e}", identity.api_base)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Http { source: e })?;
        Ok(Self {
            client,
            base,
            access_key: identity.access_key.clone(),
            worker_id: identity.worker_id.clone(),
            catalog,
        })
    }

    /// Full URL for a resource, with the identity query parameters.
    fn url(&self, resource: &str) -> Result<Url, RemoteError> {
        let mut url = self
            .base
            .join(&format!("{resource}.php"))
            .map_err(|e| RemoteError::Url(format!("{resource}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("token", &self.access_key)
            .append_pair("worker", &self.worker_id);
        Ok(url)
    }

    async fn read_body(
        resource: &str,
        response: reqwest::Response,
    ) -> Result<String, RemoteError> {
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                resource: resource.to_string(),
                status: status.as_u16(),
            });
        }
        response
            .text()
            .await
            .map_err(|e| RemoteError::Http { source: e })
    }

    async fn get(&self, resource: &str) -> Result<String, RemoteError> {
        let url = self.url(resource)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RemoteError::Http { source: e })?;
        Self::read_body(resource, response).await
    }

    async fn post_telemetry(&self, data: &str) -> Result<(), RemoteError> {
        let url = self.url("getstat")?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "mes": data }))
            .send()
            .await
            .map_err(|e| RemoteError::Http { source: e })?;
        Self::read_body("getstat", response).await.map(|_| ())
    }
}

impl RemoteClient for HttpRemote {
    async fn send_telemetry(&self, data: &str) {
        match self.post_telemetry(data).await {
            Ok(()) => {
                tracing::info!("telemetry sent");
                tracing::debug!(bytes = data.len(), "telemetry payload: {data}");
            }
            Err(e) => tracing::warn!(error = %e, "failed to send telemetry"),
        }
    }

    async fn fetch_remote_command(&self) -> Result<Option<RemoteCommand>, RemoteError> {
        let body = self.get("control").await?;
        let Some(coin) = parse_command(&body)? else {
            return Ok(None);
        };
        let coin = match coin {
            Some(name) => match self.catalog.find(&name) {
                Some(miner) => Some(miner),
                None => {
                    tracing::warn!(coin = %name, "remote requested an unknown miner, ignoring");
                    None
                }
            },
            None => None,
        };
        Ok(Some(RemoteCommand { coin }))
    }

    async fn check_algorithms(&self) -> Result<(), RemoteError> {
        let (best_text, best, dual) = tokio::try_join!(
            self.get("bestquerytext"),
            self.get("bestquery"),
            self.get("dualresponse"),
        )?;
        tracing::debug!(
            bestquerytext = %best_text,
            bestquery = %best,
            dualresponse = %dual,
            "algorithm check"
        );
        Ok(())
    }
}

/// Errors from talking to the remote service.
#[derive(Debug)]
pub enum RemoteError {
    /// The request URL could not be built.
    Url(String),
    /// Transport failure (connect, timeout, body read).
    Http { source: reqwest::Error },
    /// The service answered with a non-success status.
    Status { resource: String, status: u16 },
    /// The response body was not the expected JSON.
    Decode { source: serde_json::Error },
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::Url(msg) => write!(f, "invalid remote URL: {msg}"),
            RemoteError::Http { source } => write!(f, "remote request failed: {source}"),
            RemoteError::Status { resource, status } => {
                write!(f, "remote {resource} returned HTTP {status}")
            }
            RemoteError::Decode { source } => write!(f, "bad remote response: {source}"),
        }
    }
}

impl std::error::Error for RemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RemoteError::Url(_) | RemoteError::Status { .. } => None,
            RemoteError::Http { source } => Some(source),
            RemoteError::Decode { source } => Some(source),
        }
    }
}
