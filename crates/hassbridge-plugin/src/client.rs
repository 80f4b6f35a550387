//! HTTP surface of the remote service.
//!
//! Metadata and snapshot reads are state-critical: their errors are returned
//! so the connection can retry. Service calls are best-effort: failures are
//! logged and the call yields no result.

use crate::config::{ConfigError, PluginConfig};
use crate::tls::TlsOptions;
use hassbridge_core::{
    Credential, Metadata, MetadataError, ServiceName, ServiceNameError, Snapshot, SnapshotError,
};
use serde_json::Value;
use std::future::Future;

/// Reads used to prime a connection.
pub trait Fetch: Send + Sync + 'static {
    /// Fetch and validate the service metadata.
    fn metadata(&self) -> impl Future<Output = Result<Metadata, FetchError>> + Send;
    /// Fetch every entity state, keyed by entity id.
    fn snapshot(&self) -> impl Future<Output = Result<Snapshot, FetchError>> + Send;
}

/// Client for the service's REST API.
#[derive(Debug, Clone)]
pub struct HassClient {
    name: String,
    base_url: String,
    credential: Option<Credential>,
    verbose: bool,
    http: reqwest::Client,
}

impl HassClient {
    pub fn new(name: impl Into<String>, config: &PluginConfig) -> Result<Self, ConfigError> {
        let tls = TlsOptions::from_config(config)?;
        Self::with_tls(name, config, &tls)
    }

    /// Build a client reusing already-loaded TLS options.
    pub fn with_tls(
        name: impl Into<String>,
        config: &PluginConfig,
        tls: &TlsOptions,
    ) -> Result<Self, ConfigError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = tls
            .apply(builder)?
            .build()
            .map_err(ConfigError::HttpClient)?;

        Ok(Self {
            name: name.into(),
            base_url: config.base_url().to_string(),
            credential: config.credential(),
            verbose: config.verbose,
            http,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("{}: {} {}", self.name, method, url);
        let request = self.http.request(method, url);
        match &self.credential {
            Some(credential) => {
                let (header, value) = credential.header();
                request.header(header, value)
            }
            None => request,
        }
    }

    /// `GET /api/config`, validated.
    pub async fn get_config(&self) -> Result<Metadata, FetchError> {
        let raw: Value = self
            .request(reqwest::Method::GET, "/api/config")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Metadata::validate(raw).map_err(|e| {
            tracing::warn!("{}: {} - retrying", self.name, e);
            FetchError::Metadata(e)
        })
    }

    /// `GET /api/states`, or `GET /api/states/{entity_id}` for one entity.
    pub async fn get_state(&self, entity_id: Option<&str>) -> Result<Value, FetchError> {
        let path = match entity_id {
            Some(id) => format!("/api/states/{id}"),
            None => "/api/states".to_string(),
        };
        let value = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(value)
    }

    /// Fetch the full state list and flatten it into a [`Snapshot`].
    pub async fn complete_state(&self) -> Result<Snapshot, FetchError> {
        let states = self.get_state(None).await?;
        let snapshot = Snapshot::from_value(states)?;
        tracing::debug!("{}: got state for {} entities", self.name, snapshot.len());
        if self.verbose {
            tracing::info!("{}: complete state: {:?}", self.name, snapshot);
        }
        Ok(snapshot)
    }

    /// `POST /api/services/{domain}/{service}` with `data` as the body.
    ///
    /// A malformed service name is rejected before any request is made.
    /// Otherwise this never fails: a transport error, an error status or an
    /// undecodable body is logged and yields `Ok(None)`, meaning the outcome
    /// is unknown.
    pub async fn call_service(
        &self,
        service: &str,
        data: Value,
    ) -> Result<Option<Value>, ServiceNameError> {
        let name: ServiceName = service.parse()?;
        tracing::debug!("{}: call_service: {}, {}", self.name, name, data);

        let response = self
            .request(reqwest::Method::POST, &name.api_path())
            .json(&data)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    "{}: unexpected error during call_service({}): {}",
                    self.name,
                    name,
                    error_chain(&e)
                );
                return Ok(None);
            }
        };

        match response.json::<Value>().await {
            Ok(body) => Ok(Some(body)),
            Err(e) => {
                tracing::warn!(
                    "{}: undecodable response from call_service({}): {}",
                    self.name,
                    name,
                    error_chain(&e)
                );
                Ok(None)
            }
        }
    }
}

impl Fetch for HassClient {
    async fn metadata(&self) -> Result<Metadata, FetchError> {
        self.get_config().await
    }

    async fn snapshot(&self) -> Result<Snapshot, FetchError> {
        self.complete_state().await
    }
}

/// A failed state-critical read.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed")]
    Http(#[from] reqwest::Error),
    #[error("invalid metadata")]
    Metadata(#[from] MetadataError),
    #[error("invalid state list")]
    Snapshot(#[from] SnapshotError),
}

/// Render an error with all of its sources, `outer: inner: ...`.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
