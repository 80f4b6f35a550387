//! The connection state machine.
//!
//! One task drives the source connection through
//! `Connecting → Authenticating → Subscribing → Priming → Streaming`.
//! Every stage returns a [`StageError`] on any deviation from the protocol;
//! all of them funnel into the same failure path, which releases the
//! session, notifies the runtime once per failure episode and retries after
//! `retry_delay` until [`HassPlugin::stop`] is called.

use crate::channel::EventChannel;
use crate::client::{Fetch, FetchError, HassClient, error_chain};
use crate::config::{ConfigError, PluginConfig};
use crate::dispatch::dispatch;
use crate::runtime::{PluginStarted, Runtime};
use crate::tls::TlsOptions;
use hassbridge_core::{ConnectionState, Frame, Metadata, OutboundFrame, Snapshot};
use rustls::ClientConfig;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

/// Why a connection attempt ended.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("cannot connect to {url}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("socket error")]
    Socket(#[from] tungstenite::Error),
    #[error("session closed by Home Assistant")]
    Closed,
    #[error("undecodable frame")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected binary frame")]
    BinaryFrame,
    #[error("Home Assistant requires authentication and none provided in plugin config")]
    MissingCredential,
    #[error("error in authentication: got {0}")]
    AuthRejected(&'static str),
    #[error("unable to subscribe to events, id = {0}")]
    SubscribeRejected(u64),
    #[error("unexpected {kind} frame from Home Assistant, id = {expected}")]
    UnexpectedFrame { expected: u64, kind: &'static str },
    #[error("error getting metadata or state")]
    Prime(#[from] FetchError),
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("stop requested")]
    Stopped,
}

impl StageError {
    /// Configuration problems that a retry will not fix by itself.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::MissingCredential | Self::Config(_))
    }
}

/// Cancels a running [`HassPlugin`] from anywhere.
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// State carried by the driving task across attempts.
#[derive(Debug)]
struct MachineContext {
    /// Subscribe id of the current attempt; bumped once per attempt.
    request_id: u64,
    /// No started notification has been sent yet.
    first_time: bool,
    /// The stopped notification for the current failure episode went out.
    already_notified: bool,
}

impl MachineContext {
    fn new() -> Self {
        Self {
            request_id: 0,
            first_time: true,
            already_notified: false,
        }
    }
}

/// A source connection to one Home Assistant instance.
pub struct HassPlugin<R, F = HassClient> {
    name: String,
    config: PluginConfig,
    websocket_url: String,
    tls: Option<Arc<ClientConfig>>,
    fetcher: F,
    runtime: Arc<R>,
    stop: CancellationToken,
    state: watch::Sender<ConnectionState>,
    metadata: RwLock<Option<Metadata>>,
}

impl<R: Runtime> HassPlugin<R> {
    /// Create a plugin that primes connections through the REST API.
    pub fn new(
        name: impl Into<String>,
        config: PluginConfig,
        runtime: Arc<R>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let tls = TlsOptions::from_config(&config)?;
        let client = HassClient::with_tls(name.clone(), &config, &tls)?;
        Self::build(name, config, &tls, client, runtime)
    }

    /// The REST client, for best-effort service calls.
    pub fn client(&self) -> &HassClient {
        &self.fetcher
    }
}

impl<R: Runtime, F: Fetch> HassPlugin<R, F> {
    /// Create a plugin with a custom priming source.
    pub fn with_fetcher(
        name: impl Into<String>,
        config: PluginConfig,
        fetcher: F,
        runtime: Arc<R>,
    ) -> Result<Self, ConfigError> {
        let tls = TlsOptions::from_config(&config)?;
        Self::build(name.into(), config, &tls, fetcher, runtime)
    }

    fn build(
        name: String,
        config: PluginConfig,
        tls: &TlsOptions,
        fetcher: F,
        runtime: Arc<R>,
    ) -> Result<Self, ConfigError> {
        tracing::info!("{}: HASS plugin initializing", name);
        config.validate()?;
        if config.token.is_none() && config.ha_key.is_some() {
            tracing::warn!(
                "{}: ha_key is deprecated, please use HASS long-lived tokens instead",
                name
            );
        }

        let websocket_url = config.websocket_url()?;
        let tls = tls.client_config()?;
        let (state, _) = watch::channel(ConnectionState::Idle);

        tracing::info!("{}: HASS plugin initialization complete", name);
        Ok(Self {
            name,
            config,
            websocket_url,
            tls,
            fetcher,
            runtime,
            stop: CancellationToken::new(),
            state,
            metadata: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Metadata fetched by the most recent successful priming.
    pub async fn metadata(&self) -> Option<Metadata> {
        self.metadata.read().await.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Whether events are currently being forwarded.
    pub fn is_streaming(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    /// Request a stop. A blocked read or a pending delay ends immediately and
    /// [`run`](Self::run) returns without retrying.
    pub fn stop(&self) {
        self.verbose("*** Stopping ***");
        self.stop.cancel();
    }

    /// Drive the connection until stopped.
    pub async fn run(&self) {
        let mut ctx = MachineContext::new();

        while !self.stop.is_cancelled() {
            ctx.request_id += 1;
            let Err(error) = self.attempt(&mut ctx).await;

            self.set_state(ConnectionState::Failed);
            if !ctx.already_notified {
                self.runtime
                    .plugin_stopped(&self.name, &self.config.namespace)
                    .await;
                ctx.already_notified = true;
            }

            if self.stop.is_cancelled() || matches!(error, StageError::Stopped) {
                break;
            }
            self.report(&error);

            tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                () = tokio::time::sleep(self.config.retry_delay) => {}
            }
        }

        self.set_state(ConnectionState::Idle);
        tracing::info!("{}: disconnecting from Home Assistant", self.name);
    }

    /// One connection attempt. Only ever ends in an error.
    async fn attempt(&self, ctx: &mut MachineContext) -> Result<Infallible, StageError> {
        self.set_state(ConnectionState::Connecting);
        let mut channel =
            EventChannel::open(&self.websocket_url, self.tls.clone(), self.config.timeout).await?;

        let result = self.drive(&mut channel, ctx).await;
        channel.close().await;
        result
    }

    async fn drive(
        &self,
        channel: &mut EventChannel,
        ctx: &mut MachineContext,
    ) -> Result<Infallible, StageError> {
        self.set_state(ConnectionState::Authenticating);
        self.authenticate(channel).await?;

        self.set_state(ConnectionState::Subscribing);
        self.subscribe(channel, ctx.request_id).await?;

        self.set_state(ConnectionState::Priming);
        let (metadata, snapshot) = self.prime().await?;
        self.app_init_delay().await?;

        self.runtime
            .plugin_started(PluginStarted {
                name: self.name.clone(),
                namespace: self.config.namespace.clone(),
                metadata,
                snapshot,
                first_time: ctx.first_time,
            })
            .await;
        ctx.first_time = false;
        ctx.already_notified = false;

        self.set_state(ConnectionState::Streaming);
        self.stream(channel, ctx.request_id).await
    }

    async fn authenticate(&self, channel: &mut EventChannel) -> Result<(), StageError> {
        let first = channel.recv(&self.stop).await?;
        tracing::info!(
            "{}: connected to Home Assistant {}",
            self.name,
            first.ha_version().unwrap_or("(unknown version)")
        );

        if !matches!(first, Frame::AuthRequired { .. }) {
            return Ok(());
        }

        let credential = self
            .config
            .credential()
            .ok_or(StageError::MissingCredential)?;
        channel.send(&OutboundFrame::auth(&credential)).await?;

        match channel.recv(&self.stop).await? {
            Frame::AuthOk { .. } => Ok(()),
            other => {
                tracing::warn!("{}: error in authentication", self.name);
                Err(StageError::AuthRejected(other.kind()))
            }
        }
    }

    async fn subscribe(&self, channel: &mut EventChannel, id: u64) -> Result<(), StageError> {
        channel.send(&OutboundFrame::subscribe(id)).await?;
        self.verbose(format_args!("subscribed to events, id = {id}"));

        match channel.recv(&self.stop).await? {
            Frame::Result {
                id: result_id,
                success: true,
                ..
            } if result_id == id => Ok(()),
            other => {
                tracing::warn!("{}: unable to subscribe to HA events: {:?}", self.name, other);
                Err(StageError::SubscribeRejected(id))
            }
        }
    }

    async fn prime(&self) -> Result<(Metadata, Snapshot), StageError> {
        let metadata = self.fetcher.metadata().await?;
        let snapshot = self.fetcher.snapshot().await?;
        tracing::debug!("{}: got state for {} entities", self.name, snapshot.len());

        *self.metadata.write().await = Some(metadata.clone());
        Ok((metadata, snapshot))
    }

    async fn app_init_delay(&self) -> Result<(), StageError> {
        let delay = self.config.app_init_delay;
        if delay.is_zero() {
            return Ok(());
        }

        tracing::info!(
            "{}: delaying app initialization for {} seconds",
            self.name,
            delay.as_secs_f64()
        );
        tokio::select! {
            biased;
            () = self.stop.cancelled() => Err(StageError::Stopped),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn stream(&self, channel: &mut EventChannel, id: u64) -> Result<Infallible, StageError> {
        loop {
            match channel.recv(&self.stop).await? {
                Frame::Event {
                    id: event_id,
                    event,
                } if event_id == id => {
                    self.verbose(format_args!("event: {event}"));
                    dispatch(&*self.runtime, &self.config.namespace, event).await;
                }
                other => {
                    tracing::warn!(
                        "{}: unexpected result from Home Assistant, id = {}: {:?}",
                        self.name,
                        id,
                        other
                    );
                    return Err(StageError::UnexpectedFrame {
                        expected: id,
                        kind: other.kind(),
                    });
                }
            }
        }
    }

    fn report(&self, error: &StageError) {
        if error.is_config() {
            tracing::error!("{}: {}", self.name, error_chain(error));
        }
        tracing::warn!(
            "{}: disconnected from Home Assistant, retrying in {} seconds",
            self.name,
            self.config.retry_delay.as_secs_f64()
        );
        tracing::debug!("{}: {}", self.name, error_chain(error));
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::trace!("{}: {} -> {}", self.name, previous, state);
        }
    }

    fn verbose(&self, text: impl std::fmt::Display) {
        if self.config.verbose {
            tracing::info!("{}: {}", self.name, text);
        }
    }
}
