//! Stream ingestion.
//!
//! Holds the authenticated long-lived connection to the upstream filtered
//! stream, matches every incoming message against the tracked poll options,
//! and emits one vote event per matching option. The connection is
//! supervised: errors and forced closes end the current cycle, and the loop
//! reconnects after a fixed backoff until told to stop.

pub mod auth;
pub mod decode;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::bus::VoteEvent;
use crate::config::StreamCredentials;
use crate::store::{OptionSource, StoreError};

use auth::RequestSigner;
use decode::StreamDecoder;
use supervisor::ConnectionSupervisor;

/// Delay between connection cycles.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

/// Timeout for establishing the upstream connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a healthy connection is force-closed so the track list and
/// credentials get re-read.
pub const FORCED_CLOSE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("invalid stream endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    #[error("failed to load tracked options: {0}")]
    Options(#[from] StoreError),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("stream decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connection force-closed")]
    Closed,
}

/// The option set tracked for one connection cycle.
///
/// Match keys are lower-cased once per cycle; matching is case-insensitive
/// substring containment against the message text.
pub struct TrackedOptions {
    options: Vec<String>,
    lowered: Vec<String>,
}

impl TrackedOptions {
    pub fn new(options: Vec<String>) -> Self {
        let lowered = options.iter().map(|o| o.to_lowercase()).collect();
        Self { options, lowered }
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// The comma-joined `track` form field value.
    pub fn track_field(&self) -> String {
        self.options.join(",")
    }

    /// Every tracked option found in `text`, in tracked order.
    ///
    /// A message mentioning several options yields one match per option;
    /// this is never collapsed into a single best match.
    pub fn matches<'a>(&'a self, text: &str) -> Vec<&'a str> {
        let lowered_text = text.to_lowercase();
        self.options
            .iter()
            .zip(&self.lowered)
            .filter(|(_, key)| lowered_text.contains(key.as_str()))
            .map(|(option, _)| option.as_str())
            .collect()
    }
}

/// Long-lived client for the upstream filtered stream.
pub struct StreamIngester<S> {
    client: reqwest::Client,
    signer: RequestSigner,
    endpoint: Url,
    source: Arc<S>,
    supervisor: Arc<ConnectionSupervisor>,
    votes: mpsc::UnboundedSender<VoteEvent>,
}

impl<S: OptionSource> StreamIngester<S> {
    /// Construct the ingester, building the HTTP client and signer up front
    /// so nothing is lazily initialized inside the request loop.
    pub fn new(
        endpoint: &str,
        credentials: StreamCredentials,
        source: Arc<S>,
        supervisor: Arc<ConnectionSupervisor>,
        votes: mpsc::UnboundedSender<VoteEvent>,
    ) -> Result<Self, StreamError> {
        // No overall request timeout: the stream is expected to stay open
        // until it errors or is force-closed.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            signer: RequestSigner::new(credentials),
            endpoint: Url::parse(endpoint)?,
            source,
            supervisor,
            votes,
        })
    }

    /// Run connection cycles until the supervisor is stopped.
    ///
    /// The stop flag is only consulted between cycles; an in-flight read is
    /// interrupted by the supervisor's forced close, after which control
    /// comes back here and the flag is seen.
    pub async fn run(&self) {
        loop {
            if self.supervisor.is_stopped() {
                info!("stream ingester stopping");
                return;
            }
            info!("querying upstream stream");
            match self.cycle().await {
                Ok(()) => debug!("stream cycle ended"),
                Err(StreamError::Closed) => info!("stream connection force-closed"),
                Err(e) => warn!(error = %e, "stream cycle failed"),
            }
            debug!(seconds = RECONNECT_BACKOFF.as_secs(), "waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                _ = self.supervisor.stopped() => {}
            }
        }
    }

    /// One connection cycle: reload the tracked options, open the signed
    /// streaming request, and pump matches into the vote channel until the
    /// stream ends, errors, or is force-closed.
    async fn cycle(&self) -> Result<(), StreamError> {
        let options = TrackedOptions::new(self.source.tracked_options().await?);
        if options.is_empty() {
            debug!("no tracked options, skipping cycle");
            return Ok(());
        }

        // Dial through the supervisor so the previous connection is closed
        // first and close_all can interrupt this one.
        let token = self.supervisor.dial_cancellable();

        let track = options.track_field();
        let params = vec![("track".to_string(), track.clone())];
        let authorization = self.signer.authorization("POST", &self.endpoint, &params)?;
        let body = format!("track={}", urlencoding::encode(&track));

        let response = tokio::select! {
            response = self
                .client
                .post(self.endpoint.clone())
                .header(reqwest::header::AUTHORIZATION, authorization)
                .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(body)
                .send() => response?,
            _ = token.cancelled() => return Err(StreamError::Closed),
        };
        if !response.status().is_success() {
            return Err(StreamError::Status(response.status()));
        }

        let mut chunks = response.bytes_stream();
        let mut decoder = StreamDecoder::new();
        loop {
            let chunk = tokio::select! {
                chunk = chunks.next() => chunk,
                _ = token.cancelled() => return Err(StreamError::Closed),
            };
            let chunk = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(StreamError::Request(e)),
                // Upstream closed the stream cleanly.
                None => return Ok(()),
            };
            for message in decoder.feed(&chunk)? {
                for option in options.matches(&message.text) {
                    debug!(option, "vote");
                    if self.votes.send(VoteEvent::new(option)).is_err() {
                        // Receiver gone: the publisher has shut down.
                        return Err(StreamError::Closed);
                    }
                }
            }
        }
    }
}

/// Force the current connection closed once per `interval` so the track
/// list and credentials refresh even on an otherwise-healthy stream.
/// Returns once the supervisor is stopped.
pub async fn force_reconnect_loop(supervisor: Arc<ConnectionSupervisor>, interval: Duration) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = supervisor.stopped() => return,
        }
        supervisor.close_all();
        if supervisor.is_stopped() {
            return;
        }
    }
}
