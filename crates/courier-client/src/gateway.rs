// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Courier Developers. All Rights Reserved.

use crate::{
    Error,
    queue::OfflineQueue,
    retry::RetryPolicy,
    settings::GatewayConfig,
    token::{NoToken, TokenProvider},
    transport::{RequestBody, RequestDescriptor, Response, Transport, is_read_only},
};
use log::{debug, error, warn};
use reqwest::Method;
use serde::{Serialize, de::DeserializeOwned};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use url::Url;

const DEFAULT_ACCEPT: &str = "application/json, text/plain, */*";

/// Online/offline signal shared between the application and the gateway.
///
/// The application flips it from whatever connectivity source it has; the
/// gateway only observes it. Dropping every `Connectivity` clone stops the
/// gateway's listener task.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Connectivity { tx: Arc::new(tx) }
    }

    /// Publishes the current state. Repeating the current value is a no-op.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Request details handed to the [`ErrorReporter`] alongside a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorContext {
    pub request_id: uuid::Uuid,
    pub method: Method,
    pub url: String,
    pub status: Option<u16>,
}

impl ErrorContext {
    fn new(descriptor: &RequestDescriptor, error: &Error) -> Self {
        ErrorContext {
            request_id: descriptor.id(),
            method: descriptor.method().clone(),
            url: descriptor.endpoint().to_owned(),
            status: match error {
                Error::HttpStatus(status) => Some(*status),
                _ => None,
            },
        }
    }
}

/// Receives failures surfaced to callers for operational visibility.
///
/// Client errors (4xx) and cancellations are never reported.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &Error, context: &ErrorContext);
}

/// Reporter writing failures to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, error: &Error, context: &ErrorContext) {
        error!(
            "{} {} failed [{}]: {}",
            context.method, context.url, context.request_id, error
        );
    }
}

/// Issues API calls with standard headers, a per-exchange timeout, bounded
/// retries and offline queueing of mutations.
///
/// The gateway is cheap to clone; clones share the transport, the offline
/// queue and the connectivity signal.
///
/// # Examples
///
/// ```rust,no_run
/// use courier_client::{Connectivity, GatewayConfig, HttpTransport, Method, RequestGateway};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), courier_client::Error> {
/// let connectivity = Connectivity::new(true);
/// let config = GatewayConfig {
///     base_url: Some("https://chat.example".to_owned()),
///     ..GatewayConfig::default()
/// };
/// let gateway = RequestGateway::new(Arc::new(HttpTransport::new()?), config)?
///     .with_connectivity(&connectivity);
/// gateway.spawn_connectivity_listener();
///
/// let resp = gateway
///     .call("/api/rooms/7/messages", Method::POST)
///     .json(&json!({"text": "hello"}))
///     .send()
///     .await?;
/// println!("{:?}", resp.payload());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RequestGateway {
    transport: Arc<dyn Transport>,
    queue: Arc<OfflineQueue>,
    tokens: Arc<dyn TokenProvider>,
    reporter: Arc<dyn ErrorReporter>,
    online: watch::Receiver<bool>,
    retry: RetryPolicy,
    timeout: Duration,
    base_url: Option<Url>,
    csrf_header: String,
    user_agent: String,
}

impl std::fmt::Debug for RequestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGateway")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl RequestGateway {
    /// Creates a gateway that assumes it is always online, sends no
    /// anti-forgery token and reports failures to the log.
    pub fn new(transport: Arc<dyn Transport>, config: GatewayConfig) -> Result<Self, Error> {
        let base_url = config.base_url.as_deref().map(Url::parse).transpose()?;
        let queue = match config.max_queue_len {
            Some(max_len) => OfflineQueue::with_max_len(max_len),
            None => OfflineQueue::new(),
        };

        debug!(
            "Gateway configuration - max_retries={}, retry_delay={:?}, timeout={:?}",
            config.max_retries,
            config.retry_delay(),
            config.timeout()
        );

        Ok(RequestGateway {
            transport,
            queue: Arc::new(queue),
            tokens: Arc::new(NoToken),
            reporter: Arc::new(LogReporter),
            online: Connectivity::new(true).subscribe(),
            retry: config.retry_policy(),
            timeout: config.timeout(),
            base_url,
            csrf_header: config.csrf_header,
            user_agent: config.user_agent,
        })
    }

    /// Follows `connectivity` to decide when mutations must be queued.
    pub fn with_connectivity(mut self, connectivity: &Connectivity) -> Self {
        self.online = connectivity.subscribe();
        self
    }

    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_queue(mut self, queue: Arc<OfflineQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Resolves `endpoint` against the base URL. Absolute URLs pass through.
    pub fn resolve(&self, endpoint: &str) -> Result<String, Error> {
        resolve_endpoint(self.base_url.as_ref(), endpoint)
    }

    /// Issues one logical call.
    ///
    /// Mutations made while offline (or while earlier mutations are still
    /// queued) are parked in the offline queue and this future settles only
    /// when they are replayed.
    pub async fn request(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<RequestBody>,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Response, Error> {
        self.dispatch(endpoint, method, body, headers.unwrap_or_default(), None)
            .await
    }

    /// Starts building a call with optional body, headers and cancellation.
    pub fn call(&self, endpoint: &str, method: Method) -> RequestBuilder<'_> {
        RequestBuilder {
            gateway: self,
            endpoint: endpoint.to_owned(),
            method,
            body: Ok(None),
            headers: BTreeMap::new(),
            cancel: None,
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, Error> {
        self.call(endpoint, Method::GET).send().await?.json()
    }

    pub async fn post_json<B, T>(&self, endpoint: &str, body: &B) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.call(endpoint, Method::POST)
            .json(body)
            .send()
            .await?
            .json()
    }

    #[cfg_attr(feature = "profiling", tracing::instrument(skip(self, body, headers, cancel)))]
    async fn dispatch(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<RequestBody>,
        headers: BTreeMap<String, String>,
        cancel: Option<CancellationToken>,
    ) -> Result<Response, Error> {
        let mut descriptor = self.build_descriptor(endpoint, method, body, headers)?;

        if !is_read_only(descriptor.method()) {
            let admitted = if self.is_online() {
                self.queue.enqueue_if_busy(descriptor)
            } else {
                warn!("Network unavailable, queueing {}", descriptor);
                Ok(self.queue.enqueue(descriptor))
            };
            match admitted {
                Ok(pending) => {
                    // connectivity may have returned before the entry landed
                    if self.is_online() {
                        self.spawn_drain();
                    }
                    return pending.await;
                }
                Err(direct) => descriptor = direct,
            }
        }

        let result = self.execute(&descriptor, cancel.as_ref()).await;
        if let Err(err) = &result {
            self.report(err, &descriptor);
        }
        result
    }

    /// Starts a drain in the background unless one is already running.
    fn spawn_drain(&self) {
        let gateway = self.clone();
        tokio::spawn(async move {
            gateway.on_connectivity_restored().await;
        });
    }

    fn build_descriptor(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<RequestBody>,
        headers: BTreeMap<String, String>,
    ) -> Result<RequestDescriptor, Error> {
        let url = self.resolve(endpoint)?;

        let mut merged = BTreeMap::new();
        merged.insert("accept".to_owned(), DEFAULT_ACCEPT.to_owned());
        merged.insert("user-agent".to_owned(), self.user_agent.clone());
        if let Some(body) = &body {
            merged.insert("content-type".to_owned(), body.content_type().to_owned());
        }
        merged.extend(
            headers
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value)),
        );
        if let Some(token) = self.tokens.csrf_token().filter(|t| !t.is_empty()) {
            merged.insert(self.csrf_header.to_ascii_lowercase(), token);
        }

        Ok(RequestDescriptor::new(url, method, body, merged))
    }

    /// Sends `descriptor` until it succeeds, fails terminally or runs out of
    /// retries. The last error is returned unchanged.
    async fn execute(
        &self,
        descriptor: &RequestDescriptor,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response, Error> {
        let mut attempt = 0;
        loop {
            match self.attempt(descriptor, cancel).await {
                Ok(response) => return Ok(response),
                Err(err) if self.retry.should_retry(&err, descriptor.method(), attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        "{} failed: {}. Retry {}/{} in {:?}",
                        descriptor,
                        err,
                        attempt,
                        self.retry.max_retries(),
                        delay
                    );
                    backoff(delay, cancel).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One exchange raced against the timeout and the caller's token.
    /// Losing the race drops the transport future, which abandons the
    /// exchange.
    async fn attempt(
        &self,
        descriptor: &RequestDescriptor,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response, Error> {
        let exchange = tokio::time::timeout(self.timeout, self.transport.send(descriptor.clone()));
        let outcome = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Canceled),
                outcome = exchange => outcome,
            },
            None => exchange.await,
        };
        outcome.unwrap_or_else(|_| {
            debug!("{} timed out after {:?}", descriptor, self.timeout);
            Err(Error::Timeout)
        })
    }

    fn report(&self, error: &Error, descriptor: &RequestDescriptor) {
        if matches!(error, Error::Canceled) || error.is_client_error() {
            return;
        }
        self.reporter
            .report(error, &ErrorContext::new(descriptor, error));
    }

    /// Replays the offline queue front to back. Returns how many queued
    /// callers were settled.
    ///
    /// A replay failing on the network goes back to the head of the queue and
    /// stops the drain, leaving the order intact for the next restoration.
    /// Any other outcome, success or failure, settles the original caller.
    /// Calling this while a drain is already running does nothing.
    pub async fn on_connectivity_restored(&self) -> usize {
        if !self.queue.begin_drain() {
            debug!("Offline queue drain already running");
            return 0;
        }

        let mut settled = 0;
        while let Some(queued) = self.queue.next_for_replay() {
            debug!("Replaying {}", queued.descriptor());
            match self.execute(queued.descriptor(), None).await {
                Err(err) if err.is_network() => {
                    warn!(
                        "Replay of {} failed: {}. Keeping {} request(s) queued",
                        queued.descriptor(),
                        err,
                        self.queue.len() + 1
                    );
                    self.queue.requeue_front(queued);
                    break;
                }
                outcome => {
                    if let Err(err) = &outcome {
                        self.report(err, queued.descriptor());
                    }
                    queued.settle(outcome);
                    settled += 1;
                }
            }
        }

        debug!("Offline queue drain settled {} request(s)", settled);
        settled
    }

    /// Spawns a task that drains the offline queue once per offline to online
    /// transition. While connectivity stays online and a drain left entries
    /// behind, the drain is retried after the retry policy's backoff.
    /// The task ends when the [`Connectivity`] it follows is dropped.
    pub fn spawn_connectivity_listener(&self) -> JoinHandle<()> {
        let gateway = self.clone();
        let mut online = self.online.clone();

        tokio::spawn(async move {
            let mut was_online = *online.borrow_and_update();
            let mut stalls = 0;
            loop {
                if stalls > 0 && was_online {
                    let delay = gateway.retry.delay_for(stalls - 1);
                    tokio::select! {
                        changed = online.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(delay) => {
                            debug!("Retrying stalled offline queue after {:?}", delay);
                            stalls = gateway.drain_tracking_stalls(stalls).await;
                            continue;
                        }
                    }
                } else if online.changed().await.is_err() {
                    break;
                }

                let is_online = *online.borrow_and_update();
                if is_online && !was_online {
                    debug!("Connectivity restored");
                    stalls = gateway.drain_tracking_stalls(0).await;
                } else if !is_online {
                    stalls = 0;
                }
                was_online = is_online;
            }
            debug!("Connectivity signal closed");
        })
    }

    /// Drains and returns the updated count of consecutive drains that left
    /// entries queued.
    async fn drain_tracking_stalls(&self, stalls: u32) -> u32 {
        self.on_connectivity_restored().await;
        if self.queue.is_empty() {
            0
        } else {
            stalls.saturating_add(1)
        }
    }
}

pub(crate) fn resolve_endpoint(base: Option<&Url>, endpoint: &str) -> Result<String, Error> {
    match Url::parse(endpoint) {
        Ok(url) => Ok(url.into()),
        Err(url::ParseError::RelativeUrlWithoutBase) => match base {
            Some(base) => Ok(base.join(endpoint)?.into()),
            None => Err(Error::InvalidParameters(format!(
                "relative endpoint {} needs a base URL",
                endpoint
            ))),
        },
        Err(err) => Err(err.into()),
    }
}

async fn backoff(delay: Duration, cancel: Option<&CancellationToken>) -> Result<(), Error> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Canceled),
            _ = tokio::time::sleep(delay) => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

/// Builder for a single gateway call.
#[must_use = "a request does nothing until `send` is awaited"]
pub struct RequestBuilder<'a> {
    gateway: &'a RequestGateway,
    endpoint: String,
    method: Method,
    body: Result<Option<RequestBody>, Error>,
    headers: BTreeMap<String, String>,
    cancel: Option<CancellationToken>,
}

impl RequestBuilder<'_> {
    /// Serializes `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.body = serde_json::to_value(value)
            .map(|value| Some(RequestBody::Json(value)))
            .map_err(Error::from);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.body = Ok(Some(RequestBody::Text(text.into())));
        self
    }

    pub fn bytes(mut self, content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.body = Ok(Some(RequestBody::Bytes {
            content_type: content_type.into(),
            data: data.into(),
        }));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Canceling `token` aborts the in-flight exchange or the pending backoff
    /// and settles the call with [`Error::Canceled`]. It has no effect once
    /// the call is parked in the offline queue.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub async fn send(self) -> Result<Response, Error> {
        let body = self.body?;
        self.gateway
            .dispatch(&self.endpoint, self.method, body, self.headers, self.cancel)
            .await
    }
}
