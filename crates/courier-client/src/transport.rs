// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Courier Developers. All Rights Reserved.

//! Single-exchange I/O primitives.
//!
//! A [`Transport`] performs exactly one request/response exchange or one file
//! upload. It knows nothing about retries, timeouts or offline queueing; those
//! policies live in [`RequestGateway`][crate::RequestGateway] and
//! [`UploadCoordinator`][crate::UploadCoordinator]. Swapping the transport is
//! how tests drive the pipeline without a network.
//!
//! [`HttpTransport`] is the production binding on top of `reqwest`.

use crate::Error;
use chrono::{DateTime, Utc};
use futures::{
    FutureExt as _, StreamExt as _,
    future::{BoxFuture, ready},
};
use log::{Level, debug, log_enabled, trace};
use reqwest::{
    Body, Method,
    header::{ACCEPT, CONTENT_TYPE},
    multipart::{Form, Part},
};
use serde::de::DeserializeOwned;
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio_util::{
    codec::{BytesCodec, FramedRead},
    sync::CancellationToken,
};
use uuid::Uuid;

const MEMORY_CHUNK_SIZE: usize = 64 * 1024;

/// Returns true for methods that never mutate server state.
pub fn is_read_only(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD || method == Method::OPTIONS
}

/// Progress of a single transfer in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes sent so far.
    pub current: usize,
    /// Total bytes to send.
    pub total: usize,
}

impl Progress {
    /// Progress as an integer percentage clamped to `0..=100`.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.current.min(self.total) * 100) / self.total) as u8
    }
}

/// Callback receiving byte-level upload progress.
pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Encoded request body. JSON unless the caller picks another encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(serde_json::Value),
    Text(String),
    Bytes { content_type: String, data: Vec<u8> },
}

impl RequestBody {
    pub fn content_type(&self) -> &str {
        match self {
            RequestBody::Json(_) => "application/json",
            RequestBody::Text(_) => "text/plain; charset=utf-8",
            RequestBody::Bytes { content_type, .. } => content_type,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(match self {
            RequestBody::Json(value) => serde_json::to_vec(value)?,
            RequestBody::Text(text) => text.as_bytes().to_vec(),
            RequestBody::Bytes { data, .. } => data.clone(),
        })
    }
}

/// Immutable description of one logical API call.
///
/// Built once per call by the gateway and either sent (possibly several times
/// when retried) or parked verbatim in the offline queue. Header names are
/// stored lowercase.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    id: Uuid,
    endpoint: String,
    method: Method,
    body: Option<RequestBody>,
    headers: BTreeMap<String, String>,
    issued_at: DateTime<Utc>,
}

impl RequestDescriptor {
    pub fn new(
        endpoint: impl Into<String>,
        method: Method,
        body: Option<RequestBody>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        RequestDescriptor {
            id: Uuid::new_v4(),
            endpoint: endpoint.into(),
            method,
            body,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect(),
            issued_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Fully resolved URL of the call.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn is_read_only(&self) -> bool {
        is_read_only(&self.method)
    }
}

impl fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.endpoint)
    }
}

/// Decoded response body, selected by the declared content type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
    Empty,
}

impl Payload {
    /// Decodes a body according to its `Content-Type`.
    ///
    /// JSON types (`application/json`, `*+json`) become structured values,
    /// `text/*` becomes a string, and anything else, including a missing
    /// content type, stays raw bytes. Undecodable JSON or text is a
    /// [`Error::Validation`].
    pub fn decode(content_type: Option<&str>, body: Vec<u8>) -> Result<Self, Error> {
        if body.is_empty() {
            return Ok(Payload::Empty);
        }

        let essence = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default();

        if essence == "application/json" || essence.ends_with("+json") {
            serde_json::from_slice(&body)
                .map(Payload::Json)
                .map_err(|e| Error::Validation(format!("undecodable JSON: {}", e)))
        } else if essence.starts_with("text/") {
            String::from_utf8(body)
                .map(Payload::Text)
                .map_err(|e| Error::Validation(format!("invalid UTF-8 text: {}", e)))
        } else {
            Ok(Payload::Binary(body))
        }
    }
}

/// Successful (2xx) response of one exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: u16,
    content_type: Option<String>,
    payload: Payload,
}

impl Response {
    pub fn new(status: u16, content_type: Option<String>, payload: Payload) -> Self {
        Response {
            status,
            content_type,
            payload,
        }
    }

    /// A `200 OK` carrying a JSON value.
    pub fn from_json(value: serde_json::Value) -> Self {
        Response::new(
            200,
            Some("application/json".to_owned()),
            Payload::Json(value),
        )
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Deserializes a JSON payload. An empty body decodes as JSON `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let value = match &self.payload {
            Payload::Json(value) => value.clone(),
            Payload::Empty => serde_json::Value::Null,
            other => {
                return Err(Error::Validation(format!(
                    "expected a JSON payload, got {}",
                    match other {
                        Payload::Text(_) => "text",
                        _ => "binary data",
                    }
                )));
            }
        };
        serde_json::from_value(value).map_err(|e| Error::Validation(e.to_string()))
    }
}

#[derive(Clone)]
enum FileSource {
    Path(PathBuf),
    Memory(Arc<[u8]>),
}

/// A file accepted for upload, either on disk or already in memory.
#[derive(Clone)]
pub struct UploadFile {
    name: String,
    content_type: String,
    len: usize,
    source: FileSource,
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("len", &self.len)
            .finish()
    }
}

impl UploadFile {
    /// Opens a file on disk. The content type is sniffed from the file's
    /// leading bytes and falls back to `application/octet-stream`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let metadata = path.metadata()?;
        if !metadata.is_file() {
            return Err(Error::InvalidParameters(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let content_type = infer::get_from_path(path)?
            .map(|kind| kind.mime_type().to_owned())
            .unwrap_or_else(|| "application/octet-stream".to_owned());
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_owned());

        Ok(UploadFile {
            name,
            content_type,
            len: metadata.len() as usize,
            source: FileSource::Path(path.to_owned()),
        })
    }

    pub fn from_bytes(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        let data: Vec<u8> = data.into();
        UploadFile {
            name: name.into(),
            content_type: content_type.into(),
            len: data.len(),
            source: FileSource::Memory(data.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            FileSource::Path(path) => Some(path),
            FileSource::Memory(_) => None,
        }
    }

    /// Streams the file contents, reporting bytes as they are pulled.
    async fn into_body(self, on_progress: ProgressFn) -> Result<Body, Error> {
        let total = self.len;
        let mut sent = 0usize;

        match self.source {
            FileSource::Path(path) => {
                let file = tokio::fs::File::open(path).await?;
                let stream = FramedRead::new(file, BytesCodec::new()).map(move |chunk| {
                    if let Ok(chunk) = &chunk {
                        sent += chunk.len();
                        on_progress(Progress {
                            current: sent,
                            total,
                        });
                    }
                    chunk.map(|chunk| chunk.freeze())
                });
                Ok(Body::wrap_stream(stream))
            }
            FileSource::Memory(data) => {
                let chunks = data
                    .chunks(MEMORY_CHUNK_SIZE)
                    .map(<[u8]>::to_vec)
                    .collect::<Vec<_>>();
                let stream = futures::stream::iter(chunks).map(move |chunk| {
                    sent += chunk.len();
                    on_progress(Progress {
                        current: sent,
                        total,
                    });
                    Ok::<_, std::io::Error>(chunk)
                });
                Ok(Body::wrap_stream(stream))
            }
        }
    }
}

/// One request/response or upload exchange, and nothing more.
///
/// Implementations settle each returned future exactly once and must not
/// retry. Dropping a returned future abandons the exchange.
pub trait Transport: Send + Sync {
    /// Performs one request. Non-2xx statuses fail with
    /// [`Error::HttpStatus`].
    fn send(&self, request: RequestDescriptor) -> BoxFuture<'static, Result<Response, Error>>;

    /// Uploads one file to `endpoint`, reporting progress as bytes go out.
    /// Progress may only be reported once the returned future is polled.
    fn upload(
        &self,
        file: UploadFile,
        endpoint: String,
        on_progress: ProgressFn,
    ) -> BoxFuture<'static, Result<Response, Error>>;
}

/// Abort handle for an in-flight upload.
#[derive(Debug, Clone)]
pub struct UploadHandle {
    cancel: CancellationToken,
    // held while a progress callback runs and while aborting
    gate: Arc<Mutex<()>>,
}

impl UploadHandle {
    /// Aborts the exchange. The upload future settles with
    /// [`Error::Canceled`]. A progress callback already running finishes
    /// before this returns and none starts afterwards.
    pub fn abort(&self) {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Starts an abortable upload through `transport`.
///
/// Returns the abort handle and the exchange future. The future must be polled
/// for the upload to make progress.
pub fn start_upload(
    transport: &dyn Transport,
    file: UploadFile,
    endpoint: String,
    on_progress: ProgressFn,
) -> (UploadHandle, BoxFuture<'static, Result<Response, Error>>) {
    let handle = UploadHandle {
        cancel: CancellationToken::new(),
        gate: Arc::default(),
    };

    let gated = handle.clone();
    let progress: ProgressFn = Arc::new(move |progress| {
        let _gate = gated.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if !gated.cancel.is_cancelled() {
            on_progress(progress);
        }
    });

    let exchange = transport.upload(file, endpoint, progress);
    let token = handle.cancel.clone();
    let future = async move {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Canceled),
            result = exchange => result,
        }
    }
    .boxed();

    (handle, future)
}

/// `reqwest`-backed transport.
///
/// The client carries connection-level timeouts only; per-call deadlines are
/// applied by the gateway.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    field_name: String,
}

impl HttpTransport {
    pub fn new() -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| Error::InvalidParameters(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self::with_client(http))
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        HttpTransport {
            http,
            field_name: "file".to_owned(),
        }
    }

    /// Sets the multipart field name carrying uploaded files.
    pub fn with_field_name(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = field_name.into();
        self
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: RequestDescriptor) -> BoxFuture<'static, Result<Response, Error>> {
        let mut builder = self
            .http
            .request(request.method().clone(), request.endpoint());
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = request.body() {
            let bytes = match body.to_bytes() {
                Ok(bytes) => bytes,
                Err(err) => return ready(Err(err)).boxed(),
            };
            if request.header(CONTENT_TYPE.as_str()).is_none() {
                builder = builder.header(CONTENT_TYPE, body.content_type());
            }
            builder = builder.body(bytes);
        }

        debug!("Sending {}", request);
        async move { read_response(builder.send().await?).await }.boxed()
    }

    fn upload(
        &self,
        file: UploadFile,
        endpoint: String,
        on_progress: ProgressFn,
    ) -> BoxFuture<'static, Result<Response, Error>> {
        let http = self.http.clone();
        let field_name = self.field_name.clone();

        async move {
            let name = file.name().to_owned();
            let content_type = file.content_type().to_owned();
            let len = file.len() as u64;

            let body = file.into_body(on_progress).await?;
            let part = Part::stream_with_length(body, len)
                .file_name(name.clone())
                .mime_str(&content_type)
                .map_err(|_| {
                    Error::InvalidParameters(format!("invalid content type {}", content_type))
                })?;

            debug!("Uploading {} ({} bytes) to {}", name, len, endpoint);
            let resp = http
                .post(&endpoint)
                .header(ACCEPT, "application/json")
                .multipart(Form::new().part(field_name, part))
                .send()
                .await?;
            read_response(resp).await
        }
        .boxed()
    }
}

async fn read_response(resp: reqwest::Response) -> Result<Response, Error> {
    let status = resp.status();
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let body = resp.bytes().await?;

    if log_enabled!(Level::Trace) {
        trace!("Response {}: {}", status, String::from_utf8_lossy(&body));
    }

    if !status.is_success() {
        return Err(Error::HttpStatus(status.as_u16()));
    }

    let payload = Payload::decode(content_type.as_deref(), body.to_vec())?;
    Ok(Response::new(status.as_u16(), content_type, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::GatedUploads;
    use serde_json::json;
    use std::{sync::mpsc, thread, time::Duration};

    #[test]
    fn test_decode_dispatches_on_content_type() {
        assert_eq!(
            Payload::decode(Some("application/json; charset=utf-8"), br#"{"ok":true}"#.to_vec())
                .unwrap(),
            Payload::Json(json!({"ok": true}))
        );
        assert_eq!(
            Payload::decode(Some("application/problem+json"), b"[1,2]".to_vec()).unwrap(),
            Payload::Json(json!([1, 2]))
        );
        assert_eq!(
            Payload::decode(Some("text/html"), b"<p>hi</p>".to_vec()).unwrap(),
            Payload::Text("<p>hi</p>".to_owned())
        );
        assert_eq!(
            Payload::decode(Some("image/png"), vec![0x89, 0x50]).unwrap(),
            Payload::Binary(vec![0x89, 0x50])
        );
        assert_eq!(
            Payload::decode(None, vec![1, 2, 3]).unwrap(),
            Payload::Binary(vec![1, 2, 3])
        );
        assert_eq!(
            Payload::decode(Some("application/json"), Vec::new()).unwrap(),
            Payload::Empty
        );
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        let err = Payload::decode(Some("application/json"), b"{not json".to_vec()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_response_json_typed() {
        #[derive(serde::Deserialize)]
        struct Room {
            id: u64,
        }

        let resp = Response::from_json(json!({"id": 7}));
        assert_eq!(resp.json::<Room>().unwrap().id, 7);

        let text = Response::new(200, None, Payload::Text("x".into()));
        assert!(matches!(text.json::<Room>(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_descriptor_lowercases_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("X-CSRF-Token".to_owned(), "abc".to_owned());
        let descriptor =
            RequestDescriptor::new("https://chat.example/api/messages", Method::POST, None, headers);

        assert_eq!(descriptor.header("x-csrf-token"), Some("abc"));
        assert_eq!(descriptor.header("X-Csrf-Token"), Some("abc"));
        assert!(!descriptor.is_read_only());
        assert_eq!(
            descriptor.to_string(),
            "POST https://chat.example/api/messages"
        );
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(Progress { current: 0, total: 200 }.percent(), 0);
        assert_eq!(Progress { current: 50, total: 200 }.percent(), 25);
        assert_eq!(Progress { current: 300, total: 200 }.percent(), 100);
        assert_eq!(Progress { current: 0, total: 0 }.percent(), 100);
    }

    #[test]
    fn test_upload_file_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();

        let file = UploadFile::from_path(&path).unwrap();
        assert_eq!(file.name(), "notes.txt");
        assert_eq!(file.len(), 5);
        assert_eq!(file.content_type(), "application/octet-stream");
        assert_eq!(file.path(), Some(path.as_path()));

        assert!(matches!(
            UploadFile::from_path(dir.path()),
            Err(Error::InvalidParameters(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_settles_canceled_and_stops_progress() {
        let transport = GatedUploads::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let (handle, exchange) = start_upload(
            &transport,
            UploadFile::from_bytes("a.bin", "application/octet-stream", vec![0; 10]),
            "https://chat.example/upload".to_owned(),
            Arc::new(move |p: Progress| sink.lock().unwrap().push(p.current)),
        );

        transport.report_progress("a.bin", 4, 10);
        handle.abort();
        transport.report_progress("a.bin", 8, 10);

        assert!(handle.is_aborted());
        assert!(matches!(exchange.await, Err(Error::Canceled)));
        assert_eq!(*seen.lock().unwrap(), vec![4]);
    }

    #[test]
    fn test_abort_waits_for_running_progress_callback() {
        let transport = GatedUploads::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (entered_tx, entered_rx) = mpsc::channel();
        let entered_tx = Mutex::new(entered_tx);
        let sink = log.clone();

        let (handle, _exchange) = start_upload(
            &transport,
            UploadFile::from_bytes("a.bin", "application/octet-stream", vec![0; 10]),
            "https://chat.example/upload".to_owned(),
            Arc::new(move |_: Progress| {
                let _ = entered_tx.lock().unwrap().send(());
                thread::sleep(Duration::from_millis(50));
                sink.lock().unwrap().push("progress");
            }),
        );

        thread::scope(|scope| {
            scope.spawn(|| transport.report_progress("a.bin", 4, 10));
            entered_rx.recv().unwrap();
            handle.abort();
            log.lock().unwrap().push("aborted");
        });

        assert_eq!(*log.lock().unwrap(), vec!["progress", "aborted"]);
        transport.report_progress("a.bin", 8, 10);
        assert_eq!(log.lock().unwrap().len(), 2);
    }
}
