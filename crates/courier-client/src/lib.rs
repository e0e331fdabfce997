// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Courier Developers. All Rights Reserved.

//! # Courier Client Library
//!
//! Courier is the outbound traffic pipeline of a chat client: a resilient API
//! request gateway and a concurrent file upload coordinator. It keeps working
//! through transient network loss, bounds upload concurrency, retries failed
//! calls with exponential backoff and lets callers track and cancel in-flight
//! work.
//!
//! ## Features
//!
//! - **Request gateway**: standard headers, anti-forgery token injection, a
//!   per-exchange timeout and bounded retries with exponential backoff
//! - **Offline queue**: mutating calls made while offline are parked and
//!   replayed in order once connectivity returns
//! - **Uploads**: per-file tasks admitted into a pool bounded by
//!   `max_concurrent_uploads`, with progress, cancel and retry
//! - **Pluggable transport**: every exchange goes through the [`Transport`]
//!   trait; [`HttpTransport`] is the `reqwest` binding
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use courier_client::{
//!     Connectivity, Error, HttpTransport, PipelineConfig, RequestGateway, UploadCoordinator,
//!     UploadFile,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let config = PipelineConfig::from_env()?;
//!     let transport = Arc::new(HttpTransport::new()?);
//!     let connectivity = Connectivity::new(true);
//!
//!     let gateway = RequestGateway::new(transport.clone(), config.gateway.clone())?
//!         .with_connectivity(&connectivity);
//!     gateway.spawn_connectivity_listener();
//!
//!     let rooms: serde_json::Value = gateway.get_json("/api/rooms").await?;
//!     println!("{}", rooms);
//!
//!     let uploads = UploadCoordinator::new(transport, config.uploads)
//!         .with_base_url("https://chat.example")?;
//!     uploads.submit(vec![UploadFile::from_path("avatar.png")?]);
//!     uploads.wait_idle().await;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Optional Features
//!
//! - `profiling`: emits `tracing` spans on the request and upload paths

mod error;
mod gateway;
mod queue;
mod retry;
mod settings;
mod token;
mod transport;
mod upload;

#[cfg(test)]
mod testing;

pub use crate::{
    error::Error,
    gateway::{Connectivity, ErrorContext, ErrorReporter, LogReporter, RequestBuilder, RequestGateway},
    queue::{OfflineQueue, PendingResponse, QueuedRequest},
    retry::{RetryPolicy, RetryScope, classify_method, is_retryable},
    settings::{GatewayConfig, PipelineConfig, UploadConfig},
    token::{
        FileTokenProvider, MemoryTokenProvider, NoToken, StaticTokenProvider, TokenProvider,
    },
    transport::{
        HttpTransport, Payload, Progress, ProgressFn, RequestBody, RequestDescriptor, Response,
        Transport, UploadFile, UploadHandle, is_read_only, start_upload,
    },
    upload::{
        ChannelObserver, IdGenerator, NoopObserver, SequentialIds, UploadCoordinator, UploadEvent,
        UploadId, UploadObserver, UploadStatus, UploadTask, UuidGenerator,
    },
};

pub use reqwest::Method;
pub use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests {
    #[ctor::ctor]
    fn init() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .is_test(true)
            .init();
    }
}
