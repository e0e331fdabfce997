// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Courier Developers. All Rights Reserved.

use clap::{Parser, Subcommand};
use courier_client::{
    ChannelObserver, Error, FileTokenProvider, HttpTransport, Method, NoToken, Payload,
    PipelineConfig, RequestBody, RequestGateway, StaticTokenProvider, TokenProvider,
    UploadCoordinator, UploadEvent, UploadFile, UploadId, UploadStatus,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use walkdir::WalkDir;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL relative endpoints are resolved against
    #[clap(long, env = "COURIER_BASE_URL")]
    base_url: Option<String>,

    /// Configuration file (TOML) layered over the built-in defaults
    #[clap(long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Anti-forgery token sent with every request.  When absent the token
    /// stored by `courier token` is used.
    #[clap(long, env = "COURIER_CSRF_TOKEN")]
    csrf_token: Option<String>,

    /// Location of the stored anti-forgery token
    #[clap(long, env = "COURIER_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    /// Per-request timeout in milliseconds
    #[clap(long)]
    timeout: Option<u64>,

    /// Retries after the first attempt of a failed request
    #[clap(long)]
    max_retries: Option<u32>,

    /// Client Command
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Issue one API request and print the decoded response payload.
    Request {
        /// Endpoint, absolute or relative to the base URL
        endpoint: String,

        /// HTTP method
        #[clap(long, short = 'X', default_value = "GET")]
        method: String,

        /// Request body.  Sent as JSON when it parses as JSON, as plain text
        /// otherwise.
        #[clap(long, short)]
        data: Option<String>,

        /// Extra header as NAME:VALUE, may be repeated
        #[clap(long = "header", short = 'H')]
        headers: Vec<String>,
    },
    /// Upload files, or every file below the given directories, with bounded
    /// concurrency.  Exits with an error when any upload failed.
    Upload {
        /// Files or directories to upload
        #[clap(required = true)]
        paths: Vec<PathBuf>,

        /// Upload endpoint, overrides the configured one
        #[clap(long)]
        endpoint: Option<String>,

        /// Maximum number of simultaneous uploads
        #[clap(long)]
        max_concurrent: Option<usize>,
    },
    /// Show, store or remove the stored anti-forgery token.
    Token {
        /// New token value to store
        value: Option<String>,

        /// Remove the stored token
        #[clap(long, conflicts_with = "value")]
        clear: bool,
    },
}

fn token_store(args: &Args) -> Result<FileTokenProvider, Error> {
    match &args.token_file {
        Some(path) => Ok(FileTokenProvider::with_path(path.clone())),
        None => FileTokenProvider::new(),
    }
}

fn token_provider(args: &Args) -> Arc<dyn TokenProvider> {
    if let Some(token) = &args.csrf_token {
        return Arc::new(StaticTokenProvider::new(token.clone()));
    }
    match token_store(args) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            log::debug!("No token store: {}", err);
            Arc::new(NoToken)
        }
    }
}

fn load_config(args: &Args) -> Result<PipelineConfig, Error> {
    let mut config = PipelineConfig::load(args.config.as_deref())?;
    if let Some(base_url) = &args.base_url {
        config.gateway.base_url = Some(base_url.clone());
    }
    if let Some(timeout) = args.timeout {
        config.gateway.timeout_ms = timeout;
    }
    if let Some(max_retries) = args.max_retries {
        config.gateway.max_retries = max_retries;
    }
    Ok(config)
}

fn parse_headers(headers: &[String]) -> Result<HashMap<String, String>, Error> {
    headers
        .iter()
        .map(|header| {
            header
                .split_once(':')
                .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
                .ok_or_else(|| {
                    Error::InvalidParameters(format!("header {} is not NAME:VALUE", header))
                })
        })
        .collect()
}

async fn handle_request(
    args: &Args,
    endpoint: String,
    method: String,
    data: Option<String>,
    headers: Vec<String>,
) -> Result<(), Error> {
    let config = load_config(args)?;
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|_| Error::InvalidParameters(format!("invalid method {}", method)))?;
    let body = data.map(|data| match serde_json::from_str(&data) {
        Ok(value) => RequestBody::Json(value),
        Err(_) => RequestBody::Text(data),
    });

    let gateway = RequestGateway::new(Arc::new(HttpTransport::new()?), config.gateway)?
        .with_token_provider(token_provider(args));
    let headers = parse_headers(&headers)?;
    let response = gateway
        .request(&endpoint, method, body, Some(headers.into_iter().collect()))
        .await?;

    match response.into_payload() {
        Payload::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Payload::Text(text) => println!("{}", text),
        Payload::Binary(data) => println!("<{} bytes of binary data>", data.len()),
        Payload::Empty => {}
    }
    Ok(())
}

fn collect_files(paths: &[PathBuf]) -> Result<Vec<UploadFile>, Error> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry.map_err(std::io::Error::from)?;
                if entry.file_type().is_file() {
                    files.push(UploadFile::from_path(entry.path())?);
                }
            }
        } else {
            files.push(UploadFile::from_path(path)?);
        }
    }
    Ok(files)
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {msg:24} {wide_bar:.yellow} {pos:>3}%")
        .map(|style| style.progress_chars("█▇▆▅▄▃▂▁  "))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

async fn handle_upload(
    args: &Args,
    paths: Vec<PathBuf>,
    endpoint: Option<String>,
    max_concurrent: Option<usize>,
) -> Result<(), Error> {
    let mut config = load_config(args)?;
    if let Some(endpoint) = endpoint {
        config.uploads.endpoint = endpoint;
    }
    if let Some(max_concurrent) = max_concurrent {
        config.uploads.max_concurrent_uploads = max_concurrent;
    }

    let files = collect_files(&paths)?;
    if files.is_empty() {
        return Err(Error::InvalidParameters("no files to upload".to_owned()));
    }

    let transport = HttpTransport::new()?.with_field_name(config.uploads.field_name.clone());
    let (observer, mut events) = ChannelObserver::new();
    let uploads = UploadCoordinator::new(Arc::new(transport), config.uploads)
        .with_observer(Arc::new(observer));
    let uploads = match &config.gateway.base_url {
        Some(base_url) => uploads.with_base_url(base_url)?,
        None => uploads,
    };

    let multi = MultiProgress::new();
    let names: Vec<String> = files.iter().map(|file| file.name().to_owned()).collect();
    let total = files.len();
    let ids = uploads.submit(files);
    let bars: HashMap<UploadId, ProgressBar> = ids
        .into_iter()
        .zip(names)
        .map(|(id, name)| {
            let bar = multi.add(ProgressBar::new(100));
            bar.set_style(progress_style());
            bar.set_message(name);
            (id, bar)
        })
        .collect();

    let renderer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                UploadEvent::Progress { id, percent } => {
                    if let Some(bar) = bars.get(&id) {
                        bar.set_position(percent as u64);
                    }
                }
                UploadEvent::Status { id, status } => {
                    let Some(bar) = bars.get(&id) else {
                        continue;
                    };
                    match status {
                        UploadStatus::Completed => {
                            bar.set_position(100);
                            bar.finish();
                        }
                        UploadStatus::Failed | UploadStatus::Canceled => {
                            bar.abandon_with_message(format!("{} ({})", bar.message(), status));
                        }
                        UploadStatus::Queued | UploadStatus::Uploading => {}
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = uploads.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            let canceled = uploads.cancel_all();
            log::warn!("Interrupted, canceled {} upload(s)", canceled);
        }
    }

    let failed: Vec<_> = uploads
        .tasks()
        .into_iter()
        .filter(|task| task.status() == UploadStatus::Failed)
        .collect();
    for task in &failed {
        match task.error() {
            Some(error) => eprintln!("{}", error),
            None => eprintln!("{}: upload failed", task.file().name()),
        }
    }

    // let the renderer draw the final states
    drop(uploads);
    let _ = tokio::time::timeout(Duration::from_millis(500), renderer).await;

    match failed.len() {
        0 => {
            println!("Uploaded {} file(s)", total);
            Ok(())
        }
        n => Err(Error::Upload(format!("{} of {} upload(s) failed", n, total))),
    }
}

fn handle_token(args: &Args, value: Option<String>, clear: bool) -> Result<(), Error> {
    let store = token_store(args)?;
    if clear {
        store.clear()?;
        println!("Token removed from {}", store.path().display());
    } else if let Some(value) = value {
        store.store(&value)?;
        println!("Token stored to {}", store.path().display());
    } else {
        match store.csrf_token() {
            Some(token) => println!("{}", token),
            None => println!("No token stored at {}", store.path().display()),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    #[cfg(feature = "profiling")]
    {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_env("COURIER_TRACE"))
            .finish();
        if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
            log::warn!("Tracing disabled: {}", err);
        }
    }

    let args = Args::parse();

    match args.cmd.clone() {
        Command::Request {
            endpoint,
            method,
            data,
            headers,
        } => handle_request(&args, endpoint, method, data, headers).await,
        Command::Upload {
            paths,
            endpoint,
            max_concurrent,
        } => handle_upload(&args, paths, endpoint, max_concurrent).await,
        Command::Token { value, clear } => handle_token(&args, value, clear),
    }
}
