// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Courier Developers. All Rights Reserved.

//! Deterministic transports and observers for unit tests.

use crate::{
    Error,
    gateway::{ErrorContext, ErrorReporter},
    transport::{Progress, ProgressFn, RequestDescriptor, Response, Transport, UploadFile},
};
use futures::{
    FutureExt as _,
    future::{BoxFuture, pending, ready},
};
use serde_json::json;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::{sync::oneshot, time::Instant};

type Outcome = Result<Response, Error>;

/// Answers each exchange with the next scripted outcome, then with the
/// fallback once the script runs out. Records every request it sees.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Box<dyn Fn() -> Outcome + Send + Sync>,
    calls: Mutex<Vec<(Instant, RequestDescriptor)>>,
    uploads: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    /// Succeeds with `{"ok": true}` unless scripted otherwise.
    pub fn ok() -> Self {
        Self::failing(|| Ok(Response::from_json(json!({"ok": true}))))
    }

    pub fn failing(fallback: impl Fn() -> Outcome + Send + Sync + 'static) -> Self {
        ScriptedTransport {
            script: Mutex::new(VecDeque::new()),
            fallback: Box::new(fallback),
            calls: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, outcome: Outcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<RequestDescriptor> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, descriptor)| descriptor.clone())
            .collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    /// Names of uploaded files in upload order.
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    fn next_outcome(&self) -> Outcome {
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| (self.fallback)())
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: RequestDescriptor) -> BoxFuture<'static, Outcome> {
        self.calls.lock().unwrap().push((Instant::now(), request));
        ready(self.next_outcome()).boxed()
    }

    fn upload(
        &self,
        file: UploadFile,
        _endpoint: String,
        on_progress: ProgressFn,
    ) -> BoxFuture<'static, Outcome> {
        self.uploads.lock().unwrap().push(file.name().to_owned());
        let outcome = self.next_outcome();
        let total = file.len();
        async move {
            if outcome.is_ok() {
                on_progress(Progress {
                    current: total,
                    total,
                });
            }
            outcome
        }
        .boxed()
    }
}

/// Never answers. Every exchange must be ended by a timeout or cancellation.
#[derive(Default)]
pub struct HangingTransport {
    calls: AtomicUsize,
}

impl HangingTransport {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for HangingTransport {
    fn send(&self, _request: RequestDescriptor) -> BoxFuture<'static, Outcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        pending().boxed()
    }

    fn upload(
        &self,
        _file: UploadFile,
        _endpoint: String,
        _on_progress: ProgressFn,
    ) -> BoxFuture<'static, Outcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        pending().boxed()
    }
}

#[derive(Default)]
struct Gates {
    open: HashMap<String, oneshot::Sender<Outcome>>,
    progress: HashMap<String, ProgressFn>,
    started: Vec<String>,
}

/// Upload transport whose exchanges finish only when the test says so,
/// keyed by file name.
#[derive(Default)]
pub struct GatedUploads {
    gates: Mutex<Gates>,
}

impl GatedUploads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settles the in-flight upload of `name`. Returns false when none is
    /// in flight.
    pub fn complete(&self, name: &str, outcome: Outcome) -> bool {
        let gate = self.gates.lock().unwrap().open.remove(name);
        match gate {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn report_progress(&self, name: &str, current: usize, total: usize) {
        let progress = self.gates.lock().unwrap().progress.get(name).cloned();
        if let Some(progress) = progress {
            progress(Progress { current, total });
        }
    }

    /// File names in the order their uploads started, retries included.
    pub fn started(&self) -> Vec<String> {
        self.gates.lock().unwrap().started.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.gates
            .lock()
            .unwrap()
            .open
            .values()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

impl Transport for GatedUploads {
    fn send(&self, _request: RequestDescriptor) -> BoxFuture<'static, Outcome> {
        ready(Ok(Response::from_json(json!({"ok": true})))).boxed()
    }

    fn upload(
        &self,
        file: UploadFile,
        _endpoint: String,
        on_progress: ProgressFn,
    ) -> BoxFuture<'static, Outcome> {
        let (tx, rx) = oneshot::channel();
        let name = file.name().to_owned();
        {
            let mut gates = self.gates.lock().unwrap();
            gates.open.insert(name.clone(), tx);
            gates.progress.insert(name.clone(), on_progress);
            gates.started.push(name);
        }
        async move {
            rx.await
                .unwrap_or_else(|_| Err(Error::Network("gate dropped".into())))
        }
        .boxed()
    }
}

/// Reporter remembering what it was handed.
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, ErrorContext)>>,
}

impl RecordingReporter {
    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    pub fn contexts(&self) -> Vec<ErrorContext> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|(_, context)| context.clone())
            .collect()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, error: &Error, context: &ErrorContext) {
        self.reports
            .lock()
            .unwrap()
            .push((error.to_string(), context.clone()));
    }
}
