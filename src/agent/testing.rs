//! Scripted in-memory backend for tests.

use crate::agent::backend::{BackendError, ReasoningBackend};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type Script = dyn Fn(&str, usize) -> Result<String, BackendError> + Send + Sync;

/// Backend whose replies come from a closure of `(request, call_number)`.
pub struct ScriptedBackend {
    script: Box<Script>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    requests: Mutex<Vec<String>>,
    delay: Option<Box<dyn Fn(&str) -> Duration + Send + Sync>>,
}

impl ScriptedBackend {
    pub fn new(
        script: impl Fn(&str, usize) -> Result<String, BackendError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Reply to every request with the number of `<item` tags it contains.
    pub fn counting() -> Self {
        Self::new(|request, _| Ok(format!("summary of {} items", request.matches("<item ").count())))
    }

    /// Sleep before answering, per request.
    pub fn with_delay(mut self, delay: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Some(Box::new(delay));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most requests that were ever being answered at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &str) -> Result<String, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.to_string());
        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(active, Ordering::SeqCst);
        if let Some(ref delay) = self.delay {
            tokio::time::sleep(delay(request)).await;
        }
        let reply = (self.script)(request, call);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}
