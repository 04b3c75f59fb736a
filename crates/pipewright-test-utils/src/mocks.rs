use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::Value;

use pipewright_core::error::{PipelineError, Result};
use pipewright_core::event::PipelineEvent;
use pipewright_core::run::PipelineRun;
use pipewright_core::traits::{
    EventSink, IsolatedExecutor, IsolatedRunRequest, IsolatedRunResponse, RemoteCall, RunLog,
    SystemEvents,
};

#[derive(Debug, Clone)]
enum Reply {
    Ok(Value),
    Err(String),
    Hang,
}

/// [`RemoteCall`] that answers from per-method scripts.
///
/// Replies queued for a method are served in order; the last one repeats
/// once the queue is down to it. Unscripted methods fail.
#[derive(Default)]
pub struct ScriptedRemote {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply for `method`.
    pub fn respond(&self, method: &str, value: Value) {
        self.push(method, Reply::Ok(value));
    }

    /// Queue an error reply for `method`.
    pub fn fail(&self, method: &str, message: &str) {
        self.push(method, Reply::Err(message.to_string()));
    }

    /// Queue a reply for `method` that never resolves.
    pub fn hang(&self, method: &str) {
        self.push(method, Reply::Hang);
    }

    fn push(&self, method: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    /// Params of every call to `method`, in order.
    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    fn next_reply(&self, method: &str) -> Option<Reply> {
        let mut replies = self.replies.lock().unwrap();
        let queue = replies.get_mut(method)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl RemoteCall for ScriptedRemote {
    fn call<'a>(&'a self, method: &'a str, params: Value) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push((method.to_string(), params));
            match self.next_reply(method) {
                Some(Reply::Ok(value)) => Ok(value),
                Some(Reply::Err(message)) => Err(PipelineError::external(method, message)),
                Some(Reply::Hang) => futures::future::pending().await,
                None => Err(PipelineError::external(method, "no scripted reply")),
            }
        })
    }
}

/// [`IsolatedExecutor`] that always returns the same response and records
/// every request.
pub struct MockIsolated {
    response: IsolatedRunResponse,
    requests: Mutex<Vec<IsolatedRunRequest>>,
}

impl MockIsolated {
    pub fn new(response: IsolatedRunResponse) -> Self {
        Self {
            response,
            requests: Mutex::new(vec![]),
        }
    }

    /// An executor answering `ok` with the given summary.
    pub fn ok(summary: &str) -> Self {
        Self::new(IsolatedRunResponse {
            status: "ok".into(),
            summary: Some(summary.into()),
            ..Default::default()
        })
    }

    pub fn requests(&self) -> Vec<IsolatedRunRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl IsolatedExecutor for MockIsolated {
    fn run(&self, request: IsolatedRunRequest) -> BoxFuture<'_, Result<IsolatedRunResponse>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            Ok(self.response.clone())
        })
    }
}

/// [`SystemEvents`] that records what was enqueued.
#[derive(Default)]
pub struct RecordingEvents {
    queued: Mutex<Vec<(String, Option<String>)>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&self) -> Vec<(String, Option<String>)> {
        self.queued.lock().unwrap().clone()
    }
}

impl SystemEvents for RecordingEvents {
    fn enqueue(&self, text: String, session_key: Option<String>) {
        self.queued.lock().unwrap().push((text, session_key));
    }
}

/// [`EventSink`] that keeps every event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events about one node, in order.
    pub fn for_node(&self, node_id: &str) -> Vec<PipelineEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.node_id() == Some(node_id))
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: PipelineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// In-memory [`RunLog`].
#[derive(Default)]
pub struct MemoryRunLog {
    records: Mutex<Vec<(String, PipelineRun)>>,
}

impl MemoryRunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every appended record, in append order.
    pub fn appended(&self) -> Vec<PipelineRun> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(_, run)| run.clone())
            .collect()
    }
}

impl RunLog for MemoryRunLog {
    fn append<'a>(&'a self, pipeline_id: &'a str, run: &'a PipelineRun) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.records
                .lock()
                .unwrap()
                .push((pipeline_id.to_string(), run.clone()));
            Ok(())
        })
    }

    fn load_recent<'a>(
        &'a self,
        pipeline_id: &'a str,
        limit: Option<usize>,
    ) -> BoxFuture<'a, Result<Vec<PipelineRun>>> {
        Box::pin(async move {
            let records = self.records.lock().unwrap();
            let mut seen = HashSet::new();
            let runs: Vec<PipelineRun> = records
                .iter()
                .rev()
                .filter(|(pid, _)| pid == pipeline_id)
                .filter(|(_, run)| seen.insert(run.id.clone()))
                .map(|(_, run)| run.clone())
                .take(limit.unwrap_or(usize::MAX))
                .collect();
            Ok(runs)
        })
    }
}
