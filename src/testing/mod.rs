//! Testing utilities and fixtures.
//!
//! Scriptable collaborators for exercising the engine without a real
//! cluster: a recording flow submitter with configurable counters,
//! latency and failures, plus executor helpers that capture reported
//! side-effect errors.

use crate::config::{Config, Mode};
use crate::executor::Executor;
use crate::flow::{FlowDef, FlowStats, Record, WriteDescriptor};
use crate::writer::FlowSubmitter;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A flow submitter that records every submission and answers with
/// scripted stats.
pub struct MockSubmitter {
    submissions: Mutex<Vec<FlowDef>>,
    aborted: Mutex<Vec<String>>,
    counters: Mutex<HashMap<String, HashMap<String, i64>>>,
    records: Mutex<HashMap<String, Vec<Record>>>,
    fail_with: Mutex<Option<String>>,
    submit_delay: Mutex<Option<Duration>>,
}

impl MockSubmitter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            submissions: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            counters: Mutex::new(HashMap::new()),
            records: Mutex::new(HashMap::new()),
            fail_with: Mutex::new(None),
            submit_delay: Mutex::new(None),
        })
    }

    /// Report this counter from every completed flow.
    pub fn with_counter(self: Arc<Self>, group: &str, name: &str, value: i64) -> Arc<Self> {
        self.counters
            .lock()
            .unwrap()
            .entry(group.to_string())
            .or_default()
            .insert(name.to_string(), value);
        self
    }

    /// Materialize these records for the named pipe.
    pub fn with_records(self: Arc<Self>, pipe: &str, records: Vec<Record>) -> Arc<Self> {
        self.records
            .lock()
            .unwrap()
            .insert(pipe.to_string(), records);
        self
    }

    /// Fail every submission with this message.
    pub fn failing(self: Arc<Self>, message: &str) -> Arc<Self> {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
        self
    }

    /// Sleep before completing each submission.
    pub fn with_submit_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.submit_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn submissions(&self) -> Vec<FlowDef> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    /// Every descriptor across all submissions, in submission order.
    pub fn submitted_descriptors(&self) -> Vec<WriteDescriptor> {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .flat_map(|flow| flow.writes().iter().cloned())
            .collect()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.aborted.lock().unwrap().clone()
    }
}

#[async_trait]
impl FlowSubmitter for MockSubmitter {
    async fn submit(&self, _conf: &Config, flow: &FlowDef) -> anyhow::Result<FlowStats> {
        let started_at = Utc::now();
        self.submissions.lock().unwrap().push(flow.clone());

        let delay = *self.submit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            anyhow::bail!("{message}");
        }

        let mut stats = FlowStats::finished(flow.name(), started_at);
        stats.raw_counters = self.counters.lock().unwrap().clone();
        let scripted = self.records.lock().unwrap();
        for write in flow.writes() {
            let pipe = write.pipe().name().to_string();
            let records = scripted.get(&pipe).cloned().unwrap_or_default();
            stats.materialized.insert(pipe, records);
        }
        Ok(stats)
    }

    async fn abort(&self, flow_name: &str) {
        self.aborted.lock().unwrap().push(flow_name.to_string());
    }
}

/// A local mode backed by a fresh recording submitter.
pub fn mock_mode() -> (Mode, Arc<MockSubmitter>) {
    let submitter = MockSubmitter::new();
    (Mode::local(submitter.clone()), submitter)
}

pub fn test_config() -> Config {
    Config::empty()
}

/// The current runtime's executor.
pub fn test_executor() -> Executor {
    Executor::current()
}

/// An executor whose failure reporter appends into the returned sink.
pub fn reporting_executor() -> (Executor, Arc<Mutex<Vec<String>>>) {
    let sink: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = sink.clone();
    let exec = Executor::current().with_reporter(move |error| {
        seen.lock().unwrap().push(error.to_string());
    });
    (exec, sink)
}
