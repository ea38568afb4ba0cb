//! Opaque planner tokens: pipes, sinks, write descriptors and flow
//! definitions.
//!
//! The engine never interprets these values; it only bundles them, keys
//! caches by them, and hands them to the flow submitter. Equality and
//! hashing are therefore by token content, not by planner semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One record read back from a materialized pipe.
pub type Record = serde_json::Value;

/// An opaque handle to a pipeline stage.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pipe {
    name: String,
}

impl Pipe {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// An opaque handle to an output location.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sink {
    name: String,
}

impl Sink {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A single desired materialization, the unit of write de-duplication.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteDescriptor {
    /// Materialize the pipe so later stages can re-read it cheaply.
    Force { pipe: Pipe },
    /// Materialize the pipe and expose its records to the caller.
    ToIterable { pipe: Pipe },
    /// Write the pipe into a sink.
    SimpleWrite { pipe: Pipe, sink: Sink },
}

impl WriteDescriptor {
    pub fn pipe(&self) -> &Pipe {
        match self {
            WriteDescriptor::Force { pipe }
            | WriteDescriptor::ToIterable { pipe }
            | WriteDescriptor::SimpleWrite { pipe, .. } => pipe,
        }
    }
}

/// A planner description submitted as one unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDef {
    name: String,
    writes: Vec<WriteDescriptor>,
}

impl FlowDef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            writes: Vec::new(),
        }
    }

    pub fn with_writes(name: impl Into<String>, writes: Vec<WriteDescriptor>) -> Self {
        Self {
            name: name.into(),
            writes,
        }
    }

    pub fn add_write(mut self, write: WriteDescriptor) -> Self {
        self.writes.push(write);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn writes(&self) -> &[WriteDescriptor] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// What a completed flow reports back: raw counters keyed by group and
/// name, the records of every pipe the flow materialized, and timing
/// telemetry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowStats {
    pub flow_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// group -> name -> value, as reported by the external stat source.
    pub raw_counters: HashMap<String, HashMap<String, i64>>,
    /// pipe name -> records, for every materialized pipe.
    pub materialized: HashMap<String, Vec<Record>>,
}

impl FlowStats {
    pub fn finished(flow_name: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            flow_name: flow_name.into(),
            started_at,
            completed_at: Utc::now(),
            raw_counters: HashMap::new(),
            materialized: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_hash_by_content() {
        use std::collections::HashSet;
        let a = WriteDescriptor::Force {
            pipe: Pipe::named("events"),
        };
        let b = WriteDescriptor::Force {
            pipe: Pipe::named("events"),
        };
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn flow_def_accumulates_writes() {
        let flow = FlowDef::named("nightly")
            .add_write(WriteDescriptor::Force {
                pipe: Pipe::named("events"),
            })
            .add_write(WriteDescriptor::SimpleWrite {
                pipe: Pipe::named("events"),
                sink: Sink::named("hdfs://out"),
            });
        assert_eq!(flow.writes().len(), 2);
        assert_eq!(flow.writes()[0].pipe().name(), "events");
    }
}
