//! Job record
//!
//! Deployments attach key/value metadata (tool versions and the like) to
//! the job and write diagnostic traces to its output stream when a step
//! fails for good.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Receives job metadata and diagnostics; writes never fail
pub trait MetadataSink: Send {
    fn add_metadata(&mut self, key: &str, value: &str);

    /// Append text to the job's diagnostic output
    fn write_diagnostic(&mut self, text: &str);
}

/// Metadata and diagnostics of one dispatcher run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub device: String,
    /// Host the dispatcher ran on
    pub dispatcher: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
    pub diagnostics: String,
    pub result: Option<String>,
}

impl JobRecord {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device: device.into(),
            dispatcher: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            started_at: Utc::now(),
            finished_at: None,
            metadata: BTreeMap::new(),
            diagnostics: String::new(),
            result: None,
        }
    }

    /// Stamp the end time and outcome
    pub fn finish<T>(&mut self, outcome: &Result<T>) {
        self.finished_at = Some(Utc::now());
        self.result = Some(match outcome {
            Ok(_) => "pass".to_string(),
            Err(e) => format!("fail: {}", e),
        });
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        info!("Wrote job record to {}", path.display());
        Ok(())
    }
}

impl MetadataSink for JobRecord {
    fn add_metadata(&mut self, key: &str, value: &str) {
        self.metadata.insert(key.to_string(), value.to_string());
    }

    fn write_diagnostic(&mut self, text: &str) {
        self.diagnostics.push_str(text);
        if !text.ends_with('\n') {
            self.diagnostics.push('\n');
        }
    }
}

/// Turn a step failure into a fatal error
///
/// The full cause chain goes to the job output before the error
/// propagates, so it survives even if the caller only prints the context.
pub fn escalate(sink: &mut dyn MetadataSink, context: &str, err: Error) -> Error {
    if err.is_fatal() {
        return err;
    }
    let trace = err.trace();
    error!("{}: {}", context, trace);
    sink.write_diagnostic(&format!("{}\n{}", context, trace));
    err.fatal(context)
}
