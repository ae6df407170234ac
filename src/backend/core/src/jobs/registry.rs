//! Job type registry used by runners to decode stored payloads.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Job, ShouldQueue};
use crate::error::{QueueError, Result};

type Decoder = Arc<dyn Fn(serde_json::Value) -> Result<Box<dyn Job>> + Send + Sync>;

/// Maps a stored `job_type` back to a runnable job.
#[derive(Clone, Default)]
pub struct JobRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queueable job type under its `JOB_TYPE`.
    ///
    /// Registering the same type twice replaces the earlier decoder.
    pub fn register<J: ShouldQueue>(&mut self) -> &mut Self {
        let decoder: Decoder = Arc::new(|payload| {
            let job: J = serde_json::from_value(payload)?;
            Ok(Box::new(job) as Box<dyn Job>)
        });
        if self.decoders.insert(J::JOB_TYPE, decoder).is_some() {
            tracing::warn!(job_type = J::JOB_TYPE, "Job type registered twice");
        }
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<J: ShouldQueue>(mut self) -> Self {
        self.register::<J>();
        self
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.decoders.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.decoders.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Rebuild a job from its stored payload.
    pub fn decode(&self, job_type: &str, payload: serde_json::Value) -> Result<Box<dyn Job>> {
        let decoder = self
            .decoders
            .get(job_type)
            .ok_or_else(|| QueueError::unknown_job_type(job_type))?;
        decoder(payload)
    }
}
