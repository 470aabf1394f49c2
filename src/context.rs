//! Run-scoped context shared with tools, hooks, and handoff resolvers.
//!
//! A [`RunContext`] carries an arbitrary caller-supplied payload plus the
//! cumulative token usage for the run. The run loop is the single writer of
//! the usage counters (one add per completed model response); everything else
//! only reads.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::usage::Usage;

/// Mutable, run-scoped bag of caller context plus cumulative usage.
pub struct RunContext {
    payload: Option<Arc<dyn Any + Send + Sync>>,
    usage: Mutex<Usage>,
}

impl RunContext {
    /// Creates an empty context with zeroed usage.
    pub fn new() -> Self {
        Self {
            payload: None,
            usage: Mutex::new(Usage::empty()),
        }
    }

    /// Creates a context carrying a caller-supplied payload.
    pub fn with_payload<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            payload: Some(Arc::new(payload)),
            usage: Mutex::new(Usage::empty()),
        }
    }

    /// Downcasts the caller payload to a concrete type, if present and matching.
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.payload.clone().and_then(|p| p.downcast::<T>().ok())
    }

    /// Returns a snapshot of the cumulative usage so far.
    pub fn usage(&self) -> Usage {
        self.usage.lock().unwrap().clone()
    }

    /// Adds one model response's usage into the cumulative counters.
    pub(crate) fn add_usage(&self, usage: &Usage) {
        self.usage.lock().unwrap().add_usage(usage);
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("payload", &self.payload.is_some())
            .field("usage", &self.usage())
            .finish()
    }
}
