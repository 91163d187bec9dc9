//! Saga orchestrator: forward steps with reverse-order compensation.
//!
//! A saga is a linear sequence of named steps, each pairing a forward
//! action (which produces a value) with a reverse action (which undoes it,
//! given that value). The first forward failure triggers the reverse
//! actions of every completed step in LIFO order; a reverse failure is
//! logged and the unwind continues; durable retry is the compensation
//! engine's job, and call-sites wanting it register there explicitly.

// Layer 1: Standard library
use std::collections::HashMap;

// Layer 2: Third-party
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, info};

// Layer 3: Internal
use crate::error::SyncError;

type ForwardFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, SyncError>> + Send>;
type ReverseFn = Box<dyn FnOnce(Value) -> BoxFuture<'static, Result<(), SyncError>> + Send>;

/// One named forward/reverse pair.
pub struct SagaStep {
    name: String,
    forward: ForwardFn,
    reverse: ReverseFn,
}

/// Outcome of a saga run.
#[derive(Debug)]
pub struct SagaResult {
    pub success: bool,
    /// Name of the step whose forward action failed, if any.
    pub failed_step: Option<String>,
    /// The failing step's error, rendered.
    pub error: Option<String>,
    /// Names of steps whose forward actions completed, in execution order.
    pub completed_steps: Vec<String>,
    results: HashMap<String, Value>,
}

impl SagaResult {
    /// The value a completed step produced.
    pub fn step_result(&self, name: &str) -> Option<&Value> {
        self.results.get(name)
    }
}

/// Builder accumulating steps; `execute` consumes the saga.
pub struct Saga {
    name: String,
    steps: Vec<SagaStep>,
}

impl Saga {
    pub fn builder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step. `forward` produces the step's value; `reverse`
    /// receives that value back when an unwind reaches this step.
    pub fn step<F, FFut, R, RFut>(mut self, name: impl Into<String>, forward: F, reverse: R) -> Self
    where
        F: FnOnce() -> FFut + Send + 'static,
        FFut: std::future::Future<Output = Result<Value, SyncError>> + Send + 'static,
        R: FnOnce(Value) -> RFut + Send + 'static,
        RFut: std::future::Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            forward: Box::new(move || Box::pin(forward())),
            reverse: Box::new(move |value| Box::pin(reverse(value))),
        });
        self
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Run forward steps in order; on the first failure, run completed
    /// steps' reverse actions in LIFO order and report the outcome.
    pub async fn execute(self) -> SagaResult {
        let saga_name = self.name;
        let mut completed: Vec<(String, Value, ReverseFn)> = Vec::new();
        let mut results = HashMap::new();

        for step in self.steps {
            debug!(saga = %saga_name, step = %step.name, "saga step starting");
            match (step.forward)().await {
                Ok(value) => {
                    results.insert(step.name.clone(), value.clone());
                    completed.push((step.name, value, step.reverse));
                }
                Err(err) => {
                    error!(
                        saga = %saga_name,
                        step = %step.name,
                        error = %err,
                        "saga step failed, compensating completed steps"
                    );
                    let completed_steps: Vec<String> =
                        completed.iter().map(|(name, _, _)| name.clone()).collect();
                    // LIFO unwind; failures are logged, never aborted on.
                    for (name, value, reverse) in completed.into_iter().rev() {
                        if let Err(reverse_err) = reverse(value).await {
                            error!(
                                saga = %saga_name,
                                step = %name,
                                error = %reverse_err,
                                "saga compensation failed, manual action required"
                            );
                        } else {
                            debug!(saga = %saga_name, step = %name, "saga step compensated");
                        }
                    }
                    return SagaResult {
                        success: false,
                        failed_step: Some(step.name),
                        error: Some(err.to_string()),
                        completed_steps,
                        results,
                    };
                }
            }
        }

        info!(saga = %saga_name, steps = results.len(), "saga completed");
        let completed_steps = completed.iter().map(|(name, _, _)| name.clone()).collect();
        SagaResult {
            success: true,
            failed_step: None,
            error: None,
            completed_steps,
            results,
        }
    }
}
