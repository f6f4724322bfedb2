//! # Task Pipeline
//!
//! Every protocol transition (signing an offer, taking it, exchanging a
//! contract, publishing deposits, paying out) is a short, ordered list of
//! steps run against one mutable context. This module is the executor.
//!
//! ```text
//!   ┌────────┐   ┌────────┐   ┌────────┐
//!   │ task 1 │──▶│ task 2 │──▶│ task 3 │──▶ Completed { steps: 3 }
//!   └────────┘   └────┬───┘   └────────┘
//!                     │ Err
//!                     ▼
//!       rollback step 2, keep step 1, record error
//!                     │
//!                     ▼
//!           Failed { step: 1, task: "...", error }
//! ```
//!
//! ## Contract
//!
//! - Tasks run strictly in order. Each one may await (a delivery outcome,
//!   a wallet call); that await is the only place the pipeline suspends.
//! - Before every body an optional intercept hook gets a vote: proceed,
//!   mark the step done without running it, or fail it outright. Tests use
//!   this to inject faults at step N.
//! - Each step runs on a working copy. On success it is committed. On
//!   failure that step alone is rolled back, everything committed before
//!   it stays, the error lands on the context, and nothing later runs.
//! - No retries here. Whether to try again is the caller's business.
//! - [`TaskPipeline::run`] takes `self`, so a pipeline is spent after one
//!   run. Running the same pipeline twice does not type-check.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::escrow::EscrowError;
use crate::trade::state::TransitionError;
use crate::wallet::WalletError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a task gave up.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error("wallet: {0}")]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// A signature, contract field or amount did not check out. Fatal:
    /// the counterparty either lies or is broken.
    #[error("verification failed: {0}")]
    Verification(String),

    /// The triggering message is missing something the step needs.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Local state is not what the step expects.
    #[error("precondition not met: {0}")]
    Precondition(String),

    #[error("delivery of {kind} failed: {reason}")]
    Delivery { kind: String, reason: String },

    /// Failure injected by an intercept hook.
    #[error("intercepted: {0}")]
    Intercepted(String),
}

impl TaskError {
    /// Verification failures cannot be fixed by trying again; they are
    /// escalated to a dispute instead.
    pub fn is_fatal(&self) -> bool {
        match self {
            TaskError::Verification(_) => true,
            TaskError::Escrow(e) => e.is_verification_failure(),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One step of a pipeline.
#[async_trait]
pub trait Task: fmt::Debug + Send + Sync {
    type Context: PipelineContext + Send;

    /// Stable name for logs and the recorded error.
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut Self::Context) -> Result<(), TaskError>;
}

/// The per-step transaction boundary a context has to offer.
pub trait PipelineContext {
    /// Snapshot state before a step body runs.
    fn begin_step(&mut self);
    /// Drop the snapshot; the step's mutations stand.
    fn commit_step(&mut self);
    /// Restore the snapshot taken by `begin_step`.
    fn rollback_step(&mut self);
    /// Store a user-visible error after a failed step.
    fn record_failure(&mut self, task: &'static str, error: &TaskError);
}

// ---------------------------------------------------------------------------
// Intercept hook
// ---------------------------------------------------------------------------

/// Verdict of an intercept hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interception {
    Proceed,
    /// Count the step as done without running its body.
    Complete,
    Fail(String),
}

pub type InterceptHook<T> = Arc<dyn Fn(&T) -> Interception + Send + Sync>;

/// Clones the payload of the message that triggered a run, or fails the
/// task with `InvalidMessage` when the trigger is missing or of another
/// kind. Works on any context with an `inbound: Option<InboundMessage>`.
macro_rules! inbound_payload {
    ($ctx:expr, $variant:ident) => {
        match $ctx
            .inbound
            .as_ref()
            .map(|message| &message.envelope.message)
        {
            Some($crate::network::ProtocolMessage::$variant(payload)) => payload.clone(),
            _ => {
                return Err($crate::pipeline::TaskError::InvalidMessage(
                    concat!("expected ", stringify!($variant)).to_string(),
                ))
            }
        }
    };
}

pub(crate) use inbound_payload;

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PipelineFailure {
    /// Zero-based index of the failing step.
    pub step: usize,
    pub task: &'static str,
    pub error: TaskError,
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Completed { steps: usize },
    Failed(PipelineFailure),
}

impl PipelineOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineOutcome::Completed { .. })
    }

    pub fn failure(&self) -> Option<&PipelineFailure> {
        match self {
            PipelineOutcome::Failed(f) => Some(f),
            PipelineOutcome::Completed { .. } => None,
        }
    }
}

pub struct TaskPipeline<T: Task> {
    label: String,
    tasks: Vec<T>,
    intercept: Option<InterceptHook<T>>,
}

impl<T: Task> TaskPipeline<T> {
    pub fn new(label: impl Into<String>, tasks: Vec<T>) -> Self {
        Self {
            label: label.into(),
            tasks,
            intercept: None,
        }
    }

    pub fn with_intercept(mut self, hook: Option<InterceptHook<T>>) -> Self {
        self.intercept = hook;
        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs every task once, in order, and consumes the pipeline.
    pub async fn run(self, ctx: &mut T::Context) -> PipelineOutcome {
        let Self {
            label,
            tasks,
            intercept,
        } = self;
        let total = tasks.len();

        for (step, task) in tasks.into_iter().enumerate() {
            let name = task.name();
            let verdict = intercept
                .as_ref()
                .map(|hook| hook(&task))
                .unwrap_or(Interception::Proceed);

            ctx.begin_step();
            let result = match verdict {
                Interception::Proceed => {
                    trace!(pipeline = %label, step, task = name, "running task");
                    task.execute(ctx).await
                }
                Interception::Complete => {
                    debug!(pipeline = %label, step, task = name, "task completed by intercept");
                    Ok(())
                }
                Interception::Fail(reason) => Err(TaskError::Intercepted(reason)),
            };

            match result {
                Ok(()) => ctx.commit_step(),
                Err(error) => {
                    ctx.rollback_step();
                    ctx.record_failure(name, &error);
                    error!(
                        pipeline = %label,
                        step,
                        task = name,
                        error = %error,
                        "pipeline failed"
                    );
                    return PipelineOutcome::Failed(PipelineFailure {
                        step,
                        task: name,
                        error,
                    });
                }
            }
        }

        debug!(pipeline = %label, steps = total, "pipeline completed");
        PipelineOutcome::Completed { steps: total }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Toy context: a log of applied steps with snapshot support.
    #[derive(Debug, Default)]
    struct Ledger {
        applied: Vec<&'static str>,
        snapshot: Option<Vec<&'static str>>,
        error: Option<String>,
    }

    impl PipelineContext for Ledger {
        fn begin_step(&mut self) {
            self.snapshot = Some(self.applied.clone());
        }
        fn commit_step(&mut self) {
            self.snapshot = None;
        }
        fn rollback_step(&mut self) {
            if let Some(snapshot) = self.snapshot.take() {
                self.applied = snapshot;
            }
        }
        fn record_failure(&mut self, task: &'static str, error: &TaskError) {
            self.error = Some(format!("{task}: {error}"));
        }
    }

    #[derive(Debug)]
    enum Step {
        Apply(&'static str),
        /// Mutates the ledger and then fails, to prove rollback.
        ApplyThenFail(&'static str),
    }

    #[async_trait]
    impl Task for Step {
        type Context = Ledger;

        fn name(&self) -> &'static str {
            match self {
                Step::Apply(n) | Step::ApplyThenFail(n) => *n,
            }
        }

        async fn execute(&self, ctx: &mut Ledger) -> Result<(), TaskError> {
            match self {
                Step::Apply(n) => {
                    tokio::task::yield_now().await;
                    ctx.applied.push(*n);
                    Ok(())
                }
                Step::ApplyThenFail(n) => {
                    ctx.applied.push(*n);
                    Err(TaskError::Precondition(format!("{n} cannot continue")))
                }
            }
        }
    }

    #[tokio::test]
    async fn test_runs_tasks_in_order() {
        let mut ctx = Ledger::default();
        let outcome = TaskPipeline::new(
            "order",
            vec![Step::Apply("a"), Step::Apply("b"), Step::Apply("c")],
        )
        .run(&mut ctx)
        .await;

        assert!(outcome.is_completed());
        assert_eq!(ctx.applied, vec!["a", "b", "c"]);
        assert!(ctx.error.is_none());
    }

    #[tokio::test]
    async fn test_failure_at_step_n_keeps_earlier_steps_and_rolls_back_step_n() {
        let mut ctx = Ledger::default();
        let outcome = TaskPipeline::new(
            "fail-mid",
            vec![
                Step::Apply("a"),
                Step::ApplyThenFail("b"),
                Step::Apply("c"),
            ],
        )
        .run(&mut ctx)
        .await;

        let failure = outcome.failure().expect("pipeline must fail");
        assert_eq!(failure.step, 1);
        assert_eq!(failure.task, "b");
        // Step a committed, step b rolled back, step c never ran.
        assert_eq!(ctx.applied, vec!["a"]);
        assert!(ctx.error.as_deref().unwrap().starts_with("b: "));
    }

    #[tokio::test]
    async fn test_intercept_fail_injects_fault_at_step() {
        let hook: InterceptHook<Step> = Arc::new(|task: &Step| {
            if task.name() == "b" {
                Interception::Fail("injected".into())
            } else {
                Interception::Proceed
            }
        });
        let mut ctx = Ledger::default();
        let outcome = TaskPipeline::new("inject", vec![Step::Apply("a"), Step::Apply("b")])
            .with_intercept(Some(hook))
            .run(&mut ctx)
            .await;

        let failure = outcome.failure().unwrap();
        assert!(matches!(failure.error, TaskError::Intercepted(ref r) if r == "injected"));
        assert_eq!(ctx.applied, vec!["a"]);
    }

    #[tokio::test]
    async fn test_intercept_complete_skips_body() {
        let hook: InterceptHook<Step> = Arc::new(|task: &Step| {
            if task.name() == "a" {
                Interception::Complete
            } else {
                Interception::Proceed
            }
        });
        let mut ctx = Ledger::default();
        let outcome = TaskPipeline::new("skip", vec![Step::Apply("a"), Step::Apply("b")])
            .with_intercept(Some(hook))
            .run(&mut ctx)
            .await;

        assert!(matches!(outcome, PipelineOutcome::Completed { steps: 2 }));
        assert_eq!(ctx.applied, vec!["b"]);
    }

    #[tokio::test]
    async fn test_empty_pipeline_completes() {
        let mut ctx = Ledger::default();
        let pipeline: TaskPipeline<Step> = TaskPipeline::new("empty", vec![]);
        assert!(pipeline.is_empty());
        assert!(pipeline.run(&mut ctx).await.is_completed());
    }

    #[test]
    fn test_verification_errors_are_fatal() {
        assert!(TaskError::Verification("bad sig".into()).is_fatal());
        assert!(!TaskError::Precondition("later".into()).is_fatal());
        assert!(!TaskError::Delivery {
            kind: "PaymentSent".into(),
            reason: "offline".into()
        }
        .is_fatal());
    }
}
