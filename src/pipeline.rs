//! Behavior chain: ordered step execution with snapshots, timing and
//! first-error-wins propagation

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{NoOpDiagnostics, PipelineDiagnostics, PipelineError};

/// One step of a pipeline.
///
/// A behavior does its work around `next`: everything before the call runs
/// on the way in, everything after on the way out.
///
/// ```rust,ignore
/// impl Behavior<IncomingContext> for AuditBehavior {
///     fn invoke(&self, ctx: &mut IncomingContext, next: &mut Next<'_, IncomingContext>)
///         -> Result<(), PipelineError>
///     {
///         tracing::info!(message_type = %ctx.message.message_type(), "in");
///         next.invoke(ctx)?;
///         tracing::info!("out");
///         Ok(())
///     }
/// }
/// ```
pub trait Behavior<C>: Send + Sync + 'static {
    /// Run this step; call `next.invoke` to run the remaining steps
    fn invoke(&self, context: &mut C, next: &mut Next<'_, C>) -> Result<(), PipelineError>;
}

/// Resolves a behavior identifier to a runnable instance
pub trait BehaviorBuilder<C>: Send + Sync + 'static {
    /// Build the behavior registered under `behavior`
    fn build(&self, behavior: &str) -> Result<Arc<dyn Behavior<C>>, PipelineError>;
}

type BehaviorFactory<C> = Arc<dyn Fn() -> Arc<dyn Behavior<C>> + Send + Sync>;

/// Behavior builder backed by a map of factories
pub struct BehaviorRegistry<C> {
    factories: HashMap<Box<str>, BehaviorFactory<C>>,
}

impl<C: 'static> BehaviorRegistry<C> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory producing a fresh behavior per chain step
    pub fn register<F>(&mut self, behavior: impl Into<Box<str>>, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Behavior<C>> + Send + Sync + 'static,
    {
        self.factories.insert(behavior.into(), Arc::new(factory));
        self
    }

    /// Register one shared behavior instance
    pub fn register_instance(
        &mut self,
        behavior: impl Into<Box<str>>,
        instance: Arc<dyn Behavior<C>>,
    ) -> &mut Self {
        self.register(behavior, move || instance.clone())
    }
}

impl<C: 'static> Default for BehaviorRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> BehaviorBuilder<C> for BehaviorRegistry<C> {
    fn build(&self, behavior: &str) -> Result<Arc<dyn Behavior<C>>, PipelineError> {
        self.factories
            .get(behavior)
            .map(|factory| factory())
            .ok_or_else(|| PipelineError::Build {
                behavior: behavior.into(),
            })
    }
}

/// One executed step in a pipeline trace
#[derive(Clone, Debug)]
pub struct Step {
    /// Behavior identifier
    pub behavior: Box<str>,
    /// Position of the step in the trace
    pub step_id: usize,
    /// Time spent in the step including everything after it, once it returned
    pub duration: Option<Duration>,
}

/// Append-only trace of one pipeline run
#[derive(Clone, Debug)]
pub struct PipelineInstance {
    started_at: Instant,
    steps: Vec<Step>,
    elapsed: Option<Duration>,
}

impl PipelineInstance {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            steps: Vec::new(),
            elapsed: None,
        }
    }

    fn add_step(&mut self, behavior: &str) -> usize {
        let step_id = self.steps.len();
        self.steps.push(Step {
            behavior: behavior.into(),
            step_id,
            duration: None,
        });
        step_id
    }

    fn complete_steps(&mut self) {
        if self.elapsed.is_none() {
            self.elapsed = Some(self.started_at.elapsed());
        }
    }

    /// Executed steps in order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// True once the run reached its end or its first failure
    pub fn is_completed(&self) -> bool {
        self.elapsed.is_some()
    }

    /// Time from start until the run completed
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }
}

/// Continuation handed to a behavior; runs the rest of the chain
pub struct Next<'a, C> {
    chain: &'a mut BehaviorChain<C>,
}

impl<C: 'static> Next<'_, C> {
    /// Run the remaining steps
    pub fn invoke(&mut self, context: &mut C) -> Result<(), PipelineError> {
        self.chain.invoke_next(context)
    }

    /// Save the remaining steps so they can be replayed
    pub fn take_snapshot(&mut self) {
        self.chain.take_snapshot();
    }

    /// Restore the remaining steps saved by the last snapshot
    pub fn delete_snapshot(&mut self) {
        self.chain.delete_snapshot();
    }

    /// Identifiers of the steps not yet run
    pub fn remaining(&self) -> Vec<&str> {
        self.chain.remaining()
    }
}

/// Execution state of one pipeline run over one context.
///
/// The first error raised by any step is captured and is the one [`invoke`]
/// returns, whatever else fails while the stack unwinds.
///
/// [`invoke`]: BehaviorChain::invoke
pub struct BehaviorChain<C> {
    builder: Arc<dyn BehaviorBuilder<C>>,
    queue: VecDeque<Box<str>>,
    snapshots: Vec<VecDeque<Box<str>>>,
    root_error: Option<PipelineError>,
    instance: PipelineInstance,
}

impl<C: 'static> BehaviorChain<C> {
    /// Create a chain over the given behaviors
    pub fn new<I, B>(behaviors: I, builder: Arc<dyn BehaviorBuilder<C>>) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Box<str>>,
    {
        Self {
            builder,
            queue: behaviors.into_iter().map(Into::into).collect(),
            snapshots: Vec::new(),
            root_error: None,
            instance: PipelineInstance::new(),
        }
    }

    /// Run the chain against `context`
    pub fn invoke(&mut self, context: &mut C) -> Result<(), PipelineError> {
        self.root_error = None;
        self.instance = PipelineInstance::new();

        match self.invoke_next(context) {
            Ok(()) => Ok(()),
            Err(unwound) => Err(self.root_error.take().unwrap_or(unwound)),
        }
    }

    fn invoke_next(&mut self, context: &mut C) -> Result<(), PipelineError> {
        let Some(behavior) = self.queue.pop_front() else {
            self.instance.complete_steps();
            return Ok(());
        };

        let outcome = self.run_step(&behavior, context);
        if let Err(error) = &outcome {
            if self.root_error.is_none() {
                tracing::debug!(behavior = %behavior, error = %error, "Pipeline step failed");
                self.root_error = Some(error.clone());
            }
            self.instance.complete_steps();
        }
        outcome
    }

    fn run_step(&mut self, behavior: &str, context: &mut C) -> Result<(), PipelineError> {
        let instance = self.builder.build(behavior)?;
        let step_id = self.instance.add_step(behavior);

        let started = Instant::now();
        let outcome = instance.invoke(context, &mut Next { chain: self });
        if let Some(step) = self.instance.steps.get_mut(step_id) {
            step.duration = Some(started.elapsed());
        }
        outcome
    }

    /// Save a copy of the remaining steps
    pub fn take_snapshot(&mut self) {
        self.snapshots.push(self.queue.clone());
    }

    /// Restore the remaining steps to the last snapshot
    pub fn delete_snapshot(&mut self) {
        match self.snapshots.pop() {
            Some(snapshot) => self.queue = snapshot,
            None => tracing::warn!("delete_snapshot called without a snapshot"),
        }
    }

    /// Identifiers of the steps not yet run
    pub fn remaining(&self) -> Vec<&str> {
        self.queue.iter().map(|b| &**b).collect()
    }

    /// Trace of the current or last run
    pub fn instance(&self) -> &PipelineInstance {
        &self.instance
    }
}

/// Runs a fixed behavior list for each incoming context
pub struct PipelineExecutor<C> {
    behaviors: Vec<Box<str>>,
    builder: Arc<dyn BehaviorBuilder<C>>,
    diagnostics: Arc<dyn PipelineDiagnostics>,
}

impl<C: 'static> PipelineExecutor<C> {
    /// Create an executor running `behaviors` in order
    pub fn new<I, B>(behaviors: I, builder: Arc<dyn BehaviorBuilder<C>>) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Box<str>>,
    {
        Self {
            behaviors: behaviors.into_iter().map(Into::into).collect(),
            builder,
            diagnostics: Arc::new(NoOpDiagnostics),
        }
    }

    /// Hand every finished trace to `diagnostics`
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn PipelineDiagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// A fresh chain over this executor's behaviors
    pub fn chain(&self) -> BehaviorChain<C> {
        BehaviorChain::new(self.behaviors.iter().cloned(), self.builder.clone())
    }

    /// Process one context through the pipeline
    pub fn invoke(&self, context: &mut C) -> Result<(), PipelineError> {
        let mut chain = self.chain();
        let outcome = chain.invoke(context);
        // diagnostics never change the outcome of the run
        if let Err(error) = self.diagnostics.record(chain.instance()) {
            tracing::warn!(error = %error, succeeded = outcome.is_ok(), "Pipeline diagnostics failed");
        }
        outcome
    }
}
