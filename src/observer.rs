//! Pipeline diagnostics sinks

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::{PipelineError, PipelineInstance};

/// Receives the trace of every finished pipeline run
pub trait PipelineDiagnostics: Send + Sync + 'static {
    /// Record a finished run
    fn record(&self, instance: &PipelineInstance) -> Result<(), PipelineError>;
}

/// Diagnostics sink that discards traces
pub struct NoOpDiagnostics;

impl PipelineDiagnostics for NoOpDiagnostics {
    fn record(&self, _instance: &PipelineInstance) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Tracing-based diagnostics
pub struct TracingDiagnostics;

impl PipelineDiagnostics for TracingDiagnostics {
    fn record(&self, instance: &PipelineInstance) -> Result<(), PipelineError> {
        for step in instance.steps() {
            tracing::debug!(
                behavior = %step.behavior,
                step_id = step.step_id,
                duration_us = step.duration.map(|d| d.as_micros() as u64),
                "Pipeline step"
            );
        }
        tracing::info!(
            steps = instance.steps().len(),
            elapsed_us = instance.elapsed().map(|d| d.as_micros() as u64),
            completed = instance.is_completed(),
            "Pipeline completed"
        );
        Ok(())
    }
}

/// Keeps the most recent traces in memory
pub struct InMemoryDiagnostics {
    capacity: usize,
    instances: Mutex<VecDeque<PipelineInstance>>,
}

impl InMemoryDiagnostics {
    /// Keep at most `capacity` traces, dropping the oldest first
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            instances: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Retained traces, oldest first
    pub fn instances(&self) -> Vec<PipelineInstance> {
        self.instances
            .lock()
            .map(|instances| instances.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryDiagnostics {
    fn default() -> Self {
        Self::with_capacity(64)
    }
}

impl PipelineDiagnostics for InMemoryDiagnostics {
    fn record(&self, instance: &PipelineInstance) -> Result<(), PipelineError> {
        if self.capacity == 0 {
            return Ok(());
        }
        let mut instances = self
            .instances
            .lock()
            .map_err(|_| PipelineError::collaborator("diagnostics lock poisoned"))?;
        while instances.len() >= self.capacity {
            instances.pop_front();
        }
        instances.push_back(instance.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Behavior, BehaviorRegistry, Next, PipelineExecutor};
    use std::sync::Arc;

    struct Pass;

    impl Behavior<()> for Pass {
        fn invoke(&self, context: &mut (), next: &mut Next<'_, ()>) -> Result<(), PipelineError> {
            next.invoke(context)
        }
    }

    #[test]
    fn test_in_memory_keeps_most_recent() {
        let mut registry = BehaviorRegistry::new();
        registry.register_instance("a", Arc::new(Pass));
        registry.register_instance("b", Arc::new(Pass));
        let diagnostics = Arc::new(InMemoryDiagnostics::with_capacity(2));

        let short = PipelineExecutor::new(["a"], Arc::new(registry))
            .with_diagnostics(diagnostics.clone());
        short.invoke(&mut ()).unwrap();
        short.invoke(&mut ()).unwrap();

        let mut registry = BehaviorRegistry::new();
        registry.register_instance("a", Arc::new(Pass));
        registry.register_instance("b", Arc::new(Pass));
        let long = PipelineExecutor::new(["a", "b"], Arc::new(registry))
            .with_diagnostics(diagnostics.clone());
        long.invoke(&mut ()).unwrap();

        let traces = diagnostics.instances();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].steps().len(), 1);
        assert_eq!(traces[1].steps().len(), 2);
    }
}
