//! Where pipeline events go.

use forgeline_common::PipelineEvent;

/// Receives pipeline events in emission order.
///
/// `emit` returns `false` once the sink no longer accepts events (a
/// cancelled job). Emitters treat that as a stop signal, never as an error.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent) -> bool;
}

/// Logs events through `tracing`. Used by the CLI.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) -> bool {
        match &event {
            PipelineEvent::PhaseStart { phase_id } => tracing::info!(phase = %phase_id, "Phase started"),
            PipelineEvent::PhaseComplete { phase_id, attempts } => {
                tracing::info!(phase = %phase_id, attempts, "Phase complete")
            }
            PipelineEvent::VerificationFailed {
                phase_id,
                attempt,
                message,
            } => tracing::warn!(phase = %phase_id, attempt, "Verification failed: {}", message),
            PipelineEvent::GateFailed {
                phase_id,
                attempt,
                tier,
                message,
            } => tracing::warn!(phase = %phase_id, attempt, tier = %tier, "Gate failed: {}", message),
            PipelineEvent::Escalated { phase_id, from, to } => {
                tracing::warn!(phase = %phase_id, from = %from, to = %to, "Escalated")
            }
            PipelineEvent::HumanRequired { phase_id, request } => tracing::warn!(
                phase = %phase_id,
                request = %request.display(),
                "Human decision required"
            ),
            PipelineEvent::PhaseFailed { phase_id, reason } => {
                tracing::error!(phase = %phase_id, "Phase failed: {}", reason)
            }
            PipelineEvent::PhasesAdded { phase_ids } => {
                tracing::info!(phases = %phase_ids.join(", "), "Generated phases added")
            }
            PipelineEvent::PhaseReverted { from, to } => {
                tracing::warn!(from = %from, to = %to, "Pipeline reverted")
            }
            PipelineEvent::ProjectComplete { phases } => tracing::info!(phases, "Project complete"),
            PipelineEvent::JobFailed { error } => tracing::error!("Run failed: {}", error),
            other => tracing::debug!(event = other.name(), "Pipeline event"),
        }
        true
    }
}
