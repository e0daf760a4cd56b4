// Execution Events
// Progress reporting for chain execution and the stage pipeline

use crate::plan::models::ToolKind;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during an orchestration run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Chain execution started
    ChainStarted {
        chain_id: String,
        strategy: String,
        total_groups: usize,
        total_steps: usize,
    },

    /// Chain execution completed
    ChainCompleted {
        chain_id: String,
        success: bool,
        duration: Duration,
    },

    /// Execution group dispatched
    GroupStarted { group_index: usize, tools: Vec<String> },

    /// Every step of the group returned
    GroupCompleted {
        group_index: usize,
        duration: Duration,
    },

    /// Step dispatched to its handler
    StepStarted {
        step_id: String,
        tool_kind: ToolKind,
        group_index: usize,
    },

    /// Step returned
    StepCompleted {
        step_id: String,
        success: bool,
        duration: Duration,
    },

    /// Step was not dispatched
    StepSkipped { step_id: String, reason: String },

    /// Pipeline stage started
    StageStarted { stage: String },

    /// Pipeline stage finished, successfully or not
    StageCompleted {
        stage: String,
        ok: bool,
        duration: Duration,
    },

    /// Recoverable problem worth surfacing
    Warning { message: String, step_id: Option<String> },
}

impl ExecutionEvent {
    /// Create a chain started event
    pub fn chain_started(
        chain_id: impl Into<String>,
        strategy: impl Into<String>,
        total_groups: usize,
        total_steps: usize,
    ) -> Self {
        Self::ChainStarted {
            chain_id: chain_id.into(),
            strategy: strategy.into(),
            total_groups,
            total_steps,
        }
    }

    /// Create a chain completed event
    pub fn chain_completed(chain_id: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::ChainCompleted {
            chain_id: chain_id.into(),
            success,
            duration,
        }
    }

    /// Create a step started event
    pub fn step_started(step_id: impl Into<String>, tool_kind: ToolKind, group_index: usize) -> Self {
        Self::StepStarted {
            step_id: step_id.into(),
            tool_kind,
            group_index,
        }
    }

    /// Create a step completed event
    pub fn step_completed(step_id: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::StepCompleted {
            step_id: step_id.into(),
            success,
            duration,
        }
    }

    /// Create a step skipped event
    pub fn step_skipped(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StepSkipped {
            step_id: step_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a stage completed event
    pub fn stage_completed(stage: impl Into<String>, ok: bool, duration: Duration) -> Self {
        Self::StageCompleted {
            stage: stage.into(),
            ok,
            duration,
        }
    }

    /// Create a warning event
    pub fn warning(message: impl Into<String>, step_id: Option<String>) -> Self {
        Self::Warning {
            message: message.into(),
            step_id,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
