//! Run statuses for tasks and steps, and the user-facing human status.

wire_enum! {
    /// Run status of a task.
    pub enum TaskStatus {
        Created => "created",
        Running => "running",
        /// Paused by monitoring.
        Stopped => "stopped",
        Finished => "finished",
        Canceled => "canceled",
        Error => "error",
        NoSuccess => "no_success",
    }
}

impl TaskStatus {
    /// Whether the task can no longer advance without a restart.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Canceled | TaskStatus::Error | TaskStatus::NoSuccess
        )
    }
}

wire_enum! {
    /// Status of one step (one visit to a block).
    pub enum StepStatus {
        Idle => "idle",
        Running => "running",
        Finished => "finished",
        Canceled => "canceled",
        Skipped => "skipped",
        NoSuccess => "no_success",
        Error => "error",
    }
}

impl StepStatus {
    /// Statuses after which the orchestrator evaluates outgoing sockets.
    pub fn is_traversable(&self) -> bool {
        matches!(
            self,
            StepStatus::Finished | StepStatus::NoSuccess | StepStatus::Error
        )
    }

    /// Statuses a restart treats as "already reached".
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            StepStatus::Finished | StepStatus::Skipped | StepStatus::Canceled | StepStatus::NoSuccess
        )
    }

    /// Statuses that still wait for an external event.
    pub fn is_open(&self) -> bool {
        matches!(self, StepStatus::Idle | StepStatus::Running)
    }
}

wire_enum! {
    /// Finer-grained, user-facing label of where a task currently is.
    pub enum HumanStatus {
        New => "new",
        Approvement => "approvement",
        Approved => "approved",
        Rejected => "rejected",
        Wait => "wait",
        Execution => "execution",
        Executed => "executed",
        Signing => "signing",
        Signed => "signed",
        Processing => "processing",
        Done => "done",
        Canceled => "canceled",
        Revoke => "revoke",
        Error => "error",
        NoSuccess => "no_success",
    }
}
