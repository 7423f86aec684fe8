pub mod shutdown;

/// Namespace the controller itself runs in unless overridden via
/// `HIBERNATOR_CONTROLLER_NAMESPACE`.
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "hibernator-system";

/// API group prefix for all well-known labels.
pub const LABEL_PREFIX: &str = "hibernator.ardikabs.com";

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

/// Routing labels stamped on runner jobs (and the plan label on exceptions).
pub mod labels {
    use super::LABEL_PREFIX;
    use const_format::concatcp;

    pub const PLAN: &str = concatcp!(LABEL_PREFIX, "/plan");
    pub const TARGET: &str = concatcp!(LABEL_PREFIX, "/target");
    pub const OPERATION: &str = concatcp!(LABEL_PREFIX, "/operation");
    pub const EXECUTION_ID: &str = concatcp!(LABEL_PREFIX, "/execution-id");
    pub const EXECUTOR: &str = concatcp!(LABEL_PREFIX, "/executor");
    pub const CYCLE_ID: &str = concatcp!(LABEL_PREFIX, "/cycle-id");
    /// Set to "true" on jobs the engine has logically retired; such jobs are
    /// excluded from all state aggregation.
    pub const STALE: &str = concatcp!(LABEL_PREFIX, "/stale");
    pub const STALE_REASON: &str = concatcp!(LABEL_PREFIX, "/stale-reason");
}

/// Well-known annotations on plans and runner jobs.
pub mod annotations {
    use super::LABEL_PREFIX;
    use const_format::concatcp;

    /// Short-form markers on runner jobs.
    pub const PLAN: &str = "hibernator/plan";
    pub const TARGET: &str = "hibernator/target";

    /// Phase the plan held when it was suspended; consulted on resume.
    pub const SUSPENDED_AT_PHASE: &str = concatcp!(LABEL_PREFIX, "/suspended-at-phase");
    /// RFC3339 deadline after which the suspension self-clears.
    pub const SUSPEND_UNTIL: &str = concatcp!(LABEL_PREFIX, "/suspend-until");
    pub const SUSPEND_REASON: &str = concatcp!(LABEL_PREFIX, "/suspend-reason");
    /// Per-target restoration tally: `restored-<target>` = "true".
    pub const RESTORED_PREFIX: &str = concatcp!(LABEL_PREFIX, "/restored-");
    pub const RESTORE_PREVIOUS_STATE: &str = concatcp!(LABEL_PREFIX, "/restore-previous-state");
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}
