use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// API group shared by every Hibernator resource.
pub const GROUP: &str = "hibernator.ardikabs.com";

/// Finalizer attached to every observed `HibernatePlan`.
pub const FINALIZER: &str = "hibernator.ardikabs.com/finalizer";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OffHourWindow {
    /// Window opening time, "HH:MM" 24h in the plan's timezone.
    pub start: String,
    /// Window closing time, "HH:MM". Numerically `end <= start` makes the
    /// window overnight (it crosses midnight into the next day).
    pub end: String,
    /// Three-letter uppercase day names (SUN..SAT) the window opens on.
    pub days_of_week: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanSchedule {
    /// IANA timezone name the off-hour windows are expressed in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Ordered, non-empty list of recurring off-hour windows.
    pub off_hours: Vec<OffHourWindow>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Ordered pair: `to` waits for `from`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub from: String,
    pub to: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StageSpec {
    #[serde(default)]
    pub name: Option<String>,
    /// Target names executed within this stage.
    pub targets: Vec<String>,
    /// When true, targets in this stage run up to the global concurrency
    /// bound; otherwise one at a time.
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutionStrategy {
    Sequential,
    /// All targets at once, bounded by `maxConcurrency`.
    #[serde(rename_all = "camelCase")]
    Parallel {
        #[serde(default)]
        max_concurrency: Option<u32>,
    },
    /// Dependency-ordered execution; stages are topological levels.
    #[serde(rename = "dag", rename_all = "camelCase")]
    Dag {
        #[serde(default)]
        dependencies: Vec<Dependency>,
        #[serde(default)]
        max_concurrency: Option<u32>,
    },
    /// Operator-declared stages, walked in order.
    #[serde(rename_all = "camelCase")]
    Staged {
        stages: Vec<StageSpec>,
        #[serde(default)]
        max_concurrency: Option<u32>,
    },
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        Self::Sequential
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    #[serde(default)]
    pub strategy: ExecutionStrategy,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorRef {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Unique within the plan; used as a routing label on runner jobs.
    pub name: String,
    /// Executor tag handed to the runner (`--target-type`).
    #[serde(rename = "type")]
    pub target_type: String,
    pub connector_ref: ConnectorRef,
    /// Opaque executor parameters, passed to the runner as raw JSON.
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum FailureMode {
    /// Any failed target aborts the cycle.
    #[default]
    Strict,
    /// Failed targets are recorded but the cycle continues.
    BestEffort,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Behavior {
    #[serde(default)]
    pub mode: FailureMode,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            mode: FailureMode::default(),
            fail_fast: false,
            retries: default_retries(),
        }
    }
}

fn default_retries() -> u32 {
    3
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "hibernator.ardikabs.com",
    version = "v1alpha1",
    kind = "HibernatePlan",
    plural = "hibernateplans",
    derive = "PartialEq",
    status = "HibernatePlanStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.nextHibernate\", \"name\": \"NEXT-HIBERNATE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.nextWakeUp\", \"name\": \"NEXT-WAKEUP\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.currentOperation\", \"name\": \"OPERATION\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.currentStageIndex\", \"name\": \"STAGE\", \"type\": \"integer\" }"
)]
#[kube(printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }")]
#[serde(rename_all = "camelCase")]
pub struct HibernatePlanSpec {
    pub schedule: PlanSchedule,
    #[serde(default)]
    pub execution: ExecutionConfig,
    pub targets: Vec<Target>,
    #[serde(default)]
    pub behavior: Behavior,
    /// Operator toggle; the only spec field the engine writes back.
    #[serde(default)]
    pub suspend: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum PlanPhase {
    Active,
    Hibernating,
    Hibernated,
    WakingUp,
    Suspended,
    Error,
}

impl FromStr for PlanPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Active" => Ok(PlanPhase::Active),
            "Hibernating" => Ok(PlanPhase::Hibernating),
            "Hibernated" => Ok(PlanPhase::Hibernated),
            "WakingUp" => Ok(PlanPhase::WakingUp),
            "Suspended" => Ok(PlanPhase::Suspended),
            "Error" => Ok(PlanPhase::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for PlanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanPhase::Active => write!(f, "Active"),
            PlanPhase::Hibernating => write!(f, "Hibernating"),
            PlanPhase::Hibernated => write!(f, "Hibernated"),
            PlanPhase::WakingUp => write!(f, "WakingUp"),
            PlanPhase::Suspended => write!(f, "Suspended"),
            PlanPhase::Error => write!(f, "Error"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Shutdown,
    Wakeup,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Shutdown => "shutdown",
            Operation::Wakeup => "wakeup",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shutdown" => Ok(Operation::Shutdown),
            "wakeup" => Ok(Operation::Wakeup),
            _ => Err(()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum ExecutionState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Failed)
    }
}

/// Per-target execution record for the current operation.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    pub target: String,
    pub executor: String,
    #[serde(default)]
    pub state: ExecutionState,
    pub started_at: Option<Time>,
    pub finished_at: Option<Time>,
    #[serde(default)]
    pub attempts: u32,
    pub job_ref: Option<String>,
    pub logs_ref: Option<String>,
    pub message: Option<String>,
    pub restore_config_map_ref: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetExecutionResult {
    pub target: String,
    pub success: bool,
    pub message: Option<String>,
}

/// Summary of one completed operation within a cycle.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub operation: Operation,
    pub start_time: Option<Time>,
    pub end_time: Option<Time>,
    pub success: bool,
    #[serde(default)]
    pub target_results: Vec<TargetExecutionResult>,
}

/// One shutdown plus its eventual wakeup, keyed by the cycle ID minted at
/// shutdown start.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCycle {
    pub cycle_id: String,
    pub shutdown_execution: Option<ExecutionSummary>,
    pub wakeup_execution: Option<ExecutionSummary>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionType {
    Extend,
    Suspend,
    Replace,
}

impl fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionType::Extend => write!(f, "extend"),
            ExceptionType::Suspend => write!(f, "suspend"),
            ExceptionType::Replace => write!(f, "replace"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum ExceptionState {
    #[default]
    Pending,
    Active,
    Expired,
}

impl fmt::Display for ExceptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionState::Pending => write!(f, "Pending"),
            ExceptionState::Active => write!(f, "Active"),
            ExceptionState::Expired => write!(f, "Expired"),
        }
    }
}

/// Compact projection of a known `ScheduleException`, kept on the plan status.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionReference {
    pub name: String,
    #[serde(rename = "type")]
    pub exception_type: ExceptionType,
    pub state: ExceptionState,
    pub valid_from: Option<Time>,
    pub valid_until: Option<Time>,
    pub expired_at: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HibernatePlanStatus {
    /// Unset until the reconciler initializes the plan.
    pub phase: Option<PlanPhase>,
    #[serde(default)]
    pub observed_generation: i64,
    pub last_transition_time: Option<Time>,
    /// 8-char opaque token; minted on shutdown start, reused by the wakeup.
    pub current_cycle_id: Option<String>,
    pub current_operation: Option<Operation>,
    #[serde(default)]
    pub current_stage_index: u32,
    #[serde(default)]
    pub executions: Vec<ExecutionStatus>,
    /// Ring buffer of completed cycles, newest last, length <= 5.
    #[serde(default)]
    pub execution_history: Vec<ExecutionCycle>,
    #[serde(default)]
    pub active_exceptions: Vec<ExceptionReference>,
    #[serde(default)]
    pub retry_count: u32,
    pub last_retry_time: Option<Time>,
    pub error_message: Option<String>,
    pub next_hibernate: Option<Time>,
    pub next_wake_up: Option<Time>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanReference {
    pub name: String,
}

#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "hibernator.ardikabs.com",
    version = "v1alpha1",
    kind = "ScheduleException",
    plural = "scheduleexceptions",
    derive = "PartialEq",
    status = "ScheduleExceptionStatus",
    namespaced
)]
#[kube(printcolumn = "{\"jsonPath\": \".spec.type\", \"name\": \"TYPE\", \"type\": \"string\" }")]
#[kube(printcolumn = "{\"jsonPath\": \".status.state\", \"name\": \"STATE\", \"type\": \"string\" }")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.validFrom\", \"name\": \"VALID-FROM\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.validUntil\", \"name\": \"VALID-UNTIL\", \"type\": \"string\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleExceptionSpec {
    /// The plan this exception modifies. The exception must also carry the
    /// `hibernator.ardikabs.com/plan` label with the same name.
    pub plan_ref: PlanReference,
    #[serde(rename = "type")]
    pub exception_type: ExceptionType,
    pub valid_from: Time,
    pub valid_until: Time,
    /// Exception windows; meaning depends on `type`.
    #[serde(default)]
    pub windows: Vec<OffHourWindow>,
    /// Duration string (e.g. "1h"); suspend exceptions only. Hibernation must
    /// not start within this long before a suspension window opens.
    #[serde(default)]
    pub lead_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleExceptionStatus {
    #[serde(default)]
    pub state: ExceptionState,
    pub applied_at: Option<Time>,
    pub expired_at: Option<Time>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
}
