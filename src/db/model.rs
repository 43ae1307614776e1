//! Data-model entities (§3 of the spec).
//!
//! These are plain serde structs; persistence lives in [`super::store`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Opaque short token for a new `app_id`/`function_id` (§3): a uuid v4 with
/// hyphens stripped, truncated to 12 hex characters. Collisions are resolved
/// by the caller's unique-name constraint at insert time, not by this
/// generator.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Deleting,
    Error,
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AppStatus::Starting => "starting",
            AppStatus::Running => "running",
            AppStatus::Stopping => "stopping",
            AppStatus::Stopped => "stopped",
            AppStatus::Deleting => "deleting",
            AppStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AppStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "starting" => AppStatus::Starting,
            "running" => AppStatus::Running,
            "stopping" => AppStatus::Stopping,
            "stopped" => AppStatus::Stopped,
            "deleting" => AppStatus::Deleting,
            "error" => AppStatus::Error,
            other => return Err(format!("unknown application status: {other}")),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allowed_methods: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub app_id: String,
    pub app_name: String,
    pub db_password: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub common_dependencies: Vec<DependencySpec>,
    #[serde(default)]
    pub environment_variables: Vec<EnvVar>,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub ai: AiConfig,
    pub status: AppStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Application {
    /// `app_id`, lowercase-normalized for DNS/bucket names (§3).
    pub fn app_id_lc(&self) -> String {
        self.app_id.to_ascii_lowercase()
    }

    pub fn container_name(&self) -> String {
        format!("hyac-app-runtime-{}", self.app_id_lc())
    }

    pub fn data_bucket(&self) -> String {
        self.app_id_lc()
    }

    pub fn web_bucket(&self) -> String {
        format!("web-{}", self.app_id_lc())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionType {
    Endpoint,
    Common,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionStatus {
    Unpublished,
    Published,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyacFunction {
    pub function_id: String,
    pub function_name: String,
    pub app_id: String,
    pub function_type: FunctionType,
    pub status: FunctionStatus,
    pub code: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    pub timeout: u64,
    pub memory_limit: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionHistoryEntry {
    pub id: i64,
    pub function_id: String,
    pub old_code: String,
    pub new_code: String,
    pub updated_by: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    StartApp,
    StopApp,
    RestartApp,
    DeleteApp,
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskAction::StartApp => "start_app",
            TaskAction::StopApp => "stop_app",
            TaskAction::RestartApp => "restart_app",
            TaskAction::DeleteApp => "delete_app",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub app_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub action: TaskAction,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn new(action: TaskAction, app_id: impl Into<String>) -> Self {
        let ts = now();
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            action,
            payload: TaskPayload {
                app_id: app_id.into(),
            },
            status: TaskStatus::Pending,
            result: None,
            created_at: ts,
            updated_at: ts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Cron,
    Interval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub app_id: String,
    pub function_id: String,
    pub trigger: TriggerKind,
    /// Cron expression for `Cron`, seconds-as-string for `Interval`.
    pub trigger_config: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub body: Value,
    pub enabled: bool,
    pub is_system_task: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricStatus {
    Success,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionMetric {
    pub function_id: String,
    pub function_name: String,
    pub app_id: String,
    pub status: MetricStatus,
    pub execution_time: f64,
    pub timestamp: i64,
    #[serde(default)]
    pub extra: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    System,
    Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub logtype: LogType,
    pub message: String,
    pub app_id: Option<String>,
    pub function_id: Option<String>,
    #[serde(default)]
    pub extras: Value,
    pub timestamp: i64,
}

pub(super) fn timestamp() -> i64 {
    now()
}
