//! Pipelines: requested pools of worker VMs.

use batchfleet_id::{OrgId, PipelineId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::dependency::Dependency;
use super::job::{Job, JobStatus};

/// Pipeline lifecycle status.
///
/// `Created → Pending → Reserved → Building → Deploying → {Opened | Broken}`,
/// then `Opened → Closing → {Closed | ClosingError}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Created,
    Pending,
    Reserved,
    Building,
    Deploying,
    Opened,
    Broken,
    Closing,
    ClosingError,
    Closed,
}

impl PipelineStatus {
    pub const ALL: [PipelineStatus; 10] = [
        Self::Created,
        Self::Pending,
        Self::Reserved,
        Self::Building,
        Self::Deploying,
        Self::Opened,
        Self::Broken,
        Self::Closing,
        Self::ClosingError,
        Self::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Reserved => "reserved",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Opened => "opened",
            Self::Broken => "broken",
            Self::Closing => "closing",
            Self::ClosingError => "closing_error",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Queued: no remote resource exists yet.
    pub fn is_not_deployed_yet(&self) -> bool {
        matches!(self, Self::Created | Self::Pending | Self::Reserved)
    }

    pub fn is_deploying(&self) -> bool {
        matches!(self, Self::Building | Self::Deploying)
    }

    /// States a close request may act on.
    pub fn is_closable(&self) -> bool {
        matches!(self, Self::Opened | Self::Broken | Self::ClosingError)
    }

    /// Returns false once the pipeline can no longer run new jobs.
    pub fn accepts_jobs(&self) -> bool {
        !matches!(
            self,
            Self::Broken | Self::Closing | Self::ClosingError | Self::Closed
        )
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a pipeline whose jobs have all finished is closed automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClosePolicy {
    #[default]
    CloseAnyway,
    CloseOnAllSuccess,
    CloseNever,
}

impl ClosePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CloseAnyway => "CloseAnyway",
            Self::CloseOnAllSuccess => "CloseOnAllSuccess",
            Self::CloseNever => "CloseNever",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CloseAnyway" => Some(Self::CloseAnyway),
            "CloseOnAllSuccess" => Some(Self::CloseOnAllSuccess),
            "CloseNever" => Some(Self::CloseNever),
            _ => None,
        }
    }

    /// Returns true if a pipeline with these (finished) jobs may close.
    pub fn allows_close(&self, jobs: &[Job]) -> bool {
        match self {
            Self::CloseAnyway => true,
            Self::CloseOnAllSuccess => jobs.iter().all(|j| j.status == JobStatus::Success),
            Self::CloseNever => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct BootDisk {
    #[validate(length(min = 1, message = "source_image is required"))]
    pub source_image: String,

    #[serde(default)]
    pub disk_size_gb: Option<u32>,

    #[serde(default)]
    pub disk_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accelerators {
    #[serde(default)]
    pub count: u32,

    #[serde(default, rename = "type")]
    pub accelerator_type: String,
}

/// Shape of each worker VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct InstanceSpec {
    #[validate(length(min = 1, message = "machine_type is required"))]
    pub machine_type: String,

    #[validate(nested)]
    pub boot_disk: BootDisk,

    #[serde(default)]
    pub gpu_accelerators: Accelerators,

    #[serde(default)]
    pub preemptible: bool,

    #[serde(default)]
    pub stackdriver_agent: bool,
}

/// Container each worker VM runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ContainerSpec {
    #[validate(length(min = 1, message = "container image is required"))]
    pub image: String,

    /// Containers per VM.
    #[validate(range(min = 1, message = "container size must be at least 1"))]
    pub size: u32,

    #[serde(default)]
    pub command: String,

    #[serde(default)]
    pub docker_run_options: String,
}

/// How the progress subscription is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct PullingSettings {
    #[serde(default = "default_message_per_pull")]
    #[validate(range(min = 1, max = 1000, message = "message_per_pull must be between 1 and 1000"))]
    pub message_per_pull: u32,

    #[serde(default = "default_interval_seconds")]
    #[validate(range(min = 1, max = 86400, message = "interval_seconds must be between 1 and 86400"))]
    pub interval_seconds: u64,

    /// Unfinished jobs per extra pull in one subscription pass.
    #[serde(default = "default_jobs_per_task")]
    #[validate(range(min = 1, message = "jobs_per_task must be at least 1"))]
    pub jobs_per_task: u32,
}

fn default_message_per_pull() -> u32 {
    100
}

fn default_interval_seconds() -> u64 {
    30
}

fn default_jobs_per_task() -> u32 {
    50
}

/// Most pulls made in one subscription pass.
const MAX_PULLS_PER_PASS: u32 = 10;

impl Default for PullingSettings {
    fn default() -> Self {
        Self {
            message_per_pull: default_message_per_pull(),
            interval_seconds: default_interval_seconds(),
            jobs_per_task: default_jobs_per_task(),
        }
    }
}

impl PullingSettings {
    /// Pulls to make in one pass given the number of unfinished jobs.
    pub fn pulls_for(&self, unfinished: usize) -> u32 {
        let per_task = self.jobs_per_task.max(1) as usize;
        let pulls = unfinished / per_task + 1;
        u32::try_from(pulls)
            .unwrap_or(MAX_PULLS_PER_PASS)
            .min(MAX_PULLS_PER_PASS)
    }
}

/// Grows the instance group when ready work outnumbers container slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_job_scaler"))]
pub struct JobScaler {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub max_instance_size: u32,
}

fn validate_job_scaler(scaler: &JobScaler) -> Result<(), ValidationError> {
    if scaler.enabled && scaler.max_instance_size == 0 {
        let mut err = ValidationError::new("job_scaler");
        err.message = Some("max_instance_size must be at least 1 when job_scaler is enabled".into());
        return Err(err);
    }
    Ok(())
}

impl JobScaler {
    /// Returns true if the group may still grow past `current`.
    pub fn can_scale(&self, current: u32) -> bool {
        self.enabled && current < self.max_instance_size
    }

    /// New instance group size for `working` jobs, or `None` when the
    /// current size has enough container slots or cannot grow.
    pub fn desired_size(&self, working: usize, container_size: u32, current: u32) -> Option<u32> {
        if !self.can_scale(current) {
            return None;
        }
        let per_vm = container_size.max(1) as usize;
        let slots = current as usize * per_vm;
        if working <= slots {
            return None;
        }
        let needed = u32::try_from(working.div_ceil(per_vm)).unwrap_or(u32::MAX);
        Some(needed.min(self.max_instance_size))
    }
}

/// A requested pool of worker VMs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub org_id: OrgId,
    pub name: String,
    pub project_id: String,
    pub zone: String,
    pub instance: InstanceSpec,
    pub container: ContainerSpec,
    pub target_size: u32,

    /// Tokens debited from the organization while the pipeline is active.
    /// Fixed at creation.
    pub token_consumption: i64,

    pub status: PipelineStatus,
    pub dependency: Dependency,
    pub close_policy: ClosePolicy,
    pub pulling: PullingSettings,
    pub job_scaler: JobScaler,
    pub deployment_name: Option<String>,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a pipeline.
#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_gpu_image"))]
pub struct NewPipeline {
    #[validate(custom(function = "validate_resource_name"))]
    pub name: String,

    #[validate(length(min = 1, message = "project_id is required"))]
    pub project_id: String,

    #[validate(length(min = 1, message = "zone is required"))]
    pub zone: String,

    #[validate(nested)]
    pub instance: InstanceSpec,

    #[validate(nested)]
    pub container: ContainerSpec,

    #[validate(range(min = 1, message = "target_size must be at least 1"))]
    pub target_size: u32,

    #[validate(range(min = 0, message = "token_consumption cannot be negative"))]
    #[serde(default)]
    pub token_consumption: i64,

    #[serde(default)]
    pub dependency: Dependency,

    #[serde(default)]
    pub close_policy: ClosePolicy,

    #[serde(default)]
    #[validate(nested)]
    pub pulling: PullingSettings,

    #[serde(default)]
    #[validate(nested)]
    pub job_scaler: JobScaler,
}

/// Longest accepted pipeline name. Derived resource names append
/// suffixes and must stay within the 63-character cloud limit.
const MAX_NAME_LEN: usize = 50;

fn validate_resource_name(name: &str) -> Result<(), ValidationError> {
    let mut chars = name.chars();
    let valid = name.len() <= MAX_NAME_LEN
        && chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        let mut err = ValidationError::new("resource_name");
        err.message = Some(
            "name must start with a lowercase letter and contain only lowercase letters, digits and hyphens"
                .into(),
        );
        Err(err)
    }
}

fn is_gpu_capable_image(source_image: &str) -> bool {
    source_image
        .find("ubuntu")
        .is_some_and(|at| source_image[at..].contains("1604"))
}

fn validate_gpu_image(input: &NewPipeline) -> Result<(), ValidationError> {
    let instance = &input.instance;
    if instance.gpu_accelerators.count > 0 && !is_gpu_capable_image(&instance.boot_disk.source_image)
    {
        let mut err = ValidationError::new("gpu_image");
        err.message = Some("GPU pipelines require an Ubuntu 16.04 boot image".into());
        return Err(err);
    }
    Ok(())
}

impl Pipeline {
    /// Build a new pipeline in `Created` from validated input.
    pub fn new(org_id: OrgId, input: NewPipeline) -> Self {
        let now = Utc::now();
        Self {
            id: PipelineId::new(),
            org_id,
            name: input.name,
            project_id: input.project_id,
            zone: input.zone,
            instance: input.instance,
            container: input.container,
            target_size: input.target_size,
            token_consumption: input.token_consumption,
            status: PipelineStatus::Created,
            dependency: input.dependency,
            close_policy: input.close_policy,
            pulling: input.pulling,
            job_scaler: input.job_scaler,
            deployment_name: None,
            cancelled: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fully qualified job topic.
    pub fn job_topic(&self) -> String {
        format!("projects/{}/topics/{}-job-topic", self.project_id, self.name)
    }

    /// Fully qualified progress subscription.
    pub fn progress_subscription(&self) -> String {
        format!(
            "projects/{}/subscriptions/{}-progress-subscription",
            self.project_id, self.name
        )
    }

    /// Name of the managed instance group created for this pipeline.
    pub fn instance_group_name(&self) -> String {
        format!("{}-igm", self.name)
    }

    /// Deployment name, falling back to the pipeline name before one is
    /// recorded.
    pub fn deployment(&self) -> &str {
        self.deployment_name.as_deref().unwrap_or(&self.name)
    }
}
