//! Domain model.

pub mod dependency;
pub mod job;
pub mod operation;
pub mod organization;
pub mod pipeline;

pub use dependency::{Dependency, DependencyCondition};
pub use job::{
    Job, JobMessage, JobStatus, JobStep, JobStepStatus, NewJob, ProgressError, ProgressReport,
    JOB_ID_ATTRIBUTE,
};
pub use operation::{OperationService, PipelineOperation, RemoteHandle};
pub use organization::{NewOrganization, Organization};
pub use pipeline::{
    Accelerators, BootDisk, ClosePolicy, ContainerSpec, InstanceSpec, JobScaler, NewPipeline,
    Pipeline, PipelineStatus, PullingSettings,
};
