//! Typed ID definitions for all batchfleet resources.
//!
//! Each ID type has a unique prefix that identifies the resource type.

use crate::define_id;

// =============================================================================
// Tenancy
// =============================================================================

define_id!(OrgId, "org");

// =============================================================================
// Pipelines and their remote operations
// =============================================================================

define_id!(PipelineId, "pl");
define_id!(OperationId, "op");

// =============================================================================
// Work items
// =============================================================================

define_id!(JobId, "job");

// =============================================================================
// Scheduling and requests
// =============================================================================

define_id!(TaskId, "task");
define_id!(RequestId, "req");

// =============================================================================
// Tests
// =============================================================================
