//! Conditions recorded on [`OpsRequest`]s, and the reasons they carry.

use crate::crd::ops_request::{ConditionStatus, OpsCondition, OpsConditionType, OpsRequest};

pub const REASON_VALIDATE_PASSED: &str = "ValidateOpsRequestPassed";
pub const REASON_VALIDATE_FAILED: &str = "ValidateFailed";
pub const REASON_CLUSTER_NOT_FOUND: &str = "ClusterNotFound";
pub const REASON_OPS_TYPE_NOT_SUPPORTED: &str = "OpsTypeNotSupported";
pub const REASON_OPS_REQUEST_FORBIDDEN: &str = "OpsRequestForbidden";
pub const REASON_WAIT_FOR_QUEUE: &str = "WaitForQueue";
pub const REASON_WAIT_FOR_DEPENDENCY: &str = "WaitForDependency";
pub const REASON_DEPENDENCY_UNSUCCESSFUL: &str = "DependencyUnsuccessful";
pub const REASON_WAIT_FOR_CLUSTER_PHASE: &str = "WaitForClusterPhase";
pub const REASON_OPS_REQUEST_SUCCEED: &str = "OpsRequestProcessedSuccessfully";
pub const REASON_OPS_REQUEST_FAILED: &str = "OpsRequestFailed";
pub const REASON_CANCELLING: &str = "CancelOpsRequest";
pub const REASON_CANCEL_REJECTED: &str = "CancelRejected";
pub const REASON_CANCELLED: &str = "CancelSucceed";
pub const REASON_ABORTED: &str = "OpsRequestAborted";
pub const REASON_TIMED_OUT: &str = "Timeout";

fn ops_name(ops: &OpsRequest) -> &str {
    ops.metadata.name.as_deref().unwrap_or_default()
}

pub fn validate_passed(ops: &OpsRequest) -> OpsCondition {
    OpsCondition::new(
        OpsConditionType::Validated,
        ConditionStatus::True,
        REASON_VALIDATE_PASSED,
        format!("OpsRequest: {} is validated", ops_name(ops)),
    )
}

pub fn validate_failed(reason: &str, message: impl Into<String>) -> OpsCondition {
    OpsCondition::new(
        OpsConditionType::Validated,
        ConditionStatus::False,
        reason,
        message,
    )
}

pub fn wait_for_progressing(reason: &str, message: impl Into<String>) -> OpsCondition {
    OpsCondition::new(
        OpsConditionType::WaitForProgressing,
        ConditionStatus::True,
        reason,
        message,
    )
}

/// The condition a handler records when its operation starts.
pub fn progressing(reason: &str, message: impl Into<String>) -> OpsCondition {
    OpsCondition::new(
        OpsConditionType::Progressing,
        ConditionStatus::True,
        reason,
        message,
    )
}

pub fn succeed(ops: &OpsRequest) -> OpsCondition {
    OpsCondition::new(
        OpsConditionType::Succeed,
        ConditionStatus::True,
        REASON_OPS_REQUEST_SUCCEED,
        format!("Successfully processed the OpsRequest: {}", ops_name(ops)),
    )
}

pub fn failed(message: impl Into<String>) -> OpsCondition {
    OpsCondition::new(
        OpsConditionType::Failed,
        ConditionStatus::False,
        REASON_OPS_REQUEST_FAILED,
        message,
    )
}

pub fn cancelling(ops: &OpsRequest) -> OpsCondition {
    OpsCondition::new(
        OpsConditionType::Cancelling,
        ConditionStatus::True,
        REASON_CANCELLING,
        format!("Start to cancel the OpsRequest: {}", ops_name(ops)),
    )
}

pub fn cancel_rejected(message: impl Into<String>) -> OpsCondition {
    OpsCondition::new(
        OpsConditionType::Cancelling,
        ConditionStatus::False,
        REASON_CANCEL_REJECTED,
        message,
    )
}

pub fn cancelled(ops: &OpsRequest) -> OpsCondition {
    OpsCondition::new(
        OpsConditionType::Cancelled,
        ConditionStatus::True,
        REASON_CANCELLED,
        format!("Cancelled the OpsRequest: {}", ops_name(ops)),
    )
}

pub fn dependency_unsuccessful(message: impl Into<String>) -> OpsCondition {
    OpsCondition::new(
        OpsConditionType::Cancelled,
        ConditionStatus::True,
        REASON_DEPENDENCY_UNSUCCESSFUL,
        message,
    )
}

pub fn aborted(reason: &str, message: impl Into<String>) -> OpsCondition {
    OpsCondition::new(
        OpsConditionType::Aborted,
        ConditionStatus::True,
        reason,
        message,
    )
}
