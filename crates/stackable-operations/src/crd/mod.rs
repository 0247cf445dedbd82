//! Custom resources read and written by the operations engine.

use jiff::Timestamp;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

pub mod cluster;
pub mod ops_definition;
pub mod ops_request;

pub(crate) fn now() -> Time {
    Time(Timestamp::now())
}
