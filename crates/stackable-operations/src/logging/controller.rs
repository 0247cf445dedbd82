//! Facilities for reporting controller outcomes
//!
//! The primary entry point is [`report_controller_reconciled`].

use std::error::Error;

use kube::{
    Resource,
    runtime::{
        controller::{self, Action},
        reflector::ObjectRef,
    },
};

/// [`Error`] extensions that help report reconciliation errors
///
/// This should be implemented for reconciler error types.
pub trait ReconcilerError: Error {
    /// `PascalCase`d name for the error category
    ///
    /// This can typically be implemented by delegating to [`strum::IntoStaticStr`].
    fn category(&self) -> &'static str;
}

/// Reports the controller reconciliation result to the current [`tracing::Subscriber`]
pub fn report_controller_reconciled<K, ReconcileErr, QueueErr>(
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<ReconcileErr, QueueErr>>,
) where
    K: Resource,
    ReconcileErr: ReconcilerError,
    QueueErr: Error,
{
    match result {
        Ok((obj, _)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %obj,
                "Reconciled object"
            );
        }
        Err(err) => report_controller_error(controller_name, err),
    }
}

fn report_controller_error<ReconcileErr, QueueErr>(
    controller_name: &str,
    error: &controller::Error<ReconcileErr, QueueErr>,
) where
    ReconcileErr: ReconcilerError,
    QueueErr: Error,
{
    let category = if let controller::Error::ReconcilerFailed(err, _) = error {
        err.category()
    } else {
        "Controller"
    };
    tracing::error!(
        controller.name = controller_name,
        error.category = category,
        error = error as &dyn Error,
        "Failed to reconcile object",
    );
}
