//! Gateway errors as gRPC statuses
//!
//! Validation failures become `INVALID_ARGUMENT`; every database failure
//! becomes `INTERNAL` carrying the upstream message unchanged.

use pgrelay_core::{DbError, GatewayError};
use tonic::Status;

/// Map a gateway error onto the status returned to the caller.
pub fn into_status(err: GatewayError) -> Status {
    match err {
        GatewayError::Validation(e) => {
            tracing::warn!(error = %e, "rejected request");
            Status::invalid_argument(e.to_string())
        }
        GatewayError::Database(e) => {
            if let DbError::Query { code: Some(code), .. } = &e {
                tracing::error!(sqlstate = %code, error = %e, "database error");
            } else {
                tracing::error!(error = %e, "database error");
            }
            Status::internal(e.to_string())
        }
    }
}
