//! Exec channel primitives.
//!
//! An [`ExecChannel`] is one streaming command invocation inside a workload:
//! a stdin sink, stdout/stderr sources, and a future resolving to the exit
//! code. The kube-backed gateway produces these from the pod exec subprotocol;
//! tests produce them from in-memory duplex pipes.

use std::pin::Pin;

use futures::future::BoxFuture;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use tokio::io::{AsyncRead, AsyncWrite};

/// Exit code reported when the channel closes without a status, e.g. on
/// cancellation or transport loss.
pub const EXIT_CODE_UNKNOWN: i32 = -1;

/// One open exec invocation into a workload.
pub struct ExecChannel {
    pub stdin: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    pub stdout: Option<Pin<Box<dyn AsyncRead + Send>>>,
    pub stderr: Option<Pin<Box<dyn AsyncRead + Send>>>,
    /// Resolves once the remote command finishes.
    pub status: BoxFuture<'static, i32>,
}

/// Extract the process exit code from the exec subprotocol's final Status.
///
/// A `Success` status is exit 0. Failures carry the code in a cause with
/// reason `ExitCode`; a failure without one (signal kill, channel loss) maps
/// to [`EXIT_CODE_UNKNOWN`].
pub fn exit_code_from_status(status: &Status) -> i32 {
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|c| c.message.as_ref())
        .and_then(|m| m.trim().parse().ok())
        .unwrap_or(EXIT_CODE_UNKNOWN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    fn failure_with_exit_code(code: &str) -> Status {
        Status {
            status: Some("Failure".to_string()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_string()),
                    message: Some(code.to_string()),
                    field: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_success_is_zero() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(&status), 0);
    }

    #[test]
    fn test_failure_carries_exit_code() {
        assert_eq!(exit_code_from_status(&failure_with_exit_code("3")), 3);
        assert_eq!(exit_code_from_status(&failure_with_exit_code("137")), 137);
    }

    #[test]
    fn test_failure_without_code_is_unknown() {
        let status = Status {
            status: Some("Failure".to_string()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(&status), EXIT_CODE_UNKNOWN);
    }
}
