use crate::osb::OsbError;

/// Whether a failed broker call may have left a resource behind on the broker.
///
/// Transport failures, any 2xx other than 200, 408 and 5xx are treated as a possible partial
/// success: the resource is kept and a compensating delete is scheduled.
pub fn should_start_orphan_mitigation(err: &OsbError) -> bool {
    match err {
        OsbError::Transport { .. } => true,
        OsbError::Http { status, .. } | OsbError::InvalidResponse { status, .. } => {
            let status = *status;
            ((200..300).contains(&status) && status != 200) || status == 408 || status >= 500
        }
    }
}
