//! Reconnection and resend coordination.
//!
//! When a connection completes a handshake, every request addressed to it is
//! examined in submission order:
//!
//! - already sent: the outcome is unknown (processed, lost, or about to be
//!   processed twice), so it is rejected as interrupted and never retried;
//! - bound to a session that is no longer current: rejected as stale;
//! - otherwise: sent now.

use crate::error::CommError;
use crate::pending::PendingTable;
use crate::registry::ConnectionRecord;
use tracing::{debug, info};

/// What happened to the requests examined after a handshake.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResendReport {
    /// Handed to the transport during this pass.
    pub resent: Vec<u64>,
    /// Rejected as interrupted by the reconnect.
    pub interrupted: Vec<u64>,
    /// Rejected because their session binding went stale.
    pub stale: Vec<u64>,
    /// Still waiting; the transport did not accept them.
    pub queued: Vec<u64>,
}

impl ResendReport {
    pub fn is_empty(&self) -> bool {
        self.resent.is_empty()
            && self.interrupted.is_empty()
            && self.stale.is_empty()
            && self.queued.is_empty()
    }
}

enum Decision {
    Interrupted,
    Stale,
    Send,
}

/// Resolve, reject, or resend the requests addressed to a freshly established connection.
pub fn resend_pending(pending: &mut PendingTable, connection: &ConnectionRecord) -> ResendReport {
    let mut report = ResendReport::default();

    for req_id in pending.ids_matching(connection.destination()) {
        let Some(request) = pending.get_mut(req_id) else {
            continue;
        };

        let decision = if request.sent {
            Decision::Interrupted
        } else if request
            .session
            .as_deref()
            .is_some_and(|bound| Some(bound) != connection.session_id())
        {
            Decision::Stale
        } else {
            Decision::Send
        };

        match decision {
            Decision::Send => {
                request.sent = connection.send(&request.message);
                if request.sent {
                    debug!("Comm: resent req #{} {}", req_id, request.method);
                    report.resent.push(req_id);
                } else {
                    debug!("Comm: req #{} {} still queued", req_id, request.method);
                    report.queued.push(req_id);
                }
            }
            Decision::Interrupted => {
                let err = CommError::InterruptedByReconnect {
                    method: request.method.clone(),
                };
                info!("Comm: Rejecting req #{} {}: {}", req_id, request.method, err);
                pending.settle(req_id, Err(err));
                report.interrupted.push(req_id);
            }
            Decision::Stale => {
                let err = CommError::StaleSession {
                    method: request.method.clone(),
                };
                info!("Comm: Rejecting req #{} {}: {}", req_id, request.method, err);
                pending.settle(req_id, Err(err));
                report.stale.push(req_id);
            }
        }
    }

    report
}
