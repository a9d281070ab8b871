use std::collections::VecDeque;

use tracing::{debug, info, warn};

use tracker_core::{
    EntityKind, IncidentId, RequestId, RowKey,
    wire::{Envelope, HostRequest, HostResponse},
};

use crate::error::EngineError;
use crate::lifecycle::EntityLifecycle;
use crate::link::HostLink;

/// A request waiting for the host. `finalize` names the tentative row that
/// adopts the host's id once the answer arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_id: RequestId,
    /// Incident the local change was made in.
    pub incident: Option<IncidentId>,
    pub request: HostRequest,
    pub finalize: Option<(EntityKind, RowKey)>,
    pub attempts: u32,
}

impl PendingRequest {
    /// The same envelope on every attempt, so the host can spot a resend.
    pub fn envelope(&self) -> Envelope {
        Envelope {
            request_id: self.request_id,
            incident: self.incident,
            request: self.request.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub finalized: usize,
    /// Reasons given by the host for requests it refused.
    pub rejected: Vec<String>,
    pub pending: usize,
}

/// FIFO of requests not yet acknowledged by the host. Requests are sent in
/// the order the mutations were made; a transport failure stops the flush
/// with the failed request still at the front.
///
/// Sending is split into [`Outbox::begin_attempt`] and [`Outbox::complete`]
/// so the call itself can run without holding the replica.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<PendingRequest>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        request: HostRequest,
        finalize: Option<(EntityKind, RowKey)>,
        incident: Option<IncidentId>,
    ) {
        debug!(op = request.op_name(), queued = self.queue.len() + 1, "request queued");
        self.queue.push_back(PendingRequest {
            request_id: RequestId::new(),
            incident,
            request,
            finalize,
            attempts: 0,
        });
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRequest> {
        self.queue.iter()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Count an attempt on the front request and hand out a copy to send.
    pub fn begin_attempt(&mut self) -> Option<PendingRequest> {
        let front = self.queue.front_mut()?;
        front.attempts += 1;
        Some(front.clone())
    }

    /// Apply the host's answer to `sent`. An answer for a request that is no
    /// longer at the front was already settled by another flush and is
    /// ignored.
    pub fn complete(
        &mut self,
        sent: &PendingRequest,
        response: HostResponse,
        lifecycle: &mut EntityLifecycle,
        report: &mut FlushReport,
    ) -> Result<(), EngineError> {
        if self.queue.front().map(|p| p.request_id) != Some(sent.request_id) {
            debug!(op = sent.request.op_name(), "answer for a settled request dropped");
            return Ok(());
        }
        self.queue.pop_front();
        report.delivered += 1;
        match settle(lifecycle, sent, response) {
            Ok(Settled::Finalized) => report.finalized += 1,
            Ok(Settled::Acknowledged) => {}
            Ok(Settled::Rejected(reason)) => report.rejected.push(reason),
            Err(e) if e.is_rejection() => {
                warn!(op = sent.request.op_name(), error = %e, "host answer could not be applied locally");
            }
            Err(e) => return Err(e),
        }
        report.pending = self.queue.len();
        Ok(())
    }

    pub fn flush(
        &mut self,
        link: &dyn HostLink,
        lifecycle: &mut EntityLifecycle,
    ) -> Result<FlushReport, EngineError> {
        let mut report = FlushReport::default();
        while let Some(sent) = self.begin_attempt() {
            let response = match link.call(sent.envelope()) {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        op = sent.request.op_name(),
                        attempts = sent.attempts,
                        pending = self.queue.len(),
                        error = %e,
                        "host unreachable, request kept for retry"
                    );
                    return Err(e.into());
                }
            };
            self.complete(&sent, response, lifecycle, &mut report)?;
        }
        report.pending = self.queue.len();
        report.log();
        Ok(report)
    }
}

impl FlushReport {
    pub(crate) fn log(&self) {
        if self.delivered > 0 {
            info!(
                delivered = self.delivered,
                finalized = self.finalized,
                rejected = self.rejected.len(),
                pending = self.pending,
                "outbox flushed"
            );
        }
    }
}

enum Settled {
    Finalized,
    Acknowledged,
    Rejected(String),
}

fn settle(
    lifecycle: &mut EntityLifecycle,
    sent: &PendingRequest,
    response: HostResponse,
) -> Result<Settled, EngineError> {
    let confirmed = match response {
        HostResponse::Team(row) => Some((row.tid, row.last_edit_epoch)),
        HostResponse::Assignment(row) => Some((row.aid, row.last_edit_epoch)),
        HostResponse::Pairing(row) => Some((row.pid, row.last_edit_epoch)),
        HostResponse::Ack { epoch } => {
            lifecycle.observe(epoch);
            None
        }
        HostResponse::Delta(_) => None,
        HostResponse::Rejected { reason } => {
            warn!(op = sent.request.op_name(), %reason, "request rejected by host");
            if let Some((kind, n)) = sent.finalize {
                lifecycle.discard_tentative(kind, n)?;
            }
            return Ok(Settled::Rejected(reason));
        }
    };

    match (sent.finalize, confirmed) {
        (Some((kind, n)), Some((id, epoch))) => {
            lifecycle.finalize(kind, n, id, epoch)?;
            Ok(Settled::Finalized)
        }
        (_, Some((_, epoch))) => {
            lifecycle.observe(epoch);
            Ok(Settled::Acknowledged)
        }
        _ => Ok(Settled::Acknowledged),
    }
}
