use crate::peer::types::IceCandidate;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

impl IceCandidate {
    /// Reads the `typ` attribute of the candidate line.
    pub fn candidate_type(&self) -> CandidateType {
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return match parts.next() {
                    Some("host") => CandidateType::Host,
                    Some("srflx") => CandidateType::ServerReflexive,
                    Some("prflx") => CandidateType::PeerReflexive,
                    Some("relay") => CandidateType::Relay,
                    _ => CandidateType::Unknown,
                };
            }
        }
        CandidateType::Unknown
    }
}

/// Remote candidates that arrived before the remote description was applied.
///
/// Drained exactly once, right after the description is applied; after that
/// candidates go straight to the peer link and the buffer refuses new entries.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: Vec<IceCandidate>,
    drained: bool,
}

impl PendingCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a candidate, or hands it back if the buffer was already drained.
    pub fn push(&mut self, candidate: IceCandidate) -> Result<(), IceCandidate> {
        if self.drained {
            return Err(candidate);
        }
        debug!(
            "Remote description not set yet, queuing candidate ({} pending)",
            self.queue.len() + 1
        );
        self.queue.push(candidate);
        Ok(())
    }

    /// Takes every queued candidate in arrival order.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.drained = true;
        std::mem::take(&mut self.queue)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[cfg(test)]
    fn is_drained(&self) -> bool {
        self.drained
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub prflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();
    for candidate in candidates {
        match candidate.candidate_type() {
            CandidateType::Host => summary.host += 1,
            CandidateType::ServerReflexive => summary.srflx += 1,
            CandidateType::PeerReflexive => summary.prflx += 1,
            CandidateType::Relay => summary.relay += 1,
            CandidateType::Unknown => {}
        }
    }

    debug!(
        "Candidate analysis: {} host, {} srflx, {} prflx, {} relay",
        summary.host, summary.srflx, summary.prflx, summary.relay
    );
    if summary.relay == 0 {
        warn!("No TURN relay candidates found, connection through symmetric NAT may fail");
    }
    summary
}
