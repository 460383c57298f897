//! Recursive α-parallel content lookup.
//!
//! The lookup keeps the k closest not-yet-queried candidates, drives up to
//! α concurrent FINDCONTENT requests, and terminates on the first usable
//! CONTENT answer, on shortlist exhaustion, or at its wall-clock deadline.
//! Responses from cancelled branches are simply ignored.

use portal_wire::constants::{BUCKET_SIZE, LOOKUP_PARALLELISM};
use portal_wire::content_key::ContentId;
use portal_wire::enr::Enr;
use portal_wire::messages::Content;
use portal_wire::types::NodeId;
use portal_wire::RawContentKey;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default wall-clock bound for one lookup.
pub const LOOKUP_DEADLINE: Duration = Duration::from_secs(60);

/// Per-peer FINDCONTENT patience before the branch counts as failed.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// Content arrived inline or over uTP.
    Content { peer: NodeId, bytes: Vec<u8> },
    NotFound,
    Timeout,
}

impl LookupOutcome {
    /// The caller-facing result: who served the content and its bytes, or
    /// the terminal failure.
    pub fn into_result(self) -> Result<(NodeId, Vec<u8>), crate::OverlayError> {
        match self {
            LookupOutcome::Content { peer, bytes } => Ok((peer, bytes)),
            LookupOutcome::NotFound => Err(crate::OverlayError::NotFound),
            LookupOutcome::Timeout => Err(crate::OverlayError::LookupTimeout),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    InProgress,
    Complete,
}

/// Follow-up work a CONTENT response asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupAction {
    /// The peer redirected us to uTP; open a READ transfer on this id.
    OpenTransfer { peer: NodeId, conn_id: u16 },
}

pub struct ContentLookup {
    key: RawContentKey,
    target: ContentId,
    /// Closest known unqueried candidates, ascending by distance.
    shortlist: Vec<Enr>,
    queried: HashSet<NodeId>,
    failed: HashSet<NodeId>,
    in_flight: HashMap<NodeId, Instant>,
    /// Set while a uTP delivery from this peer is the outstanding branch.
    pending_transfer: Option<NodeId>,
    outcome: Option<LookupOutcome>,
    deadline: Instant,
}

impl ContentLookup {
    pub fn new(key: RawContentKey, bootstrap: Vec<Enr>, now: Instant) -> Self {
        let target = key.content_id();
        let mut lookup = Self {
            key,
            target,
            shortlist: Vec::new(),
            queried: HashSet::new(),
            failed: HashSet::new(),
            in_flight: HashMap::new(),
            pending_transfer: None,
            outcome: None,
            deadline: now + LOOKUP_DEADLINE,
        };
        for enr in bootstrap {
            lookup.offer_candidate(enr);
        }
        lookup
    }

    pub fn key(&self) -> &RawContentKey {
        &self.key
    }

    pub fn target(&self) -> ContentId {
        self.target
    }

    pub fn status(&self) -> LookupStatus {
        if self.outcome.is_some() {
            LookupStatus::Complete
        } else {
            LookupStatus::InProgress
        }
    }

    pub fn outcome(&self) -> Option<&LookupOutcome> {
        self.outcome.as_ref()
    }

    pub fn into_outcome(self) -> Option<LookupOutcome> {
        self.outcome
    }

    fn offer_candidate(&mut self, enr: Enr) {
        let id = enr.node_id();
        if self.queried.contains(&id)
            || self.failed.contains(&id)
            || self.in_flight.contains_key(&id)
            || self.shortlist.iter().any(|e| e.node_id() == id)
        {
            return;
        }
        self.shortlist.push(enr);
        let target = self.target;
        self.shortlist
            .sort_by_key(|e| target.distance_to(&e.node_id()));
        self.shortlist.truncate(BUCKET_SIZE);
    }

    /// Peers to query now, bounded by the α concurrency budget. The caller
    /// sends FINDCONTENT(key) to each.
    pub fn next_queries(&mut self, now: Instant) -> SmallVec<[Enr; LOOKUP_PARALLELISM]> {
        let mut out = SmallVec::new();
        if self.outcome.is_some() || self.pending_transfer.is_some() {
            return out;
        }
        while self.in_flight.len() < LOOKUP_PARALLELISM && !self.shortlist.is_empty() {
            let enr = self.shortlist.remove(0);
            let id = enr.node_id();
            self.queried.insert(id);
            self.in_flight.insert(id, now);
            out.push(enr);
        }
        out
    }

    /// Feeds one CONTENT response. Returns follow-up work, if any.
    pub fn on_content_response(
        &mut self,
        from: NodeId,
        content: Content,
        now: Instant,
    ) -> Option<LookupAction> {
        if self.in_flight.remove(&from).is_none() || self.outcome.is_some() {
            // A cancelled or unknown branch; ignore it.
            return None;
        }
        match content {
            Content::Payload(bytes) => {
                debug!(peer = %from, len = bytes.len(), "lookup found inline content");
                self.outcome = Some(LookupOutcome::Content { peer: from, bytes });
                None
            }
            Content::ConnectionId(conn_id) => {
                self.pending_transfer = Some(from);
                Some(LookupAction::OpenTransfer {
                    peer: from,
                    conn_id,
                })
            }
            Content::Enrs(enrs) => {
                for enr in enrs {
                    if enr.verify().is_ok() {
                        self.offer_candidate(enr);
                    }
                }
                self.check_exhausted(now);
                None
            }
        }
    }

    /// The uTP transfer a CONTENT redirect promised has delivered.
    pub fn on_transfer_complete(&mut self, peer: NodeId, bytes: Vec<u8>) {
        if self.pending_transfer == Some(peer) && self.outcome.is_none() {
            self.pending_transfer = None;
            self.outcome = Some(LookupOutcome::Content { peer, bytes });
        }
    }

    /// A branch failed: transport error, uTP teardown, or no response.
    pub fn on_failure(&mut self, peer: NodeId, now: Instant) {
        self.in_flight.remove(&peer);
        if self.pending_transfer == Some(peer) {
            self.pending_transfer = None;
        }
        self.failed.insert(peer);
        self.check_exhausted(now);
    }

    /// Expires silent branches and enforces the lookup deadline. Called
    /// from the owner's timer.
    pub fn on_tick(&mut self, now: Instant) {
        if self.outcome.is_some() {
            return;
        }
        if now >= self.deadline {
            self.outcome = Some(LookupOutcome::Timeout);
            return;
        }
        let expired: Vec<NodeId> = self
            .in_flight
            .iter()
            .filter(|(_, started)| now.saturating_duration_since(**started) >= QUERY_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.on_failure(id, now);
        }
    }

    fn check_exhausted(&mut self, _now: Instant) {
        if self.outcome.is_none()
            && self.shortlist.is_empty()
            && self.in_flight.is_empty()
            && self.pending_transfer.is_none()
        {
            self.outcome = Some(LookupOutcome::NotFound);
        }
    }

    /// Earliest instant `on_tick` has something to do.
    pub fn next_wakeup(&self) -> Option<Instant> {
        if self.outcome.is_some() {
            return None;
        }
        let mut next = self.deadline;
        for started in self.in_flight.values() {
            next = next.min(*started + QUERY_TIMEOUT);
        }
        Some(next)
    }
}
