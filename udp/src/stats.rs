use wire::RejectKind;

/// Per-request transfer counters, surfaced on the completed response.
/// Every counter is non-decreasing over the life of a fetch.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub nacks_sent: u64,
    pub request_retries: u64,
}

/// Packet-layer rejection counters. Rejections are local and silent; they
/// feed these buckets only.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RejectStats {
    pub malformed: u64,
    pub auth_failed: u64,
    pub replay: u64,
    pub stale: u64,
}

impl RejectStats {
    pub fn bump(&mut self, kind: RejectKind) {
        match kind {
            RejectKind::Malformed => self.malformed += 1,
            RejectKind::AuthFailed => self.auth_failed += 1,
            RejectKind::Replay => self.replay += 1,
            RejectKind::Stale => self.stale += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.malformed + self.auth_failed + self.replay + self.stale
    }
}
