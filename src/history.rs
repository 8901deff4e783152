use smallvec::SmallVec;
use std::collections::VecDeque;

const RETIRED_CAPACITY: usize = 128;

/// Which query instances have come and gone. Lets the receive engine answer
/// late packets of a finished instance instead of leaving their senders
/// retransmitting forever, and tell them apart from packets of an instance
/// that is not set up yet.
#[derive(Debug, Default)]
pub(crate) struct InstanceHistory {
    session_id: Option<i32>,
    active: SmallVec<[u32; 4]>,
    /// Most recent retirements of any session. A new session does not clear
    /// them: senders of an earlier session may still be retransmitting.
    retired: VecDeque<(i32, u32)>,
    last_teardown: Option<u32>,
}

/// How to answer a data packet that matches no registered connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// The instance finished here; acknowledge with STOP.
    Retired,
    /// The instance belongs to the current session but has not been set up
    /// yet; ask the sender to retry.
    NotYetSetUp,
    Unknown,
}

impl InstanceHistory {
    pub(crate) fn begin(&mut self, session_id: i32, instance_id: u32) {
        if self.session_id != Some(session_id) {
            self.session_id = Some(session_id);
            self.active.clear();
            self.last_teardown = None;
        }
        self.retired.retain(|retired| *retired != (session_id, instance_id));
        if !self.active.contains(&instance_id) {
            self.active.push(instance_id);
        }
    }

    pub(crate) fn retire(&mut self, session_id: i32, instance_id: u32) {
        if !self.retired.contains(&(session_id, instance_id)) {
            self.retired.push_back((session_id, instance_id));
            while self.retired.len() > RETIRED_CAPACITY {
                self.retired.pop_front();
            }
        }
        if self.session_id == Some(session_id) {
            self.active.retain(|id| *id != instance_id);
            self.last_teardown = Some(self.last_teardown.map_or(instance_id, |last| last.max(instance_id)));
        }
    }

    pub(crate) fn is_retired(&self, session_id: i32, instance_id: u32) -> bool {
        self.retired.contains(&(session_id, instance_id))
    }

    /// Classify a data packet with no connection. Only packets of the current
    /// session newer than the last torn down instance count as early.
    pub(crate) fn verdict(&self, session_id: i32, instance_id: u32) -> Verdict {
        if self.is_retired(session_id, instance_id) {
            return Verdict::Retired;
        }
        let current = self.session_id == Some(session_id);
        let newer = self.last_teardown.map_or(true, |last| instance_id > last);
        if current && newer && !self.active.contains(&instance_id) {
            Verdict::NotYetSetUp
        } else {
            Verdict::Unknown
        }
    }

    pub(crate) fn last_teardown(&self) -> Option<u32> {
        self.last_teardown
    }
}
