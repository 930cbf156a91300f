// Per-thread stepping state
//
// A step request is recorded here when the debugger sets it and armed in the
// runtime only when the thread is actually released.

use crate::commands::{step_depths, step_sizes};
use crate::eventrequest::SuspendPolicy;
use crate::protocol::{error_codes, JdwpError, JdwpResult};
use crate::types::{Location, ThreadId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    Into,
    Over,
    Out,
    ForceReturn,
    PopFrames,
}

impl StepKind {
    pub fn from_depth(depth: i32) -> JdwpResult<Self> {
        match depth {
            step_depths::INTO => Ok(StepKind::Into),
            step_depths::OVER => Ok(StepKind::Over),
            step_depths::OUT => Ok(StepKind::Out),
            _ => Err(JdwpError::Command(error_codes::ILLEGAL_ARGUMENT)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteppingInfo {
    pub request_id: i32,
    pub suspend_policy: SuspendPolicy,
    pub kind: StepKind,
    pub size: i32,
    /// Where the thread was when the step was requested
    pub origin: Option<(Location, Option<i32>)>,
    /// Whether the step has been handed to the runtime
    pub submitted: bool,
}

impl SteppingInfo {
    pub fn new(request_id: i32, suspend_policy: SuspendPolicy, kind: StepKind, size: i32) -> Self {
        Self {
            request_id,
            suspend_policy,
            kind,
            size,
            origin: None,
            submitted: false,
        }
    }

    /// Whether a stop at `location`/`line` is still on the line the step started from
    pub fn is_same_line(&self, location: &Location, line: Option<i32>) -> bool {
        if self.size != step_sizes::LINE {
            return false;
        }
        match (&self.origin, line) {
            (Some((origin, Some(origin_line))), Some(line)) => {
                origin.class_id == location.class_id
                    && origin.method_id == location.method_id
                    && *origin_line == line
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct SteppingTable {
    steps: Mutex<HashMap<ThreadId, SteppingInfo>>,
}

impl SteppingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step for `thread`, replacing any previous one
    pub fn set(&self, thread: ThreadId, info: SteppingInfo) {
        self.steps.lock().insert(thread, info);
    }

    pub fn get(&self, thread: ThreadId) -> Option<SteppingInfo> {
        self.steps.lock().get(&thread).cloned()
    }

    pub fn remove(&self, thread: ThreadId) -> Option<SteppingInfo> {
        self.steps.lock().remove(&thread)
    }

    /// Remove the step belonging to `request_id`, returning its thread
    pub fn remove_request(&self, request_id: i32) -> Option<ThreadId> {
        let mut steps = self.steps.lock();
        let thread = steps
            .iter()
            .find(|(_, info)| info.request_id == request_id)
            .map(|(thread, _)| *thread)?;
        steps.remove(&thread);
        Some(thread)
    }

    /// Mark the pending step of `thread` as submitted, returning its kind if
    /// it still had to be armed
    pub fn take_unsubmitted(&self, thread: ThreadId) -> Option<StepKind> {
        let mut steps = self.steps.lock();
        let info = steps.get_mut(&thread)?;
        if info.submitted {
            return None;
        }
        info.submitted = true;
        Some(info.kind)
    }

    /// Drop every pending step, returning the threads that had one
    pub fn drain(&self) -> Vec<ThreadId> {
        self.steps.lock().drain().map(|(thread, _)| thread).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(index: u64) -> Location {
        Location {
            type_tag: 1,
            class_id: 1,
            method_id: 2,
            index,
        }
    }

    #[test]
    fn test_second_step_overwrites_first() {
        let table = SteppingTable::new();
        table.set(7, SteppingInfo::new(10, SuspendPolicy::EventThread, StepKind::Over, 1));
        table.set(7, SteppingInfo::new(11, SuspendPolicy::All, StepKind::Into, 1));

        let info = table.get(7).unwrap();
        assert_eq!(info.request_id, 11);
        assert_eq!(info.kind, StepKind::Into);
        assert_eq!(table.remove_request(10), None);
        assert_eq!(table.remove_request(11), Some(7));
        assert!(table.get(7).is_none());
    }

    #[test]
    fn test_take_unsubmitted_only_once() {
        let table = SteppingTable::new();
        table.set(1, SteppingInfo::new(3, SuspendPolicy::EventThread, StepKind::Out, 1));

        assert_eq!(table.take_unsubmitted(1), Some(StepKind::Out));
        assert_eq!(table.take_unsubmitted(1), None);
        assert_eq!(table.take_unsubmitted(2), None);
    }

    #[test]
    fn test_same_line_detection() {
        let mut info = SteppingInfo::new(1, SuspendPolicy::EventThread, StepKind::Over, step_sizes::LINE);
        info.origin = Some((location(0), Some(12)));

        assert!(info.is_same_line(&location(4), Some(12)));
        assert!(!info.is_same_line(&location(9), Some(13)));
        assert!(!info.is_same_line(&location(9), None));

        info.size = step_sizes::MIN;
        assert!(!info.is_same_line(&location(4), Some(12)));
    }
}
