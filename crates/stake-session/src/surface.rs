use std::sync::{Mutex, PoisonError};

use crate::error::Error;
use crate::session::SessionSnapshot;
use crate::stake::StakeInfo;

/// User-triggered operations reported to the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    SwitchNetwork,
    RegisterReferrer,
    BuyAndStake,
    ClaimReward,
    LoadStakeInfo,
}

/// Whatever renders the session to the user.
///
/// The manager only pushes data; rendering is entirely up to the
/// implementor.
pub trait DisplaySurface: Send + Sync {
    fn session_changed(&self, snapshot: &SessionSnapshot);

    fn stake_info_loaded(&self, info: &StakeInfo);

    fn operation_succeeded(&self, op: Operation, message: &str);

    fn operation_failed(&self, op: Operation, error: &Error);
}

/// A surface that discards everything.
pub struct NullSurface;

impl DisplaySurface for NullSurface {
    fn session_changed(&self, _snapshot: &SessionSnapshot) {}

    fn stake_info_loaded(&self, _info: &StakeInfo) {}

    fn operation_succeeded(&self, _op: Operation, _message: &str) {}

    fn operation_failed(&self, _op: Operation, _error: &Error) {}
}

/// A notification as captured by [`RecordingSurface`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    SessionChanged(SessionSnapshot),
    StakeInfo(StakeInfo),
    Succeeded(Operation, String),
    Failed(Operation, Error),
}

/// In-memory surface that keeps every notification, for tests and
/// headless use.
#[derive(Default)]
pub struct RecordingSurface {
    events: Mutex<Vec<SurfaceEvent>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: SurfaceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn events(&self) -> Vec<SurfaceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn failures(&self) -> Vec<(Operation, Error)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SurfaceEvent::Failed(op, err) => Some((op, err)),
                _ => None,
            })
            .collect()
    }

    pub fn successes(&self) -> Vec<(Operation, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SurfaceEvent::Succeeded(op, msg) => Some((op, msg)),
                _ => None,
            })
            .collect()
    }

    pub fn last_snapshot(&self) -> Option<SessionSnapshot> {
        self.events().into_iter().rev().find_map(|e| match e {
            SurfaceEvent::SessionChanged(snapshot) => Some(snapshot),
            _ => None,
        })
    }
}

impl DisplaySurface for RecordingSurface {
    fn session_changed(&self, snapshot: &SessionSnapshot) {
        self.push(SurfaceEvent::SessionChanged(snapshot.clone()));
    }

    fn stake_info_loaded(&self, info: &StakeInfo) {
        self.push(SurfaceEvent::StakeInfo(info.clone()));
    }

    fn operation_succeeded(&self, op: Operation, message: &str) {
        self.push(SurfaceEvent::Succeeded(op, message.to_string()));
    }

    fn operation_failed(&self, op: Operation, error: &Error) {
        self.push(SurfaceEvent::Failed(op, error.clone()));
    }
}
