//! Kernel lifecycle state machine.
//!
//! CREATED → READY → SERVING → CLOSING → CLOSED
//!
//! `close()` is the only legal path into CLOSING; once there, every other
//! operation fails fast with a state transition error.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::types::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelState {
    Created,
    Ready,
    Serving,
    Closing,
    Closed,
}

impl KernelState {
    /// CLOSING and CLOSED reject everything but `close()`.
    pub fn is_closing(self) -> bool {
        matches!(self, KernelState::Closing | KernelState::Closed)
    }

    pub fn can_transition_to(self, to: KernelState) -> bool {
        match (self, to) {
            (KernelState::Created, KernelState::Ready) => true,
            // Recovered kernels may go straight to serving.
            (KernelState::Created, KernelState::Serving) => true,
            (KernelState::Ready, KernelState::Serving) => true,
            (from, KernelState::Closing) => !from.is_closing(),
            (KernelState::Closing, KernelState::Closed) => true,
            _ => false,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            KernelState::Created => 0,
            KernelState::Ready => 1,
            KernelState::Serving => 2,
            KernelState::Closing => 3,
            KernelState::Closed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => KernelState::Created,
            1 => KernelState::Ready,
            2 => KernelState::Serving,
            3 => KernelState::Closing,
            _ => KernelState::Closed,
        }
    }
}

/// Shared, lock-free holder of a kernel's current state.
///
/// Operations on one kernel take `&self`, so the state lives in an atomic
/// and transitions are compare-and-swap loops.
#[derive(Debug)]
pub struct KernelLifecycle {
    state: AtomicU8,
}

impl KernelLifecycle {
    pub fn new(initial: KernelState) -> Self {
        Self {
            state: AtomicU8::new(initial.to_u8()),
        }
    }

    pub fn state(&self) -> KernelState {
        KernelState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Fail with a state transition error once close has begun.
    pub fn ensure_open(&self, op: &str) -> Result<()> {
        let state = self.state();
        if state.is_closing() {
            return Err(Error::state_transition(format!(
                "cannot {}: kernel is {:?}",
                op, state
            )));
        }
        Ok(())
    }

    /// Move to `to` if legal from the current state.
    pub fn transition(&self, to: KernelState) -> Result<KernelState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = KernelState::from_u8(current);
            if !from.can_transition_to(to) {
                return Err(Error::state_transition(format!(
                    "cannot move kernel from {:?} to {:?}",
                    from, to
                )));
            }
            match self.state.compare_exchange(
                current,
                to.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }

    /// A runner is attached. No-op when already READY or SERVING.
    pub fn mark_ready(&self) -> Result<()> {
        match self.state() {
            KernelState::Ready | KernelState::Serving => Ok(()),
            _ => self.transition(KernelState::Ready).map(|_| ()),
        }
    }

    /// A service or commit became active. No-op when already SERVING.
    pub fn mark_serving(&self) -> Result<()> {
        match self.state() {
            KernelState::Serving => Ok(()),
            _ => self.transition(KernelState::Serving).map(|_| ()),
        }
    }

    /// Enter CLOSING. Returns `false` if another caller got there first,
    /// which makes `close()` idempotent.
    pub fn begin_close(&self) -> bool {
        self.transition(KernelState::Closing).is_ok()
    }

    pub fn finish_close(&self) {
        self.state.store(KernelState::Closed.to_u8(), Ordering::Release);
    }
}
