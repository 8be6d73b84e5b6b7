//! Bridge lifecycle state machine.

use tracing::trace;

use crate::error::InteropError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeState {
    #[default]
    Uninitialized,
    Ready,
    RenderingFrame,
    Presenting,
    Resizing,
    /// Terminal.
    Destroyed,
}

impl BridgeState {
    /// Whether `self -> next` is a legal edge. Any state may go to
    /// `Destroyed`, including `Destroyed` itself (teardown is idempotent).
    pub fn can_transition(self, next: BridgeState) -> bool {
        use BridgeState::*;
        match (self, next) {
            (_, Destroyed) => true,
            (Destroyed, _) => false,
            (Uninitialized, Ready) => true,
            (Ready, RenderingFrame) | (Ready, Resizing) => true,
            (RenderingFrame, Presenting) => true,
            (Presenting, Ready) | (Presenting, RenderingFrame) => true,
            // A frame dropped mid-way returns straight to Ready.
            (RenderingFrame, Ready) => true,
            (RenderingFrame, Resizing) | (Presenting, Resizing) => true,
            (Resizing, Ready) => true,
            _ => false,
        }
    }
}

/// Current state plus checked transitions.
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: BridgeState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == BridgeState::Destroyed
    }

    /// Fail with `InvalidState` unless the bridge is in one of `allowed`.
    pub fn expect(&self, op: &'static str, allowed: &[BridgeState]) -> Result<(), InteropError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(InteropError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    pub fn transition(&mut self, op: &'static str, next: BridgeState) -> Result<(), InteropError> {
        if !self.state.can_transition(next) {
            return Err(InteropError::InvalidState {
                op,
                state: self.state,
            });
        }
        trace!("{op}: {:?} -> {next:?}", self.state);
        self.state = next;
        Ok(())
    }

    /// Enter `Destroyed`. Returns `false` if already there.
    pub fn destroy(&mut self) -> bool {
        let first = self.state != BridgeState::Destroyed;
        self.state = BridgeState::Destroyed;
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_cycle() {
        let mut lc = Lifecycle::new();
        lc.transition("init", BridgeState::Ready).unwrap();
        lc.transition("loop", BridgeState::RenderingFrame).unwrap();
        lc.transition("swap", BridgeState::Presenting).unwrap();
        lc.transition("loop", BridgeState::RenderingFrame).unwrap();
        lc.transition("swap", BridgeState::Presenting).unwrap();
        lc.transition("resize", BridgeState::Resizing).unwrap();
        lc.transition("resize", BridgeState::Ready).unwrap();
    }

    #[test]
    fn uninitialized_cannot_render() {
        let mut lc = Lifecycle::new();
        let err = lc
            .transition("on_loop", BridgeState::RenderingFrame)
            .unwrap_err();
        assert!(matches!(
            err,
            InteropError::InvalidState {
                op: "on_loop",
                state: BridgeState::Uninitialized
            }
        ));
    }

    #[test]
    fn destroyed_is_terminal_and_idempotent() {
        let mut lc = Lifecycle::new();
        assert!(lc.destroy());
        assert!(!lc.destroy());
        assert!(lc.transition("init", BridgeState::Ready).is_err());
        assert!(lc.expect("swap", &[BridgeState::RenderingFrame]).is_err());
    }
}
