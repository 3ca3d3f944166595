//! Follow mode: ride along with a remote user's cursor.
//!
//! ```text
//!          follow(target)
//!   Idle ─────────────────► Following(target)
//!    ▲                            │
//!    └────────────────────────────┘
//!      unfollow | target left | target timed out
//! ```
//!
//! Local edits never change the follow state.

use tandem_core::ClientId;

use crate::awareness::AwarenessEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FollowState {
    #[default]
    Idle,
    Following(ClientId),
}

#[derive(Debug, Default)]
pub struct FollowController {
    state: FollowState,
}

impl FollowController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FollowState {
        self.state
    }

    pub fn target(&self) -> Option<ClientId> {
        match self.state {
            FollowState::Following(target) => Some(target),
            FollowState::Idle => None,
        }
    }

    /// Start (or retarget) following.
    pub fn follow(&mut self, target: ClientId) {
        log::debug!("Following {target}");
        self.state = FollowState::Following(target);
    }

    pub fn unfollow(&mut self) {
        if let FollowState::Following(target) = self.state {
            log::debug!("Stopped following {target}");
        }
        self.state = FollowState::Idle;
    }

    /// Feed an awareness event.
    ///
    /// Returns the offset to center the viewport on when the event is an
    /// update from the followed client. A removal of the target drops back
    /// to `Idle`.
    pub fn on_awareness(&mut self, event: &AwarenessEvent) -> Option<usize> {
        let target = self.target()?;
        match event {
            AwarenessEvent::Updated(state) if state.client_id == target => Some(state.cursor),
            AwarenessEvent::Removed { client_id, reason } if *client_id == target => {
                log::info!("Follow target {target} went away ({reason:?}), returning to idle");
                self.state = FollowState::Idle;
                None
            }
            _ => None,
        }
    }
}
