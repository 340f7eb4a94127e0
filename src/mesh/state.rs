use crate::error::{Error, NegotiationErrorKind};

/// Negotiation state of one connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Failed,
}

/// Collision role of the local side towards one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Rolls back its own offer when offers collide.
    Polite,
    /// Keeps its own offer when offers collide.
    Impolite,
}

/// The lower id is polite. Both sides compute the same answer without talking to each other.
pub fn role(local_peer_id: &str, remote_peer_id: &str) -> Role {
    if local_peer_id < remote_peer_id {
        Role::Polite
    } else {
        Role::Impolite
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    Accept,
    /// Roll back the pending local offer, then accept.
    RollbackAndAccept,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerDecision {
    Apply,
    /// No local offer is pending, e.g. it was rolled back after a collision.
    Stale,
}

#[derive(Debug, Clone)]
pub struct SlotMachine {
    state: NegotiationState,
    previous: NegotiationState,
    role: Role,
    restart_attempts: u32,
    restart_limit: u32,
}

impl SlotMachine {
    pub fn new(role: Role, restart_limit: u32) -> Self {
        Self {
            state: NegotiationState::Idle,
            previous: NegotiationState::Idle,
            role,
            restart_attempts: 0,
            restart_limit,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts
    }

    pub fn can_offer(&self) -> bool {
        matches!(
            self.state,
            NegotiationState::Idle | NegotiationState::Stable
        )
    }

    pub fn begin_local_offer(&mut self) -> Result<(), Error> {
        if !self.can_offer() {
            return Err(self.invalid("create a local offer"));
        }
        self.transition(NegotiationState::HaveLocalOffer);
        Ok(())
    }

    /// Restores the state before the last local offer, used when creating the offer failed.
    pub fn revert_local_offer(&mut self) {
        if self.state == NegotiationState::HaveLocalOffer {
            self.state = self.previous;
        }
    }

    pub fn receive_offer(&mut self) -> OfferDecision {
        match (self.state, self.role) {
            (NegotiationState::HaveLocalOffer, Role::Polite) => {
                self.transition(NegotiationState::HaveRemoteOffer);
                OfferDecision::RollbackAndAccept
            }
            (NegotiationState::HaveLocalOffer, Role::Impolite) => OfferDecision::Ignore,
            _ => {
                self.transition(NegotiationState::HaveRemoteOffer);
                OfferDecision::Accept
            }
        }
    }

    pub fn answer_sent(&mut self) -> Result<(), Error> {
        if self.state != NegotiationState::HaveRemoteOffer {
            return Err(self.invalid("send an answer"));
        }
        self.transition(NegotiationState::Stable);
        Ok(())
    }

    pub fn receive_answer(&mut self) -> AnswerDecision {
        if self.state == NegotiationState::HaveLocalOffer {
            self.transition(NegotiationState::Stable);
            AnswerDecision::Apply
        } else {
            AnswerDecision::Stale
        }
    }

    pub fn fail(&mut self) {
        if self.state != NegotiationState::Idle {
            self.transition(NegotiationState::Failed);
        }
    }

    /// Moves a failed slot to `HaveLocalOffer` for an ICE-restart offer and returns the attempt number.
    pub fn begin_ice_restart(&mut self) -> Result<u32, Error> {
        if self.state != NegotiationState::Failed {
            return Err(self.invalid("restart ICE"));
        }
        if self.restart_attempts >= self.restart_limit {
            return Err(Error::new_negotiation(
                format!("gave up after {} ICE restarts", self.restart_attempts),
                NegotiationErrorKind::IceRestartExhaustedError,
            ));
        }
        self.restart_attempts += 1;
        self.transition(NegotiationState::HaveLocalOffer);
        Ok(self.restart_attempts)
    }

    /// The connection came back, with or without a restart.
    pub fn connected(&mut self) {
        self.restart_attempts = 0;
        if self.state == NegotiationState::Failed {
            self.transition(NegotiationState::Stable);
        }
    }

    fn transition(&mut self, next: NegotiationState) {
        self.previous = self.state;
        self.state = next;
    }

    fn invalid(&self, action: &str) -> Error {
        Error::new_negotiation(
            format!("cannot {} in {:?}", action, self.state),
            NegotiationErrorKind::InvalidTransitionError,
        )
    }
}
