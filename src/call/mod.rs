//! The call state machine shared by all four interaction patterns (§9:
//! "unary, server-streaming, client-streaming and bidi-streaming calls are
//! the same state machine parameterised by request/response cardinality").
//!
//! [`crate::caller::CallerEndpoint`] and [`crate::responder::ResponderEndpoint`]
//! both drive a [`CallState`] through its phases; `call::unary`,
//! `call::server_stream`, `call::client_stream` and `call::bidi` are thin,
//! differently-shaped entry points over that one machine, not four separate
//! implementations.

pub mod bidi;
pub mod client_stream;
pub mod server_stream;
pub(crate) mod support;
pub mod unary;

/// Which half of a stream a phase transition applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    Local,
    Remote,
}

/// A call's lifecycle phase (§9). Every call starts at `New`, and ends at
/// `Closed` exactly once both halves have reached end-of-stream — in either
/// order, which is why there are two distinct half-closed phases rather than
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    New,
    Open,
    /// This side has finished sending; the remote side may still be
    /// streaming.
    HalfClosedLocal,
    /// The remote side has finished sending; this side may still be
    /// streaming.
    HalfClosedRemote,
    Closed,
}

/// Drives a single call's [`Phase`] through transitions, independent of
/// transport, codec, or cardinality. Both caller- and responder-side call
/// drivers own one of these.
#[derive(Debug, Clone, Copy)]
pub struct CallState {
    phase: Phase,
}

impl Default for CallState {
    fn default() -> Self {
        CallState { phase: Phase::New }
    }
}

impl CallState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// The first frame observed on a stream (outbound or inbound) opens it.
    pub fn open(&mut self) {
        if self.phase == Phase::New {
            self.phase = Phase::Open;
        }
    }

    /// Record that `half` has reached end-of-stream, returning the phase
    /// after the transition. Idempotent: ending an already-ended half is a
    /// no-op (some transports call this once for the explicit end_stream
    /// flag and the responder drains to end-of-stream separately).
    pub fn end(&mut self, half: Half) -> Phase {
        self.open();
        self.phase = match (self.phase, half) {
            (Phase::Open, Half::Local) => Phase::HalfClosedLocal,
            (Phase::Open, Half::Remote) => Phase::HalfClosedRemote,
            (Phase::HalfClosedRemote, Half::Local) => Phase::Closed,
            (Phase::HalfClosedLocal, Half::Remote) => Phase::Closed,
            (other, _) => other,
        };
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_halves_ending_closes_regardless_of_order() {
        let mut state = CallState::new();
        assert_eq!(state.end(Half::Local), Phase::HalfClosedLocal);
        assert_eq!(state.end(Half::Remote), Phase::Closed);

        let mut state = CallState::new();
        assert_eq!(state.end(Half::Remote), Phase::HalfClosedRemote);
        assert_eq!(state.end(Half::Local), Phase::Closed);
    }

    #[test]
    fn ending_same_half_twice_is_a_no_op() {
        let mut state = CallState::new();
        state.end(Half::Local);
        assert_eq!(state.end(Half::Local), Phase::HalfClosedLocal);
    }

    #[test]
    fn new_call_opens_on_first_half_end() {
        let state = CallState::new();
        assert_eq!(state.phase(), Phase::New);
    }
}
