use std::time::Instant;

use crate::request::RequestPhase;

/// Per-request lifecycle states. Transitions are one-way:
/// `received → routed → connected → streaming → completed | failed | cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Routed,
    Connected,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition(&self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Received, Routed) => true,
            (Routed, Connected) => true,
            (Connected, Streaming) => true,
            (Streaming, Completed) => true,
            // Failure and cancellation are reachable from any non-terminal state.
            (s, Failed | Cancelled) if !s.is_terminal() => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Routed => "routed",
            Self::Connected => "connected",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// End-to-end tracking record for one dispatched request.
#[derive(Debug, Clone)]
pub struct RequestTrack {
    pub request_id: String,
    pub workflow_id: Option<String>,
    pub agent_id: Option<String>,
    pub phase: RequestPhase,
    pub prefill_endpoint: Option<String>,
    pub decode_endpoint: Option<String>,
    pub state: RequestState,
    pub started_at: Instant,
    pub first_token_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub success: Option<bool>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// True when token counts came from the whitespace fallback instead of
    /// the engine's reported `usage`.
    pub tokens_estimated: bool,
}

impl RequestTrack {
    pub fn new(request_id: impl Into<String>, phase: RequestPhase) -> Self {
        Self {
            request_id: request_id.into(),
            workflow_id: None,
            agent_id: None,
            phase,
            prefill_endpoint: None,
            decode_endpoint: None,
            state: RequestState::Received,
            started_at: Instant::now(),
            first_token_at: None,
            finished_at: None,
            success: None,
            tokens_in: 0,
            tokens_out: 0,
            tokens_estimated: false,
        }
    }

    /// Advance the state machine; illegal transitions are ignored and
    /// reported as `false` so a late cancellation cannot resurrect a
    /// completed request.
    pub fn advance(&mut self, next: RequestState) -> bool {
        if self.state.can_transition(next) {
            self.state = next;
            if next.is_terminal() && self.finished_at.is_none() {
                self.finished_at = Some(Instant::now());
            }
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut track = RequestTrack::new("req-1", RequestPhase::Prefill);
        assert!(track.advance(RequestState::Routed));
        assert!(track.advance(RequestState::Connected));
        assert!(track.advance(RequestState::Streaming));
        assert!(track.advance(RequestState::Completed));
        assert!(track.finished_at.is_some());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut track = RequestTrack::new("req-1", RequestPhase::Prefill);
        assert!(track.advance(RequestState::Failed));
        assert!(!track.advance(RequestState::Cancelled));
        assert!(!track.advance(RequestState::Routed));
        assert_eq!(track.state, RequestState::Failed);
    }

    #[test]
    fn cancel_allowed_from_any_live_state() {
        let mut track = RequestTrack::new("req-1", RequestPhase::Decode);
        assert!(track.advance(RequestState::Routed));
        assert!(track.advance(RequestState::Cancelled));
        assert!(track.state.is_terminal());
    }

    #[test]
    fn no_skipping_forward() {
        let mut track = RequestTrack::new("req-1", RequestPhase::Prefill);
        assert!(!track.advance(RequestState::Streaming));
        assert_eq!(track.state, RequestState::Received);
    }
}
