//! Common types for the XMPP broker.

/// Session state in the XMPP stream lifecycle.
///
/// The ordering is load-bearing: a session's state only ever moves towards
/// `Disconnect`. Attempting a transition to a lower state is treated as a
/// fault and closes the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    /// Created, transport not yet accepted
    Idle = 0,
    /// TCP accepted, stream negotiation and SASL in progress
    Connect = 1,
    /// Authenticated, waiting for resource binding
    Init = 2,
    /// Resource bound, waiting for session establishment
    Bind = 3,
    /// Fully established; the only state that participates in routing
    Ready = 4,
    /// Torn down
    Disconnect = 5,
}

impl SessionState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Idle,
            1 => SessionState::Connect,
            2 => SessionState::Init,
            3 => SessionState::Bind,
            4 => SessionState::Ready,
            _ => SessionState::Disconnect,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Connect => write!(f, "CONNECT"),
            SessionState::Init => write!(f, "INIT"),
            SessionState::Bind => write!(f, "BIND"),
            SessionState::Ready => write!(f, "READY"),
            SessionState::Disconnect => write!(f, "DISCONNECT"),
        }
    }
}

/// What kind of peer a session authenticated as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PeerKind {
    /// Not yet authenticated
    #[default]
    Unknown = 0,
    /// Embedded appliance (non-empty devclass)
    Bot = 1,
    /// Human-facing client
    Controller = 2,
}

impl PeerKind {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => PeerKind::Bot,
            2 => PeerKind::Controller,
            _ => PeerKind::Unknown,
        }
    }
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerKind::Unknown => write!(f, "unknown"),
            PeerKind::Bot => write!(f, "bot"),
            PeerKind::Controller => write!(f, "controller"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering_is_monotonic() {
        assert!(SessionState::Idle < SessionState::Connect);
        assert!(SessionState::Connect < SessionState::Init);
        assert!(SessionState::Init < SessionState::Bind);
        assert!(SessionState::Bind < SessionState::Ready);
        assert!(SessionState::Ready < SessionState::Disconnect);
    }

    #[test]
    fn state_u8_roundtrip() {
        for state in [
            SessionState::Idle,
            SessionState::Connect,
            SessionState::Init,
            SessionState::Bind,
            SessionState::Ready,
            SessionState::Disconnect,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }
}
