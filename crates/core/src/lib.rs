pub mod backoff;
pub mod frame;
pub mod router;
pub mod session;
pub mod stats;
pub mod token;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use frame::{DecodeError, HeartbeatStats, InboundFrame, OutboundFrame};
pub use router::{
    AudioAnalysis, AudioSink, CallbackError, DispatchContext, EventRouter, MessageHandler,
    ParticipantRecord,
};
pub use session::{SessionConfig, SessionError, SessionHandle, SessionManager, SessionState};
pub use stats::{ConnectionStats, StatsSnapshot};
pub use token::{Capability, Credential, SigningError, TokenIssuer};
pub use transport::{
    ConnectError, Connection, ReceiveError, ScopedConnection, SendError, Transport,
};
