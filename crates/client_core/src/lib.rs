//! Session and update-synchronization core of the chat client.
//!
//! The pieces compose as: transport push stream → [`RecoveryCoordinator`]
//! (ordering, gap detection and recovery per channel) → [`Dispatcher`] →
//! application handlers, with [`SessionLoop`] owning the whole run after
//! [`AuthFlow`] has logged in.

pub mod auth;
pub mod dispatcher;
pub mod error;
pub mod gaps;
pub mod http;
pub mod messenger;
pub mod recovery;
pub mod retry;
pub mod session;
pub mod transport;

pub use auth::{
    validate_phone, AuthFailure, AuthFlow, AuthOptions, AuthState, CredentialProvider, Session,
    SignUpDetails, SignUpHandler, SignUpPolicy,
};
pub use dispatcher::{Dispatcher, UpdateHandler};
pub use error::{
    AuthError, CommandError, DispatchError, GapUnrecoverable, SessionError, TransportError,
};
pub use gaps::{Classification, GapDetector, Verdict};
pub use http::{HttpTransport, HttpTransportConfig};
pub use messenger::Messenger;
pub use recovery::{
    ChannelStatus, PendingBuffer, RecoveryCoordinator, RecoveryEvent, UpdatesConfig,
};
pub use retry::{RetryOutcome, RetryPolicy};
pub use session::{LiveContext, ReconnectPolicy, SessionLoop, SessionOptions};
pub use transport::{AuthApi, MessagesApi, UpdateStream, UpdatesApi};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
