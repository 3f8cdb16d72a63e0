pub mod config;
pub mod directory;
pub mod error;
pub mod logger;
pub mod negotiator;
pub mod peer;
pub mod presence;
pub mod selector;
pub mod session;
pub mod signaling;
mod utils;

pub use config::CallConfig;
pub use directory::{MemoryDirectory, SharedDirectory};
pub use error::{CallError, CallFailure};
pub use negotiator::{CallEvent, Participant, ParticipantHandle};
pub use peer::{PeerId, WebRtcTransportFactory};
pub use session::{CallState, Role};
