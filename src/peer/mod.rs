pub mod connection;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{WebRtcTransport, WebRtcTransportFactory};
pub use state::LOCAL_ID;
pub use transport::{SdpKind, SessionDescription, SessionTransport, TransportFactory};
pub use types::{MediaKind, PeerId, PeerRecord, PeerStatus, RemoteTrack, ServerConfig};
