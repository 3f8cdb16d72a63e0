use crate::peer::types::PeerId;
use once_cell::sync::Lazy;

/// ========== GLOBAL STATE ==========

/// Identifier of this process, assigned once for its whole lifetime
pub static LOCAL_ID: Lazy<PeerId> = Lazy::new(PeerId::generate);
