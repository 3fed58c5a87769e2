//! Session identifier generation.
//!
//! Clients name their terminals (`terminal_<millis>_<suffix>`) so an id can be
//! persisted before the server ever sees it. The server only mints ids for
//! `create` requests that arrive without one.

use rand::Rng;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of the random suffix in client-generated ids.
const SUFFIX_LEN: usize = 9;

/// Generate a client-side terminal id: `terminal_<unix millis>_<9 base36 chars>`.
pub fn new_terminal_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("terminal_{}_{suffix}", crate::messages::now_millis())
}

/// Generate a random server-side session id (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}
