use sha2::{Digest, Sha224};

/// Hex-encoded SHA-224 of the password: the 56-byte token that opens every
/// request header.
pub fn sha224_hex(password: &str) -> String {
    hex::encode(Sha224::digest(password.as_bytes()))
}
