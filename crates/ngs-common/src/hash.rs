use ring::digest;
use std::fmt::Write;

/// SHA-256 of `input`, lowercase hex.
pub fn sha256_hex(input: &str) -> String {
    let d = digest::digest(&digest::SHA256, input.as_bytes());
    let mut s = String::with_capacity(64);
    for b in d.as_ref() {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// SHA-256 of `input`, truncated to the first `len` hex characters.
pub fn sha256_hex_truncated(input: &str, len: usize) -> String {
    let mut s = sha256_hex(input);
    s.truncate(len);
    s
}
