//! Job identity derivation
//!
//! An identity is `escape(origin)_run_id`. The escaped origin never contains
//! `_`, so the last `_` always splits the pair back apart.

use std::fmt::Write;

const ID_SEPARATOR: char = '_';

/// Percent-encode every byte of `origin` outside `[A-Za-z0-9.-]`.
///
/// The output is also safe to use as a single path component.
pub fn escape_origin(origin: &str) -> String {
    let mut escaped = String::with_capacity(origin.len());
    for byte in origin.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'-' {
            escaped.push(byte as char);
        } else {
            // Writing to a String cannot fail
            let _ = write!(escaped, "%{:02X}", byte);
        }
    }
    escaped
}

/// Deterministic job id for a run submitted by `origin`.
pub fn format_id(origin: &str, run_id: u64) -> String {
    format!("{}{}{}", escape_origin(origin), ID_SEPARATOR, run_id)
}
