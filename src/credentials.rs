//! Credentials collaborator interface.
//!
//! Credential material formatting and validation are external concerns; the
//! core only sequences: build the blob, anchor it in the connection's scratch
//! arena, hand it to the transport, free it with the connection.

use bytes::Bytes;

use crate::status::Status;

/// Builds an opaque credentials blob from a raw connection string
/// (e.g. `"user%secret"` — the format is the builder's business).
pub trait CredentialsBuilder {
    fn build(&self, raw: &str) -> Result<Bytes, Status>;
}

/// Default builder: passes the raw string through verbatim. Suitable when
/// the transport does its own parsing.
pub struct PassthroughCredentials;

impl CredentialsBuilder for PassthroughCredentials {
    fn build(&self, raw: &str) -> Result<Bytes, Status> {
        Ok(Bytes::copy_from_slice(raw.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_copies_bytes() {
        let blob = PassthroughCredentials.build("svc%hunter2").unwrap();
        assert_eq!(&blob[..], b"svc%hunter2");
    }
}
