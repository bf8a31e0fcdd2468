//! Numeric status codes reported by the transport collaborator.
//!
//! The core only ever branches on the success/failure binary
//! ([`Status::is_ok`]). Symbolic names exist purely for diagnostics and are
//! resolved through an injected [`StatusMapper`], so the name table can be
//! swapped per deployment without touching the sequencing logic.

use std::borrow::Cow;
use std::fmt;

/// A raw transport status code. Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    pub const OK: Status = Status(0x0000_0000);
    pub const UNSUCCESSFUL: Status = Status(0xC000_0001);
    pub const NOT_IMPLEMENTED: Status = Status(0xC000_0002);
    pub const INVALID_PARAMETER: Status = Status(0xC000_000D);
    pub const NO_MEMORY: Status = Status(0xC000_0017);
    pub const ACCESS_DENIED: Status = Status(0xC000_0022);
    pub const OBJECT_NAME_NOT_FOUND: Status = Status(0xC000_0034);
    pub const IO_TIMEOUT: Status = Status(0xC000_00B5);
    pub const PIPE_BROKEN: Status = Status(0xC000_014B);
    pub const CONNECTION_REFUSED: Status = Status(0xC000_0236);

    /// Success/failure binary — the only predicate the core branches on.
    #[inline]
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Maps a numeric status to a symbolic name for messages and trace events.
pub trait StatusMapper {
    fn name(&self, status: Status) -> Cow<'static, str>;
}

/// Default mapper covering the well-known codes; unknown codes render as
/// `STATUS_0x...`.
pub struct WellKnownStatusNames;

impl StatusMapper for WellKnownStatusNames {
    fn name(&self, status: Status) -> Cow<'static, str> {
        let known = match status {
            Status::OK => "OK",
            Status::UNSUCCESSFUL => "UNSUCCESSFUL",
            Status::NOT_IMPLEMENTED => "NOT_IMPLEMENTED",
            Status::INVALID_PARAMETER => "INVALID_PARAMETER",
            Status::NO_MEMORY => "NO_MEMORY",
            Status::ACCESS_DENIED => "ACCESS_DENIED",
            Status::OBJECT_NAME_NOT_FOUND => "OBJECT_NAME_NOT_FOUND",
            Status::IO_TIMEOUT => "IO_TIMEOUT",
            Status::PIPE_BROKEN => "PIPE_BROKEN",
            Status::CONNECTION_REFUSED => "CONNECTION_REFUSED",
            _ => return Cow::Owned(format!("STATUS_{status}")),
        };
        Cow::Borrowed(known)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_binary() {
        assert!(Status::OK.is_ok());
        assert!(!Status::ACCESS_DENIED.is_ok());
        assert!(!Status(1).is_ok());
    }

    #[test]
    fn well_known_names() {
        let mapper = WellKnownStatusNames;
        assert_eq!(mapper.name(Status::ACCESS_DENIED), "ACCESS_DENIED");
        assert_eq!(mapper.name(Status::OK), "OK");
    }

    #[test]
    fn unknown_names_render_hex() {
        let mapper = WellKnownStatusNames;
        assert_eq!(mapper.name(Status(0xDEAD_BEEF)), "STATUS_0xDEADBEEF");
    }
}
