/// Configuration for a [`Client`](crate::Client).
///
/// All pools are fixed-capacity: exhaustion surfaces as
/// [`Error::OutOfMemory`](crate::Error::OutOfMemory) (arena and op table) or
/// [`Error::ConnectionLimitReached`](crate::Error::ConnectionLimitReached),
/// never as an unbounded allocation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of live arena blocks.
    pub max_blocks: u32,
    /// Maximum number of in-flight asynchronous operations.
    pub max_ops: u32,
    /// Maximum number of connection slots.
    pub max_connections: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_blocks: 4096,
            max_ops: 1024,
            max_connections: 64,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.max_blocks == 0 {
            return Err(crate::error::Error::Config(
                "max_blocks must be nonzero".into(),
            ));
        }
        if self.max_ops == 0 {
            return Err(crate::error::Error::Config("max_ops must be nonzero".into()));
        }
        if self.max_connections == 0 {
            return Err(crate::error::Error::Config(
                "max_connections must be nonzero".into(),
            ));
        }
        // Every connection needs at least its own node, a scratch node, and a
        // credentials node in the arena.
        if self.max_blocks < self.max_connections {
            return Err(crate::error::Error::Config(
                "max_blocks must be >= max_connections".into(),
            ));
        }
        Ok(())
    }
}
