/// Query routing and mirroring engine
pub mod backend;
pub mod engine;
pub mod fanout;
pub mod projector;
pub mod writer;

pub use backend::BackendConnection;
pub use engine::{MirrorSlot, ProxyEngine, QueryReport};
pub use fanout::{Dispatch, MirrorFanout, MirrorOutcome, MirrorPolicy};
pub use writer::{ColumnDescriptor, FieldFormat, ResultWriter};

use std::fmt;

/// Version announced when the primary does not report one
pub const FALLBACK_SERVER_VERSION: &str = "150002";

/// Completion status written after the last row of a primary result
pub const COMPLETION_STATUS: &str = "OK";

/// Role a backend plays for the lifetime of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Authoritative backend whose results reach the client
    Primary,
    /// Best-effort backend receiving a copy of each successful query
    Mirror,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Mirror => write!(f, "mirror"),
        }
    }
}
