//! RPC error types.
//!
//! Failures surfaced to callers fall into three groups: the peer went away
//! ([`RpcError::ConnectionLost`]), the remote handler ran and returned an
//! error ([`RpcError::Remote`]), or the call could not be issued locally.
//! Keeping these apart lets callers distinguish "remote refused or crashed"
//! from "remote returned a value".
//!
//! Protocol violations (an unknown handler id, a malformed packet) are not
//! represented here. They indicate mismatched builds and abort the process.
use thiserror::Error;

use crate::packet::ProcId;

#[derive(Error, Debug)]
pub enum RpcError {
    /// The connection to `peer` closed or failed while the call was pending,
    /// or before it was issued.
    #[error("connection to node {peer} lost")]
    ConnectionLost { peer: ProcId },

    /// The remote handler returned an error.
    #[error("node {peer} failed to handle the call: {message}")]
    Remote { peer: ProcId, message: String },

    /// Arguments or a return value could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(#[source] anyhow::Error),

    /// `target` is not a member of the session.
    #[error("node {target} is not part of a session of {numprocs} nodes")]
    UnknownPeer { target: ProcId, numprocs: usize },

    /// A blocking wait was attempted on a fiber worker thread, which would
    /// stall every fiber scheduled there. Await the future instead.
    #[error("blocking wait attempted inside a fiber")]
    BlockingWaitInFiber,

    /// The session has been shut down.
    #[error("session is shut down")]
    Shutdown,
}

impl RpcError {
    /// The peer the failure is attributed to, if any.
    pub fn peer(&self) -> Option<ProcId> {
        match self {
            Self::ConnectionLost { peer } | Self::Remote { peer, .. } => Some(*peer),
            Self::UnknownPeer { target, .. } => Some(*target),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn it_attributes_failures_to_peers() {
        assert_eq!(RpcError::ConnectionLost { peer: 3 }.peer(), Some(3));
        assert_eq!(
            RpcError::Remote {
                peer: 1,
                message: "boom".into()
            }
            .to_string(),
            "node 1 failed to handle the call: boom"
        );
        assert_eq!(RpcError::Shutdown.peer(), None);
    }
}
