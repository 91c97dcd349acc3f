//! The dial service the reconnection queue drives.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::peer::PeerId;

pub type DialResult<T> = std::result::Result<T, DialError>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DialError {
    #[error("timeout while dialing")]
    Timeout,
    #[error("connection refused by peer")]
    Refused,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("dial cancelled")]
    Cancelled,
}

/// Opens fully usable connections to peers.
///
/// Implementations must be idempotent: when a connection to `peer` already
/// exists the call succeeds with it instead of opening a second one. The
/// `cancel` token is triggered when the caller is no longer interested in the
/// outcome and the attempt should be abandoned as soon as possible.
pub trait Dialer: Send + Sync + 'static {
    type Connection: Send;

    fn open_connection(
        &self,
        peer: &PeerId,
        cancel: CancellationToken,
    ) -> impl Future<Output = DialResult<Self::Connection>> + Send;
}
