use std::time::Duration;
use crate::error::TransferError;
use super::Rank;

/// Interface for a group of processes that can exchange messages over a
/// network. The underlying transport can in principle be TCP, UDP, or a
/// higher level abstraction like MPI.
///
pub trait Communicator: Send + Sync {
    /// Must be implemented to return the rank of this process within the
    /// communicator.
    fn rank(&self) -> Rank;

    /// Must be implemented to return the number of peers processes in this
    /// communicator.
    fn size(&self) -> usize;

    /// Must be implemented to send a message to a peer. This method must
    /// return immediately, in other words it is not allowed to block until a
    /// matching receive is posted. An error means the message can never be
    /// delivered.
    fn send(&self, rank: Rank, message: Vec<u8>) -> Result<(), TransferError>;

    /// Must be implemented to receive a message from any of the peers,
    /// waiting at most `timeout` for one to arrive. A zero timeout polls.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, TransferError>;

    /// Receive a message from any of the peers, blocking until one arrives.
    ///
    fn recv(&self) -> Result<Vec<u8>, TransferError> {
        loop {
            if let Some(message) = self.recv_timeout(Duration::from_millis(100))? {
                return Ok(message);
            }
        }
    }
}
