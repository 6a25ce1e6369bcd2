use std::time::Duration;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use crate::error::TransferError;
use super::{comm::Communicator, Rank};

/// A communicator whose ranks are threads in one process. Each rank owns the
/// receiving end of an unbounded channel, and holds senders to every peer's
/// channel, so sends never block.
///
pub struct LocalCommunicator {
    rank: Rank,
    peers: Vec<Sender<Vec<u8>>>,
    inbox: Receiver<Vec<u8>>,
}

impl LocalCommunicator {
    /// Create a connected group of communicators, one per rank, in rank
    /// order. Move each into the thread that plays that rank.
    ///
    pub fn group(size: usize) -> Vec<Self> {
        let (peers, inboxes): (Vec<_>, Vec<_>) = (0..size)
            .map(|_| crossbeam_channel::unbounded())
            .unzip();

        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| Self {
                rank,
                peers: peers.clone(),
                inbox,
            })
            .collect()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: Rank, message: Vec<u8>) -> Result<(), TransferError> {
        self.peers
            .get(rank)
            .ok_or(TransferError::Disconnected { peer: rank })?
            .send(message)
            .map_err(|_| TransferError::Disconnected { peer: rank })
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, TransferError> {
        match self.inbox.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransferError::Disconnected { peer: self.rank }),
        }
    }
}
