use std::collections::hash_map::{Entry, HashMap};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::error::TransferError;
use super::{backoff::ExponentialBackoff, comm::Communicator, util, Rank};

const CXN_R_TIMEOUT: Duration = Duration::from_millis(5000);
const CXN_W_TIMEOUT: Duration = Duration::from_millis(5000);
const RETRY_WAIT: Duration = Duration::from_millis(50);
const RETRY_MAX_WAIT: Duration = Duration::from_millis(2000);
const RETRY_ATTEMPTS: usize = 12;

/// The threads behind a TCP communicator: one serial sender, which owns an
/// outbound connection to each peer it has talked to, and one listener,
/// which accepts inbound connections and spawns a reader for each.
///
/// Every frame is acknowledged by the receiver echoing the frame size, once
/// the payload has been queued for the local rank. A broken connection is
/// re-established with exponential backoff; if that fails the sender thread
/// exits, and later sends report the peer as disconnected.
///
pub struct TcpHost {
    listen_thread: Option<thread::JoinHandle<()>>,
    send_thread: Option<thread::JoinHandle<()>>,
}

impl TcpHost {
    pub fn new(
        listener: TcpListener,
        peers: Vec<SocketAddr>,
    ) -> (Self, Sender<(Rank, Vec<u8>)>, Receiver<Vec<u8>>) {
        let (send_sink, send_src) = crossbeam_channel::unbounded();
        let send_thread = Self::start_serial_sender(peers, send_src);

        let (recv_sink, recv_src) = crossbeam_channel::unbounded();
        let listen_thread = Self::start_listener(listener, recv_sink);

        (
            TcpHost {
                send_thread: Some(send_thread),
                listen_thread: Some(listen_thread),
            },
            send_sink,
            recv_src,
        )
    }

    /// Wait for the sender thread to flush every queued message. The
    /// outbound channel must have been dropped first (by dropping the
    /// communicator), otherwise this blocks forever.
    pub fn join(&mut self) {
        if let Some(handle) = self.send_thread.take() {
            if handle.join().is_err() {
                error!("TCP sender thread panicked");
            }
        }
    }

    fn start_serial_sender(
        peers: Vec<SocketAddr>,
        send_src: Receiver<(Rank, Vec<u8>)>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut table: HashMap<Rank, TcpStream> = HashMap::new();

            for (rank, message) in send_src {
                let addr = match peers.get(rank) {
                    Some(addr) => *addr,
                    None => {
                        error!("No address for rank {}, dropping message", rank);
                        continue;
                    }
                };

                let result = match table.entry(rank) {
                    Entry::Occupied(entry) => Ok(entry.into_mut()),
                    Entry::Vacant(entry) => Self::connect_with_retry(addr).map(|s| entry.insert(s)),
                }
                .and_then(|client| match Self::send_frame(client, &message) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!("Send to {} failed ({}), reconnecting", addr, e);
                        *client = Self::connect_with_retry(addr)?;
                        Self::send_frame(client, &message)
                    }
                });

                if let Err(e) = result {
                    error!("Giving up on rank {} at {}: {}", rank, addr, e);
                    return;
                }
            }
            debug!("TCP sender shutting down");
        })
    }

    fn send_frame(client: &mut TcpStream, message: &[u8]) -> io::Result<()> {
        util::write_frame(client, message)?;
        let ack = util::read_u64(client)?;

        if ack != message.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("receiver acknowledged {} bytes but {} were sent", ack, message.len()),
            ));
        }
        Ok(())
    }

    fn start_listener(listener: TcpListener, recv_sink: Sender<Vec<u8>>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            if let Ok(addr) = listener.local_addr() {
                info!("Listening to: {}", addr);
            }
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => Self::handle_connection(stream, recv_sink.clone()),
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        break;
                    }
                }
            }
        })
    }

    fn handle_connection(mut stream: TcpStream, recv_sink: Sender<Vec<u8>>) {
        let remote = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        debug!("Receiving connection from {}", remote);

        thread::spawn(move || loop {
            match Self::receive_frame(&mut stream, &recv_sink) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("Connection from {} closed", remote);
                    break;
                }
                Err(e) => {
                    warn!("Connection from {} failed: {}", remote, e);
                    break;
                }
            }
        });
    }

    fn receive_frame(stream: &mut TcpStream, recv_sink: &Sender<Vec<u8>>) -> io::Result<()> {
        let size = util::read_u64(stream)?;
        let bytes = util::read_bytes_vec(stream, size as usize)?;

        recv_sink
            .send(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
        stream.write_all(&size.to_le_bytes())
    }

    fn connect_with_retry(addr: SocketAddr) -> io::Result<TcpStream> {
        ExponentialBackoff::new(RETRY_WAIT, RETRY_MAX_WAIT, 2, RETRY_ATTEMPTS).retry(
            || {
                let stream = TcpStream::connect(addr)?;
                stream.set_read_timeout(Some(CXN_R_TIMEOUT))?;
                stream.set_write_timeout(Some(CXN_W_TIMEOUT))?;
                stream.set_nodelay(true)?;
                Ok(stream)
            },
            |e, delay| debug!("Connect to {} failed ({}), retrying in {:?}", addr, e, delay),
        )
    }
}

impl Drop for TcpHost {
    fn drop(&mut self) {
        // The listener blocks in accept for the life of the process; it is
        // detached rather than joined.
        self.listen_thread.take();
    }
}

/// A communicator over TCP. Sends are queued for the host's sender thread and
/// return immediately; receives pop frames queued by the host's readers.
///
pub struct TcpCommunicator {
    rank: Rank,
    num_peers: usize,
    send_sink: Sender<(Rank, Vec<u8>)>,
    recv_src: Receiver<Vec<u8>>,
}

impl TcpCommunicator {
    pub fn new(
        rank: Rank,
        peers: &[SocketAddr],
        send_sink: Sender<(Rank, Vec<u8>)>,
        recv_src: Receiver<Vec<u8>>,
    ) -> Self {
        Self {
            rank,
            num_peers: peers.len(),
            send_sink,
            recv_src,
        }
    }

    /// Bind this rank's listener at its address in `peers`, start the host
    /// threads, and return the communicator along with its host.
    ///
    pub fn connect(rank: Rank, peers: Vec<SocketAddr>) -> Result<(Self, TcpHost), TransferError> {
        let addr = *peers.get(rank).ok_or(TransferError::Disconnected { peer: rank })?;
        let listener = TcpListener::bind(addr).map_err(|source| TransferError::Io { peer: rank, source })?;
        Ok(Self::from_listener(rank, listener, peers))
    }

    /// Like `connect`, for a listener the caller has already bound. This is
    /// how tests obtain free ports: bind every listener to port zero first,
    /// then hand out the resulting addresses as the peer list.
    ///
    pub fn from_listener(rank: Rank, listener: TcpListener, peers: Vec<SocketAddr>) -> (Self, TcpHost) {
        let (host, send_sink, recv_src) = TcpHost::new(listener, peers.clone());
        (Self::new(rank, &peers, send_sink, recv_src), host)
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.num_peers
    }

    fn send(&self, rank: Rank, message: Vec<u8>) -> Result<(), TransferError> {
        self.send_sink
            .send((rank, message))
            .map_err(|_| TransferError::Disconnected { peer: rank })
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, TransferError> {
        match self.recv_src.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransferError::Disconnected { peer: self.rank }),
        }
    }
}
