//! Connection manager (§4.2): owns per-peer sockets, starts the acceptor and
//! one reader thread per peer, and dispatches parsed frames into the
//! election logic through the narrow [`MessageHandler`] capability.
use std::collections::HashMap;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, debug_span, warn};

use crate::election::{FrameSender, Kind, MessageHandler};
use crate::net::{self, Error as NetError};

/// Errors from the connection manager itself, as opposed to a single
/// socket operation (`crate::net::Error`).
#[derive(Error, Debug)]
pub enum Error {
    /// Neither an inbound nor an outbound channel exists to this peer, and
    /// it isn't a known neighbor we could dial on demand either.
    #[error("no channel to peer {0}")]
    NoChannel(i64),
    #[error(transparent)]
    Net(#[from] NetError),
}

fn clone_stream(stream: &TcpStream) -> Result<TcpStream, Error> {
    stream.try_clone().map_err(|e| Error::Net(NetError::Io(e)))
}

struct Sockets {
    inbound: Mutex<HashMap<i64, TcpStream>>,
    outbound: Mutex<HashMap<i64, TcpStream>>,
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Inbound,
    Outbound,
}

/// Owns `inbound_by_peer`/`outbound_by_peer` (§3's "per-peer connection
/// record") and the threads that serve them. Holds no election state: it is
/// a pure transport, matching §4.2's "the manager itself holds no election
/// state". It does know neighbor addresses, though -- purely to dial a
/// neighbor on demand the first time something is sent to it, the same
/// "connect right before the first send" behavior as the original
/// `connection_manager.py::send_message_to_server`, rather than requiring
/// every neighbor's listener to already be up before this node starts.
pub struct ConnectionManager {
    self_id: i64,
    neighbor_addrs: HashMap<i64, SocketAddr>,
    sockets: Sockets,
    shutting_down: AtomicBool,
    handler: Mutex<Option<Arc<dyn MessageHandler>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    weak_self: Mutex<Weak<ConnectionManager>>,
}

impl ConnectionManager {
    pub fn new(self_id: i64, neighbor_addrs: HashMap<i64, SocketAddr>) -> Arc<Self> {
        let manager = Arc::new(Self {
            self_id,
            neighbor_addrs,
            sockets: Sockets {
                inbound: Mutex::new(HashMap::new()),
                outbound: Mutex::new(HashMap::new()),
            },
            shutting_down: AtomicBool::new(false),
            handler: Mutex::new(None),
            readers: Mutex::new(Vec::new()),
            weak_self: Mutex::new(Weak::new()),
        });
        *manager.weak_self.lock().unwrap() = Arc::downgrade(&manager);
        manager
    }

    fn arc_self(&self) -> Arc<Self> {
        self.weak_self
            .lock()
            .unwrap()
            .upgrade()
            .expect("ConnectionManager used after being dropped")
    }

    /// Bind, listen, and spawn the acceptor thread (§4.2). `on_message` is
    /// the dispatch capability into the election state machine; it is
    /// supplied here rather than at construction time, which is what lets
    /// the manager and the election state machine be built independently of
    /// each other (§9's "cyclic ownership" resolution).
    pub fn start(&self, listen_addr: SocketAddr, on_message: Arc<dyn MessageHandler>) -> Result<(), Error> {
        *self.handler.lock().unwrap() = Some(on_message);

        let listener = net::bind_and_listen(listen_addr)?;
        let manager = self.arc_self();
        thread::Builder::new()
            .name(format!("election-acceptor-{}", self.self_id))
            .spawn(move || manager.accept_loop(listener))
            .expect("failed to spawn acceptor thread");
        Ok(())
    }

    /// Dial `peer_id` at `addr` and register the resulting outbound socket,
    /// spawning a dedicated reader thread for it (§4.2). Exposed for callers
    /// that want to dial eagerly; `send` also calls this lazily as needed.
    pub fn dial_and_register(&self, peer_id: i64, addr: SocketAddr) -> Result<(), Error> {
        let stream = net::dial(addr)?;
        let reader = BufReader::new(clone_stream(&stream)?);
        self.sockets.outbound.lock().unwrap().insert(peer_id, stream);
        self.spawn_reader(peer_id, reader, Role::Outbound);
        Ok(())
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let _span = debug_span!("acceptor", self_id = self.self_id).entered();
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                debug!("acceptor observed shutdown flag, exiting");
                return;
            }
            match net::accept_nonblocking(&listener) {
                Ok(Some((stream, peer_addr))) => {
                    if let Err(err) = self.accept_peer(stream) {
                        warn!(%peer_addr, %err, "failed to accept peer");
                    }
                }
                Ok(None) => continue,
                Err(err) => warn!(%err, "accept failed"),
            }
        }
    }

    fn accept_peer(&self, stream: TcpStream) -> Result<(), Error> {
        let mut reader = BufReader::new(clone_stream(&stream)?);
        let (kind_str, peer_id) = net::recv_frame(&mut reader)?;
        let kind = match Kind::from_wire(&kind_str) {
            Some(kind) => kind,
            None => {
                warn!(self_id = self.self_id, kind = %kind_str, "unrecognized first frame, dropping connection");
                return Ok(());
            }
        };

        self.sockets.inbound.lock().unwrap().insert(peer_id, stream);
        self.dispatch(peer_id, kind, peer_id);
        self.spawn_reader(peer_id, reader, Role::Inbound);
        Ok(())
    }

    fn spawn_reader(&self, peer_id: i64, reader: BufReader<TcpStream>, role: Role) {
        let manager = self.arc_self();
        let handle = thread::Builder::new()
            .name(format!("election-reader-{}-{}-{:?}", self.self_id, peer_id, role))
            .spawn(move || manager.reader_loop(peer_id, reader))
            .expect("failed to spawn reader thread");
        self.readers.lock().unwrap().push(handle);
    }

    fn reader_loop(self: Arc<Self>, peer_id: i64, mut reader: BufReader<TcpStream>) {
        let _span = debug_span!("reader", self_id = self.self_id, peer_id).entered();
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                debug!("reader observed shutdown flag, exiting");
                return;
            }
            match net::recv_frame(&mut reader) {
                Ok((kind_str, payload)) => match Kind::from_wire(&kind_str) {
                    Some(kind) => self.dispatch(peer_id, kind, payload),
                    None => {
                        warn!(kind = %kind_str, "unrecognized message kind, closing reader");
                        return;
                    }
                },
                Err(NetError::Closed) => {
                    debug!("peer closed connection");
                    return;
                }
                Err(err) => {
                    warn!(%err, "reader error, closing");
                    return;
                }
            }
        }
    }

    fn dispatch(&self, peer_id: i64, kind: Kind, payload: i64) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler.handle_message(peer_id, kind, payload);
        }
    }

    fn send_over(stream: &TcpStream, kind: Kind, payload: i64) -> Result<(), Error> {
        let mut stream = clone_stream(stream)?;
        Ok(net::send_frame(&mut stream, kind.as_wire(), payload)?)
    }
}

impl FrameSender for ConnectionManager {
    fn send(&self, peer_id: i64, kind: Kind, payload: i64) -> Result<(), Error> {
        if let Some(stream) = self.sockets.outbound.lock().unwrap().get(&peer_id) {
            return Self::send_over(stream, kind, payload);
        }
        if let Some(stream) = self.sockets.inbound.lock().unwrap().get(&peer_id) {
            return Self::send_over(stream, kind, payload);
        }

        let addr = *self.neighbor_addrs.get(&peer_id).ok_or(Error::NoChannel(peer_id))?;
        self.dial_and_register(peer_id, addr)?;
        let outbound = self.sockets.outbound.lock().unwrap();
        let stream = outbound.get(&peer_id).expect("just registered");
        Self::send_over(stream, kind, payload)
    }

    /// Idempotent (§8 property 7): a second call is a no-op.
    fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for stream in self.sockets.inbound.lock().unwrap().values() {
            net::close(stream);
        }
        for stream in self.sockets.outbound.lock().unwrap().values() {
            net::close(stream);
        }
    }
}
