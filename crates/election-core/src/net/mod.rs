//! The socket layer: binding, dialing and framed send/receive over TCP.
//!
//! Unlike a poll-based reactor, every socket here is used in blocking mode by
//! a dedicated OS thread (see [`crate::manager`]), which is what lets the
//! election driver (`crate::election`) block on a condition variable instead
//! of busy-waiting on an event loop.
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

pub mod error;

pub use error::Error;

/// How long [`accept_nonblocking`] waits for an incoming connection before
/// giving the caller a chance to check its shutdown flag.
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// How long [`dial`] waits to establish the TCP handshake.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind a listening socket on `addr`.
pub fn bind_and_listen(addr: SocketAddr) -> Result<TcpListener, Error> {
    let listener = TcpListener::bind(addr).map_err(|e| Error::Bind(addr, e))?;
    // We drive the accept loop with a poll timeout (see `accept_nonblocking`),
    // not with a blocking `accept`, so that shutdown can be observed.
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Accept a single connection, or return `None` if nothing arrived within
/// `ACCEPT_POLL_TIMEOUT`. Used by the acceptor loop to check its shutdown
/// flag between polls instead of blocking forever in `accept()`.
pub fn accept_nonblocking(listener: &TcpListener) -> Result<Option<(TcpStream, SocketAddr)>, Error> {
    match listener.accept() {
        Ok((stream, addr)) => {
            stream.set_nonblocking(false)?;
            Ok(Some((stream, addr)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            std::thread::sleep(ACCEPT_POLL_TIMEOUT);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Dial a peer, returning a connected, blocking socket.
///
/// Built on [`socket2::Socket`] the same way the `yuv-p2p` crate's
/// `net/reactor.rs::dial` is, to set connect timeout and `TCP_NODELAY` up
/// front -- but the resulting stream is left in blocking mode, since this
/// engine is thread-per-peer rather than a single poll loop.
pub fn dial(addr: SocketAddr) -> Result<TcpStream, Error> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let sock = Socket::new(domain, Type::STREAM, None).map_err(|e| Error::Dial(addr, e))?;
    sock.set_nodelay(true).map_err(|e| Error::Dial(addr, e))?;
    sock.connect_timeout(&addr.into(), DIAL_TIMEOUT)
        .map_err(|e| Error::Dial(addr, e))?;

    let stream: TcpStream = sock.into();
    stream.set_nonblocking(false)?;
    Ok(stream)
}

/// Send one frame: `KIND SP PAYLOAD\n`.
///
/// The trailing newline is a deliberate deviation from the literal "one
/// `sendall` == one message" assumption of the original protocol (flagged as
/// fragile): it gives [`recv_frame`] an unambiguous boundary to read up to,
/// without changing the logical `kind integer` grammar on the wire.
pub fn send_frame(stream: &mut TcpStream, kind: &str, payload: i64) -> Result<(), Error> {
    let line = format!("{kind} {payload}\n");
    stream.write_all(line.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Receive one frame, blocking until a full line arrives.
///
/// Returns `Error::Closed` on EOF (the peer shut down its write side), and
/// `Error::Io` for a malformed line (not `Error::Closed`, since parsing a
/// malformed frame is the reader's job via [`crate::election::ProtocolError`],
/// handled separately from a genuine socket failure).
pub fn recv_frame(reader: &mut BufReader<TcpStream>) -> Result<(String, i64), Error> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Err(Error::Closed);
    }

    let line = line.trim_end();
    let (kind, payload) = line
        .split_once(' ')
        .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed frame")))?;
    let payload: i64 = payload
        .parse()
        .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "non-integer payload")))?;

    Ok((kind.to_string(), payload))
}

/// Close a socket. Idempotent: shutting down an already-closed socket is
/// simply ignored, since the only thing we can do at that point is continue.
pub fn close(stream: &TcpStream) {
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn send_then_recv_roundtrip() {
        let listener = bind_and_listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(false).unwrap();

        let client = std::thread::spawn(move || {
            let mut stream = dial(addr).unwrap();
            send_frame(&mut stream, "be_my_parent", 7).unwrap();
        });

        let (server_stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(server_stream);
        let (kind, payload) = recv_frame(&mut reader).unwrap();

        assert_eq!(kind, "be_my_parent");
        assert_eq!(payload, 7);

        client.join().unwrap();
    }

    #[test]
    fn recv_on_closed_socket_is_closed_error() {
        let listener = bind_and_listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(false).unwrap();

        let client = std::thread::spawn(move || {
            let stream = dial(addr).unwrap();
            drop(stream);
        });

        let (server_stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(server_stream);
        let err = recv_frame(&mut reader).unwrap_err();
        assert!(matches!(err, Error::Closed));

        client.join().unwrap();
    }
}
