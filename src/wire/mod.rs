//! # Replication Envelope
//!
//! Length-delimited, type-tagged message framing over a stream socket.
//! Everything on the wire is network byte order:
//!
//! ```text
//! [1 byte  message type id]   0xFE is reserved and never valid
//! [4 bytes body length N]     big-endian
//! [N bytes body]
//! ```
//!
//! Integer fields inside bodies use the same conventions: `u16`/`u32` in
//! network byte order, `u64` as two 32-bit halves (high then low), and
//! strings as a `u32` length followed by raw bytes (8-bit clean).
//!
//! Unknown type ids on receive are a fatal protocol error — the envelope
//! is extensible by allocating new ids, never by guessing.
//!
//! [`ReplicaServer`] provides the accept loop: one thread per connection,
//! dispatching by type id to registered handlers. Shutdown signals the
//! loop and wakes it with a local connection so the listening socket can
//! close promptly.


use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{debug, error, info, warn};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Reserved type id; never a valid message.
pub const RESERVED_MESSAGE_TYPE: u8 = 0xFE;

/// Upper bound on a message body (64 MiB); larger declared lengths are
/// treated as protocol corruption.
pub const MAX_BODY_LENGTH: u32 = 64 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised by envelope framing and the replica server.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An attempt to send (or a peer sending) the reserved type id.
    #[error("Message type 0xFE is reserved")]
    ReservedType,

    /// A received type id has no registered handler.
    #[error("Unknown message type id: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// A declared body length exceeds [`MAX_BODY_LENGTH`].
    #[error("Message body length {0} exceeds limit")]
    BodyTooLarge(u32),
}

// ------------------------------------------------------------------------------------------------
// Integer / string primitives (network byte order)
// ------------------------------------------------------------------------------------------------

/// Writes a `u16` in network byte order.
pub fn send_u16<W: Write>(writer: &mut W, value: u16) -> Result<(), ProtocolError> {
    writer.write_all(&value.to_be_bytes())?;
    Ok(())
}

/// Reads a `u16` in network byte order.
pub fn receive_u16<R: Read>(reader: &mut R) -> Result<u16, ProtocolError> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

/// Writes a `u32` in network byte order.
pub fn send_u32<W: Write>(writer: &mut W, value: u32) -> Result<(), ProtocolError> {
    writer.write_all(&value.to_be_bytes())?;
    Ok(())
}

/// Reads a `u32` in network byte order.
pub fn receive_u32<R: Read>(reader: &mut R) -> Result<u32, ProtocolError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Writes a `u64` as two 32-bit halves in network byte order, high half
/// first.
pub fn send_u64<W: Write>(writer: &mut W, value: u64) -> Result<(), ProtocolError> {
    send_u32(writer, (value >> 32) as u32)?;
    send_u32(writer, (value & 0xFFFF_FFFF) as u32)
}

/// Reads a `u64` sent as two 32-bit halves, high half first.
pub fn receive_u64<R: Read>(reader: &mut R) -> Result<u64, ProtocolError> {
    let high = receive_u32(reader)?;
    let low = receive_u32(reader)?;
    Ok((u64::from(high) << 32) | u64::from(low))
}

/// Writes a string as `u32` length + raw bytes. The payload is 8-bit
/// clean; no encoding is assumed.
pub fn send_string<W: Write>(writer: &mut W, value: &[u8]) -> Result<(), ProtocolError> {
    let len = u32::try_from(value.len()).map_err(|_| ProtocolError::BodyTooLarge(u32::MAX))?;
    send_u32(writer, len)?;
    writer.write_all(value)?;
    Ok(())
}

/// Reads a string written by [`send_string`].
pub fn receive_string<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let len = receive_u32(reader)?;
    if len > MAX_BODY_LENGTH {
        return Err(ProtocolError::BodyTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

// ------------------------------------------------------------------------------------------------
// Envelope
// ------------------------------------------------------------------------------------------------

/// A framed message: type id + opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message type id (anything except [`RESERVED_MESSAGE_TYPE`]).
    pub message_type: u8,

    /// Message body bytes.
    pub body: Vec<u8>,
}

impl Envelope {
    /// Creates an envelope; the reserved type id is rejected.
    pub fn new(message_type: u8, body: Vec<u8>) -> Result<Self, ProtocolError> {
        if message_type == RESERVED_MESSAGE_TYPE {
            return Err(ProtocolError::ReservedType);
        }
        Ok(Self { message_type, body })
    }
}

/// Sends one framed message.
pub fn send_message<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtocolError> {
    if envelope.message_type == RESERVED_MESSAGE_TYPE {
        return Err(ProtocolError::ReservedType);
    }
    let len =
        u32::try_from(envelope.body.len()).map_err(|_| ProtocolError::BodyTooLarge(u32::MAX))?;
    if len > MAX_BODY_LENGTH {
        return Err(ProtocolError::BodyTooLarge(len));
    }

    writer.write_all(&[envelope.message_type])?;
    send_u32(writer, len)?;
    writer.write_all(&envelope.body)?;
    writer.flush()?;
    Ok(())
}

/// Receives one framed message. Returns `Ok(None)` on a clean disconnect
/// before the type byte.
pub fn receive_message<R: Read>(reader: &mut R) -> Result<Option<Envelope>, ProtocolError> {
    let mut type_byte = [0u8; 1];
    match reader.read(&mut type_byte) {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => return receive_message(reader),
        Err(e) => return Err(ProtocolError::Io(e)),
    }
    let message_type = type_byte[0];
    if message_type == RESERVED_MESSAGE_TYPE {
        return Err(ProtocolError::ReservedType);
    }

    let len = receive_u32(reader)?;
    if len > MAX_BODY_LENGTH {
        return Err(ProtocolError::BodyTooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(Some(Envelope { message_type, body }))
}

// ------------------------------------------------------------------------------------------------
// ReplicaServer
// ------------------------------------------------------------------------------------------------

/// Handler invoked for each received message of a registered type id;
/// returning an envelope sends it back as the response.
pub type MessageHandler =
    Box<dyn Fn(Envelope) -> Result<Option<Envelope>, ProtocolError> + Send + Sync>;

/// Accept-loop server speaking the envelope protocol.
pub struct ReplicaServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    handlers: Arc<HashMap<u8, MessageHandler>>,
    shutdown_flag: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ReplicaServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaServer").finish_non_exhaustive()
    }
}

impl ReplicaServer {
    /// Binds the listening socket (without accepting yet).
    pub fn bind(
        addr: impl ToSocketAddrs,
        handlers: HashMap<u8, MessageHandler>,
    ) -> Result<Self, ProtocolError> {
        if handlers.contains_key(&RESERVED_MESSAGE_TYPE) {
            return Err(ProtocolError::ReservedType);
        }
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "replica server bound");
        Ok(Self {
            listener,
            local_addr,
            handlers: Arc::new(handlers),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            accept_thread: Mutex::new(None),
        })
    }

    /// Address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts the accept loop on a background thread.
    pub fn start(&self) -> Result<(), ProtocolError> {
        let listener = self.listener.try_clone()?;
        let handlers = Arc::clone(&self.handlers);
        let shutdown = Arc::clone(&self.shutdown_flag);

        let handle = std::thread::Builder::new()
            .name("replica-accept".into())
            .spawn(move || {
                for connection in listener.incoming() {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    match connection {
                        Ok(stream) => {
                            let handlers = Arc::clone(&handlers);
                            if let Err(e) = std::thread::Builder::new()
                                .name("replica-conn".into())
                                .spawn(move || handle_connection(stream, &handlers))
                            {
                                error!(error = %e, "failed to spawn connection thread");
                            }
                        }
                        Err(e) => {
                            if shutdown.load(Ordering::SeqCst) {
                                break;
                            }
                            error!(error = %e, "accept failed");
                            break;
                        }
                    }
                }
                debug!("replica accept loop exited");
            })
            .map_err(|e| ProtocolError::Io(io::Error::other(e.to_string())))?;

        *lock_thread(&self.accept_thread) = Some(handle);
        Ok(())
    }

    /// Signals the accept loop, wakes it with a local connection, and
    /// joins the thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        // The listener blocks in accept(); a throwaway local connection
        // wakes it so the flag is observed.
        let _ = TcpStream::connect(self.local_addr);

        if let Some(handle) = lock_thread(&self.accept_thread).take()
            && handle.join().is_err()
        {
            error!("replica accept thread panicked");
        }
        info!(addr = %self.local_addr, "replica server shut down");
    }
}

impl Drop for ReplicaServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock_thread(mutex: &Mutex<Option<JoinHandle<()>>>) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Per-connection loop: receive, dispatch, reply. An unknown type id is
/// fatal for the connection.
fn handle_connection(stream: TcpStream, handlers: &HashMap<u8, MessageHandler>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".into());
    let mut reader = match stream.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            error!(peer, error = %e, "failed to clone connection stream");
            return;
        }
    };
    let mut writer = stream;

    loop {
        let envelope = match receive_message(&mut reader) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                debug!(peer, "peer disconnected");
                return;
            }
            Err(e) => {
                warn!(peer, error = %e, "framing error, closing connection");
                return;
            }
        };

        let Some(handler) = handlers.get(&envelope.message_type) else {
            error!(
                peer,
                message_type = envelope.message_type,
                "unknown message type, closing connection"
            );
            return;
        };

        match handler(envelope) {
            Ok(Some(reply)) => {
                if let Err(e) = send_message(&mut writer, &reply) {
                    warn!(peer, error = %e, "failed to send reply");
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(peer, error = %e, "handler failed, closing connection");
                return;
            }
        }
    }
}
