//! Blocking Unix-socket glue for the callback-based connection core.
//!
//! One reader thread feeds received bytes into the connection's decoder;
//! one writer thread drains the outbound queue whenever the connection
//! signals intent through its wake capability. The socket is the only place
//! real I/O happens — everything above it stays callback-pure.

use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::connection::{Connection, TransportSend, TransportWake};
use crate::dispatch::Bus;
use crate::error::Result;
use crate::lock;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Owns a connection wired to a Unix socket and the two threads driving it.
///
/// Dropping the handle shuts the socket down, detaches the connection from
/// the bus, and joins both threads.
pub struct ConnectionHandle {
    conn: Arc<Connection>,
    stream: UnixStream,
    wake_tx: mpsc::Sender<()>,
    shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// Wire a connected Unix socket to `bus`.
pub fn attach_stream(bus: &Arc<Bus>, stream: UnixStream) -> Result<ConnectionHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let (wake_tx, wake_rx) = mpsc::channel::<()>();

    let write_stream = Arc::new(Mutex::new(stream.try_clone()?));
    let send_shutdown = Arc::clone(&shutdown);
    let transport_send: TransportSend = Box::new(move |buf: Bytes| {
        let mut guard = lock(&write_stream);
        if let Err(err) = guard.write_all(&buf).and_then(|()| guard.flush()) {
            warn!(%err, "transport write failed");
            send_shutdown.store(true, Ordering::SeqCst);
        }
    });

    let conn_wake_tx = wake_tx.clone();
    let transport_wake: TransportWake = Box::new(move || {
        let _ = conn_wake_tx.send(());
    });

    let conn = bus.attach(transport_send, transport_wake);

    let writer = {
        let conn = Arc::clone(&conn);
        let shutdown = Arc::clone(&shutdown);
        std::thread::spawn(move || {
            while wake_rx.recv().is_ok() {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                while conn.on_writable() {}
            }
        })
    };

    let reader = {
        let conn = Arc::clone(&conn);
        let shutdown = Arc::clone(&shutdown);
        let wake_tx = wake_tx.clone();
        let mut read_stream = stream.try_clone()?;
        std::thread::spawn(move || {
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            loop {
                match read_stream.read(&mut chunk) {
                    Ok(0) => {
                        debug!(conn = conn.id(), "peer closed connection");
                        break;
                    }
                    Ok(n) => {
                        if let Err(err) = conn.on_bytes_received(&chunk[..n]) {
                            warn!(conn = conn.id(), %err, "closing corrupt connection");
                            break;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(conn = conn.id(), %err, "transport read failed");
                        break;
                    }
                }
            }
            conn.close();
            let _ = read_stream.shutdown(Shutdown::Both);
            shutdown.store(true, Ordering::SeqCst);
            // unblock the writer thread
            let _ = wake_tx.send(());
        })
    };

    Ok(ConnectionHandle {
        conn,
        stream,
        wake_tx,
        shutdown,
        reader: Some(reader),
        writer: Some(writer),
    })
}

/// Connect to a Unix socket path and wire the stream to `bus`.
pub fn connect(bus: &Arc<Bus>, path: impl AsRef<std::path::Path>) -> Result<ConnectionHandle> {
    let stream = UnixStream::connect(path)?;
    attach_stream(bus, stream)
}

impl ConnectionHandle {
    /// The connection driven by this handle.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Shut the socket down, detach from the bus, and join both threads.
    /// Idempotent; also invoked on drop.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.send(());
        let _ = self.stream.shutdown(Shutdown::Both);
        self.conn.close();

        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}
