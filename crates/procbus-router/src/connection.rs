use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use procbus_frame::{encode_frame, Decoder, Frame};
use tracing::trace;

use crate::dispatch::Bus;
use crate::error::Result;
use crate::lock;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// "Write these bytes now" capability injected by the transport.
pub type TransportSend = Box<dyn Fn(Bytes) + Send + Sync>;

/// "Schedule a writability callback" capability injected by the transport.
pub type TransportWake = Box<dyn Fn() + Send + Sync>;

/// Module identity a peer registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Canonical (upper-cased) module name.
    pub module: String,
    /// Instance uuid, absent for legacy registrations.
    pub uuid: Option<String>,
}

/// One live peer session: an inbound frame decoder and a FIFO of encoded
/// outbound buffers, bound to an opaque transport.
///
/// The transport owns the `Connection`'s lifetime; the route table only
/// holds weak handles. `send` never writes — it queues and signals intent
/// through the wake capability, and the transport later drains the queue one
/// buffer at a time via [`Connection::on_writable`].
pub struct Connection {
    id: u64,
    bus: Arc<Bus>,
    identity: Mutex<Option<Identity>>,
    decoder: Mutex<Decoder>,
    outbound: Mutex<VecDeque<Bytes>>,
    transport_send: TransportSend,
    transport_wake: TransportWake,
}

impl Connection {
    pub(crate) fn new(
        bus: Arc<Bus>,
        transport_send: TransportSend,
        transport_wake: TransportWake,
    ) -> Arc<Self> {
        let max_payload = bus.config().max_payload_size;
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            bus,
            identity: Mutex::new(None),
            decoder: Mutex::new(Decoder::with_max_payload(max_payload)),
            outbound: Mutex::new(VecDeque::new()),
            transport_send,
            transport_wake,
        })
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The identity this peer registered under, if any.
    pub fn identity(&self) -> Option<Identity> {
        lock(&self.identity).clone()
    }

    pub(crate) fn set_identity(&self, identity: Identity) {
        *lock(&self.identity) = Some(identity);
    }

    pub(crate) fn clear_identity(&self) {
        *lock(&self.identity) = None;
    }

    /// Feed a chunk of received transport bytes through the decoder,
    /// dispatching every completed frame to the bus.
    ///
    /// Runs on whatever thread the transport delivers bytes; never blocks
    /// beyond the decoder and table locks. A decode error is fatal for this
    /// connection: the caller must [`Connection::close`] it. Other
    /// connections and the route table are unaffected.
    pub fn on_bytes_received(self: &Arc<Self>, buf: &[u8]) -> Result<()> {
        let mut rest = buf;
        while !rest.is_empty() {
            let completed = {
                let mut decoder = lock(&self.decoder);
                let (consumed, frame) = decoder.feed(rest)?;
                rest = &rest[consumed..];
                frame
            };
            if let Some(frame) = completed {
                self.bus.dispatch_inbound(self, frame)?;
            }
        }
        Ok(())
    }

    /// Encode a frame and queue it for transmission.
    ///
    /// Does not block and does not write; it pushes the encoded buffer onto
    /// the outbound queue and signals the transport to schedule a write.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        let mut wire = BytesMut::new();
        encode_frame(frame, &mut wire)?;
        lock(&self.outbound).push_back(wire.freeze());
        (self.transport_wake)();
        Ok(())
    }

    /// Hand the next queued buffer to the transport, if any.
    ///
    /// Called by the transport when it can accept more bytes; the previous
    /// buffer is already flushed at that point, so at most one buffer is in
    /// flight per connection. Returns whether a buffer was dispatched.
    pub fn on_writable(&self) -> bool {
        let next = lock(&self.outbound).pop_front();
        match next {
            Some(buf) => {
                trace!(conn = self.id, len = buf.len(), "dispatching outbound buffer");
                (self.transport_send)(buf);
                true
            }
            None => false,
        }
    }

    /// Number of queued outbound buffers.
    pub fn queued(&self) -> usize {
        lock(&self.outbound).len()
    }

    /// Deregister from the bus and discard queued-but-unsent buffers.
    ///
    /// After this returns no `resolve` call can yield this connection.
    pub fn close(self: &Arc<Self>) {
        self.bus.detach(self);
    }

    pub(crate) fn discard_outbound(&self) {
        lock(&self.outbound).clear();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity())
            .field("queued", &self.queued())
            .finish()
    }
}
