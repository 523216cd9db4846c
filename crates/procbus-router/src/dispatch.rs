use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use procbus_frame::{Frame, FrameType, PayloadKind, DEFAULT_MAX_PAYLOAD};
use tracing::{debug, info, warn};

use crate::announce::{
    methods_advertise, parse_control, route_response, route_update, MethodSet, RouteAck,
    RouteAnnouncement, METHODS_QUERY,
};
use crate::connection::{Connection, Identity, TransportSend, TransportWake};
use crate::error::{BusError, Result};
use crate::lock;
use crate::table::{canonical, RouteTable};

/// Frames addressed to this bus's own name are handed here.
pub type LocalHandler = Box<dyn Fn(&Arc<Connection>, Frame) + Send + Sync>;

/// Observability tap: sees every inbound frame before dispatch.
pub type FrameTap = Box<dyn Fn(&Frame) + Send + Sync>;

/// Bus behavior configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// The module name this bus answers to locally.
    pub local_name: String,
    /// Maximum inbound payload size per connection decoder.
    pub max_payload_size: usize,
}

impl BusConfig {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            ..Self::default()
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            local_name: "BUS".to_string(),
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// The dispatch layer tying connections to the route table.
///
/// Every completed inbound frame lands in [`Bus::dispatch_inbound`]:
/// route frames mutate the table, message frames are forwarded to the
/// connection currently serving the target name, and a request nobody
/// serves is answered with a synthesized error response so callers never
/// hang on an unknown module.
pub struct Bus {
    config: BusConfig,
    table: RouteTable,
    methods: Mutex<HashMap<String, BTreeSet<String>>>,
    local_handler: Mutex<Option<LocalHandler>>,
    tap: Mutex<Option<FrameTap>>,
}

impl Bus {
    pub fn new(config: BusConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            table: RouteTable::new(),
            methods: Mutex::new(HashMap::new()),
            local_handler: Mutex::new(None),
            tap: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn local_name(&self) -> &str {
        &self.config.local_name
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Create a connection bound to this bus over the given transport
    /// capabilities. The caller owns the returned handle; the table only
    /// ever holds weak references to it.
    pub fn attach(
        self: &Arc<Self>,
        transport_send: TransportSend,
        transport_wake: TransportWake,
    ) -> Arc<Connection> {
        Connection::new(Arc::clone(self), transport_send, transport_wake)
    }

    /// Deregister a connection and discard its queued output.
    pub fn detach(&self, conn: &Arc<Connection>) {
        self.table.remove(conn);
        conn.discard_outbound();
        conn.clear_identity();
        debug!(conn = conn.id(), "connection detached");
    }

    /// Install the handler for frames addressed to this bus's own name.
    pub fn set_local_handler(&self, handler: impl Fn(&Arc<Connection>, Frame) + Send + Sync + 'static) {
        *lock(&self.local_handler) = Some(Box::new(handler));
    }

    /// Install a tap that observes every inbound frame before dispatch.
    pub fn set_tap(&self, tap: impl Fn(&Frame) + Send + Sync + 'static) {
        *lock(&self.tap) = Some(Box::new(tap));
    }

    /// Register a connection under a module name from the application side,
    /// without a route frame on the wire.
    pub fn register(
        &self,
        conn: &Arc<Connection>,
        module: &str,
        uuid: Option<&str>,
        reachable: &[String],
    ) -> Result<()> {
        self.table.add_direct(module, uuid, conn, reachable)?;
        conn.set_identity(Identity {
            module: canonical(module),
            uuid: uuid.map(str::to_string),
        });
        Ok(())
    }

    /// Method names a module has advertised.
    pub fn known_methods(&self, module: &str) -> Vec<String> {
        lock(&self.methods)
            .get(&canonical(module))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Route one completed inbound frame.
    ///
    /// An `Err` here is a protocol violation on this connection; the owning
    /// transport must close it. Table mutations and forwards to other
    /// connections never raise across this boundary.
    pub(crate) fn dispatch_inbound(self: &Arc<Self>, conn: &Arc<Connection>, frame: Frame) -> Result<()> {
        if let Some(tap) = lock(&self.tap).as_ref() {
            tap(&frame);
        }

        match frame.frame_type {
            FrameType::None => {
                debug!(conn = conn.id(), "ignoring NONE frame");
                Ok(())
            }
            FrameType::RouteRequest => self.handle_route_request(conn, &frame),
            FrameType::RouteResponse => {
                let ack: RouteAck = parse_control(&frame)?;
                self.table.update_reachable(conn, &ack.reachable);
                Ok(())
            }
            FrameType::RouteUpdate => {
                let announcement: RouteAnnouncement = parse_control(&frame)?;
                self.table.update_reachable(conn, &announcement.reachable);
                Ok(())
            }
            FrameType::Methods => self.handle_methods(conn, &frame),
            FrameType::MessageRequest | FrameType::MessageResponse => {
                self.handle_message(conn, frame)
            }
        }
    }

    fn handle_route_request(&self, conn: &Arc<Connection>, frame: &Frame) -> Result<()> {
        let announcement: RouteAnnouncement = parse_control(frame)?;
        let mut ack_error = None;
        let mut registered = false;

        // an empty sender is an anonymous probe: ack without registering
        if !frame.sender.is_empty() {
            match self.table.add_direct(
                &frame.sender,
                announcement.uuid.as_deref(),
                conn,
                &announcement.reachable,
            ) {
                Ok(()) => {
                    conn.set_identity(Identity {
                        module: canonical(&frame.sender),
                        uuid: announcement.uuid.clone(),
                    });
                    registered = true;
                    info!(
                        module = %canonical(&frame.sender),
                        uuid = announcement.uuid.as_deref(),
                        conn = conn.id(),
                        "module registered"
                    );
                }
                Err(err @ BusError::DuplicateRegistration { .. }) => {
                    warn!(conn = conn.id(), %err, "registration rejected");
                    ack_error = Some(err.to_string());
                }
                Err(err) => return Err(err),
            }
        }

        let ack = RouteAck {
            reachable: self.table.reachable_names(),
            error: ack_error,
        };
        conn.send(&route_response(&self.config.local_name, &ack)?)?;

        if registered {
            self.broadcast_routes(Some(conn.id()))?;
        }
        Ok(())
    }

    /// Tell every other direct connection what is reachable through us now.
    fn broadcast_routes(&self, excluding: Option<u64>) -> Result<()> {
        let update = route_update(
            &self.config.local_name,
            &RouteAnnouncement {
                uuid: None,
                reachable: self.table.reachable_names(),
            },
        )?;
        for peer in self.table.connections(excluding) {
            if let Err(err) = peer.send(&update) {
                warn!(conn = peer.id(), %err, "route update broadcast failed");
            }
        }
        Ok(())
    }

    fn handle_methods(&self, conn: &Arc<Connection>, frame: &Frame) -> Result<()> {
        let set: MethodSet = parse_control(frame)?;

        if frame.method == METHODS_QUERY {
            let reply = MethodSet {
                module: set.module.clone(),
                methods: self.known_methods(&set.module),
            };
            conn.send(&methods_advertise(&self.config.local_name, &reply)?)?;
        } else if !set.methods.is_empty() {
            lock(&self.methods)
                .entry(canonical(&set.module))
                .or_default()
                .extend(set.methods);
        }
        Ok(())
    }

    fn handle_message(&self, conn: &Arc<Connection>, frame: Frame) -> Result<()> {
        if canonical(&frame.module) == canonical(&self.config.local_name) {
            match lock(&self.local_handler).as_ref() {
                Some(handler) => handler(conn, frame),
                None => debug!(
                    chain_key = %frame.chain_key,
                    "no local handler installed; dropping frame"
                ),
            }
            return Ok(());
        }

        match self.table.resolve(&frame.module, None) {
            Some(target) => {
                if let Err(err) = target.send(&frame) {
                    warn!(conn = target.id(), %err, "forward failed");
                    if frame.frame_type == FrameType::MessageRequest {
                        self.send_unroutable_response(conn, &frame)?;
                    }
                }
            }
            None if frame.frame_type == FrameType::MessageRequest => {
                warn!(module = %frame.module, "no route to module");
                self.send_unroutable_response(conn, &frame)?;
            }
            None => {
                warn!(
                    module = %frame.module,
                    chain_key = %frame.chain_key,
                    "dropping unroutable response"
                );
            }
        }
        Ok(())
    }

    /// Synthesize the error reply for a request nobody serves, routed back
    /// on the connection it arrived from.
    fn send_unroutable_response(&self, conn: &Arc<Connection>, request: &Frame) -> Result<()> {
        let body = serde_json::json!({
            "error": BusError::UnknownModule(request.module.clone()).to_string(),
            "module": request.module,
        });
        let reply = Frame {
            frame_type: FrameType::MessageResponse,
            chain_key: request.chain_key.clone(),
            module: request.sender.clone(),
            method: request.method.clone(),
            sender: self.config.local_name.clone(),
            payload_kind: PayloadKind::Json,
            payload: Bytes::from(serde_json::to_vec(&body)?),
        };
        conn.send(&reply)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use procbus_frame::Decoder;

    use super::*;
    use crate::announce::route_request;

    /// A connection whose transport captures every dispatched buffer, with
    /// the queue drained eagerly on wake.
    struct Captured {
        conn: Arc<Connection>,
        sent: Arc<Mutex<Vec<Bytes>>>,
    }

    impl Captured {
        fn frames(&self) -> Vec<Frame> {
            let mut decoder = Decoder::new();
            let mut frames = Vec::new();
            for buf in lock(&self.sent).iter() {
                let mut rest: &[u8] = buf;
                while !rest.is_empty() {
                    let (consumed, frame) = decoder.feed(rest).unwrap();
                    rest = &rest[consumed..];
                    frames.extend(frame);
                }
            }
            frames
        }

        fn last_frame(&self) -> Frame {
            self.frames().pop().expect("expected at least one frame")
        }
    }

    fn captured_conn(bus: &Arc<Bus>) -> Captured {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = Arc::clone(&sent);
        let conn = bus.attach(
            Box::new(move |buf| lock(&sent_clone).push(buf)),
            Box::new(|| {}),
        );
        // drain on demand in tests: wake is a no-op, tests pump explicitly
        Captured { conn, sent }
    }

    fn pump(conn: &Arc<Connection>) {
        while conn.on_writable() {}
    }

    fn deliver(conn: &Arc<Connection>, frame: &Frame) {
        let mut wire = bytes::BytesMut::new();
        procbus_frame::encode_frame(frame, &mut wire).unwrap();
        conn.on_bytes_received(&wire).unwrap();
    }

    #[test]
    fn route_request_registers_and_acks_with_reachable_set() {
        let bus = Bus::new(BusConfig::new("RELAY"));
        let worker = captured_conn(&bus);

        let frame = route_request(
            "WORKER",
            &RouteAnnouncement {
                uuid: Some("u1".to_string()),
                reachable: vec!["BILLING".to_string()],
            },
        )
        .unwrap();
        deliver(&worker.conn, &frame);
        pump(&worker.conn);

        let ack = worker.last_frame();
        assert_eq!(ack.frame_type, FrameType::RouteResponse);
        assert_eq!(ack.sender, "RELAY");
        let parsed: RouteAck = parse_control(&ack).unwrap();
        assert!(parsed.error.is_none());
        assert_eq!(
            parsed.reachable,
            vec!["BILLING".to_string(), "WORKER".to_string()]
        );

        assert_eq!(
            worker.conn.identity(),
            Some(Identity {
                module: "WORKER".to_string(),
                uuid: Some("u1".to_string()),
            })
        );
        assert_eq!(
            bus.table().resolve("worker", None).unwrap().id(),
            worker.conn.id()
        );
    }

    #[test]
    fn duplicate_anonymous_registration_gets_error_ack() {
        let bus = Bus::new(BusConfig::new("RELAY"));
        let first = captured_conn(&bus);
        let second = captured_conn(&bus);

        let frame = route_request("WORKER", &RouteAnnouncement::default()).unwrap();
        deliver(&first.conn, &frame);
        deliver(&second.conn, &frame);
        pump(&second.conn);

        let ack: RouteAck = parse_control(&second.last_frame()).unwrap();
        assert!(ack.error.is_some());
        assert!(second.conn.identity().is_none());
        assert_eq!(
            bus.table().resolve("WORKER", None).unwrap().id(),
            first.conn.id()
        );
    }

    #[test]
    fn registration_broadcasts_route_update_to_other_peers() {
        let bus = Bus::new(BusConfig::new("RELAY"));
        let earlier = captured_conn(&bus);
        let later = captured_conn(&bus);

        deliver(
            &earlier.conn,
            &route_request("ALPHA", &RouteAnnouncement::default()).unwrap(),
        );
        deliver(
            &later.conn,
            &route_request("BETA", &RouteAnnouncement::default()).unwrap(),
        );
        pump(&earlier.conn);

        let frames = earlier.frames();
        let update = frames
            .iter()
            .find(|f| f.frame_type == FrameType::RouteUpdate)
            .expect("earlier peer should receive a route update");
        let parsed: RouteAnnouncement = parse_control(update).unwrap();
        assert!(parsed.reachable.contains(&"BETA".to_string()));
    }

    #[test]
    fn message_request_forwarded_to_registered_module() {
        let bus = Bus::new(BusConfig::new("RELAY"));
        let worker = captured_conn(&bus);
        let client = captured_conn(&bus);

        deliver(
            &worker.conn,
            &route_request("WORKER", &RouteAnnouncement::default()).unwrap(),
        );

        let request = Frame {
            frame_type: FrameType::MessageRequest,
            chain_key: "ck-7".to_string(),
            module: "worker".to_string(),
            method: "process".to_string(),
            sender: "CLIENT".to_string(),
            payload_kind: PayloadKind::Json,
            payload: Bytes::from_static(b"{\"n\":1}"),
        };
        deliver(&client.conn, &request);
        pump(&worker.conn);

        let forwarded = worker.last_frame();
        assert_eq!(forwarded, request);
    }

    #[test]
    fn unknown_module_gets_synthesized_error_response() {
        let bus = Bus::new(BusConfig::new("RELAY"));
        let client = captured_conn(&bus);

        let request = Frame {
            frame_type: FrameType::MessageRequest,
            chain_key: "ck-9".to_string(),
            module: "GHOST".to_string(),
            method: "poke".to_string(),
            sender: "CLIENT".to_string(),
            ..Frame::default()
        };
        deliver(&client.conn, &request);
        pump(&client.conn);

        let reply = client.last_frame();
        assert_eq!(reply.frame_type, FrameType::MessageResponse);
        assert_eq!(reply.chain_key, "ck-9");
        assert_eq!(reply.module, "CLIENT");
        assert_eq!(reply.sender, "RELAY");
        let body: serde_json::Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(body["module"], "GHOST");
    }

    #[test]
    fn unroutable_response_is_dropped_silently() {
        let bus = Bus::new(BusConfig::new("RELAY"));
        let client = captured_conn(&bus);

        let response = Frame {
            frame_type: FrameType::MessageResponse,
            chain_key: "ck".to_string(),
            module: "GONE".to_string(),
            sender: "WORKER".to_string(),
            ..Frame::default()
        };
        deliver(&client.conn, &response);
        pump(&client.conn);

        assert!(client.frames().is_empty());
    }

    #[test]
    fn local_frames_reach_the_local_handler() {
        let bus = Bus::new(BusConfig::new("APP"));
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        bus.set_local_handler(move |_, frame| lock(&received_clone).push(frame));

        let conn = captured_conn(&bus);
        let frame = Frame {
            frame_type: FrameType::MessageRequest,
            module: "app".to_string(),
            method: "status".to_string(),
            sender: "PEER".to_string(),
            ..Frame::default()
        };
        deliver(&conn.conn, &frame);

        let received = lock(&received);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].method, "status");
    }

    #[test]
    fn methods_advertisement_then_query() {
        let bus = Bus::new(BusConfig::new("RELAY"));
        let worker = captured_conn(&bus);
        let client = captured_conn(&bus);

        let advertise = methods_advertise(
            "WORKER",
            &MethodSet {
                module: "WORKER".to_string(),
                methods: vec!["process".to_string(), "status".to_string()],
            },
        )
        .unwrap();
        deliver(&worker.conn, &advertise);

        let query = crate::announce::methods_query("CLIENT", "worker").unwrap();
        deliver(&client.conn, &query);
        pump(&client.conn);

        let reply: MethodSet = parse_control(&client.last_frame()).unwrap();
        assert_eq!(
            reply.methods,
            vec!["process".to_string(), "status".to_string()]
        );
        assert_eq!(
            bus.known_methods("WORKER"),
            vec!["process".to_string(), "status".to_string()]
        );
    }

    #[test]
    fn empty_methods_reply_does_not_echo_back() {
        let bus = Bus::new(BusConfig::new("RELAY"));
        let client = captured_conn(&bus);

        let query = crate::announce::methods_query("CLIENT", "UNKNOWN").unwrap();
        deliver(&client.conn, &query);
        pump(&client.conn);

        let reply = client.last_frame();
        let set: MethodSet = parse_control(&reply).unwrap();
        assert!(set.methods.is_empty());

        // the reply is an advertisement: replaying it must not produce
        // another frame, or two buses would ping-pong forever
        let frames_before = client.frames().len();
        deliver(&client.conn, &reply);
        pump(&client.conn);
        assert_eq!(client.frames().len(), frames_before);
    }

    #[test]
    fn route_update_rewrites_node_entries() {
        let bus = Bus::new(BusConfig::new("RELAY"));
        let relay = captured_conn(&bus);

        deliver(
            &relay.conn,
            &route_request(
                "GATEWAY",
                &RouteAnnouncement {
                    uuid: None,
                    reachable: vec!["OLD".to_string()],
                },
            )
            .unwrap(),
        );
        assert!(bus.table().resolve("OLD", None).is_some());

        let update = route_update(
            "GATEWAY",
            &RouteAnnouncement {
                uuid: None,
                reachable: vec!["NEW".to_string()],
            },
        )
        .unwrap();
        deliver(&relay.conn, &update);

        assert!(bus.table().resolve("OLD", None).is_none());
        assert_eq!(
            bus.table().resolve("NEW", None).unwrap().id(),
            relay.conn.id()
        );
    }

    #[test]
    fn detach_makes_module_unroutable() {
        let bus = Bus::new(BusConfig::new("RELAY"));
        let worker = captured_conn(&bus);

        deliver(
            &worker.conn,
            &route_request("WORKER", &RouteAnnouncement::default()).unwrap(),
        );
        assert!(bus.table().resolve("WORKER", None).is_some());

        worker.conn.close();
        assert!(bus.table().resolve("WORKER", None).is_none());
        assert!(worker.conn.identity().is_none());
    }

    #[test]
    fn tap_observes_inbound_frames() {
        let bus = Bus::new(BusConfig::new("RELAY"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bus.set_tap(move |frame| lock(&seen_clone).push(frame.frame_type));

        let conn = captured_conn(&bus);
        deliver(
            &conn.conn,
            &route_request("X", &RouteAnnouncement::default()).unwrap(),
        );

        assert_eq!(lock(&seen).as_slice(), &[FrameType::RouteRequest]);
    }
}
