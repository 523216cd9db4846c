use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{FrameError, Result};

/// Frame boundary / section separator.
pub const SEP_SECTION: u8 = b'#';
/// Terminates the frame-type field.
pub const SEP_TYPE: u8 = b'!';
/// Separates fields inside a section.
pub const SEP_FIELD: u8 = b'|';

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// What a frame is for, carried in the first header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    /// Placeholder; carries nothing and is ignored on receipt.
    #[default]
    None = 0,
    /// Peer announces its module name and the names it can relay to.
    RouteRequest = 1,
    /// Acknowledges a route request, carrying the receiver's reachable set.
    RouteResponse = 2,
    /// Application call, correlated by chain key.
    MessageRequest = 3,
    /// Application reply, same chain key as the request.
    MessageResponse = 4,
    /// Peer's reachable-name set changed.
    RouteUpdate = 5,
    /// Advertises or queries the callable method names of a module.
    Methods = 6,
}

impl FrameType {
    /// Map a wire value to a frame type.
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::RouteRequest),
            2 => Some(Self::RouteResponse),
            3 => Some(Self::MessageRequest),
            4 => Some(Self::MessageResponse),
            5 => Some(Self::RouteUpdate),
            6 => Some(Self::Methods),
            _ => None,
        }
    }

    /// The value written on the wire.
    pub fn wire_value(self) -> u8 {
        self as u8
    }

    /// Human-readable name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::RouteRequest => "ROUTE_REQUEST",
            Self::RouteResponse => "ROUTE_RESPONSE",
            Self::MessageRequest => "MESSAGE_REQUEST",
            Self::MessageResponse => "MESSAGE_RESPONSE",
            Self::RouteUpdate => "ROUTE_UPDATE",
            Self::Methods => "METHODS",
        }
    }
}

/// How the payload bytes should be interpreted by the application layer.
///
/// Opaque to the codec and the router; only ever passed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadKind {
    /// No payload semantics.
    #[default]
    None = 0,
    /// Payload is a serialized JSON document.
    Json = 1,
    /// Payload is raw file content.
    File = 2,
}

impl PayloadKind {
    /// Map a wire value to a payload kind.
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Json),
            2 => Some(Self::File),
            _ => None,
        }
    }

    /// The value written on the wire.
    pub fn wire_value(self) -> u8 {
        self as u8
    }
}

/// One protocol message: routing/correlation header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    /// What this frame is for.
    pub frame_type: FrameType,
    /// Caller-chosen correlation token, echoed back on the response.
    pub chain_key: String,
    /// Logical target module name.
    pub module: String,
    /// Method name on the target module.
    pub method: String,
    /// Identity of the frame's origin, used to route the response back.
    pub sender: String,
    /// How the payload should be interpreted.
    pub payload_kind: PayloadKind,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create an empty frame of the given type.
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            ..Self::default()
        }
    }
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Encode a frame into the wire format.
///
/// Every separator is emitted even when a string field is empty. String
/// fields containing a separator byte are rejected — the format has no
/// escaping and such a frame could never be decoded back.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    check_field("chain_key", frame.chain_key.as_bytes())?;
    check_field("module", frame.module.as_bytes())?;
    check_field("method", frame.method.as_bytes())?;
    check_field("sender", frame.sender.as_bytes())?;

    dst.reserve(
        32 + frame.chain_key.len()
            + frame.module.len()
            + frame.method.len()
            + frame.sender.len()
            + frame.payload.len(),
    );

    dst.put_u8(SEP_SECTION);
    put_decimal(dst, u64::from(frame.frame_type.wire_value()));
    dst.put_u8(SEP_TYPE);
    dst.put_slice(frame.chain_key.as_bytes());
    dst.put_u8(SEP_SECTION);
    dst.put_slice(frame.module.as_bytes());
    dst.put_u8(SEP_FIELD);
    dst.put_slice(frame.method.as_bytes());
    dst.put_u8(SEP_FIELD);
    dst.put_slice(frame.sender.as_bytes());
    dst.put_u8(SEP_SECTION);
    put_decimal(dst, u64::from(frame.payload_kind.wire_value()));
    dst.put_u8(SEP_FIELD);
    put_decimal(dst, frame.payload.len() as u64);
    dst.put_u8(SEP_FIELD);
    dst.put_slice(&frame.payload);

    Ok(())
}

fn check_field(field: &'static str, bytes: &[u8]) -> Result<()> {
    if bytes
        .iter()
        .any(|b| matches!(*b, SEP_SECTION | SEP_TYPE | SEP_FIELD))
    {
        return Err(FrameError::SeparatorInField { field });
    }
    Ok(())
}

fn put_decimal(dst: &mut BytesMut, value: u64) {
    let mut buf = [0u8; 20];
    let mut idx = buf.len();
    let mut rest = value;
    loop {
        idx -= 1;
        buf[idx] = b'0' + (rest % 10) as u8;
        rest /= 10;
        if rest == 0 {
            break;
        }
    }
    dst.put_slice(&buf[idx..]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Start,
    Type,
    ChainKey,
    Module,
    Method,
    Sender,
    PayloadKind,
    PayloadSize,
    Payload,
}

/// Incremental frame decoder.
///
/// Tolerates arbitrary chunk boundaries: [`Decoder::feed`] consumes as much
/// of the input as it can, returning a completed frame as soon as one is
/// available along with the number of bytes consumed. The caller loops over
/// the leftover slice. After a frame completes the decoder resets to the
/// start state, so one instance keeps parsing a pipelined stream.
///
/// A decode error is fatal: the stream has no resync marker, so the owning
/// connection must be closed.
#[derive(Debug)]
pub struct Decoder {
    state: DecodeState,
    scratch: Vec<u8>,
    frame: Frame,
    payload: BytesMut,
    remaining: usize,
    max_payload: usize,
}

impl Decoder {
    /// Create a decoder with the default payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Create a decoder with an explicit payload limit.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            state: DecodeState::Start,
            scratch: Vec::new(),
            frame: Frame::default(),
            payload: BytesMut::new(),
            remaining: 0,
            max_payload,
        }
    }

    /// Feed a chunk of stream bytes.
    ///
    /// Returns the number of input bytes consumed and, when a frame
    /// completed within this chunk, the frame. Consumed may be less than
    /// `input.len()` only when a frame completed; call again with the
    /// remainder.
    pub fn feed(&mut self, input: &[u8]) -> Result<(usize, Option<Frame>)> {
        let mut pos = 0usize;

        while pos < input.len() {
            match self.state {
                DecodeState::Start => {
                    let byte = input[pos];
                    if byte != SEP_SECTION {
                        return Err(FrameError::Desynchronized {
                            expected: SEP_SECTION as char,
                            found: byte as char,
                        });
                    }
                    pos += 1;
                    self.state = DecodeState::Type;
                }
                DecodeState::Type => {
                    if self.accumulate(input, &mut pos, SEP_TYPE) {
                        let value = self.take_number("frame type")?;
                        self.frame.frame_type = FrameType::from_wire(value)
                            .ok_or(FrameError::UnknownFrameType(value))?;
                        self.state = DecodeState::ChainKey;
                    }
                }
                DecodeState::ChainKey => {
                    if self.accumulate(input, &mut pos, SEP_SECTION) {
                        self.frame.chain_key = self.take_string("chain_key")?;
                        self.state = DecodeState::Module;
                    }
                }
                DecodeState::Module => {
                    if self.accumulate(input, &mut pos, SEP_FIELD) {
                        self.frame.module = self.take_string("module")?;
                        self.state = DecodeState::Method;
                    }
                }
                DecodeState::Method => {
                    if self.accumulate(input, &mut pos, SEP_FIELD) {
                        self.frame.method = self.take_string("method")?;
                        self.state = DecodeState::Sender;
                    }
                }
                DecodeState::Sender => {
                    if self.accumulate(input, &mut pos, SEP_SECTION) {
                        self.frame.sender = self.take_string("sender")?;
                        self.state = DecodeState::PayloadKind;
                    }
                }
                DecodeState::PayloadKind => {
                    if self.accumulate(input, &mut pos, SEP_FIELD) {
                        let value = self.take_number("payload kind")?;
                        self.frame.payload_kind = PayloadKind::from_wire(value)
                            .ok_or(FrameError::UnknownPayloadKind(value))?;
                        self.state = DecodeState::PayloadSize;
                    }
                }
                DecodeState::PayloadSize => {
                    if self.accumulate(input, &mut pos, SEP_FIELD) {
                        let size = self.take_number("payload size")? as usize;
                        if size > self.max_payload {
                            return Err(FrameError::PayloadTooLarge {
                                size,
                                max: self.max_payload,
                            });
                        }
                        if size == 0 {
                            return Ok((pos, Some(self.finish())));
                        }
                        self.remaining = size;
                        self.state = DecodeState::Payload;
                    }
                }
                DecodeState::Payload => {
                    let take = (input.len() - pos).min(self.remaining);
                    self.payload.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    self.remaining -= take;
                    if self.remaining == 0 {
                        return Ok((pos, Some(self.finish())));
                    }
                }
            }
        }

        Ok((pos, None))
    }

    /// Copy input into the scratch buffer up to (not including) `terminator`.
    ///
    /// Advances `pos` past the terminator when found and returns true; when
    /// the chunk runs out first, consumes it all and returns false.
    fn accumulate(&mut self, input: &[u8], pos: &mut usize, terminator: u8) -> bool {
        while *pos < input.len() {
            let byte = input[*pos];
            *pos += 1;
            if byte == terminator {
                return true;
            }
            self.scratch.push(byte);
        }
        false
    }

    fn take_number(&mut self, field: &'static str) -> Result<u64> {
        let text = std::str::from_utf8(&self.scratch)
            .map_err(|_| FrameError::InvalidNumber { field })?;
        let value = text
            .parse::<u64>()
            .map_err(|_| FrameError::InvalidNumber { field })?;
        self.scratch.clear();
        Ok(value)
    }

    fn take_string(&mut self, field: &'static str) -> Result<String> {
        String::from_utf8(std::mem::take(&mut self.scratch))
            .map_err(|_| FrameError::InvalidUtf8 { field })
    }

    fn finish(&mut self) -> Frame {
        let mut frame = std::mem::take(&mut self.frame);
        frame.payload = self.payload.split().freeze();
        self.state = DecodeState::Start;
        self.remaining = 0;
        trace!(
            frame_type = frame.frame_type.name(),
            module = %frame.module,
            payload_size = frame.payload.len(),
            "frame decoded"
        );
        frame
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
