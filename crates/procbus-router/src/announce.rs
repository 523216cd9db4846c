use bytes::Bytes;
use procbus_frame::{Frame, FrameType, PayloadKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// ROUTE_REQUEST / ROUTE_UPDATE payload: the announcing peer's instance
/// uuid and the module names it can relay to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteAnnouncement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub reachable: Vec<String>,
}

/// ROUTE_RESPONSE payload: the receiver's own reachable-name set, plus an
/// error message when the registration was refused.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteAck {
    #[serde(default)]
    pub reachable: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// METHODS payload: a module name and method names for it.
///
/// The frame's `method` envelope field carries the verb: an
/// [`METHODS_ADVERTISE`] frame records its set, an [`METHODS_QUERY`] frame
/// asks the receiver to answer with an advertisement of the known set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MethodSet {
    pub module: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

/// METHODS verb: the payload lists callable methods for its module.
pub const METHODS_ADVERTISE: &str = "advertise";
/// METHODS verb: answer with an advertisement of the known set.
pub const METHODS_QUERY: &str = "query";

/// Build a ROUTE_REQUEST frame announcing `sender`.
pub fn route_request(sender: &str, announcement: &RouteAnnouncement) -> Result<Frame> {
    json_frame(FrameType::RouteRequest, sender, announcement)
}

/// Build a ROUTE_RESPONSE frame.
pub fn route_response(sender: &str, ack: &RouteAck) -> Result<Frame> {
    json_frame(FrameType::RouteResponse, sender, ack)
}

/// Build a ROUTE_UPDATE frame carrying a changed relay set.
pub fn route_update(sender: &str, announcement: &RouteAnnouncement) -> Result<Frame> {
    json_frame(FrameType::RouteUpdate, sender, announcement)
}

/// Build a METHODS advertisement frame.
pub fn methods_advertise(sender: &str, set: &MethodSet) -> Result<Frame> {
    let mut frame = json_frame(FrameType::Methods, sender, set)?;
    frame.method = METHODS_ADVERTISE.to_string();
    Ok(frame)
}

/// Build a METHODS query frame for `module`.
pub fn methods_query(sender: &str, module: &str) -> Result<Frame> {
    let set = MethodSet {
        module: module.to_string(),
        methods: Vec::new(),
    };
    let mut frame = json_frame(FrameType::Methods, sender, &set)?;
    frame.method = METHODS_QUERY.to_string();
    Ok(frame)
}

/// Parse a control frame's JSON payload. An empty payload parses as the
/// type's default, so bare announcements stay legal on the wire.
pub fn parse_control<T: DeserializeOwned + Default>(frame: &Frame) -> Result<T> {
    if frame.payload.is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(&frame.payload)?)
}

fn json_frame<T: Serialize>(frame_type: FrameType, sender: &str, value: &T) -> Result<Frame> {
    let payload = serde_json::to_vec(value)?;
    Ok(Frame {
        frame_type,
        sender: sender.to_string(),
        payload_kind: PayloadKind::Json,
        payload: Bytes::from(payload),
        ..Frame::default()
    })
}
