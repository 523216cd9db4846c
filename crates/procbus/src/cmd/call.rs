use std::sync::mpsc;
use std::time::Instant;

use bytes::Bytes;
use procbus_frame::{Frame, FrameType, PayloadKind};
use procbus_router::announce::{route_request, RouteAnnouncement};
use procbus_router::{connect, Bus, BusConfig};

use crate::cmd::{parse_duration, CallArgs};
use crate::exit::{bus_error, io_error, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_frame, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let (payload_kind, payload) = payload_from_args(&args)?;

    let bus = Bus::new(BusConfig::new(args.caller.clone()));
    let (response_tx, response_rx) = mpsc::channel::<Frame>();
    bus.set_local_handler(move |_, frame| {
        if frame.frame_type == FrameType::MessageResponse {
            let _ = response_tx.send(frame);
        }
    });

    let handle = connect(&bus, &args.path).map_err(|err| bus_error("connect failed", err))?;
    let conn = handle.connection();

    let announcement = RouteAnnouncement {
        uuid: args.uuid.clone(),
        reachable: Vec::new(),
    };
    conn.send(
        &route_request(&args.caller, &announcement)
            .map_err(|err| bus_error("registration failed", err))?,
    )
    .map_err(|err| bus_error("registration failed", err))?;

    let chain_key = format!("cli-{}-{}", std::process::id(), conn.id());
    let request = Frame {
        frame_type: FrameType::MessageRequest,
        chain_key: chain_key.clone(),
        module: args.module.clone(),
        method: args.method.clone(),
        sender: args.caller.clone(),
        payload_kind,
        payload,
    };
    conn.send(&request)
        .map_err(|err| bus_error("send failed", err))?;

    // wait for the correlated response; unrelated responses are skipped
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| timeout_error(timeout))?;
        match response_rx.recv_timeout(remaining) {
            Ok(frame) if frame.chain_key == chain_key => {
                print_frame(&frame, format);
                return Ok(SUCCESS);
            }
            Ok(_) => continue,
            Err(mpsc::RecvTimeoutError::Timeout) => return Err(timeout_error(timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(crate::exit::CliError::new(
                    crate::exit::FAILURE,
                    "connection closed before a response arrived",
                ))
            }
        }
    }
}

fn timeout_error(timeout: std::time::Duration) -> crate::exit::CliError {
    crate::exit::CliError::new(TIMEOUT, format!("no response within {timeout:?}"))
}

fn payload_from_args(args: &CallArgs) -> CliResult<(PayloadKind, Bytes)> {
    if let Some(json) = &args.json {
        return Ok((PayloadKind::Json, Bytes::from(json.clone().into_bytes())));
    }
    if let Some(data) = &args.data {
        return Ok((PayloadKind::None, Bytes::from(data.clone().into_bytes())));
    }
    if let Some(path) = &args.file {
        let content = std::fs::read(path).map_err(|err| io_error("payload file", err))?;
        return Ok((PayloadKind::File, Bytes::from(content)));
    }
    Ok((PayloadKind::None, Bytes::new()))
}
