use std::sync::mpsc;

use procbus_frame::{Frame, FrameType};
use procbus_router::announce::{parse_control, route_request, RouteAck, RouteAnnouncement};
use procbus_router::{connect, Bus, BusConfig};

use crate::cmd::{parse_duration, RoutesArgs};
use crate::exit::{bus_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_names, OutputFormat};

pub fn run(args: RoutesArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;

    let bus = Bus::new(BusConfig::new("CLI"));
    let (ack_tx, ack_rx) = mpsc::channel::<RouteAck>();
    bus.set_tap(move |frame: &Frame| {
        if frame.frame_type == FrameType::RouteResponse {
            if let Ok(ack) = parse_control::<RouteAck>(frame) {
                let _ = ack_tx.send(ack);
            }
        }
    });

    let handle = connect(&bus, &args.path).map_err(|err| bus_error("connect failed", err))?;

    // empty sender: an anonymous probe that acks without registering
    let probe = route_request("", &RouteAnnouncement::default())
        .map_err(|err| bus_error("probe failed", err))?;
    handle
        .connection()
        .send(&probe)
        .map_err(|err| bus_error("probe failed", err))?;

    let ack = ack_rx
        .recv_timeout(timeout)
        .map_err(|_| CliError::new(TIMEOUT, format!("no route response within {timeout:?}")))?;

    print_names("MODULE", &ack.reachable, format);
    Ok(SUCCESS)
}
