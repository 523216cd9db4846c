use std::sync::mpsc;

use procbus_frame::{Frame, FrameType};
use procbus_router::announce::{methods_query, parse_control, MethodSet, METHODS_ADVERTISE};
use procbus_router::{connect, Bus, BusConfig};

use crate::cmd::{parse_duration, MethodsArgs};
use crate::exit::{bus_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_names, OutputFormat};

pub fn run(args: MethodsArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;

    let bus = Bus::new(BusConfig::new("CLI"));
    let (reply_tx, reply_rx) = mpsc::channel::<MethodSet>();
    bus.set_tap(move |frame: &Frame| {
        if frame.frame_type == FrameType::Methods && frame.method == METHODS_ADVERTISE {
            if let Ok(set) = parse_control::<MethodSet>(frame) {
                let _ = reply_tx.send(set);
            }
        }
    });

    let handle = connect(&bus, &args.path).map_err(|err| bus_error("connect failed", err))?;

    handle
        .connection()
        .send(&methods_query("", &args.module).map_err(|err| bus_error("query failed", err))?)
        .map_err(|err| bus_error("query failed", err))?;

    let reply = reply_rx
        .recv_timeout(timeout)
        .map_err(|_| CliError::new(TIMEOUT, format!("no methods reply within {timeout:?}")))?;

    print_names("METHOD", &reply.methods, format);
    Ok(SUCCESS)
}
