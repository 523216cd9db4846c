use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use procbus_router::{attach_stream, Bus, BusConfig, ConnectionHandle};
use tracing::{debug, info};

use crate::cmd::RelayArgs;
use crate::exit::{bus_error, io_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::OutputFormat;

pub fn run(args: RelayArgs, _format: OutputFormat) -> CliResult<i32> {
    remove_stale_socket(&args.path)?;

    let listener =
        UnixListener::bind(&args.path).map_err(|err| io_error("bind failed", err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| io_error("bind failed", err))?;

    let bus = Bus::new(BusConfig::new(args.name.clone()));
    info!(path = %args.path.display(), name = %args.name, "relay listening");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut handles: Vec<ConnectionHandle> = Vec::new();

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                stream
                    .set_nonblocking(false)
                    .map_err(|err| io_error("accept failed", err))?;
                let handle =
                    attach_stream(&bus, stream).map_err(|err| bus_error("attach failed", err))?;
                debug!(conn = handle.connection().id(), "peer connected");
                handles.push(handle);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => return Err(io_error("accept failed", err)),
        }
    }

    info!("relay stopping");
    drop(handles);
    let _ = std::fs::remove_file(&args.path);
    Ok(SUCCESS)
}

/// Remove a leftover socket file from a previous run, but never a
/// non-socket path.
fn remove_stale_socket(path: &std::path::Path) -> CliResult<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            debug!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path).map_err(|err| io_error("bind failed", err))
        }
        Ok(_) => Err(CliError::new(
            INTERNAL,
            format!("existing path is not a unix socket: {}", path.display()),
        )),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error("bind failed", err)),
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
