use ble_sensor_gateway::app::{Gateway, Options, RunError, open_output};
use ble_sensor_gateway::{HciSocket, ScanError};
use clap::Parser;
use std::panic::{self, PanicHookInfo};

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

/// Scan until interrupted or the scan loop fails, then flush the last window.
async fn run(options: Options) -> Result<(), RunError> {
    let sink = open_output(options.output.as_deref())?;
    let mut gateway = Gateway::new(&options, sink)?;

    let socket = HciSocket::open(options.device).map_err(ScanError::from)?;
    gateway.start(socket)?;

    let scanner = gateway.scanner();
    let mut scan = tokio::task::spawn_blocking(move || scanner.start());

    let scanned = tokio::select! {
        joined = &mut scan => joined,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => log::info!("interrupted, shutting down"),
                Err(e) => log::error!("failed to listen for ctrl-c: {e}"),
            }
            gateway.scanner().stop();
            scan.await
        }
    };

    gateway.shutdown();

    match scanned {
        Ok(result) => result.map_err(RunError::from),
        Err(e) => {
            log::error!("scan task failed: {e}");
            Err(RunError::Io(std::io::Error::other(e)))
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    match run(options).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            log::error!("{why}");
            std::process::exit(EXIT_ERROR);
        }
    }
}
