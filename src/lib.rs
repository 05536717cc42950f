pub mod audio;
pub mod console;
pub mod controller;
pub mod error;
pub mod events;
pub mod settings;
pub mod state_machine;
pub mod take;

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use audio::{CpalBackend, CueSoundCoordinator};
use console::{parse_intent, OperatorIntent, HELP};
use controller::SessionController;
use error::RecorderError;
use events::event_channel;
use take::{platform_hook, WorkerConfig};

/// Route `log` records through a tracing subscriber filtered by `RUST_LOG`.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Restore the directory and device from the last run. Failures only log.
fn restore_selection(controller: &mut SessionController, settings: &settings::RecorderSettings) {
    if let Some(dir) = &settings.session_directory {
        if let Err(e) = controller.select_directory(dir) {
            log::warn!("Could not restore session directory {:?}: {}", dir, e);
        }
    }
    if let Some(id) = &settings.device_id {
        if let Err(e) = controller.select_device(id) {
            log::warn!("Could not restore input device {:?}: {}", id, e);
        }
    }
}

pub fn run() -> Result<(), RecorderError> {
    init_logging();

    let settings = settings::load_settings();
    log::info!("Settings loaded: {:?}", settings);

    let (events, event_rx) = event_channel(settings.event_queue_capacity);

    let mut cues = CueSoundCoordinator::with_default_output(Duration::from_millis(
        settings.cue_blocking_timeout_ms,
    ));
    match settings.cue_dir() {
        Some(dir) => {
            cues.load_assets(&dir);
        }
        None => log::warn!("No cue asset directory, cues are silent"),
    }

    let mut worker_config = WorkerConfig::new(platform_hook());
    worker_config.flush_threshold_bytes = settings.flush_threshold_bytes;
    worker_config.queue_batches = settings.frame_queue_batches;

    let mut controller =
        SessionController::new(Box::new(CpalBackend::new()), cues, worker_config, events)?;
    restore_selection(&mut controller, &settings);

    let floor_db = settings.meter_floor_db;
    let printer = std::thread::Builder::new()
        .name("event-printer".into())
        .spawn(move || console::print_events(event_rx, floor_db))
        .map_err(|e| RecorderError::io("event-printer thread", e))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| RecorderError::io("tokio runtime", e))?;

    runtime.block_on(async move {
        let (tx, rx) = mpsc::channel::<OperatorIntent>(32);
        let control =
            tokio::task::spawn_blocking(move || console::run_control_loop(rx, controller, settings));

        println!("{}", HELP);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    log::error!("Failed to read stdin: {}", e);
                    break;
                }
            };
            let Some(intent) = parse_intent(&line) else {
                if !line.trim().is_empty() {
                    println!("unknown command: {} (try help)", line.trim());
                }
                continue;
            };
            let quit = intent == OperatorIntent::Quit;
            if tx.send(intent).await.is_err() || quit {
                break;
            }
        }

        drop(tx);
        if let Err(e) = control.await {
            log::error!("Control loop panicked: {}", e);
        }
    });
    // The stdin reader may still be parked in a blocking read.
    runtime.shutdown_background();

    // The controller (and with it every event sender) is gone by now.
    if printer.join().is_err() {
        log::error!("Event printer panicked");
    }
    Ok(())
}
