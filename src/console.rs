//! Line-oriented operator console
//!
//! Stdin lines become operator intents; recorder events are printed one per
//! line, except level updates, which redraw a single meter line.

use std::io::Write;
use std::path::PathBuf;

use crossbeam_channel::Receiver;
use tokio::sync::mpsc;

use crate::audio::level::{display_db, meter_percent};
use crate::controller::SessionController;
use crate::events::RecorderEvent;
use crate::settings::{save_settings, RecorderSettings};
use crate::take::{LeftoverState, RecoveryChoice, RecoveryOutcome};

const METER_WIDTH: usize = 40;

pub const HELP: &str = "\
commands:
  dir <path>        select session directory
  devices           list input devices
  device <id>       select input device
  start | s | f10   start or end session
  good | g | f11    finish good take
  bad | b | f12     finish bad take
  replay | r        replay current take
  keep | discard | delete | skip   resolve leftover take
  status            show session state
  quit | q          exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorIntent {
    SelectDirectory(PathBuf),
    ListDevices,
    SelectDevice(String),
    StartOrEndSession,
    FinishGoodTake,
    FinishBadTake,
    ReplayLastTake,
    ResolveLeftover(RecoveryChoice),
    Status,
    Help,
    Quit,
}

/// Map one console line to an intent. `None` for blank or unknown input.
pub fn parse_intent(line: &str) -> Option<OperatorIntent> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let intent = match word.to_ascii_lowercase().as_str() {
        "dir" if !rest.is_empty() => OperatorIntent::SelectDirectory(PathBuf::from(rest)),
        "devices" => OperatorIntent::ListDevices,
        "device" if !rest.is_empty() => OperatorIntent::SelectDevice(rest.to_string()),
        "start" | "s" | "f10" => OperatorIntent::StartOrEndSession,
        "good" | "g" | "f11" => OperatorIntent::FinishGoodTake,
        "bad" | "b" | "f12" => OperatorIntent::FinishBadTake,
        "replay" | "r" => OperatorIntent::ReplayLastTake,
        "keep" => OperatorIntent::ResolveLeftover(RecoveryChoice::Keep),
        "discard" => OperatorIntent::ResolveLeftover(RecoveryChoice::Discard),
        "delete" => OperatorIntent::ResolveLeftover(RecoveryChoice::Delete),
        "skip" => OperatorIntent::ResolveLeftover(RecoveryChoice::Skip),
        "status" => OperatorIntent::Status,
        "help" | "?" => OperatorIntent::Help,
        "quit" | "q" | "exit" => OperatorIntent::Quit,
        _ => return None,
    };
    Some(intent)
}

/// Run intents against the controller until `Quit` or the sender goes away.
///
/// Blocks; run it on a blocking thread.
pub fn run_control_loop(
    mut rx: mpsc::Receiver<OperatorIntent>,
    mut controller: SessionController,
    mut settings: RecorderSettings,
) {
    log::info!("Control loop started");
    while let Some(intent) = rx.blocking_recv() {
        log::debug!("Operator intent: {:?}", intent);
        if intent == OperatorIntent::Quit {
            break;
        }
        if handle_intent(&mut controller, &mut settings, intent) {
            if let Err(e) = save_settings(&settings) {
                log::warn!("Settings: {}", e);
            }
        }
    }
    controller.shutdown();
    log::info!("Control loop ended");
}

/// Returns true when the settings changed.
fn handle_intent(
    controller: &mut SessionController,
    settings: &mut RecorderSettings,
    intent: OperatorIntent,
) -> bool {
    let result = match intent {
        OperatorIntent::SelectDirectory(path) => match controller.select_directory(&path) {
            Ok(leftover) => {
                println!("directory: {}", path.display());
                if let LeftoverState::NonEmpty { path, size_bytes } = leftover {
                    println!(
                        "leftover take {} ({} bytes): keep, discard, delete or skip?",
                        path.display(),
                        size_bytes
                    );
                }
                settings.session_directory = Some(path);
                return true;
            }
            Err(e) => Err(e),
        },
        OperatorIntent::ListDevices => controller.list_input_devices().map(|devices| {
            if devices.is_empty() {
                println!("no input devices");
            }
            for d in devices {
                let marker = if controller.device_id() == Some(d.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{} {}", marker, d.name);
            }
        }),
        OperatorIntent::SelectDevice(id) => match controller.select_device(&id) {
            Ok(()) => {
                println!("device: {}", id);
                settings.device_id = Some(id);
                return true;
            }
            Err(e) => Err(e),
        },
        OperatorIntent::StartOrEndSession => controller.start_or_end_session().map(|_| ()),
        OperatorIntent::FinishGoodTake => controller.finish_good_take().map(|_| ()),
        OperatorIntent::FinishBadTake => controller.finish_bad_take().map(|_| ()),
        OperatorIntent::ReplayLastTake => controller.replay_last_take().map(|_| ()),
        OperatorIntent::ResolveLeftover(choice) => {
            controller.resolve_leftover(choice).map(|outcome| match outcome {
                RecoveryOutcome::Moved { path, .. } => println!("recovered: {}", path.display()),
                RecoveryOutcome::Deleted => println!("leftover deleted"),
                RecoveryOutcome::Skipped => println!("leftover skipped, directory stays blocked"),
                RecoveryOutcome::Nothing => println!("no leftover take"),
            })
        }
        OperatorIntent::Status => {
            println!(
                "state: {}  directory: {}  device: {}  takes: {}  dropped batches: {}",
                controller.state(),
                controller
                    .directory()
                    .map(|d| d.display().to_string())
                    .unwrap_or_else(|| "none".into()),
                controller.device_id().unwrap_or("none"),
                controller.state().takes_finished(),
                controller.dropped_batches()
            );
            if controller.pending_leftover().is_some() {
                println!("leftover take pending: keep, discard, delete or skip");
            }
            Ok(())
        }
        OperatorIntent::Help => {
            println!("{}", HELP);
            Ok(())
        }
        OperatorIntent::Quit => Ok(()),
    };

    if let Err(e) = result {
        println!("error: {}", e);
    }
    false
}

/// One-line meter: `[#####     ] -23.4 dB`
pub fn render_meter(level_db: f64, floor_db: f64) -> String {
    let filled = usize::from(meter_percent(level_db, floor_db)) * METER_WIDTH / 100;
    format!(
        "[{}{}] {:>6.1} dB",
        "#".repeat(filled),
        " ".repeat(METER_WIDTH - filled),
        display_db(level_db, floor_db)
    )
}

/// Print recorder events until the channel closes.
pub fn print_events(rx: Receiver<RecorderEvent>, floor_db: f64) {
    let mut stdout = std::io::stdout();
    for event in rx {
        match event {
            RecorderEvent::LevelUpdated { db } => {
                let _ = write!(stdout, "\r{}", render_meter(db, floor_db));
                let _ = stdout.flush();
            }
            RecorderEvent::DistortionDetected { peak } => {
                println!("\rdistortion: peak {:.2}", peak);
            }
            RecorderEvent::StateChanged { state } => println!("\rstate: {}", state),
            RecorderEvent::RecoveryPromptNeeded { path, size_bytes } => println!(
                "\rleftover take {} ({} bytes) needs a decision",
                path.display(),
                size_bytes
            ),
            RecorderEvent::TakeFinalized { path, destination } => {
                println!("\rtake -> {} ({})", path.display(), destination.dir_name())
            }
            RecorderEvent::WriteFailed { message } => println!("\rwrite failed: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_keys_map_to_session_intents() {
        assert_eq!(parse_intent("f10"), Some(OperatorIntent::StartOrEndSession));
        assert_eq!(parse_intent("F11"), Some(OperatorIntent::FinishGoodTake));
        assert_eq!(parse_intent("f12"), Some(OperatorIntent::FinishBadTake));
        assert_eq!(parse_intent(" r "), Some(OperatorIntent::ReplayLastTake));
    }

    #[test]
    fn arguments_keep_spaces() {
        assert_eq!(
            parse_intent("dir /home/me/My Sessions"),
            Some(OperatorIntent::SelectDirectory(PathBuf::from("/home/me/My Sessions")))
        );
        assert_eq!(
            parse_intent("device USB Audio CODEC"),
            Some(OperatorIntent::SelectDevice("USB Audio CODEC".into()))
        );
    }

    #[test]
    fn missing_arguments_and_unknown_words_are_ignored() {
        assert_eq!(parse_intent("dir"), None);
        assert_eq!(parse_intent("device   "), None);
        assert_eq!(parse_intent(""), None);
        assert_eq!(parse_intent("record"), None);
    }

    #[test]
    fn leftover_choices() {
        assert_eq!(
            parse_intent("skip"),
            Some(OperatorIntent::ResolveLeftover(RecoveryChoice::Skip))
        );
        assert_eq!(
            parse_intent("delete"),
            Some(OperatorIntent::ResolveLeftover(RecoveryChoice::Delete))
        );
    }

    #[test]
    fn meter_clamps_silence_to_floor() {
        let line = render_meter(f64::NEG_INFINITY, -60.0);
        assert!(line.starts_with(&format!("[{}]", " ".repeat(METER_WIDTH))));
        assert!(line.ends_with("-60.0 dB"));
    }

    #[test]
    fn meter_full_at_zero_db() {
        let line = render_meter(0.0, -60.0);
        assert!(line.starts_with(&format!("[{}]", "#".repeat(METER_WIDTH))));
    }
}
