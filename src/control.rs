//! Line commands read from stdin by the binary.

use crate::background::BackgroundSelection;
use crate::render::BackendKind;
use crate::session::BusEvent;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start(Option<BackendKind>),
    Stop,
    /// Restart the running session on another backend
    Backend(BackendKind),
    LoadOverlay(PathBuf),
    Publish(BusEvent),
    Quit,
}

pub const HELP: &str = "commands: start [accelerated|software] | stop | backend <accelerated|software> \
| opacity <0-100> | feather <0-15> | bg <id> <path> | overlay <file|clear> | quit";

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();

    let command = match (verb.to_ascii_lowercase().as_str(), rest.as_slice()) {
        ("start", []) => Command::Start(None),
        ("start", [backend]) => Command::Start(Some(backend.parse()?)),
        ("stop", []) => Command::Stop,
        ("backend", [backend]) => Command::Backend(backend.parse()?),
        ("opacity", [value]) => Command::Publish(BusEvent::OpacityChanged(number(value)?)),
        ("feather", [value]) => Command::Publish(BusEvent::FeatherChanged(number(value)?)),
        ("bg", [spec]) => Command::Publish(BusEvent::BackgroundSelected(BackgroundSelection::parse(spec))),
        ("bg", [id, path]) => {
            Command::Publish(BusEvent::BackgroundSelected(BackgroundSelection::new(*id, *path)))
        }
        ("overlay", ["clear"]) | ("overlay", ["none"]) => {
            Command::Publish(BusEvent::OverlayUpdated(None))
        }
        ("overlay", [path]) => Command::LoadOverlay(PathBuf::from(*path)),
        ("quit", []) | ("exit", []) => Command::Quit,
        _ => return Err(format!("unrecognised command '{}'. {}", line.trim(), HELP)),
    };
    Ok(Some(command))
}

fn number(value: &str) -> Result<f32, String> {
    value
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("'{}' is not a number", value))
}
