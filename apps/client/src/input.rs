//! Lines typed at the prompt.

use anyhow::{bail, Result};
use parley_protocol::{RoomId, Target, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Join(RoomId),
    Leave(RoomId),
    /// Make subsequent chat lines go to this target.
    Focus(Target),
    Typing,
    Say(String),
    Quit,
}

/// Parse one line. Blank lines yield `None`.
pub fn parse_input(line: &str) -> Result<Option<Input>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(Input::Say(line.to_string())));
    };

    let mut parts = command.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let argument = parts.next().map(str::trim).filter(|arg| !arg.is_empty());

    let input = match (name, argument) {
        ("join", Some(room)) => Input::Join(RoomId::from(room)),
        ("leave", Some(room)) => Input::Leave(RoomId::from(room)),
        ("room", Some(room)) => Input::Focus(Target::Room(RoomId::from(room))),
        ("to", Some(user)) => Input::Focus(Target::Direct(UserId::from(user))),
        ("typing", None) => Input::Typing,
        ("quit", None) => Input::Quit,
        ("join" | "leave" | "room" | "to", None) => bail!("/{name} needs an argument"),
        _ => bail!("unknown command /{name}"),
    };
    Ok(Some(input))
}
