//! Operator console: one command per stdin line during `trialflow run`.
//!
//! ```text
//! p            pause
//! r            resume
//! s            skip the live step
//! q            stop the session
//! c            continue button
//! space        the space bar (`" "`)
//! click X Y    pointer click
//! touch X Y..  touch start, one X Y pair per finger
//! <anything>   key press with that name
//! ```

use trialflow_runtime::{ParticipantInput, Point, SessionCommand};

/// Parse one console line; `None` for blank lines
pub fn parse_line(line: &str) -> Option<SessionCommand> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let command = match trimmed {
        "p" => SessionCommand::Pause,
        "r" => SessionCommand::Resume,
        "s" => SessionCommand::Skip,
        "q" => SessionCommand::Stop,
        "c" => SessionCommand::Input(ParticipantInput::Continue),
        "space" => SessionCommand::Input(ParticipantInput::Key(" ".to_string())),
        _ => pointer(trimmed).unwrap_or_else(|| SessionCommand::Input(ParticipantInput::Key(trimmed.to_string()))),
    };
    Some(command)
}

fn pointer(line: &str) -> Option<SessionCommand> {
    let mut words = line.split_whitespace();
    let verb = words.next()?;
    let coords = words.map(str::parse::<f64>).collect::<Result<Vec<_>, _>>().ok()?;
    if coords.is_empty() || coords.len() % 2 != 0 {
        return None;
    }
    let mut points: Vec<Point> = coords.chunks(2).map(|xy| Point::new(xy[0], xy[1])).collect();

    let input = match verb {
        "click" if points.len() == 1 => ParticipantInput::Click(points.remove(0)),
        "touch" => ParticipantInput::Touch(points),
        _ => return None,
    };
    Some(SessionCommand::Input(input))
}
