// SPDX-License-Identifier: MPL-2.0

//! The administrative command surface: a typed dispatcher over a text,
//! one-command-per-line control channel. Parsing lives here; dispatch
//! (`Target::handle_command`) lives with the target since it needs the
//! table/engine/stats it mutates.

use crate::error::{Errno, Error};

pub const HELP_TEXT: &str =
    "commands: help | status | stats | add <bad> | test_remap <bad> <spare> | remove <bad> | save | restore | clear_stats";

/// One parsed admin command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    Stats,
    Add { bad: u64 },
    TestRemap { bad: u64, spare: u64 },
    Remove { bad: u64 },
    Save,
    Restore,
    ClearStats,
}

/// Parses one control-channel line (whitespace-separated tokens, first
/// token is the command name). Unknown commands and malformed
/// arguments both fail with `Internal` — the admin surface's own
/// validation errors, distinct from the target-level errors a
/// well-formed command can still return.
pub fn parse_line(line: &str) -> Result<Command, Error> {
    let mut tokens = line.split_whitespace();
    let name = tokens.next().ok_or_else(|| Error::with_msg(Errno::Internal, "empty command"))?;

    let parse_u64 = |tokens: &mut std::str::SplitWhitespace, field: &'static str| -> Result<u64, Error> {
        tokens
            .next()
            .ok_or_else(|| Error::with_msg(Errno::Internal, "missing argument"))?
            .parse::<u64>()
            .map_err(|_| Error::with_msg(Errno::Internal, field))
    };

    let command = match name {
        "help" => Command::Help,
        "status" => Command::Status,
        "stats" => Command::Stats,
        "add" => Command::Add { bad: parse_u64(&mut tokens, "bad must be a u64")? },
        "test_remap" => {
            let bad = parse_u64(&mut tokens, "bad must be a u64")?;
            let spare = parse_u64(&mut tokens, "spare must be a u64")?;
            Command::TestRemap { bad, spare }
        }
        "remove" => Command::Remove { bad: parse_u64(&mut tokens, "bad must be a u64")? },
        "save" => Command::Save,
        "restore" => Command::Restore,
        "clear_stats" => Command::ClearStats,
        _ => return Err(Error::with_msg(Errno::Internal, "unrecognized command")),
    };

    if tokens.next().is_some() {
        return Err(Error::with_msg(Errno::Internal, "trailing arguments"));
    }

    Ok(command)
}

/// A control-channel response: one line beginning with `ok` or `err`.
#[derive(Clone, Debug)]
pub enum Response {
    Ok(String),
    Err(Error),
}

impl Response {
    pub fn ok(payload: impl Into<String>) -> Self {
        Response::Ok(payload.into())
    }

    pub fn to_line(&self) -> String {
        match self {
            Response::Ok(payload) if payload.is_empty() => "ok".to_string(),
            Response::Ok(payload) => format!("ok {payload}"),
            Response::Err(e) => format!("err {}", e.errno()),
        }
    }
}

impl From<Error> for Response {
    fn from(e: Error) -> Self {
        Response::Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_command() {
        assert_eq!(parse_line("help").unwrap(), Command::Help);
        assert_eq!(parse_line("status").unwrap(), Command::Status);
        assert_eq!(parse_line("add 42").unwrap(), Command::Add { bad: 42 });
        assert_eq!(parse_line("test_remap 42 1500").unwrap(), Command::TestRemap { bad: 42, spare: 1500 });
        assert_eq!(parse_line("remove 42").unwrap(), Command::Remove { bad: 42 });
        assert_eq!(parse_line("save").unwrap(), Command::Save);
        assert_eq!(parse_line("restore").unwrap(), Command::Restore);
        assert_eq!(parse_line("clear_stats").unwrap(), Command::ClearStats);
    }

    #[test]
    fn rejects_unknown_command_and_bad_args() {
        assert!(parse_line("frobnicate").is_err());
        assert!(parse_line("add not_a_number").is_err());
        assert!(parse_line("add").is_err());
        assert!(parse_line("add 1 2").is_err());
    }

    #[test]
    fn response_formatting() {
        assert_eq!(Response::ok("").to_line(), "ok");
        assert_eq!(Response::ok("entries=0").to_line(), "ok entries=0");
        assert_eq!(Response::from(Error::new(Errno::NotFound)).to_line(), "err NotFound");
    }
}
