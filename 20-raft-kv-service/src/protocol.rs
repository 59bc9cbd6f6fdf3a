//! Console command parsing for the node binary.
//!
//! `ConsoleCommand` is what a user types at the prompt. Only `Get`, `Put`
//! and `Append` become replicated operations; the rest act on the local
//! replica.

use anyhow::{anyhow, Result};

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Get { key: String },
    Put { key: String, value: String },
    Append { key: String, value: String },
    Status,
    /// Make the local log leader of a new term.
    Campaign,
    /// Give up leadership; writes are refused until the next `Campaign`.
    StepDown,
    Help,
    Exit,
}

pub const HELP: &str = "commands: PUT/p <key> <value>, APPEND/a <key> <value>, GET/g <key>, \
STATUS/s, CAMPAIGN/c, STEPDOWN/d, HELP/h, EXIT/e";

impl ConsoleCommand {
    /// Parses one line of input. Command words are case-insensitive and
    /// accept single-letter aliases; keys and values are taken verbatim.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized = match cmd.as_str() {
            "G" => "GET",
            "P" => "PUT",
            "A" => "APPEND",
            "S" => "STATUS",
            "C" => "CAMPAIGN",
            "D" => "STEPDOWN",
            "H" => "HELP",
            "E" | "QUIT" => "EXIT",
            other => other,
        };

        match (normalized, parts.len()) {
            ("STATUS", 1) => Ok(ConsoleCommand::Status),
            ("CAMPAIGN", 1) => Ok(ConsoleCommand::Campaign),
            ("STEPDOWN", 1) => Ok(ConsoleCommand::StepDown),
            ("HELP", 1) => Ok(ConsoleCommand::Help),
            ("EXIT", 1) => Ok(ConsoleCommand::Exit),
            ("GET", 2) => Ok(ConsoleCommand::Get {
                key: parts[1].to_string(),
            }),
            ("PUT", 3) => Ok(ConsoleCommand::Put {
                key: parts[1].to_string(),
                value: parts[2].to_string(),
            }),
            ("APPEND", 3) => Ok(ConsoleCommand::Append {
                key: parts[1].to_string(),
                value: parts[2].to_string(),
            }),
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("PUT", _) => Err(anyhow!("PUT requires exactly two arguments: PUT <key> <value>")),
            ("APPEND", _) => Err(anyhow!(
                "APPEND requires exactly two arguments: APPEND <key> <value>"
            )),
            ("STATUS" | "CAMPAIGN" | "STEPDOWN" | "HELP" | "EXIT", _) => {
                Err(anyhow!("{normalized} takes no arguments"))
            }
            _ => Err(anyhow!("invalid command. {HELP}")),
        }
    }
}
