//! Command parsing for the interactive client console.

use anyhow::{anyhow, Result};

/// Commands accepted at the console prompt.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Get { key: String },
    Put { key: String, value: String },
    Delete { key: String },
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parses one line of input.
    ///
    /// Keywords are case-insensitive and each has a single-letter alias:
    /// `GET/g <key>`, `PUT/p <key> <value>`, `DEL/d <key>`, `HELP/h`,
    /// `EXIT/e`.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(head) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let keyword = head.to_uppercase();
        let keyword = match keyword.as_str() {
            "G" => "GET",
            "P" => "PUT",
            "D" => "DEL",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match (keyword, parts.len()) {
            ("HELP", 1) => Ok(Self::Help),
            ("EXIT", 1) => Ok(Self::Exit),
            ("GET", 2) => Ok(Self::Get {
                key: parts[1].to_string(),
            }),
            ("DEL" | "DELETE", 2) => Ok(Self::Delete {
                key: parts[1].to_string(),
            }),
            ("PUT", 3) => Ok(Self::Put {
                key: parts[1].to_string(),
                value: parts[2].to_string(),
            }),
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("DEL" | "DELETE", _) => Err(anyhow!("DEL requires exactly one argument: DEL <key>")),
            ("PUT", _) => Err(anyhow!("PUT requires exactly two arguments: PUT <key> <value>")),
            _ => Err(anyhow!(
                "unknown command. Try: PUT/p <key> <value>, GET/g <key>, DEL/d <key>, HELP/h, EXIT/e"
            )),
        }
    }
}
