//! Shell command language.

use crate::error::{CliError, CliResult};
use serde_json::Value;

/// One parsed shell command.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    /// `open <name> <version>`
    Open {
        /// Database name.
        name: String,
        /// Requested version.
        version: u64,
    },
    /// `delete <name>`
    Delete {
        /// Database name.
        name: String,
    },
    /// `stores`
    Stores,
    /// `select <collection>`
    Select {
        /// Collection name.
        name: String,
    },
    /// `put <json object>`
    Put {
        /// The value to store.
        value: Value,
    },
    /// `rm <id>`
    Remove {
        /// Primary key of the record.
        id: String,
    },
    /// `clear`
    Clear,
    /// `items`
    Items,
    /// `refresh`
    Refresh,
    /// `events [cursor]`
    Events {
        /// Only events after this sequence number.
        since: u64,
    },
    /// `clear-events`
    ClearEvents,
    /// `state`
    State,
    /// `peer open <name> <version>`
    PeerOpen {
        /// Database name.
        name: String,
        /// Requested version.
        version: u64,
    },
    /// `peer close`
    PeerClose,
    /// `help`
    Help,
    /// `quit` or `exit`
    Quit,
}

/// Usage summary printed by `help`.
pub const HELP: &str = "\
open <name> <version>      open a database, upgrading if needed
delete <name>              delete a database
stores                     list collections of the open database
select <collection>        make a collection active
put <json>                 store a record in the active collection
rm <id>                    delete a record from the active collection
clear                      delete every record of the active collection
items                      show the active collection
refresh                    re-read the active collection
events [cursor]            show the event log after a sequence number
clear-events               empty the event log
state                      show the session state
peer open <name> <version> open a second connection from another client
peer close                 close every peer connection
help                       show this text
quit                       leave the shell";

/// Parses one input line.
///
/// Returns `None` for blank lines and `#` comments.
///
/// # Errors
///
/// Returns [`CliError::Parse`] naming `line` if the command is unknown or
/// its arguments are malformed.
pub fn parse_line(line: usize, text: &str) -> CliResult<Option<ShellCommand>> {
    let text = text.trim();
    if text.is_empty() || text.starts_with('#') {
        return Ok(None);
    }

    let (word, rest) = match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (text, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    let command = match (word, args.as_slice()) {
        ("open", [name, version]) => ShellCommand::Open {
            name: (*name).to_string(),
            version: parse_version(line, version)?,
        },
        ("delete", [name]) => ShellCommand::Delete {
            name: (*name).to_string(),
        },
        ("stores", []) => ShellCommand::Stores,
        ("select", [name]) => ShellCommand::Select {
            name: (*name).to_string(),
        },
        ("put", _) if !rest.is_empty() => {
            let value = serde_json::from_str(rest)
                .map_err(|e| CliError::parse(line, format!("put expects a JSON object: {e}")))?;
            ShellCommand::Put { value }
        }
        ("rm", [id]) => ShellCommand::Remove {
            id: (*id).to_string(),
        },
        ("clear", []) => ShellCommand::Clear,
        ("items", []) => ShellCommand::Items,
        ("refresh", []) => ShellCommand::Refresh,
        ("events", []) => ShellCommand::Events { since: 0 },
        ("events", [cursor]) => ShellCommand::Events {
            since: cursor
                .parse()
                .map_err(|_| CliError::parse(line, format!("invalid cursor '{cursor}'")))?,
        },
        ("clear-events", []) => ShellCommand::ClearEvents,
        ("state", []) => ShellCommand::State,
        ("peer", ["open", name, version]) => ShellCommand::PeerOpen {
            name: (*name).to_string(),
            version: parse_version(line, version)?,
        },
        ("peer", ["close"]) => ShellCommand::PeerClose,
        ("help", []) => ShellCommand::Help,
        ("quit" | "exit", []) => ShellCommand::Quit,
        (
            "open" | "delete" | "select" | "put" | "rm" | "clear" | "items" | "refresh"
            | "events" | "clear-events" | "state" | "peer" | "help" | "quit" | "exit",
            _,
        ) => {
            return Err(CliError::parse(
                line,
                format!("wrong arguments for '{word}', try 'help'"),
            ))
        }
        _ => return Err(CliError::parse(line, format!("unknown command '{word}'"))),
    };
    Ok(Some(command))
}

fn parse_version(line: usize, text: &str) -> CliResult<u64> {
    text.parse()
        .map_err(|_| CliError::parse(line, format!("invalid version '{text}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(text: &str) -> ShellCommand {
        parse_line(1, text).unwrap().unwrap()
    }

    #[test]
    fn blank_lines_and_comments_are_skipped() {
        assert_eq!(parse_line(1, "").unwrap(), None);
        assert_eq!(parse_line(2, "   ").unwrap(), None);
        assert_eq!(parse_line(3, "# open orders 1").unwrap(), None);
    }

    #[test]
    fn parses_lifecycle_commands() {
        assert_eq!(
            parse("open orders 2"),
            ShellCommand::Open {
                name: "orders".into(),
                version: 2
            }
        );
        assert_eq!(
            parse("  delete orders "),
            ShellCommand::Delete {
                name: "orders".into()
            }
        );
        assert_eq!(
            parse("peer open orders 3"),
            ShellCommand::PeerOpen {
                name: "orders".into(),
                version: 3
            }
        );
        assert_eq!(parse("peer close"), ShellCommand::PeerClose);
        assert_eq!(parse("exit"), ShellCommand::Quit);
    }

    #[test]
    fn put_takes_the_rest_of_the_line_as_json() {
        assert_eq!(
            parse(r#"put {"id": "a1", "note": "two words"}"#),
            ShellCommand::Put {
                value: json!({"id": "a1", "note": "two words"})
            }
        );
    }

    #[test]
    fn events_cursor_is_optional() {
        assert_eq!(parse("events"), ShellCommand::Events { since: 0 });
        assert_eq!(parse("events 12"), ShellCommand::Events { since: 12 });
    }

    #[test]
    fn errors_name_the_line() {
        let err = parse_line(7, "open orders one").unwrap_err();
        assert_eq!(err.to_string(), "line 7: invalid version 'one'");

        let err = parse_line(8, "frobnicate").unwrap_err();
        assert!(matches!(err, CliError::Parse { line: 8, .. }));

        let err = parse_line(9, "select").unwrap_err();
        assert!(err.to_string().contains("wrong arguments for 'select'"));

        assert!(parse_line(10, "put {not json").is_err());
        assert!(parse_line(11, "put").is_err());
    }
}
