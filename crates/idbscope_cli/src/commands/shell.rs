//! Shell command implementation.
//!
//! Drives a [`Session`] over the in-memory engine from a line-oriented
//! command stream. After every command the engine is run until idle and
//! the events recorded since the previous command are printed.

use super::parse::{parse_line, ShellCommand, HELP};
use super::render::{OutputFormat, Renderer};
use crate::error::{CliError, CliResult};
use clap::Args;
use idbscope_core::{DatabaseIdentity, Record, Session, SessionConfig};
use idbscope_engine::{ConnectionId, Engine, EngineEvent, InMemoryEngine, OpenOutcome};
use std::io::{BufRead, Write};
use tracing::{debug, info};

/// Session settings shared by every shell invocation.
#[derive(Debug, Clone, Args)]
pub struct SessionArgs {
    /// Collection ensured during every upgrade (repeatable)
    #[arg(long = "store", default_value = "line-items")]
    pub stores: Vec<String>,

    /// Field holding the primary key of every record
    #[arg(long, default_value = "id")]
    pub key_path: String,

    /// Maximum number of events kept in the log
    #[arg(long, default_value_t = 10_000)]
    pub max_events: usize,

    /// Do not select the first collection when a database opens
    #[arg(long)]
    pub no_auto_select: bool,
}

impl SessionArgs {
    /// Builds the session configuration.
    pub fn config(&self) -> SessionConfig {
        SessionConfig::new()
            .collections(self.stores.iter().cloned())
            .key_path(self.key_path.clone())
            .max_events(self.max_events)
            .auto_select(!self.no_auto_select)
    }
}

/// How the shell reads and reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellOptions {
    /// Output format.
    pub format: OutputFormat,
    /// Print a prompt before reading each line.
    pub prompt: bool,
    /// Print each command before running it.
    pub echo: bool,
    /// Stop at the first failed command.
    pub fail_fast: bool,
}

/// Totals of a shell run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShellSummary {
    /// Commands executed.
    pub commands: usize,
    /// Commands that failed.
    pub errors: usize,
}

enum Flow {
    Continue,
    Quit,
}

/// A second client of the same engine that holds connections open.
///
/// Peer connections are never listened, so they ignore `versionchange`
/// and keep blocking upgrades and deletes until `peer close`.
struct Peer {
    engine: InMemoryEngine,
    connections: Vec<ConnectionId>,
}

impl Peer {
    fn pump<W: Write>(&mut self, renderer: &mut Renderer<W>) -> CliResult<usize> {
        let mut delivered = 0;
        while let Some(event) = self.engine.poll_event() {
            delivered += 1;
            let EngineEvent::Open { outcome, .. } = event else {
                continue;
            };
            match outcome {
                OpenOutcome::Success {
                    connection,
                    version,
                } => {
                    self.connections.push(connection);
                    renderer.message(&format!("peer: {connection} open at v{version}"))?;
                }
                OpenOutcome::Blocked { new_version, .. } => {
                    renderer.message(&format!("peer: open v{new_version} blocked"))?;
                }
                OpenOutcome::Error(error) => {
                    renderer.message(&format!("peer: open failed: {error}"))?;
                }
                OpenOutcome::UpgradeNeeded { .. } => {}
            }
        }
        Ok(delivered)
    }

    fn close_all(&mut self) -> usize {
        let count = self.connections.len();
        for connection in self.connections.drain(..) {
            self.engine.close(connection);
        }
        count
    }
}

/// The interactive shell.
pub struct Shell<W: Write> {
    session: Session<InMemoryEngine>,
    peer: Peer,
    renderer: Renderer<W>,
    options: ShellOptions,
    cursor: u64,
}

impl<W: Write> Shell<W> {
    /// Creates a shell over a fresh in-memory engine.
    pub fn new(config: SessionConfig, out: W, options: ShellOptions) -> Self {
        let engine = InMemoryEngine::new();
        let peer = Peer {
            engine: engine.peer(),
            connections: Vec::new(),
        };
        Self {
            session: Session::with_config(engine, config),
            peer,
            renderer: Renderer::new(out, options.format),
            options,
            cursor: 0,
        }
    }

    /// Runs commands from `input` until it ends or `quit` is read.
    ///
    /// # Errors
    ///
    /// Returns I/O errors, and with `fail_fast` the first failed command.
    pub fn run<R: BufRead>(&mut self, input: R) -> CliResult<ShellSummary> {
        let mut summary = ShellSummary::default();
        let mut lines = input.lines();
        let mut number = 0;

        loop {
            if self.options.prompt {
                self.renderer.prompt()?;
            }
            let Some(line) = lines.next() else {
                break;
            };
            let line = line?;
            number += 1;

            let command = match parse_line(number, &line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(error) => {
                    summary.errors += 1;
                    self.fail(error)?;
                    continue;
                }
            };

            if self.options.echo {
                self.renderer.echo(line.trim())?;
            }
            summary.commands += 1;
            match self.execute(command) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(error) => {
                    summary.errors += 1;
                    self.settle()?;
                    self.fail(error)?;
                }
            }
        }

        info!(
            commands = summary.commands,
            errors = summary.errors,
            "shell finished"
        );
        Ok(summary)
    }

    /// Returns the session driven by this shell.
    pub fn session(&self) -> &Session<InMemoryEngine> {
        &self.session
    }

    fn fail(&mut self, error: CliError) -> CliResult<()> {
        if self.options.fail_fast {
            return Err(error);
        }
        self.renderer.error(&error)
    }

    fn execute(&mut self, command: ShellCommand) -> CliResult<Flow> {
        debug!(?command, "executing");
        match command {
            ShellCommand::Open { name, version } => {
                self.session.open(DatabaseIdentity::new(name, version)?)?;
            }
            ShellCommand::Delete { name } => {
                self.session.delete(&name)?;
            }
            ShellCommand::Stores => {
                self.settle()?;
                self.renderer.collections(
                    self.session.collections(),
                    self.session.active_collection(),
                )?;
                return Ok(Flow::Continue);
            }
            ShellCommand::Select { name } => self.session.select_collection(&name)?,
            ShellCommand::Put { value } => {
                let record = Record::from_value(value, &self.session.config().key_path)?;
                self.session.put(record)?;
            }
            ShellCommand::Remove { id } => {
                self.session.delete_record(&id)?;
            }
            ShellCommand::Clear => {
                self.session.clear()?;
            }
            ShellCommand::Items => {
                self.settle()?;
                self.renderer.records(
                    self.session.active_collection(),
                    self.session.projection(),
                )?;
                return Ok(Flow::Continue);
            }
            ShellCommand::Refresh => self.session.refresh()?,
            ShellCommand::Events { since } => {
                self.settle()?;
                for event in self.session.event_log().since(since) {
                    self.renderer.event(&event)?;
                }
                return Ok(Flow::Continue);
            }
            ShellCommand::ClearEvents => self.session.clear_event_log(),
            ShellCommand::State => {
                self.settle()?;
                self.renderer.snapshot(&self.session.snapshot())?;
                return Ok(Flow::Continue);
            }
            ShellCommand::PeerOpen { name, version } => {
                let identity = DatabaseIdentity::new(name, version)?;
                self.peer
                    .engine
                    .open(identity.name(), identity.version())
                    .map_err(idbscope_core::CoreError::from)?;
            }
            ShellCommand::PeerClose => {
                let closed = self.peer.close_all();
                self.renderer
                    .message(&format!("peer: closed {closed} connection(s)"))?;
            }
            ShellCommand::Help => {
                self.renderer.message(HELP)?;
                return Ok(Flow::Continue);
            }
            ShellCommand::Quit => return Ok(Flow::Quit),
        }
        self.settle()?;
        Ok(Flow::Continue)
    }

    /// Runs both clients until neither has anything left to deliver, then
    /// prints the events recorded since the last settle.
    fn settle(&mut self) -> CliResult<()> {
        loop {
            let dispatched = self.session.run_until_idle();
            let delivered = self.peer.pump(&mut self.renderer)?;
            if dispatched == 0 && delivered == 0 {
                break;
            }
        }

        for event in self.session.event_log().since(self.cursor) {
            self.renderer.event(&event)?;
        }
        self.cursor = self.session.event_log().latest_sequence();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idbscope_core::{ConnectionState, EventKind};

    fn config() -> SessionConfig {
        SessionConfig::new().collections(["line-items", "customers"])
    }

    fn run_script(script: &str, options: ShellOptions) -> (ShellSummary, String, ConnectionState) {
        let mut out = Vec::new();
        let mut shell = Shell::new(config(), &mut out, options);
        let summary = shell.run(script.as_bytes()).unwrap();
        let state = shell.session().state();
        drop(shell);
        (summary, String::from_utf8(out).unwrap(), state)
    }

    #[test]
    fn open_put_and_list() {
        let script = "\
            open orders 1\n\
            select line-items\n\
            put {\"id\": \"a1\", \"qty\": 2}\n\
            items\n";
        let (summary, out, state) = run_script(script, ShellOptions::default());

        assert_eq!(summary, ShellSummary { commands: 4, errors: 0 });
        assert_eq!(state, ConnectionState::Open);
        assert!(out.contains("upgradeneeded"));
        assert!(out.contains("line-items: a1: {\"qty\":2}"));
    }

    #[test]
    fn events_are_printed_once() {
        let mut out = Vec::new();
        let mut shell = Shell::new(config(), &mut out, ShellOptions::default());
        shell.run("open orders 1\nstate\n".as_bytes()).unwrap();
        drop(shell);

        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.matches(" success").count(), 1);
        assert!(out.contains("state:      open"));
    }

    #[test]
    fn errors_are_reported_and_counted() {
        let script = "bogus\nput {\"id\": \"a1\"}\nopen orders 0\n";
        let (summary, out, _) = run_script(script, ShellOptions::default());

        assert_eq!(summary, ShellSummary { commands: 2, errors: 3 });
        assert!(out.contains("error: line 1: unknown command 'bogus'"));
        assert!(out.contains("error: no open connection"));
        assert!(out.contains("error: invalid database identity"));
    }

    #[test]
    fn fail_fast_stops_at_the_first_error() {
        let mut out = Vec::new();
        let options = ShellOptions {
            fail_fast: true,
            ..ShellOptions::default()
        };
        let mut shell = Shell::new(config(), &mut out, options);
        let result = shell.run("open orders 1\nselect nowhere\nclear\n".as_bytes());
        assert!(matches!(result, Err(CliError::Core(_))));
    }

    #[test]
    fn quit_stops_reading() {
        let (summary, _, state) = run_script("quit\nopen orders 1\n", ShellOptions::default());
        assert_eq!(summary.commands, 1);
        assert_eq!(state, ConnectionState::Closed);
    }

    #[test]
    fn peer_blocks_until_closed() {
        let mut out = Vec::new();
        let mut shell = Shell::new(config(), &mut out, ShellOptions::default());
        shell
            .run("peer open orders 1\nopen orders 2\n".as_bytes())
            .unwrap();
        assert_eq!(shell.session().state(), ConnectionState::Closed);
        assert_eq!(shell.session().event_log().kinds(), vec![EventKind::Blocked]);

        shell.run("peer close\n".as_bytes()).unwrap();
        assert_eq!(shell.session().state(), ConnectionState::Open);
        assert_eq!(
            shell.session().event_log().kinds(),
            vec![
                EventKind::Blocked,
                EventKind::UpgradeNeeded,
                EventKind::Success
            ]
        );
    }

    #[test]
    fn peer_upgrade_closes_the_session() {
        let mut out = Vec::new();
        let mut shell = Shell::new(config(), &mut out, ShellOptions::default());
        shell
            .run("open orders 1\npeer open orders 2\n".as_bytes())
            .unwrap();

        assert_eq!(shell.session().state(), ConnectionState::Closed);
        let kinds = shell.session().event_log().kinds();
        assert_eq!(
            &kinds[kinds.len() - 2..],
            [EventKind::VersionChange, EventKind::Close]
        );
        drop(shell);
        assert!(String::from_utf8(out).unwrap().contains("peer: conn:"));
    }

    #[test]
    fn json_output_is_line_delimited() {
        let options = ShellOptions {
            format: OutputFormat::Json,
            echo: true,
            ..ShellOptions::default()
        };
        let (_, out, _) = run_script("open orders 1\nstores\n", options);

        let values: Vec<serde_json::Value> = out
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(values[0]["command"], "open orders 1");
        assert_eq!(values[1]["event"]["kind"], "upgradeneeded");
        assert_eq!(values[2]["event"]["kind"], "success");
        let last = values.last().unwrap();
        assert_eq!(last["collections"], serde_json::json!(["customers", "line-items"]));
        assert_eq!(last["active"], "customers");
    }

    #[test]
    fn runs_a_script_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# create and fill").unwrap();
        writeln!(file, "open orders 1").unwrap();
        writeln!(file, "select line-items").unwrap();
        writeln!(file, "put {{\"id\": \"a1\"}}").unwrap();
        writeln!(file, "rm a1").unwrap();
        writeln!(file, "items").unwrap();

        let input = std::io::BufReader::new(std::fs::File::open(file.path()).unwrap());
        let mut out = Vec::new();
        let mut shell = Shell::new(config(), &mut out, ShellOptions::default());
        let summary = shell.run(input).unwrap();
        drop(shell);

        assert_eq!(summary, ShellSummary { commands: 5, errors: 0 });
        assert!(String::from_utf8(out)
            .unwrap()
            .contains("line-items: (no records)"));
    }

    #[test]
    fn session_args_build_the_config() {
        let args = SessionArgs {
            stores: vec!["a".into(), "b".into()],
            key_path: "sku".into(),
            max_events: 5,
            no_auto_select: true,
        };
        let config = args.config();
        assert_eq!(config.collections, ["a", "b"]);
        assert_eq!(config.key_path, "sku");
        assert_eq!(config.max_events, 5);
        assert!(!config.auto_select);
    }
}
