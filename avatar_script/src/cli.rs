use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(
    about = "Runs an avatar script inside the sandboxed script engine",
    version
)]
pub struct Args {
    /// Lua script to load
    pub script: PathBuf,

    /// Participant id the script is loaded for
    #[arg(long, default_value = "local")]
    pub id: String,

    /// Display name shown in chat output
    #[arg(long, default_value = "Local")]
    pub name: String,

    /// Name the avatar was loaded under (default: the script's file stem)
    #[arg(long)]
    pub loaded_name: Option<String>,

    /// Optional JSON host configuration (logging mode, trust levels)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of ticks to run
    #[arg(long, default_value_t = 20)]
    pub ticks: u32,

    /// Render after every N ticks (0 disables rendering)
    #[arg(long, default_value_t = 1)]
    pub render_every: u32,

    /// Also run a peer copy of the script fed through the loopback transport
    #[arg(long)]
    pub peer: bool,

    /// Fire a catalog event before the first tick, as NAME or NAME=JSON_ARRAY
    #[arg(long = "event", value_name = "NAME[=ARGS]")]
    pub events: Vec<String>,

    /// Path to write the session summary as JSON
    #[arg(long)]
    pub summary_json: Option<PathBuf>,

    /// Print the comment-stripped source and exit
    #[arg(long)]
    pub strip: bool,
}

#[derive(Debug)]
pub enum Command {
    Run(RunArgs),
    Strip(StripArgs),
}

#[derive(Debug)]
pub struct RunArgs {
    pub script: PathBuf,
    pub id: String,
    pub name: String,
    pub loaded_name: Option<String>,
    pub config: Option<PathBuf>,
    pub ticks: u32,
    pub render_every: u32,
    pub peer: bool,
    pub events: Vec<EventCall>,
    pub summary_json: Option<PathBuf>,
}

#[derive(Debug)]
pub struct StripArgs {
    pub script: PathBuf,
}

/// A host-fired event requested on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct EventCall {
    pub name: String,
    pub args: Vec<Value>,
}

impl EventCall {
    fn parse(raw: &str) -> Result<Self> {
        let Some((name, args)) = raw.split_once('=') else {
            return Ok(Self {
                name: raw.to_string(),
                args: Vec::new(),
            });
        };
        let args: Vec<Value> = serde_json::from_str(args)
            .with_context(|| format!("--event {name}: arguments must be a JSON array"))?;
        Ok(Self {
            name: name.to_string(),
            args,
        })
    }
}

pub fn parse() -> Result<Command> {
    let args = Args::parse();
    args.into_command()
}

impl Args {
    fn into_command(self) -> Result<Command> {
        if self.strip {
            if self.peer || self.summary_json.is_some() || !self.events.is_empty() {
                bail!("--strip cannot be combined with --peer, --event or --summary-json");
            }
            return Ok(Command::Strip(StripArgs {
                script: self.script,
            }));
        }

        let events = self
            .events
            .iter()
            .map(|raw| EventCall::parse(raw))
            .collect::<Result<Vec<_>>>()?;
        Ok(Command::Run(RunArgs {
            script: self.script,
            id: self.id,
            name: self.name,
            loaded_name: self.loaded_name,
            config: self.config,
            ticks: self.ticks,
            render_every: self.render_every,
            peer: self.peer,
            events,
            summary_json: self.summary_json,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(argv: &[&str]) -> Result<Command> {
        let mut full = vec!["avatar_script"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full)?.into_command()
    }

    #[test]
    fn event_arguments_parse_as_json() -> Result<()> {
        let Command::Run(run) = command(&[
            "avatar.lua",
            "--event",
            "onDamage=[4, \"fall\"]",
            "--event",
            "player_init",
        ])?
        else {
            panic!("expected a run command");
        };
        assert_eq!(
            run.events,
            vec![
                EventCall {
                    name: "onDamage".to_string(),
                    args: vec![json!(4), json!("fall")],
                },
                EventCall {
                    name: "player_init".to_string(),
                    args: Vec::new(),
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn strip_rejects_session_flags() {
        assert!(command(&["avatar.lua", "--strip", "--peer"]).is_err());
        assert!(matches!(
            command(&["avatar.lua", "--strip"]),
            Ok(Command::Strip(_))
        ));
    }
}
