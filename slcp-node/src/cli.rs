//! Slash commands typed at the interactive prompt.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join,
    Leave,
    Who,
    Whois(String),
    Msg { to: String, text: String },
    Img { to: String, path: PathBuf },
    Peers,
    Help,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("commands start with '/'; try /help")]
    NotACommand,
    #[error("unknown command {0}; try /help")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

pub const HELP: &str = "\
/join                  announce yourself
/leave                 say goodbye
/who                   ask who is online
/whois <handle>        ask where a handle lives
/msg <handle> <text>   send a message
/img <handle> <path>   send an image
/peers                 list known peers
/quit                  leave and exit";

impl Command {
    /// Parse one input line. Blank lines are `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let rest = line.strip_prefix('/').ok_or(CommandError::NotACommand)?;
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };
        let cmd = match name {
            "join" => Command::Join,
            "leave" => Command::Leave,
            "who" => Command::Who,
            "peers" => Command::Peers,
            "help" => Command::Help,
            "quit" | "exit" => Command::Quit,
            "whois" => match args.split_whitespace().collect::<Vec<_>>()[..] {
                [handle] => Command::Whois(handle.to_string()),
                _ => return Err(CommandError::Usage("/whois <handle>")),
            },
            "msg" => {
                let (to, text) =
                    split_target(args).ok_or(CommandError::Usage("/msg <handle> <text>"))?;
                Command::Msg {
                    to,
                    text: text.to_string(),
                }
            }
            "img" => {
                let (to, path) =
                    split_target(args).ok_or(CommandError::Usage("/img <handle> <path>"))?;
                Command::Img {
                    to,
                    path: PathBuf::from(path),
                }
            }
            other => return Err(CommandError::Unknown(format!("/{other}"))),
        };
        Ok(Some(cmd))
    }
}

/// `<handle> <rest>` with a non-empty rest.
fn split_target(args: &str) -> Option<(String, &str)> {
    let (to, rest) = args.split_once(char::is_whitespace)?;
    let rest = rest.trim();
    (!rest.is_empty()).then(|| (to.to_string(), rest))
}
