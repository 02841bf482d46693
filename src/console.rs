//! # Operator Console
//!
//! Line-oriented commands read from stdin:
//!
//! ```text
//! list
//! send <imei> <command...>
//! send14 <imei> <command...>
//! kick <imei>
//! upload <imei> <path> [full|delta]
//! help
//! ```

use std::path::PathBuf;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::codec::protocol::TransferMode;
use crate::imei::Imei;
use crate::server::Gateway;

pub const HELP: &str = "\
commands:
  list                              show known devices
  send <imei> <command...>          send a Codec 12 command
  send14 <imei> <command...>        send a Codec 14 command
  kick <imei>                       disconnect a device
  upload <imei> <path> [full|delta] upload a file
  help                              show this text";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    List,
    Send { imei: Imei, command: String },
    Send14 { imei: Imei, command: String },
    Kick { imei: Imei },
    Upload { imei: Imei, path: PathBuf, mode: Option<TransferMode> },
    Help,
}

#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("Empty input")]
    Empty,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Invalid IMEI: {0}")]
    InvalidImei(String),

    #[error("Invalid transfer mode: {0} (expected full or delta)")]
    InvalidMode(String),

    #[error("Unexpected argument: {0}")]
    UnexpectedArgument(String),
}

/// Parse one console line
pub fn parse_command(line: &str) -> Result<ConsoleCommand, ParseError> {
    let line = line.trim();
    let (verb, rest) = split_word(line);

    match verb.to_ascii_lowercase().as_str() {
        "" => Err(ParseError::Empty),
        "list" | "ls" => Ok(ConsoleCommand::List),
        "help" | "?" => Ok(ConsoleCommand::Help),
        "send" => {
            let (imei, command) = imei_and_text(rest)?;
            Ok(ConsoleCommand::Send { imei, command })
        }
        "send14" => {
            let (imei, command) = imei_and_text(rest)?;
            Ok(ConsoleCommand::Send14 { imei, command })
        }
        "kick" => {
            let (imei, rest) = split_word(rest);
            if !rest.is_empty() {
                return Err(ParseError::UnexpectedArgument(rest.to_string()));
            }
            Ok(ConsoleCommand::Kick { imei: parse_imei(imei)? })
        }
        "upload" => {
            let mut args = rest.split_whitespace();
            let imei = parse_imei(args.next().unwrap_or(""))?;
            let path = args.next().ok_or(ParseError::MissingArgument("path"))?;
            let mode = args.next().map(parse_mode).transpose()?;
            if let Some(extra) = args.next() {
                return Err(ParseError::UnexpectedArgument(extra.to_string()));
            }
            Ok(ConsoleCommand::Upload {
                imei,
                path: PathBuf::from(path),
                mode,
            })
        }
        other => Err(ParseError::UnknownCommand(other.to_string())),
    }
}

fn split_word(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (s, ""),
    }
}

fn parse_imei(s: &str) -> Result<Imei, ParseError> {
    if s.is_empty() {
        return Err(ParseError::MissingArgument("imei"));
    }
    Imei::parse(s).map_err(|_| ParseError::InvalidImei(s.to_string()))
}

fn parse_mode(s: &str) -> Result<TransferMode, ParseError> {
    match s.to_ascii_lowercase().as_str() {
        "full" => Ok(TransferMode::Full),
        "delta" => Ok(TransferMode::Delta),
        _ => Err(ParseError::InvalidMode(s.to_string())),
    }
}

/// IMEI followed by free text; the text keeps its inner spacing
fn imei_and_text(rest: &str) -> Result<(Imei, String), ParseError> {
    let (imei, text) = split_word(rest);
    let imei = parse_imei(imei)?;
    let text = text.trim_end();
    if text.is_empty() {
        return Err(ParseError::MissingArgument("command"));
    }
    Ok((imei, text.to_string()))
}

/// Read commands from stdin until EOF
///
/// Commands that wait on a device run in their own task so the prompt
/// stays responsive.
pub async fn run_console(gateway: Gateway) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Console input closed");
                break;
            }
            Err(e) => {
                warn!("Console read failed: {}", e);
                break;
            }
        };

        match parse_command(&line) {
            Ok(command) => execute(&gateway, command),
            Err(ParseError::Empty) => {}
            Err(e) => println!("{}\n{}", e, HELP),
        }
    }
}

fn execute(gateway: &Gateway, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::List => {
            let devices = gateway.devices();
            if devices.is_empty() {
                println!("no devices");
            }
            for device in devices {
                println!(
                    "{} {:<16} {:<7} {} session {} last seen {}",
                    device.imei,
                    device.name.as_deref().unwrap_or("-"),
                    if device.online { "online" } else { "offline" },
                    device.peer,
                    device.session_id,
                    device.last_seen.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        ConsoleCommand::Kick { imei } => match gateway.kick(&imei) {
            Ok(()) => println!("{}: disconnecting", imei),
            Err(e) => println!("{}: {}", imei, e),
        },
        ConsoleCommand::Send { imei, command } => {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                match gateway.send_command(&imei, &command).await {
                    Ok(response) => println!("{} <- {}", imei, response.text),
                    Err(e) => println!("{}: {}", imei, e),
                }
            });
        }
        ConsoleCommand::Send14 { imei, command } => {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                match gateway.send_command_to_imei(&imei, &command).await {
                    Ok(response) => println!("{} <- {:?} {}", imei, response.kind, response.text),
                    Err(e) => println!("{}: {}", imei, e),
                }
            });
        }
        ConsoleCommand::Upload { imei, path, mode } => {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                let data = match tokio::fs::read(&path).await {
                    Ok(data) => data,
                    Err(e) => {
                        println!("{}: {}", path.display(), e);
                        return;
                    }
                };
                println!("{}: uploading {} bytes", imei, data.len());
                match gateway.upload(&imei, data, mode).await {
                    Ok(()) => println!("{}: upload complete", imei),
                    Err(e) => println!("{}: upload failed: {}", imei, e),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMEI: &str = "356307042441013";

    fn imei() -> Imei {
        Imei::parse(IMEI).unwrap()
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_command("list"), Ok(ConsoleCommand::List));
        assert_eq!(parse_command("  LIST  "), Ok(ConsoleCommand::List));
        assert_eq!(parse_command("help"), Ok(ConsoleCommand::Help));
        assert_eq!(parse_command(""), Err(ParseError::Empty));
        assert_eq!(parse_command("   "), Err(ParseError::Empty));
    }

    #[test]
    fn test_parse_send_keeps_command_text() {
        let parsed = parse_command(&format!("send {} setparam 2004:example.com", IMEI)).unwrap();
        assert_eq!(
            parsed,
            ConsoleCommand::Send {
                imei: imei(),
                command: "setparam 2004:example.com".to_string(),
            }
        );

        let parsed = parse_command(&format!("send14 {} getver", IMEI)).unwrap();
        assert_eq!(
            parsed,
            ConsoleCommand::Send14 {
                imei: imei(),
                command: "getver".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_send_errors() {
        assert_eq!(parse_command("send"), Err(ParseError::MissingArgument("imei")));
        assert_eq!(
            parse_command(&format!("send {}", IMEI)),
            Err(ParseError::MissingArgument("command"))
        );
        assert_eq!(
            parse_command("send 12345 getver"),
            Err(ParseError::InvalidImei("12345".to_string()))
        );
    }

    #[test]
    fn test_parse_kick() {
        assert_eq!(
            parse_command(&format!("kick {}", IMEI)),
            Ok(ConsoleCommand::Kick { imei: imei() })
        );
        assert_eq!(
            parse_command(&format!("kick {} now", IMEI)),
            Err(ParseError::UnexpectedArgument("now".to_string()))
        );
    }

    #[test]
    fn test_parse_upload() {
        assert_eq!(
            parse_command(&format!("upload {} fw.bin", IMEI)),
            Ok(ConsoleCommand::Upload {
                imei: imei(),
                path: PathBuf::from("fw.bin"),
                mode: None,
            })
        );
        assert_eq!(
            parse_command(&format!("upload {} patch.bin DELTA", IMEI)),
            Ok(ConsoleCommand::Upload {
                imei: imei(),
                path: PathBuf::from("patch.bin"),
                mode: Some(TransferMode::Delta),
            })
        );
        assert_eq!(
            parse_command(&format!("upload {} fw.bin partial", IMEI)),
            Err(ParseError::InvalidMode("partial".to_string()))
        );
        assert_eq!(
            parse_command(&format!("upload {}", IMEI)),
            Err(ParseError::MissingArgument("path"))
        );
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            parse_command("reboot all"),
            Err(ParseError::UnknownCommand("reboot".to_string()))
        );
    }
}
