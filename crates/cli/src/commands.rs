//! Console command parsing

use anyhow::{anyhow, bail, Result};

/// One line typed into the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Accept,
    Reject,
    End,
    Mute,
    Dial(String),
    Input(String),
    Output(String),
    TestSpeaker,
    Devices,
    Microphone,
    Reconnect,
    Status,
    /// Make the simulated telephony backend ring the agent
    Ring(String),
    /// Hang up the live call from the remote side
    RemoteHangup,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  accept | reject | end | mute
  dial <number>
  input <device-id> | output <device-id> | test | devices | mic
  reconnect | status
  ring [caller]      simulate an incoming call
  hangup             simulate the caller hanging up
  help | quit";

impl ConsoleCommand {
    /// Parse a console line; blank lines yield `None`
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let rest = words.collect::<Vec<_>>().join(" ");
        let argument = |name: &str| -> Result<String> {
            if rest.is_empty() {
                Err(anyhow!("{} needs a {}", verb, name))
            } else {
                Ok(rest.clone())
            }
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "accept" | "a" => ConsoleCommand::Accept,
            "reject" | "r" => ConsoleCommand::Reject,
            "end" | "e" => ConsoleCommand::End,
            "mute" | "m" => ConsoleCommand::Mute,
            "dial" | "d" => ConsoleCommand::Dial(argument("number")?),
            "input" => ConsoleCommand::Input(argument("device id")?),
            "output" => ConsoleCommand::Output(argument("device id")?),
            "test" => ConsoleCommand::TestSpeaker,
            "devices" => ConsoleCommand::Devices,
            "mic" => ConsoleCommand::Microphone,
            "reconnect" => ConsoleCommand::Reconnect,
            "status" | "s" => ConsoleCommand::Status,
            "ring" => ConsoleCommand::Ring(if rest.is_empty() { "+15550100".to_string() } else { rest.clone() }),
            "hangup" => ConsoleCommand::RemoteHangup,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" | "q" => ConsoleCommand::Quit,
            other => bail!("unknown command '{}', type 'help'", other),
        };
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(ConsoleCommand::parse("accept").unwrap(), Some(ConsoleCommand::Accept));
        assert_eq!(ConsoleCommand::parse("  M ").unwrap(), Some(ConsoleCommand::Mute));
        assert_eq!(ConsoleCommand::parse("").unwrap(), None);
        assert_eq!(ConsoleCommand::parse("exit").unwrap(), Some(ConsoleCommand::Quit));
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(
            ConsoleCommand::parse("dial +1 555 0100").unwrap(),
            Some(ConsoleCommand::Dial("+1 555 0100".to_string()))
        );
        assert_eq!(
            ConsoleCommand::parse("output headset-speaker").unwrap(),
            Some(ConsoleCommand::Output("headset-speaker".to_string()))
        );
        assert_eq!(
            ConsoleCommand::parse("ring").unwrap(),
            Some(ConsoleCommand::Ring("+15550100".to_string()))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(ConsoleCommand::parse("dial").is_err());
        assert!(ConsoleCommand::parse("input").is_err());
        assert!(ConsoleCommand::parse("transfer 42").is_err());
    }
}
