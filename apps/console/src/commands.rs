use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use platform_link::{CloseReasonCode, LifecycleEvent};
use shared::domain::Jid;
use storage::CredentialBlob;

pub const HELP: &str = "\
commands:
  start [phone]              open a session attempt
  stop                       end the session, keep credentials
  clear                      log out and delete credentials
  pair <phone>               request a pairing code
  status | snapshot          print the current state
  send <jid> <text>          send a text message
  send-bin <jid> <base64>    send binary content
  inject challenge [qr]      fake library: pairing challenge
  inject open <identity>     fake library: session open
  inject synced              fake library: initial sync done
  inject creds <text>        fake library: credentials updated
  inject close <code> [msg]  fake library: session closed
  quit";

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start { phone: Option<String> },
    Stop,
    Clear,
    Pair { phone: String },
    Status,
    Snapshot,
    SendText { jid: Jid, text: String },
    SendBinary { jid: Jid, data: Vec<u8> },
    Inject(LifecycleEvent),
    Help,
    Quit,
}

impl ConsoleCommand {
    /// `Ok(None)` for blank lines.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        let (verb, rest) = split_word(line);
        let command = match verb {
            "" => return Ok(None),
            "start" => Self::Start {
                phone: non_empty(rest).map(str::to_string),
            },
            "stop" => Self::Stop,
            "clear" => Self::Clear,
            "pair" => Self::Pair {
                phone: non_empty(rest)
                    .context("usage: pair <phone>")?
                    .to_string(),
            },
            "status" => Self::Status,
            "snapshot" => Self::Snapshot,
            "send" => {
                let (jid, text) = split_word(rest);
                let text = non_empty(text).context("usage: send <jid> <text>")?;
                Self::SendText {
                    jid: Jid::new(jid),
                    text: text.to_string(),
                }
            }
            "send-bin" => {
                let (jid, encoded) = split_word(rest);
                let encoded = non_empty(encoded).context("usage: send-bin <jid> <base64>")?;
                let data = STANDARD
                    .decode(encoded)
                    .context("binary payload is not valid base64")?;
                Self::SendBinary {
                    jid: Jid::new(jid),
                    data,
                }
            }
            "inject" => Self::Inject(parse_injection(rest)?),
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command `{other}`, try `help`"),
        };
        Ok(Some(command))
    }
}

fn parse_injection(input: &str) -> Result<LifecycleEvent> {
    let (kind, rest) = split_word(input);
    let event = match kind {
        "connecting" => LifecycleEvent::Connecting,
        "challenge" => LifecycleEvent::PairingChallenge {
            qr_payload: non_empty(rest).map(str::to_string),
        },
        "open" => LifecycleEvent::Open {
            identity: non_empty(rest)
                .context("usage: inject open <identity>")?
                .to_string(),
        },
        "synced" => LifecycleEvent::SyncComplete,
        "creds" => {
            let text = non_empty(rest).context("usage: inject creds <text>")?;
            LifecycleEvent::CredentialsUpdated(CredentialBlob::new(text.as_bytes()))
        }
        "close" => {
            let (code, message) = split_word(rest);
            let code: u16 = code
                .parse()
                .map_err(|_| anyhow!("usage: inject close <code> [message]"))?;
            LifecycleEvent::Closed {
                reason: CloseReasonCode::from_status_code(code),
                message: non_empty(message).map(str::to_string),
            }
        }
        "" => bail!("usage: inject <connecting|challenge|open|synced|creds|close> ..."),
        other => bail!("unknown lifecycle event `{other}`"),
    };
    Ok(event)
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (input, ""),
    }
}

fn non_empty(input: &str) -> Option<&str> {
    Some(input).filter(|value| !value.is_empty())
}
