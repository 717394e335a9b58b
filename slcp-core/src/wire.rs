//! Line codec: one newline-terminated, space-separated command per line.
//!
//! Decoding is total. Anything that does not match the grammar comes back as
//! [`Message::Unknown`] so the dispatch loop can log and drop it.

use std::net::IpAddr;

use crate::protocol::{Message, Peer};

/// Longest header line accepted on the TCP data plane.
pub const MAX_HEADER_LEN: usize = 512;

/// Encode a message as a single line including the trailing `\n`.
pub fn encode_line(msg: &Message) -> String {
    match msg {
        Message::Join { handle, port } => format!("JOIN {handle} {port}\n"),
        Message::Leave { handle } => format!("LEAVE {handle}\n"),
        Message::Who => "WHO\n".to_string(),
        Message::Msg { to, text } => {
            let text = text.replace(['\r', '\n'], " ");
            format!("MSG {to} \"{text}\"\n")
        }
        Message::Img { to, size } => format!("IMG {to} {size}\n"),
        Message::KnownUsers { entries } => {
            if entries.is_empty() {
                return "KNOWNUSERS\n".to_string();
            }
            let list: Vec<String> = entries
                .iter()
                .map(|p| format!("{} {} {}", p.handle, p.ip(), p.port()))
                .collect();
            format!("KNOWNUSERS {}\n", list.join(", "))
        }
        Message::Whois { handle } => format!("WHOIS {handle}\n"),
        Message::Iam { peer } => format!("IAM {} {} {}\n", peer.handle, peer.ip(), peer.port()),
        Message::Unknown { raw } => format!("{raw}\n"),
    }
}

/// Decode one line (with or without its line terminator).
pub fn decode_line(line: &str) -> Message {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut tokens = line.split_whitespace();
    let Some(command) = tokens.next() else {
        return unknown(line);
    };
    let args: Vec<&str> = tokens.collect();
    let decoded = match command {
        "JOIN" => fields::<2>(&args).and_then(|[handle, port]| {
            Some(Message::Join {
                handle: handle.to_string(),
                port: port.parse().ok()?,
            })
        }),
        "LEAVE" => fields::<1>(&args).map(|[handle]| Message::Leave {
            handle: handle.to_string(),
        }),
        "WHO" => args.is_empty().then_some(Message::Who),
        "MSG" => decode_msg(line),
        "IMG" => fields::<2>(&args).and_then(|[to, size]| {
            Some(Message::Img {
                to: to.to_string(),
                size: size.parse().ok()?,
            })
        }),
        "KNOWNUSERS" => Some(Message::KnownUsers {
            entries: decode_entries(after_command(line, "KNOWNUSERS")),
        }),
        "WHOIS" => fields::<1>(&args).map(|[handle]| Message::Whois {
            handle: handle.to_string(),
        }),
        "IAM" => fields::<3>(&args)
            .and_then(|f| parse_entry(f).map(|peer| Message::Iam { peer })),
        _ => None,
    };
    decoded.unwrap_or_else(|| unknown(line))
}

/// Decode every non-blank line of a datagram. Invalid UTF-8 is replaced, not rejected.
pub fn decode_datagram(bytes: &[u8]) -> Vec<Message> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(decode_line)
        .collect()
}

/// Parse the `IMG <to> <size>` header that opens a TCP image stream.
pub fn parse_image_header(line: &str) -> Result<(String, u64), ProtocolError> {
    match decode_line(line) {
        Message::Img { size: 0, .. } => Err(ProtocolError::EmptyImage),
        Message::Img { to, size } => Ok((to, size)),
        _ => Err(ProtocolError::Malformed(
            line.trim_end_matches(['\r', '\n']).to_string(),
        )),
    }
}

/// Error for protocol lines that must parse (TCP header path).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0:?}")]
    Malformed(String),
    #[error("image header announces zero bytes")]
    EmptyImage,
}

fn unknown(line: &str) -> Message {
    Message::Unknown {
        raw: line.to_string(),
    }
}

fn fields<'a, const N: usize>(args: &[&'a str]) -> Option<[&'a str; N]> {
    args.try_into().ok()
}

fn after_command<'a>(line: &'a str, command: &str) -> &'a str {
    line.trim_start().strip_prefix(command).unwrap_or("")
}

fn decode_msg(line: &str) -> Option<Message> {
    let rest = after_command(line, "MSG").trim_start();
    let (to, text) = rest.split_once(char::is_whitespace)?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(Message::Msg {
        to: to.to_string(),
        text: unquote(text).to_string(),
    })
}

/// Strip one surrounding pair of double quotes. Inner quotes are text.
fn unquote(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn decode_entries(list: &str) -> Vec<Peer> {
    list.split(',')
        .filter_map(|entry| {
            let parts: Vec<&str> = entry.split_whitespace().collect();
            fields::<3>(&parts).and_then(parse_entry)
        })
        .collect()
}

fn parse_entry([handle, ip, port]: [&str; 3]) -> Option<Peer> {
    let ip: IpAddr = ip.parse().ok()?;
    let port: u16 = port.parse().ok()?;
    Some(Peer::new(handle, ip, port))
}
