//! Protocol lines and the handful of commands the bouncer cares about.

use std::fmt;

/// Line terminator on both legs.
pub const DELIMITER: &[u8] = b"\r\n";

/// RFC 1459 message size including the delimiter. Advisory only.
pub const RECOMMENDED_MAX_LINE: usize = 512;

const PING: &[u8] = b"PING";
const NICK: &[u8] = b"NICK";
const QUIT: &[u8] = b"QUIT";

/// Offset of the nickname in `NICK <nick>`.
const NICK_VALUE_OFFSET: usize = 5;

/// One complete protocol message, delimiter stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Line(Vec<u8>);

/// What the bouncer does with a line is decided by its leading bytes only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Nick(String),
    Quit,
    Other,
}

impl Line {
    /// Wrap one message's bytes. They must not contain the delimiter;
    /// only the framer splits raw input.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        debug_assert!(
            !bytes.windows(DELIMITER.len()).any(|w| w == DELIMITER),
            "line contains a delimiter"
        );
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bytes as they go on the wire, delimiter re-appended.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() + DELIMITER.len());
        out.extend_from_slice(&self.0);
        out.extend_from_slice(DELIMITER);
        out
    }

    pub fn command(&self) -> Command {
        let bytes = self.as_bytes();
        if bytes.starts_with(PING) {
            Command::Ping
        } else if bytes.starts_with(NICK) {
            let value = bytes.get(NICK_VALUE_OFFSET..).unwrap_or_default();
            Command::Nick(String::from_utf8_lossy(value).into_owned())
        } else if bytes.starts_with(QUIT) {
            Command::Quit
        } else {
            Command::Other
        }
    }

    /// Keep-alive acknowledgment: `PING x` becomes `PONG x`.
    ///
    /// Only the second byte changes; the token is echoed untouched.
    pub fn to_pong(&self) -> Line {
        let mut bytes = self.0.clone();
        if let Some(b) = bytes.get_mut(1) {
            *b = b'O';
        }
        Line(bytes)
    }
}

impl From<&str> for Line {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}
