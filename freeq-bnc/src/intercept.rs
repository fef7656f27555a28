//! Client-side command interception.
//!
//! Sits between a client's framer and the upstream writer:
//! - `QUIT` ends the client's forwarding path; the server never sees it.
//! - `PING` is answered straight back to the client.
//! - `NICK` is forwarded for the first client to send one. Every later
//!   `NICK`, from any client, is dropped without a reply.
//! - Everything else is forwarded unchanged.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncRead;

use crate::clients::{ClientId, OutboundQueue};
use crate::error::FrameError;
use crate::framer::LineFramer;
use crate::line::{Command, DELIMITER, Line, RECOMMENDED_MAX_LINE};

/// Process-wide, set-once nickname ownership.
///
/// The first client to register a nickname owns the bouncer's identity on
/// the server for the rest of the process lifetime.
#[derive(Default)]
pub struct NicknameClaim {
    owner: Mutex<Option<(ClientId, String)>>,
}

/// Outcome of [`NicknameClaim::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Granted,
    Rejected { owner: ClientId },
}

impl NicknameClaim {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-set under one lock; first caller wins.
    pub fn claim(&self, client: ClientId, nick: &str) -> Claim {
        let mut owner = self.owner.lock();
        match owner.as_ref() {
            Some((id, _)) => Claim::Rejected { owner: *id },
            None => {
                *owner = Some((client, nick.to_string()));
                Claim::Granted
            }
        }
    }

    pub fn nickname(&self) -> Option<String> {
        self.owner.lock().as_ref().map(|(_, nick)| nick.clone())
    }

    pub fn owner(&self) -> Option<ClientId> {
        self.owner.lock().as_ref().map(|(id, _)| *id)
    }
}

/// Reads one client's lines and yields only those bound for upstream.
pub struct ClientCommandInterceptor<R> {
    id: ClientId,
    framer: LineFramer<R>,
    replies: Arc<OutboundQueue>,
    nick: Arc<NicknameClaim>,
    prefix: String,
}

impl<R: AsyncRead + Unpin> ClientCommandInterceptor<R> {
    /// `replies` is the client's own outbound queue, used for `PONG`.
    pub fn new(
        id: ClientId,
        framer: LineFramer<R>,
        replies: Arc<OutboundQueue>,
        nick: Arc<NicknameClaim>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            id,
            framer,
            replies,
            nick,
            prefix: prefix.into(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Next line to forward upstream.
    ///
    /// `Ok(None)` means the client sent `QUIT` and its session is over.
    pub async fn next_forward(&mut self) -> Result<Option<Line>, FrameError> {
        loop {
            let line = self.framer.next_line().await?;
            tracing::info!(target: "freeq_bnc::traffic", client = %self.id, "{line}");
            if line.len() + DELIMITER.len() > RECOMMENDED_MAX_LINE {
                tracing::debug!(
                    client = %self.id,
                    len = line.len(),
                    "Oversized line, forwarding anyway"
                );
            }

            match line.command() {
                Command::Quit => {
                    tracing::info!(client = %self.id, "Client sent QUIT");
                    return Ok(None);
                }
                Command::Ping => {
                    self.replies.push(line.to_pong());
                }
                Command::Nick(nick) => match self.nick.claim(self.id, &nick) {
                    Claim::Granted => {
                        tracing::info!(client = %self.id, %nick, "Nickname claimed");
                        return Ok(Some(line));
                    }
                    Claim::Rejected { owner } => {
                        tracing::debug!(
                            client = %self.id,
                            %owner,
                            %nick,
                            prefix = %self.prefix,
                            "Nickname already claimed, dropping NICK"
                        );
                    }
                },
                Command::Other => return Ok(Some(line)),
            }
        }
    }
}
