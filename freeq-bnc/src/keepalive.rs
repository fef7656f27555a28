//! Upstream keep-alive responder.
//!
//! The server checks liveness with `PING`; we answer on its behalf so
//! clients never see one and the connection survives even with no client
//! attached.

use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::framer::LineFramer;
use crate::line::{Command, Line};

/// Reads upstream lines, answering and hiding every `PING`.
pub struct UpstreamKeepaliveFilter<R> {
    framer: LineFramer<R>,
    upstream: mpsc::Sender<Line>,
    answered: u64,
}

impl<R: AsyncRead + Unpin> UpstreamKeepaliveFilter<R> {
    /// `upstream` feeds the writer that owns the server's write half.
    pub fn new(framer: LineFramer<R>, upstream: mpsc::Sender<Line>) -> Self {
        Self {
            framer,
            upstream,
            answered: 0,
        }
    }

    /// Number of upstream `PING`s answered so far.
    pub fn answered(&self) -> u64 {
        self.answered
    }

    /// Next line that is not a keep-alive `PING`.
    pub async fn next_line(&mut self) -> Result<Line, RelayError> {
        loop {
            let line = self.framer.next_line().await?;
            if line.command() != Command::Ping {
                return Ok(line);
            }
            let pong = line.to_pong();
            tracing::debug!(%pong, "Answering upstream keep-alive");
            self.upstream
                .send(pong)
                .await
                .map_err(|_| RelayError::UpstreamClosed)?;
            self.answered += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn filter_over(
        reader: tokio::io::DuplexStream,
    ) -> (UpstreamKeepaliveFilter<tokio::io::DuplexStream>, mpsc::Receiver<Line>) {
        let (tx, rx) = mpsc::channel(16);
        (UpstreamKeepaliveFilter::new(LineFramer::new(reader), tx), rx)
    }

    #[tokio::test]
    async fn ping_is_answered_and_hidden() {
        let (mut server, reader) = tokio::io::duplex(1024);
        let (mut filter, mut pongs) = filter_over(reader);

        server
            .write_all(b"PING :token\r\n:srv 001 me :Welcome\r\n")
            .await
            .unwrap();

        let line = filter.next_line().await.unwrap();
        assert_eq!(line, Line::from(":srv 001 me :Welcome"));
        assert_eq!(pongs.recv().await.unwrap().to_wire(), b"PONG :token\r\n");
        assert_eq!(filter.answered(), 1);
    }

    #[tokio::test]
    async fn waits_for_next_line_after_ping() {
        let (mut server, reader) = tokio::io::duplex(1024);
        let (mut filter, mut pongs) = filter_over(reader);

        server.write_all(b"PING :1\r\n").await.unwrap();
        let next = tokio::spawn(async move { filter.next_line().await });

        assert_eq!(pongs.recv().await.unwrap(), Line::from("PONG :1"));
        assert!(!next.is_finished());

        server.write_all(b"NOTICE * :later\r\n").await.unwrap();
        let line = next.await.unwrap().unwrap();
        assert_eq!(line, Line::from("NOTICE * :later"));
    }

    #[tokio::test]
    async fn ping_flood_does_not_recurse() {
        let (mut server, reader) = tokio::io::duplex(64 * 1024);
        let (tx, mut pongs) = mpsc::channel(8);
        let mut filter = UpstreamKeepaliveFilter::new(LineFramer::new(reader), tx);

        let drain = tokio::spawn(async move {
            let mut n = 0;
            while pongs.recv().await.is_some() {
                n += 1;
            }
            n
        });
        let writer = tokio::spawn(async move {
            for i in 0..2000 {
                server.write_all(format!("PING :{i}\r\n").as_bytes()).await.unwrap();
            }
            server.write_all(b"END\r\n").await.unwrap();
            server
        });

        assert_eq!(filter.next_line().await.unwrap(), Line::from("END"));
        assert_eq!(filter.answered(), 2000);
        let _server = writer.await.unwrap();
        drop(filter);
        assert_eq!(drain.await.unwrap(), 2000);
    }

    #[tokio::test]
    async fn clean_close_is_upstream_closed() {
        let (server, reader) = tokio::io::duplex(64);
        let (mut filter, _pongs) = filter_over(reader);
        drop(server);
        assert!(matches!(
            filter.next_line().await,
            Err(RelayError::UpstreamClosed)
        ));
    }

    #[tokio::test]
    async fn truncated_close_is_read_error() {
        let (mut server, reader) = tokio::io::duplex(64);
        let (mut filter, _pongs) = filter_over(reader);
        server.write_all(b"PARTIAL").await.unwrap();
        drop(server);
        assert!(matches!(
            filter.next_line().await,
            Err(RelayError::UpstreamRead(_))
        ));
    }
}
