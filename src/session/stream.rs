// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! `STREAM` sessions.
//!
//! The socket that carried `SESSION CREATE` stays open as the session
//! anchor and is never used for data commands. Every `STREAM CONNECT` and
//! `STREAM ACCEPT` runs on a fresh control connection which, once the bridge
//! confirms the operation, becomes the byte pipe handed to the caller.

use tokio::sync::{mpsc, Mutex};

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use crate::{
    config::{SessionConfig, SessionStyle},
    dest::{Destination, DestinationKeys},
    error::Error,
    proto::command,
    sam::{Sam, SamConnection, SessionParts},
    session::with_deadline,
    stream::Stream,
};

/// Logging target for the file.
const LOG_TARGET: &str = "shasta::session::stream";

/// Depth of the listener's accept queue.
const ACCEPT_QUEUE_SIZE: usize = 8;

/// Stream session state shared between clones.
struct StreamInner {
    /// Frozen configuration, carries the session id.
    config: SessionConfig,

    /// Keys the session is bound to.
    keys: DestinationKeys,

    /// Session anchor, `None` once closed.
    ///
    /// For a standalone session this is the socket that carried
    /// `SESSION CREATE`; for a subsession it is the dedicated control
    /// connection opened after `SESSION ADD`. Either way it carries no
    /// further commands.
    anchor: Mutex<Option<SamConnection>>,
}

/// `STREAM` session.
///
/// Cheap to clone; all clones share the same bridge-side session.
#[derive(Clone)]
pub struct StreamSession {
    inner: Arc<StreamInner>,
}

impl StreamSession {
    /// Create a standalone stream session from a handshaked bridge
    /// connection.
    pub(crate) async fn from_sam(sam: Sam) -> Result<Self, Error> {
        let SessionParts {
            connection,
            config,
            keys,
        } = sam.create_session(SessionStyle::Stream, Vec::new()).await?;

        Ok(Self {
            inner: Arc::new(StreamInner {
                config,
                keys,
                anchor: Mutex::new(Some(connection)),
            }),
        })
    }

    /// Wrap a subsession created under a primary.
    ///
    /// `connection` is the dedicated, already-handshaked control connection;
    /// no `SESSION CREATE` is issued on it.
    pub(crate) fn from_subsession(
        connection: SamConnection,
        config: SessionConfig,
        keys: DestinationKeys,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                config,
                keys,
                anchor: Mutex::new(Some(connection)),
            }),
        }
    }

    /// Session id.
    pub fn id(&self) -> &str {
        &self.inner.config.tunnel_name
    }

    /// Destination of the session.
    pub fn destination(&self) -> &Destination {
        self.inner.keys.addr()
    }

    /// Open an outbound stream to `destination`.
    ///
    /// `destination` may be a hostname, a base32 address, or a full base64
    /// destination. A `None` or zero `deadline` waits indefinitely.
    pub async fn connect(
        &self,
        destination: &str,
        deadline: Option<Duration>,
    ) -> Result<Stream, Error> {
        if self.inner.anchor.lock().await.is_none() {
            return Err(Error::Closed);
        }

        with_deadline(deadline, self.connect_inner(destination)).await
    }

    async fn connect_inner(&self, destination: &str) -> Result<Stream, Error> {
        let mut control = self.open_control().await?;

        let connect =
            command::stream_connect(&self.inner.config, &self.inner.config.tunnel_name, destination);
        control.write_line(&connect).await?;

        // the peer's first bytes may ride in right behind the status line
        let reply = crate::proto::parser::Reply::parse(&control.read_header_line().await?)?;

        if !reply.is("STREAM", "STATUS") {
            return Err(Error::Protocol(format!(
                "unexpected reply to STREAM CONNECT: {} {}",
                reply.verb, reply.noun
            )));
        }
        reply.classify()?;

        tracing::info!(
            target: LOG_TARGET,
            id = %self.inner.config.tunnel_name,
            %destination,
            "outbound stream open",
        );

        Ok(Stream::new(
            control.into_stream(),
            Destination::parse(destination).ok(),
            self.inner.keys.addr().clone(),
        ))
    }

    /// Accept one inbound stream.
    ///
    /// A `None` or zero `deadline` waits indefinitely. For a continuous
    /// accept loop use [`StreamSession::listener()`].
    pub async fn accept(&self, deadline: Option<Duration>) -> Result<Stream, Error> {
        if self.inner.anchor.lock().await.is_none() {
            return Err(Error::Closed);
        }

        with_deadline(deadline, self.accept_inner()).await
    }

    async fn accept_inner(&self) -> Result<Stream, Error> {
        let mut control = self.open_control().await?;

        let accept = command::stream_accept(&self.inner.config, &self.inner.config.tunnel_name);
        control.write_line(&accept).await?;

        // the peer header and payload may ride in right behind the status line
        let reply = crate::proto::parser::Reply::parse(&control.read_header_line().await?)?;

        if !reply.is("STREAM", "STATUS") {
            return Err(Error::Protocol(format!(
                "unexpected reply to STREAM ACCEPT: {} {}",
                reply.verb, reply.noun
            )));
        }
        reply.classify()?;

        // the connection is open once the bridge relays the peer's
        // destination; payload may be bundled right after the header
        let header = control.read_header_line().await?;
        let peer = header
            .split_whitespace()
            .next()
            .ok_or_else(|| Error::Parse("accept header carries no destination".to_string()))
            .and_then(Destination::parse)?;

        tracing::info!(
            target: LOG_TARGET,
            id = %self.inner.config.tunnel_name,
            peer = %peer.base32(),
            "inbound stream accepted",
        );

        Ok(Stream::new(
            control.into_stream(),
            Some(peer),
            self.inner.keys.addr().clone(),
        ))
    }

    /// Start a listener feeding accepted streams through a bounded queue.
    pub fn listener(&self) -> StreamListener {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);
        let session = self.clone();

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = session.accept(None) => accepted,
                    _ = accept_tx.closed() => break,
                };

                let failed = accepted.is_err();
                if accept_tx.send(accepted).await.is_err() || failed {
                    break;
                }
            }

            tracing::debug!(
                target: LOG_TARGET,
                id = %session.inner.config.tunnel_name,
                "accept loop stopped",
            );
        });

        StreamListener { accept_rx }
    }

    /// Close the session.
    ///
    /// Drops the session anchor; the bridge tears the session down with it.
    /// Streams already handed out stay open. Idempotent.
    pub async fn close(&self) {
        let anchor = self.inner.anchor.lock().await.take();

        if anchor.is_some() {
            tracing::info!(
                target: LOG_TARGET,
                id = %self.inner.config.tunnel_name,
                "stream session closed",
            );
        }
    }

    /// Open and handshake a fresh control connection for one data command.
    async fn open_control(&self) -> Result<SamConnection, Error> {
        crate::sam::open_control(&self.inner.config).await
    }
}

/// Listener over inbound streams.
///
/// Produced by [`StreamSession::listener()`]. Dropping the listener stops
/// the accept loop; the session itself stays open.
pub struct StreamListener {
    /// Accepted streams, bounded.
    accept_rx: mpsc::Receiver<Result<Stream, Error>>,
}

impl StreamListener {
    /// Wait for the next inbound stream.
    pub async fn accept(&mut self) -> Result<Stream, Error> {
        self.accept_rx.recv().await.unwrap_or(Err(Error::Closed))
    }
}

impl futures::Stream for StreamListener {
    type Item = Stream;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match futures::ready!(self.accept_rx.poll_recv(cx)) {
            Some(Ok(stream)) => Poll::Ready(Some(stream)),
            _ => Poll::Ready(None),
        }
    }
}
