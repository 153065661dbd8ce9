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

//! `RAW` sessions.
//!
//! Anonymous, unrepliable datagrams. The send pipeline matches the
//! `DATAGRAM` styles; forwarded receives carry a `KEY=VALUE` header line
//! with no source token, which the session requests explicitly with
//! `HEADER=true`.

use tokio::{net::UdpSocket, sync::Mutex};

use std::sync::Arc;

use crate::{
    config::{SessionConfig, SessionStyle},
    dest::{Destination, DestinationKeys},
    error::Error,
    proto::validate,
    sam::{Sam, SamConnection},
    session::{with_deadline, Reader},
};

/// Logging target for the file.
const LOG_TARGET: &str = "shasta::session::raw";

/// Protocol version stamped on outbound datagram headers.
const SEND_VERSION: &str = "3.3";

/// Anonymous datagram. There is no source to reply to.
#[derive(Debug, Clone)]
pub struct RawDatagram {
    /// Payload bytes.
    pub payload: Vec<u8>,

    /// Sender's port.
    pub from_port: u16,

    /// Receiver's port.
    pub to_port: u16,
}

/// Shared state of a raw session.
struct RawInner {
    /// Frozen configuration, carries the session id.
    config: SessionConfig,

    /// Keys the session is bound to.
    keys: DestinationKeys,

    /// Session anchor, `None` once closed.
    anchor: Mutex<Option<SamConnection>>,

    /// UDP socket shared with the receive task.
    socket: Arc<UdpSocket>,

    /// Receiving half.
    reader: Reader<RawDatagram>,
}

/// `RAW` session: anonymous, unrepliable datagrams.
///
/// Cheap to clone; all clones share the same bridge-side session.
#[derive(Clone)]
pub struct RawSession {
    inner: Arc<RawInner>,
}

impl RawSession {
    /// Create a standalone raw session from a handshaked bridge connection.
    pub(crate) async fn from_sam(sam: Sam) -> Result<Self, Error> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let port = socket.local_addr()?.port();

        let mut options = validate::ensure_forwarding_params(Vec::new(), port);
        options.push("HEADER=true".to_string());

        let parts = sam.create_session(SessionStyle::Raw, options).await?;

        Ok(Self::assemble(parts.connection, parts.config, parts.keys, socket))
    }

    /// Wrap a subsession created under a primary.
    pub(crate) fn from_subsession(
        connection: SamConnection,
        config: SessionConfig,
        keys: DestinationKeys,
        socket: Arc<UdpSocket>,
    ) -> Self {
        Self::assemble(connection, config, keys, socket)
    }

    fn assemble(
        connection: SamConnection,
        config: SessionConfig,
        keys: DestinationKeys,
        socket: Arc<UdpSocket>,
    ) -> Self {
        let reader = Reader::spawn(socket.clone(), decode_raw);

        Self {
            inner: Arc::new(RawInner {
                config,
                keys,
                anchor: Mutex::new(Some(connection)),
                socket,
                reader,
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

    /// Receive the next datagram.
    pub async fn recv(&self) -> Result<RawDatagram, Error> {
        self.inner.reader.recv().await
    }

    /// Receive into `buf`, returning the byte count.
    ///
    /// At most `buf.len()` bytes are copied; the rest of an oversized
    /// datagram is discarded.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let datagram = self.recv().await?;

        let nread = datagram.payload.len().min(buf.len());
        buf[..nread].copy_from_slice(&datagram.payload[..nread]);

        Ok(nread)
    }

    /// Send `payload` to `destination`.
    ///
    /// The receiver learns nothing about the sender.
    pub async fn send_to(&self, payload: &[u8], destination: &Destination) -> Result<(), Error> {
        if self.inner.reader.is_closed().await {
            return Err(Error::Closed);
        }

        let mut packet = format!(
            "{SEND_VERSION} {} {}\n",
            self.inner.config.tunnel_name,
            destination.base64()
        )
        .into_bytes();
        packet.extend_from_slice(payload);

        let target = self.inner.config.sam_udp_address();

        with_deadline(Some(self.inner.config.send_timeout), async {
            self.inner.socket.send_to(&packet, &target).await?;
            Ok(())
        })
        .await
    }

    /// Close the session. Idempotent.
    pub async fn close(&self) {
        self.inner.reader.close().await;

        if self.inner.anchor.lock().await.take().is_some() {
            tracing::info!(
                target: LOG_TARGET,
                id = %self.inner.config.tunnel_name,
                "raw session closed",
            );
        }
    }
}

/// Decode a forwarded `RAW` packet.
///
/// With `HEADER=true` the bridge prepends a line of `KEY=VALUE` tokens and
/// nothing else; a leading token of any other shape means the packet is not
/// ours to interpret.
fn decode_raw(packet: &[u8]) -> Result<RawDatagram, Error> {
    let newline = packet
        .iter()
        .position(|byte| *byte == b'\n')
        .ok_or_else(|| Error::Parse("forwarded datagram carries no header".to_string()))?;

    let header = std::str::from_utf8(&packet[..newline])
        .map_err(|_| Error::Parse("forwarded header is not valid utf-8".to_string()))?;

    let mut from_port = 0;
    let mut to_port = 0;

    for token in header.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            return Err(Error::Parse(format!(
                "unexpected token `{token}` in raw header"
            )));
        };

        match key {
            "FROM_PORT" => from_port = value.parse().unwrap_or(0),
            "TO_PORT" => to_port = value.parse().unwrap_or(0),
            _ => {}
        }
    }

    Ok(RawDatagram {
        payload: packet[newline + 1..].to_vec(),
        from_port,
        to_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_raw_header() {
        let datagram = decode_raw(b"FROM_PORT=7070 TO_PORT=8080 PROTOCOL=18\npayload").unwrap();

        assert_eq!(datagram.payload, b"payload");
        assert_eq!(datagram.from_port, 7070);
        assert_eq!(datagram.to_port, 8080);
    }

    #[test]
    fn decode_raw_empty_header() {
        let datagram = decode_raw(b"\npayload").unwrap();

        assert_eq!(datagram.payload, b"payload");
        assert_eq!(datagram.from_port, 0);
    }

    #[test]
    fn decode_raw_rejects_source_token() {
        // a destination-looking token means this is not a raw header
        assert!(matches!(
            decode_raw(b"somedestination FROM_PORT=1\npayload"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn decode_raw_rejects_headerless_packet() {
        assert!(matches!(
            decode_raw(b"just payload bytes"),
            Err(Error::Parse(_))
        ));
    }
}
