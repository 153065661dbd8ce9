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

//! `DATAGRAM` and `DATAGRAM3` sessions.
//!
//! Sends go straight to the bridge's UDP port as an ASCII header line
//! followed by the payload; the control socket carries no data. Receives
//! arrive on a session-local UDP socket the bridge forwards to, announced
//! through `PORT`/`HOST` options at session creation.

use tokio::{
    net::UdpSocket,
    sync::{Mutex, RwLock},
};

use std::sync::Arc;

use crate::{
    config::{SessionConfig, SessionStyle},
    dest::{Destination, DestinationKeys, SourceHash},
    error::Error,
    proto::validate,
    sam::{Sam, SamConnection},
    session::{with_deadline, Reader},
};

/// Logging target for the file.
const LOG_TARGET: &str = "shasta::session::datagram";

/// Protocol version stamped on outbound datagram headers.
const SEND_VERSION: &str = "3.3";

/// Repliable datagram.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Payload bytes.
    pub payload: Vec<u8>,

    /// Destination of the sender.
    pub source: Destination,

    /// Destination of the receiving session.
    pub local: Destination,

    /// Sender's port.
    pub from_port: u16,

    /// Receiver's port.
    pub to_port: u16,
}

/// Repliable datagram carrying only the hash of its sender.
#[derive(Debug, Clone)]
pub struct Datagram3 {
    /// Payload bytes.
    pub payload: Vec<u8>,

    /// 32-byte hash of the sender's destination.
    pub source: SourceHash,

    /// Destination of the receiving session.
    pub local: Destination,

    /// Sender's port.
    pub from_port: u16,

    /// Receiver's port.
    pub to_port: u16,
}

/// Shared state of a datagram-style session.
struct DatagramInner<T> {
    /// Frozen configuration, carries the session id.
    config: SessionConfig,

    /// Keys the session is bound to.
    keys: DestinationKeys,

    /// Session anchor, `None` once closed.
    anchor: Mutex<Option<SamConnection>>,

    /// UDP socket shared with the receive task.
    socket: Arc<UdpSocket>,

    /// Receiving half.
    reader: Reader<T>,

    /// Last-seen remote, set by `connect` and updated by `read`.
    remote: RwLock<Option<Destination>>,
}

impl<T: Send + 'static> DatagramInner<T> {
    /// Send `payload` to `destination` over the bridge's UDP port.
    async fn send_to(&self, payload: &[u8], destination: &Destination) -> Result<(), Error> {
        if self.reader.is_closed().await {
            return Err(Error::Closed);
        }

        let mut packet = format!(
            "{SEND_VERSION} {} {}\n",
            self.config.tunnel_name,
            destination.base64()
        )
        .into_bytes();
        packet.extend_from_slice(payload);

        let target = self.config.sam_udp_address();

        with_deadline(Some(self.config.send_timeout), async {
            self.socket.send_to(&packet, &target).await?;
            Ok(())
        })
        .await
    }

    /// Close the session: stop the receive task, then drop the anchor.
    async fn close(&self, style: SessionStyle) {
        self.reader.close().await;

        if self.anchor.lock().await.take().is_some() {
            tracing::info!(
                target: LOG_TARGET,
                id = %self.config.tunnel_name,
                %style,
                "datagram session closed",
            );
        }
    }
}

/// `DATAGRAM` session: authenticated, repliable datagrams.
///
/// Cheap to clone; all clones share the same bridge-side session.
///
/// ```rust,no_run
/// use shasta::Sam;
///
/// #[tokio::main]
/// async fn main() -> shasta::Result<()> {
///     let session = Sam::connect("127.0.0.1:7656").await?.datagram_session().await?;
///
///     loop {
///         let datagram = session.recv().await?;
///         session.send_to(&datagram.payload, &datagram.source).await?;
///     }
/// }
/// ```
#[derive(Clone)]
pub struct DatagramSession {
    inner: Arc<DatagramInner<Datagram>>,
}

impl DatagramSession {
    /// Create a standalone datagram session from a handshaked bridge
    /// connection.
    pub(crate) async fn from_sam(sam: Sam) -> Result<Self, Error> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let port = socket.local_addr()?.port();
        let options = validate::ensure_forwarding_params(Vec::new(), port);

        let parts = sam.create_session(SessionStyle::Datagram, options).await?;

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
        let local = keys.addr().clone();
        let reader = Reader::spawn(socket.clone(), move |packet| {
            decode_datagram(packet, &local)
        });

        Self {
            inner: Arc::new(DatagramInner {
                config,
                keys,
                anchor: Mutex::new(Some(connection)),
                socket,
                reader,
                remote: RwLock::new(None),
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
    pub async fn recv(&self) -> Result<Datagram, Error> {
        self.inner.reader.recv().await
    }

    /// Receive into `buf`, returning the byte count and the sender.
    ///
    /// At most `buf.len()` bytes are copied; the rest of an oversized
    /// datagram is discarded. The sender becomes the session's last-seen
    /// remote.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Destination), Error> {
        let datagram = self.recv().await?;

        let nread = datagram.payload.len().min(buf.len());
        buf[..nread].copy_from_slice(&datagram.payload[..nread]);

        *self.inner.remote.write().await = Some(datagram.source.clone());

        Ok((nread, datagram.source))
    }

    /// Send `payload` to `destination`.
    ///
    /// The protocol caps datagrams at 31744 bytes; sizes up to roughly 11 KB
    /// are reliable in practice. Sizes are not enforced here.
    pub async fn send_to(&self, payload: &[u8], destination: &Destination) -> Result<(), Error> {
        self.inner.send_to(payload, destination).await
    }

    /// Send `payload` to an address given in string form.
    ///
    /// The address must be a full base64 destination; anything else fails
    /// with [`Error::Addr`].
    pub async fn send_to_addr(&self, payload: &[u8], addr: &str) -> Result<(), Error> {
        let destination = Destination::parse(addr)?;

        self.inner.send_to(payload, &destination).await
    }

    /// Pin `destination` as the remote for subsequent [`DatagramSession::send()`]
    /// calls.
    pub async fn connect(&self, destination: Destination) {
        *self.inner.remote.write().await = Some(destination);
    }

    /// Send `payload` to the pinned or last-seen remote.
    pub async fn send(&self, payload: &[u8]) -> Result<(), Error> {
        let remote = self.inner.remote.read().await.clone();

        match remote {
            Some(destination) => self.inner.send_to(payload, &destination).await,
            None => Err(Error::Addr("no remote destination".to_string())),
        }
    }

    /// Close the session. Idempotent.
    pub async fn close(&self) {
        self.inner.close(SessionStyle::Datagram).await;
    }
}

/// `DATAGRAM3` session: repliable datagrams with hash-only sources.
#[derive(Clone)]
pub struct Datagram3Session {
    inner: Arc<DatagramInner<Datagram3>>,
}

impl Datagram3Session {
    /// Create a standalone datagram3 session from a handshaked bridge
    /// connection.
    pub(crate) async fn from_sam(sam: Sam) -> Result<Self, Error> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let port = socket.local_addr()?.port();
        let options = validate::ensure_forwarding_params(Vec::new(), port);

        let parts = sam.create_session(SessionStyle::Datagram3, options).await?;

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
        let local = keys.addr().clone();
        let reader = Reader::spawn(socket.clone(), move |packet| {
            decode_datagram3(packet, &local)
        });

        Self {
            inner: Arc::new(DatagramInner {
                config,
                keys,
                anchor: Mutex::new(Some(connection)),
                socket,
                reader,
                remote: RwLock::new(None),
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
    ///
    /// The source is a 32-byte hash; replying requires resolving it through
    /// the naming layer first.
    pub async fn recv(&self) -> Result<Datagram3, Error> {
        self.inner.reader.recv().await
    }

    /// Send `payload` to `destination`.
    pub async fn send_to(&self, payload: &[u8], destination: &Destination) -> Result<(), Error> {
        self.inner.send_to(payload, destination).await
    }

    /// Close the session. Idempotent.
    pub async fn close(&self) {
        self.inner.close(SessionStyle::Datagram3).await;
    }
}

/// Split a forwarded packet into its header line and payload.
fn split_header(packet: &[u8]) -> Result<(&str, &[u8]), Error> {
    let newline = packet
        .iter()
        .position(|byte| *byte == b'\n')
        .ok_or_else(|| Error::Parse("forwarded datagram carries no header".to_string()))?;

    let header = std::str::from_utf8(&packet[..newline])
        .map_err(|_| Error::Parse("forwarded header is not valid utf-8".to_string()))?;

    Ok((header, &packet[newline + 1..]))
}

/// Port value of `key` in a forwarded header, 0 when absent.
fn header_port(tokens: &[&str], key: &str) -> u16 {
    tokens
        .iter()
        .find_map(|token| token.strip_prefix(key))
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// Decode a forwarded `DATAGRAM` packet.
///
/// The header starts with the sender's destination followed by
/// `KEY=VALUE` tokens.
fn decode_datagram(packet: &[u8], local: &Destination) -> Result<Datagram, Error> {
    let (header, payload) = split_header(packet)?;
    let tokens = header.split_whitespace().collect::<Vec<_>>();

    let source = tokens
        .first()
        .ok_or_else(|| Error::Parse("forwarded header is empty".to_string()))
        .and_then(|token| Destination::parse(token))?;

    Ok(Datagram {
        payload: payload.to_vec(),
        source,
        local: local.clone(),
        from_port: header_port(&tokens, "FROM_PORT="),
        to_port: header_port(&tokens, "TO_PORT="),
    })
}

/// Decode a forwarded `DATAGRAM3` packet.
///
/// Identical to [`decode_datagram`] except the leading token is the
/// 32-byte source hash.
fn decode_datagram3(packet: &[u8], local: &Destination) -> Result<Datagram3, Error> {
    let (header, payload) = split_header(packet)?;
    let tokens = header.split_whitespace().collect::<Vec<_>>();

    let source = tokens
        .first()
        .ok_or_else(|| Error::Parse("forwarded header is empty".to_string()))
        .and_then(|token| SourceHash::parse(token))?;

    Ok(Datagram3 {
        payload: payload.to_vec(),
        source,
        local: local.clone(),
        from_port: header_port(&tokens, "FROM_PORT="),
        to_port: header_port(&tokens, "TO_PORT="),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dest::dummy_destination;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    fn local_destination() -> Destination {
        Destination::parse(&dummy_destination()).unwrap()
    }

    #[test]
    fn decode_datagram_header() {
        let source = dummy_destination();
        let packet = format!("{source} FROM_PORT=7070 TO_PORT=8080\nhello");

        let datagram = decode_datagram(packet.as_bytes(), &local_destination()).unwrap();

        assert_eq!(datagram.payload, b"hello");
        assert_eq!(datagram.source.base64(), source);
        assert_eq!(datagram.local, local_destination());
        assert_eq!(datagram.from_port, 7070);
        assert_eq!(datagram.to_port, 8080);
    }

    #[test]
    fn decode_datagram_without_ports() {
        let source = dummy_destination();
        let packet = format!("{source}\npayload");

        let datagram = decode_datagram(packet.as_bytes(), &local_destination()).unwrap();

        assert_eq!(datagram.from_port, 0);
        assert_eq!(datagram.to_port, 0);
    }

    #[test]
    fn decode_rejects_headerless_packet() {
        assert!(matches!(
            decode_datagram(b"no newline here", &local_destination()),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn decode_rejects_unparsable_source() {
        assert!(matches!(
            decode_datagram(b"not/a/destination FROM_PORT=1\nx", &local_destination()),
            Err(Error::Addr(_))
        ));
    }

    #[test]
    fn decode_datagram3_header() {
        let hash = data_encoding_base64(&[9u8; 32]);
        let packet = format!("{hash} FROM_PORT=1 TO_PORT=2\nping");

        let datagram = decode_datagram3(packet.as_bytes(), &local_destination()).unwrap();

        assert_eq!(datagram.payload, b"ping");
        assert_eq!(datagram.source.as_bytes(), &[9u8; 32]);
    }

    /// I2P-alphabet base64 without pulling the private encoder out of `dest`.
    fn data_encoding_base64(bytes: &[u8]) -> String {
        let standard = data_encoding::BASE64.encode(bytes);
        standard.replace('+', "-").replace('/', "~")
    }

    /// Bridge double: answers HELLO and SESSION CREATE on TCP and records
    /// datagrams arriving on its UDP port.
    async fn fake_bridge() -> (String, u16, tokio::sync::mpsc::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_port = listener.local_addr().unwrap().port();
        let private_key = format!("{}AAAA", dummy_destination());
        let (udp_tx, udp_rx) = tokio::sync::mpsc::channel(8);

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_port = udp.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; 65536];
            while let Ok(nread) = udp.recv(&mut buffer).await {
                if udp_tx.send(buffer[..nread].to_vec()).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = vec![0u8; 4096];

            let _ = stream.read(&mut buffer).await.unwrap();
            stream
                .write_all(b"HELLO REPLY RESULT=OK VERSION=3.3\n")
                .await
                .unwrap();

            let _ = stream.read(&mut buffer).await.unwrap();
            stream
                .write_all(
                    format!("SESSION STATUS RESULT=OK DESTINATION={private_key}\n").as_bytes(),
                )
                .await
                .unwrap();

            std::future::pending::<()>().await;
        });

        (format!("127.0.0.1:{tcp_port}"), udp_port, udp_rx)
    }

    async fn session_for(address: &str, udp_port: u16) -> DatagramSession {
        let keys = DestinationKeys::new(
            local_destination(),
            format!("{}AAAA", dummy_destination()),
        );

        Sam::connect_with(
            SessionConfig::new()
                .with_sam_address(address)
                .with_sam_udp_port(udp_port)
                .with_tunnel_name("s1")
                .with_destination_keys(keys),
        )
        .await
        .unwrap()
        .datagram_session()
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn send_format_is_versioned_header_plus_payload() {
        let (address, udp_port, mut udp_rx) = fake_bridge().await;
        let session = session_for(&address, udp_port).await;

        let destination = local_destination();
        session.send_to(b"hello", &destination).await.unwrap();

        let packet = udp_rx.recv().await.unwrap();
        let expected = format!("3.3 s1 {}\nhello", destination.base64());
        assert_eq!(packet, expected.into_bytes());
    }

    #[tokio::test]
    async fn forwarded_datagrams_reach_recv() {
        let (address, udp_port, _udp_rx) = fake_bridge().await;
        let session = session_for(&address, udp_port).await;

        // forward a packet straight to the session's UDP socket
        let forwarder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = session.inner.socket.local_addr().unwrap().port();
        let source = dummy_destination();
        let packet = format!("{source} FROM_PORT=1 TO_PORT=2\nforwarded");
        forwarder
            .send_to(packet.as_bytes(), format!("127.0.0.1:{port}"))
            .await
            .unwrap();

        let datagram = session.recv().await.unwrap();
        assert_eq!(datagram.payload, b"forwarded");
        assert_eq!(datagram.source.base64(), source);
    }

    #[tokio::test]
    async fn recv_from_truncates_and_tracks_remote() {
        let (address, udp_port, _udp_rx) = fake_bridge().await;
        let session = session_for(&address, udp_port).await;

        let forwarder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = session.inner.socket.local_addr().unwrap().port();
        let source = dummy_destination();
        let packet = format!("{source}\n0123456789");
        forwarder
            .send_to(packet.as_bytes(), format!("127.0.0.1:{port}"))
            .await
            .unwrap();

        let mut buffer = [0u8; 4];
        let (nread, from) = session.recv_from(&mut buffer).await.unwrap();

        assert_eq!(nread, 4);
        assert_eq!(&buffer, b"0123");
        assert_eq!(from.base64(), source);

        // the sender became the connectionless-send remote
        session.send(b"reply").await.unwrap();
    }

    #[tokio::test]
    async fn send_without_remote_is_addr_error() {
        let (address, udp_port, _udp_rx) = fake_bridge().await;
        let session = session_for(&address, udp_port).await;

        assert!(matches!(session.send(b"x").await, Err(Error::Addr(_))));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let (address, udp_port, _udp_rx) = fake_bridge().await;
        let session = session_for(&address, udp_port).await;

        session.close().await;
        session.close().await;

        assert!(matches!(session.recv().await, Err(Error::Closed)));
        assert!(matches!(
            session.send_to(b"x", &local_destination()).await,
            Err(Error::Closed)
        ));
    }
}
