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

//! Bridge connection and session establishment.
//!
//! [`SamConnection`] is the line-oriented TCP control transport.
//! [`Sam`] wraps a handshaked connection and drives the session lifecycle:
//! key generation, keyfile handling, `SESSION CREATE`, and the style-specific
//! session constructors.

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use std::path::Path;

use crate::{
    config::{SessionConfig, SessionStyle, SigType},
    dest::{Destination, DestinationKeys},
    error::Error,
    proto::{command, parser::Reply, validate},
    resolver::{parse_lookup_reply, Lookup},
    session::{
        datagram::{Datagram3Session, DatagramSession},
        primary::PrimarySession,
        raw::RawSession,
        stream::StreamSession,
    },
};

/// Logging target for the file.
const LOG_TARGET: &str = "shasta::sam";

/// Size of the initial response read.
const READ_BUFFER_SIZE: usize = 4096;

/// Size of follow-up reads when the initial buffer was filled exactly.
const READ_CHUNK_SIZE: usize = 2048;

/// TCP control connection to the SAM bridge.
#[derive(Debug)]
pub struct SamConnection {
    /// Control socket.
    stream: TcpStream,
}

impl SamConnection {
    /// Open a control connection to `address`.
    pub async fn connect(address: &str) -> Result<Self, Error> {
        let stream = TcpStream::connect(address).await?;

        Ok(Self { stream })
    }

    /// Write one command line to the bridge.
    pub async fn write_line(&mut self, line: &str) -> Result<(), Error> {
        tracing::trace!(
            target: LOG_TARGET,
            command = %line.trim_end(),
            "-->",
        );

        self.stream.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Read one response from the bridge.
    ///
    /// Reads into a 4096-byte buffer first; if the kernel fills it exactly,
    /// keeps reading 2048-byte chunks until a short read or EOF.
    pub async fn read_response(&mut self) -> Result<String, Error> {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        let nread = self.stream.read(&mut buffer).await?;
        if nread == 0 {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "bridge closed the control connection",
            )));
        }
        buffer.truncate(nread);

        // an exactly-full initial read means the response may continue
        if nread == READ_BUFFER_SIZE {
            loop {
                let mut chunk = [0u8; READ_CHUNK_SIZE];
                let nread = self.stream.read(&mut chunk).await?;
                buffer.extend_from_slice(&chunk[..nread]);

                if nread < READ_CHUNK_SIZE {
                    break;
                }
            }
        }

        let response = String::from_utf8(buffer)
            .map_err(|_| Error::Parse("response is not valid utf-8".to_string()))?;

        tracing::trace!(
            target: LOG_TARGET,
            response = %response.trim_end(),
            "<--",
        );

        Ok(response)
    }

    /// Write `command` and parse the single response line it elicits.
    pub async fn send_command(&mut self, command: &str) -> Result<Reply, Error> {
        self.write_line(command).await?;
        let response = self.read_response().await?;

        Reply::parse(&response)
    }

    /// Read one newline-terminated header line without touching anything
    /// after it.
    ///
    /// The bridge may bundle stream payload right after the header; peeking
    /// first makes sure only the header itself is consumed.
    pub(crate) async fn read_header_line(&mut self) -> Result<String, Error> {
        let mut buffer = [0u8; READ_BUFFER_SIZE];

        loop {
            self.stream.readable().await?;

            let nread = self.stream.peek(&mut buffer).await?;
            if nread == 0 {
                return Err(Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "bridge closed the connection before the header",
                )));
            }

            if let Some(newline) = buffer[..nread].iter().position(|byte| *byte == b'\n') {
                self.stream.read_exact(&mut buffer[..newline + 1]).await?;

                return std::str::from_utf8(&buffer[..newline])
                    .map(|header| header.trim_end().to_string())
                    .map_err(|_| Error::Parse("header is not valid utf-8".to_string()));
            }

            if nread == READ_BUFFER_SIZE {
                return Err(Error::Parse("header line exceeds buffer".to_string()));
            }
        }
    }

    /// Hand the socket over as a raw byte pipe.
    pub(crate) fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Handshaked connection to the SAM bridge.
///
/// ```rust,no_run
/// use shasta::Sam;
///
/// #[tokio::main]
/// async fn main() -> shasta::Result<()> {
///     let mut sam = Sam::connect("127.0.0.1:7656").await?;
///     let keys = sam.generate_keys(None).await?;
///
///     println!("our address: {}", keys.addr().base32());
///
///     let session = sam.stream_session().await?;
///     let stream = session.connect("host.i2p", None).await?;
///
///     Ok(())
/// }
/// ```
pub struct Sam {
    /// Control connection, handshaked.
    connection: SamConnection,

    /// Session configuration, frozen once a session is created.
    config: SessionConfig,
}

impl Sam {
    /// Connect to the bridge at `address` with a default config.
    pub async fn connect(address: &str) -> Result<Self, Error> {
        Self::connect_with(SessionConfig::new().with_sam_address(address)).await
    }

    /// Connect to the bridge named by `config` and perform the version
    /// handshake.
    ///
    /// On failure the control socket is dropped.
    pub async fn connect_with(config: SessionConfig) -> Result<Self, Error> {
        let connection = open_control(&config).await?;

        Ok(Self { connection, config })
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Surrender the handshaked control connection.
    pub(crate) fn into_connection(self) -> SamConnection {
        self.connection
    }

    /// Ask the bridge to mint a fresh destination key pair.
    ///
    /// `sig_type` defaults to Ed25519 when unset.
    pub async fn generate_keys(
        &mut self,
        sig_type: Option<SigType>,
    ) -> Result<DestinationKeys, Error> {
        let sig_type = sig_type.or(self.config.sig_type).unwrap_or_default();
        let reply = self
            .connection
            .send_command(&command::dest_generate(Some(sig_type)))
            .await?;

        // the reply carries only PUB= and PRIV= after the leading literal
        let mut public = None;
        let mut private = None;

        for token in &reply.tokens {
            match token {
                crate::proto::parser::Token::Pair { key, value } => match key.as_str() {
                    "PUB" => public = Some(value.clone()),
                    "PRIV" => private = Some(value.clone()),
                    "RESULT" => reply.classify()?,
                    key => {
                        return Err(Error::Parse(format!(
                            "unexpected token `{key}` in DEST REPLY"
                        )))
                    }
                },
                crate::proto::parser::Token::Flag(flag) => {
                    return Err(Error::Parse(format!(
                        "unexpected flag `{flag}` in DEST REPLY"
                    )))
                }
            }
        }

        match (public, private) {
            (Some(public), Some(private)) => {
                let destination = Destination::parse(&public)?;

                tracing::info!(
                    target: LOG_TARGET,
                    address = %destination.base32(),
                    %sig_type,
                    "generated destination",
                );

                Ok(DestinationKeys::new(destination, private))
            }
            _ => Err(Error::Parse("DEST REPLY is missing PUB/PRIV".to_string())),
        }
    }

    /// Make sure the config carries destination keys.
    ///
    /// - `None` generates transient keys
    /// - a missing file generates keys and persists them with mode 0600
    /// - an existing file is loaded
    pub async fn ensure_keyfile(&mut self, path: Option<&Path>) -> Result<DestinationKeys, Error> {
        let keys = match path {
            None => self.generate_keys(None).await?,
            Some(path) if !path.exists() => {
                let keys = self.generate_keys(None).await?;
                keys.store(path).await?;
                keys
            }
            Some(path) => DestinationKeys::load(path).await?,
        };

        self.config.destination_keys = Some(keys.clone());
        Ok(keys)
    }

    /// Look up the destination of `name`, optionally requesting SAMv3.2
    /// service options.
    pub async fn resolve(&mut self, name: &str, with_options: bool) -> Result<Lookup, Error> {
        let reply = self
            .connection
            .send_command(&command::naming_lookup(name, with_options))
            .await?;

        parse_lookup_reply(&reply, name)
    }

    /// Create a `STREAM` session bound to this connection.
    pub async fn stream_session(self) -> Result<StreamSession, Error> {
        StreamSession::from_sam(self).await
    }

    /// Create a `DATAGRAM` session bound to this connection.
    pub async fn datagram_session(self) -> Result<DatagramSession, Error> {
        DatagramSession::from_sam(self).await
    }

    /// Create a `DATAGRAM3` session bound to this connection.
    pub async fn datagram3_session(self) -> Result<Datagram3Session, Error> {
        Datagram3Session::from_sam(self).await
    }

    /// Create a `RAW` session bound to this connection.
    pub async fn raw_session(self) -> Result<RawSession, Error> {
        RawSession::from_sam(self).await
    }

    /// Create a `PRIMARY` session bound to this connection.
    pub async fn primary_session(self) -> Result<PrimarySession, Error> {
        PrimarySession::from_sam(self).await
    }

    /// Issue `SESSION CREATE` for `style` with `extra_options` appended.
    ///
    /// Keys are minted first when the config carries none. The returned
    /// parts wrap the same TCP socket that performed the handshake and the
    /// create; it must not be reused for a second create.
    pub(crate) async fn create_session(
        mut self,
        style: SessionStyle,
        extra_options: Vec<String>,
    ) -> Result<SessionParts, Error> {
        self.config.style = style;

        let keys = match self.config.destination_keys.clone() {
            Some(keys) => keys,
            None => self.ensure_keyfile(None).await?,
        };

        // duplicate keys resolve last-wins, an explicit signature type
        // overrides any SIGNATURE_TYPE token smuggled in through the extras
        let sig_type =
            self.config.sig_type.map(|sig_type| sig_type.to_string()).unwrap_or_default();
        let mut options = self.config.tunnel_options();
        options.extend(extra_options);
        let options = validate::resolve_sigtype_conflict(
            &sig_type,
            validate::dedupe_options(&options),
        );

        let create = command::session_create(&mut self.config, &options);
        let reply = self.connection.send_command(&create).await?;

        if !reply.is("SESSION", "STATUS") {
            return Err(Error::Protocol(format!(
                "unexpected reply to SESSION CREATE: {} {}",
                reply.verb, reply.noun
            )));
        }
        reply.classify()?;

        // the bridge echoes the keys it actually bound the session to
        match reply.value_of("DESTINATION") {
            Some(destination) if destination == keys.private_key() => {}
            Some(_) => {
                return Err(Error::Protocol(
                    "bridge bound the session to different keys".to_string(),
                ))
            }
            None => {
                return Err(Error::Parse(
                    "SESSION STATUS is missing DESTINATION".to_string(),
                ))
            }
        }

        tracing::info!(
            target: LOG_TARGET,
            id = %self.config.tunnel_name,
            %style,
            address = %keys.addr().base32(),
            "session created",
        );

        Ok(SessionParts {
            connection: self.connection,
            config: self.config,
            keys,
        })
    }
}

/// Open a control connection to the bridge named by `config` and perform
/// the version handshake.
///
/// Every connection to the bridge starts this way, whether it carries the
/// session itself or a single data command. On failure the socket is
/// dropped.
pub(crate) async fn open_control(config: &SessionConfig) -> Result<SamConnection, Error> {
    let mut connection = SamConnection::connect(&config.sam_address()).await?;

    let hello = command::hello(
        &config.sam_min,
        &config.sam_max,
        config.user.as_deref(),
        config.password.as_deref(),
    );
    let reply = connection.send_command(&hello).await?;

    if !reply.is("HELLO", "REPLY") {
        return Err(Error::Protocol(format!(
            "unexpected reply to HELLO: {} {}",
            reply.verb, reply.noun
        )));
    }

    match reply.result() {
        Some("OK") => {
            tracing::debug!(
                target: LOG_TARGET,
                version = ?reply.value_of("VERSION"),
                "handshaked with bridge",
            );

            Ok(connection)
        }
        Some("NOVERSION") => Err(Error::UnsupportedVersion),
        _ => Err(Error::Protocol(format!(
            "unexpected HELLO result: {:?}",
            reply.result()
        ))),
    }
}

/// Pieces a style wrapper is built from after `SESSION CREATE` succeeded.
#[derive(Debug)]
pub(crate) struct SessionParts {
    /// Control socket the session is bound to.
    pub connection: SamConnection,

    /// Frozen configuration.
    pub config: SessionConfig,

    /// Keys the session is bound to.
    pub keys: DestinationKeys,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{io::AsyncWriteExt as _, net::TcpListener};

    /// Bridge double that answers the handshake with `hello_reply` and every
    /// following command with `replies`.
    async fn fake_bridge(hello_reply: &'static str, replies: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = vec![0u8; 4096];

            let _ = stream.read(&mut buffer).await.unwrap();
            stream.write_all(hello_reply.as_bytes()).await.unwrap();

            for reply in replies {
                let nread = stream.read(&mut buffer).await.unwrap();
                if nread == 0 {
                    break;
                }
                stream.write_all(reply.as_bytes()).await.unwrap();
            }

            // keep the control socket open so the session outlives the loop
            std::future::pending::<()>().await;
        });

        address
    }

    #[tokio::test]
    async fn handshake_ok() {
        let address = fake_bridge("HELLO REPLY RESULT=OK VERSION=3.3\n", vec![]).await;

        let sam = Sam::connect(&address).await.unwrap();
        assert_eq!(sam.config().sam_address(), address);
    }

    #[tokio::test]
    async fn handshake_noversion() {
        let address = fake_bridge("HELLO REPLY RESULT=NOVERSION\n", vec![]).await;

        assert!(matches!(
            Sam::connect(&address).await,
            Err(Error::UnsupportedVersion)
        ));
    }

    #[tokio::test]
    async fn handshake_garbage() {
        let address = fake_bridge("SESSION STATUS RESULT=OK\n", vec![]).await;

        assert!(matches!(
            Sam::connect(&address).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn generate_keys_parses_dest_reply() {
        let public = crate::dest::dummy_destination();
        let reply: &'static str = Box::leak(
            format!("DEST REPLY PUB={public} PRIV={public}AAAA\n").into_boxed_str(),
        );
        let address = fake_bridge("HELLO REPLY RESULT=OK VERSION=3.3\n", vec![reply]).await;

        let mut sam = Sam::connect(&address).await.unwrap();
        let keys = sam.generate_keys(None).await.unwrap();

        assert_eq!(keys.addr().base64(), public);
        assert_eq!(keys.private_key(), format!("{public}AAAA"));
    }

    #[tokio::test]
    async fn generate_keys_rejects_unknown_tokens() {
        let address = fake_bridge(
            "HELLO REPLY RESULT=OK VERSION=3.3\n",
            vec!["DEST REPLY FOO=bar\n"],
        )
        .await;

        let mut sam = Sam::connect(&address).await.unwrap();

        assert!(matches!(
            sam.generate_keys(None).await,
            Err(Error::Parse(_))
        ));
    }

    #[tokio::test]
    async fn create_session_verifies_destination_echo() {
        let public = crate::dest::dummy_destination();
        let destination = Destination::parse(&public).unwrap();
        let keys = DestinationKeys::new(destination, format!("{public}AAAA"));

        let reply: &'static str = Box::leak(
            format!("SESSION STATUS RESULT=OK DESTINATION={public}AAAA\n").into_boxed_str(),
        );
        let address = fake_bridge("HELLO REPLY RESULT=OK VERSION=3.3\n", vec![reply]).await;

        let sam = Sam::connect_with(
            SessionConfig::new()
                .with_sam_address(&address)
                .with_destination_keys(keys.clone()),
        )
        .await
        .unwrap();

        let parts = sam.create_session(SessionStyle::Stream, vec![]).await.unwrap();
        assert_eq!(parts.keys, keys);
        assert_eq!(parts.config.style, SessionStyle::Stream);
    }

    /// Bridge double that also captures the `SESSION CREATE` line.
    async fn capturing_bridge() -> (String, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let private_key = format!("{}AAAA", crate::dest::dummy_destination());
        let (create_tx, create_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = vec![0u8; 8192];

            let _ = stream.read(&mut buffer).await.unwrap();
            stream
                .write_all(b"HELLO REPLY RESULT=OK VERSION=3.3\n")
                .await
                .unwrap();

            let nread = stream.read(&mut buffer).await.unwrap();
            let _ = create_tx.send(String::from_utf8_lossy(&buffer[..nread]).to_string());
            stream
                .write_all(
                    format!("SESSION STATUS RESULT=OK DESTINATION={private_key}\n").as_bytes(),
                )
                .await
                .unwrap();

            std::future::pending::<()>().await;
        });

        (address, create_rx)
    }

    #[tokio::test]
    async fn create_session_cleans_duplicates_and_sigtype_conflicts() {
        let public = crate::dest::dummy_destination();
        let keys = DestinationKeys::new(
            Destination::parse(&public).unwrap(),
            format!("{public}AAAA"),
        );
        let (address, create_rx) = capturing_bridge().await;

        let sam = Sam::connect_with(
            SessionConfig::new()
                .with_sam_address(&address)
                .with_sig_type(crate::config::SigType::EcdsaSha256P256)
                .with_destination_keys(keys),
        )
        .await
        .unwrap();

        let extras = [
            "i2cp.leaseSetEncType=4",
            "inbound.length=2",
            "SIGNATURE_TYPE=DSA_SHA1",
            "i2cp.leaseSetEncType=4,0",
            "outbound.quantity=3",
            "SIGNATURE_TYPE=EdDSA_SHA512_Ed25519",
        ]
        .iter()
        .map(|opt| opt.to_string())
        .collect();

        sam.create_session(SessionStyle::Primary, extras).await.unwrap();

        let create = create_rx.await.unwrap();
        let tokens = create.split_whitespace().collect::<Vec<_>>();

        // the explicit signature type wins, exactly once
        assert_eq!(
            tokens.iter().filter(|t| t.starts_with("SIGNATURE_TYPE=")).count(),
            1
        );
        assert!(tokens.contains(&"SIGNATURE_TYPE=ECDSA_SHA256_P256"));

        // duplicate lease-set encryption types resolve last-wins
        assert_eq!(
            tokens.iter().filter(|t| t.starts_with("i2cp.leaseSetEncType=")).count(),
            1
        );
        assert!(tokens.contains(&"i2cp.leaseSetEncType=4,0"));

        assert!(tokens.contains(&"inbound.length=2"));
        assert!(tokens.contains(&"outbound.quantity=3"));
    }

    #[tokio::test]
    async fn create_session_rejects_foreign_destination_echo() {
        let public = crate::dest::dummy_destination();
        let keys = DestinationKeys::new(
            Destination::parse(&public).unwrap(),
            format!("{public}AAAA"),
        );

        let address = fake_bridge(
            "HELLO REPLY RESULT=OK VERSION=3.3\n",
            vec!["SESSION STATUS RESULT=OK DESTINATION=somethingelse\n"],
        )
        .await;

        let sam = Sam::connect_with(
            SessionConfig::new()
                .with_sam_address(&address)
                .with_destination_keys(keys),
        )
        .await
        .unwrap();

        assert!(matches!(
            sam.create_session(SessionStyle::Stream, vec![]).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn create_session_maps_duplicate_id() {
        let public = crate::dest::dummy_destination();
        let keys = DestinationKeys::new(
            Destination::parse(&public).unwrap(),
            format!("{public}AAAA"),
        );

        let address = fake_bridge(
            "HELLO REPLY RESULT=OK VERSION=3.3\n",
            vec!["SESSION STATUS RESULT=DUPLICATED_ID\n"],
        )
        .await;

        let sam = Sam::connect_with(
            SessionConfig::new()
                .with_sam_address(&address)
                .with_destination_keys(keys),
        )
        .await
        .unwrap();

        assert!(matches!(
            sam.create_session(SessionStyle::Stream, vec![]).await,
            Err(Error::DuplicateId)
        ));
    }

    #[tokio::test]
    async fn create_session_preserves_router_message() {
        let public = crate::dest::dummy_destination();
        let keys = DestinationKeys::new(
            Destination::parse(&public).unwrap(),
            format!("{public}AAAA"),
        );

        let address = fake_bridge(
            "HELLO REPLY RESULT=OK VERSION=3.3\n",
            vec!["SESSION STATUS RESULT=I2P_ERROR MESSAGE=tunnel build failure\n"],
        )
        .await;

        let sam = Sam::connect_with(
            SessionConfig::new()
                .with_sam_address(&address)
                .with_destination_keys(keys),
        )
        .await
        .unwrap();

        match sam.create_session(SessionStyle::Stream, vec![]).await {
            Err(Error::Router(message)) => assert_eq!(message, "tunnel build failure"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
