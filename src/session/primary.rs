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

//! `PRIMARY` sessions.
//!
//! A primary session owns one destination and tunnel pool; subsessions of
//! any other style are multiplexed under it with `SESSION ADD`/`REMOVE` and
//! routed by port. Only those two commands ever run on the primary's control
//! socket; each subsession gets a dedicated, handshake-only control
//! connection for its data operations plus its own UDP socket where the
//! style needs one.

use rand::Rng;
use tokio::{
    net::UdpSocket,
    sync::{Mutex, RwLock},
};

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    config::{SessionConfig, SessionStyle},
    dest::{Destination, DestinationKeys},
    error::Error,
    proto::{command, validate},
    sam::{open_control, Sam, SamConnection, SessionParts},
    session::{
        datagram::{Datagram3Session, DatagramSession},
        raw::RawSession,
        stream::StreamSession,
    },
};

/// Logging target for the file.
const LOG_TARGET: &str = "shasta::session::primary";

/// First port of the auto-allocation range.
const AUTO_PORT_FIRST: u16 = 49152;

/// Last port of the auto-allocation range.
const AUTO_PORT_LAST: u16 = 65535;

/// How many allocation attempts are made before giving up.
const AUTO_PORT_ATTEMPTS: usize = 1000;

/// A registered subsession and the resources the registry tracks for it.
enum Subsession {
    Stream {
        session: StreamSession,
        /// `FROM_PORT` reserved in `used_ports`.
        port: u16,
    },
    Datagram(DatagramSession),
    Datagram3(Datagram3Session),
    Raw(RawSession),
}

impl Subsession {
    /// Close the wrapper's own resources. Never touches the primary's.
    async fn close(&self) {
        match self {
            Subsession::Stream { session, .. } => session.close().await,
            Subsession::Datagram(session) => session.close().await,
            Subsession::Datagram3(session) => session.close().await,
            Subsession::Raw(session) => session.close().await,
        }
    }
}

/// Registry of subsessions, guarded by the primary's lock.
struct Registry {
    /// Whether the primary has been closed.
    closed: bool,

    /// Registered subsessions by id.
    subsessions: HashMap<String, Subsession>,

    /// `FROM_PORT`s reserved by stream subsessions.
    used_ports: HashSet<u16>,

    /// Cursor for automatic port allocation.
    next_auto_port: u16,
}

impl Registry {
    /// Reserve the next free port in the dynamic range.
    fn allocate_port(&mut self) -> Result<u16, Error> {
        for _ in 0..AUTO_PORT_ATTEMPTS {
            let port = self.next_auto_port;
            self.next_auto_port = match port {
                AUTO_PORT_LAST.. => AUTO_PORT_FIRST,
                port => port + 1,
            };

            if self.used_ports.insert(port) {
                return Ok(port);
            }
        }

        Err(Error::Config(
            "no free port in the subsession port range".to_string(),
        ))
    }
}

/// Shared state of a primary session.
struct PrimaryInner {
    /// Frozen configuration, carries the primary's id.
    config: SessionConfig,

    /// Keys every subsession shares.
    keys: DestinationKeys,

    /// Control socket, `SESSION ADD`/`REMOVE` only. `None` once closed.
    control: Mutex<Option<SamConnection>>,

    /// Subsession registry.
    registry: RwLock<Registry>,
}

/// `PRIMARY` session.
///
/// Cheap to clone; all clones share the same bridge-side session.
///
/// ```rust,no_run
/// use shasta::Sam;
///
/// #[tokio::main]
/// async fn main() -> shasta::Result<()> {
///     let primary = Sam::connect("127.0.0.1:7656").await?.primary_session().await?;
///
///     // both subsessions answer under the same destination
///     let streams = primary.add_stream_subsession("web", Vec::new()).await?;
///     let datagrams = primary.add_datagram_subsession("ping", Vec::new()).await?;
///
///     primary.close().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct PrimarySession {
    inner: Arc<PrimaryInner>,
}

impl PrimarySession {
    /// Create a primary session from a handshaked bridge connection.
    pub(crate) async fn from_sam(sam: Sam) -> Result<Self, Error> {
        let SessionParts {
            connection,
            config,
            keys,
        } = sam.create_session(SessionStyle::Primary, Vec::new()).await?;

        Ok(Self {
            inner: Arc::new(PrimaryInner {
                config,
                keys,
                control: Mutex::new(Some(connection)),
                registry: RwLock::new(Registry {
                    closed: false,
                    subsessions: HashMap::new(),
                    used_ports: HashSet::new(),
                    next_auto_port: AUTO_PORT_FIRST,
                }),
            }),
        })
    }

    /// Session id of the primary.
    pub fn id(&self) -> &str {
        &self.inner.config.tunnel_name
    }

    /// Destination shared by the primary and every subsession.
    pub fn destination(&self) -> &Destination {
        self.inner.keys.addr()
    }

    /// Number of registered subsessions.
    pub async fn subsession_count(&self) -> usize {
        self.inner.registry.read().await.subsessions.len()
    }

    /// Ids of the registered subsessions, in no particular order.
    pub async fn subsession_ids(&self) -> Vec<String> {
        self.inner.registry.read().await.subsessions.keys().cloned().collect()
    }

    /// Add a `STREAM` subsession.
    ///
    /// A `FROM_PORT`/`LISTEN_PORT` option reserves that port; without one a
    /// port is allocated from the dynamic range and appended as `FROM_PORT`.
    pub async fn add_stream_subsession(
        &self,
        id: &str,
        options: Vec<String>,
    ) -> Result<StreamSession, Error> {
        let mut registry = self.inner.registry.write().await;
        self.check_open(&registry, id)?;

        let mut options = options;
        let port = match explicit_listen_port(&options)? {
            Some(port) => {
                if !registry.used_ports.insert(port) {
                    return Err(Error::Config(format!("port {port} already in use")));
                }
                port
            }
            None => {
                let port = registry.allocate_port()?;
                options.push(format!("FROM_PORT={port}"));
                port
            }
        };

        let options = validate::scrub_subsession_options(&options);

        let control = match self
            .establish_subsession(&mut registry, SessionStyle::Stream, id, &options)
            .await
        {
            Ok(control) => control,
            Err(error) => {
                registry.used_ports.remove(&port);
                return Err(error);
            }
        };

        let mut config = self.subsession_config(id);
        config.from_port = port.to_string();

        let session = StreamSession::from_subsession(control, config, self.inner.keys.clone());
        registry.subsessions.insert(
            id.to_string(),
            Subsession::Stream {
                session: session.clone(),
                port,
            },
        );

        Ok(session)
    }

    /// Add a `STREAM` subsession under a unique generated id.
    pub async fn new_unique_stream_subsession(
        &self,
        prefix: &str,
    ) -> Result<StreamSession, Error> {
        let id = {
            let registry = self.inner.registry.read().await;
            let mut rng = rand::thread_rng();

            loop {
                let id = format!("{prefix}-{}", rng.gen_range(1000..9999));
                if !registry.subsessions.contains_key(&id) {
                    break id;
                }
            }
        };

        self.add_stream_subsession(&id, Vec::new()).await
    }

    /// Add a `DATAGRAM` subsession.
    pub async fn add_datagram_subsession(
        &self,
        id: &str,
        options: Vec<String>,
    ) -> Result<DatagramSession, Error> {
        let mut registry = self.inner.registry.write().await;

        let (control, socket) = self
            .add_forwarded_subsession(&mut registry, SessionStyle::Datagram, id, options)
            .await?;

        let session = DatagramSession::from_subsession(
            control,
            self.subsession_config(id),
            self.inner.keys.clone(),
            socket,
        );
        registry
            .subsessions
            .insert(id.to_string(), Subsession::Datagram(session.clone()));

        Ok(session)
    }

    /// Add a `DATAGRAM3` subsession.
    pub async fn add_datagram3_subsession(
        &self,
        id: &str,
        options: Vec<String>,
    ) -> Result<Datagram3Session, Error> {
        let mut registry = self.inner.registry.write().await;

        let (control, socket) = self
            .add_forwarded_subsession(&mut registry, SessionStyle::Datagram3, id, options)
            .await?;

        let session = Datagram3Session::from_subsession(
            control,
            self.subsession_config(id),
            self.inner.keys.clone(),
            socket,
        );
        registry
            .subsessions
            .insert(id.to_string(), Subsession::Datagram3(session.clone()));

        Ok(session)
    }

    /// Add a `RAW` subsession.
    pub async fn add_raw_subsession(
        &self,
        id: &str,
        mut options: Vec<String>,
    ) -> Result<RawSession, Error> {
        if !options.iter().any(|option| option.starts_with("HEADER=")) {
            options.push("HEADER=true".to_string());
        }

        let mut registry = self.inner.registry.write().await;

        let (control, socket) = self
            .add_forwarded_subsession(&mut registry, SessionStyle::Raw, id, options)
            .await?;

        let session = RawSession::from_subsession(
            control,
            self.subsession_config(id),
            self.inner.keys.clone(),
            socket,
        );
        registry
            .subsessions
            .insert(id.to_string(), Subsession::Raw(session.clone()));

        Ok(session)
    }

    /// Remove the subsession registered as `id`.
    ///
    /// Closes the wrapper's resources, releases its ports, and tells the
    /// bridge to drop the subsession.
    pub async fn remove_subsession(&self, id: &str) -> Result<(), Error> {
        let mut registry = self.inner.registry.write().await;

        if registry.closed {
            return Err(Error::Closed);
        }

        let subsession = registry
            .subsessions
            .remove(id)
            .ok_or_else(|| Error::Config(format!("unknown subsession `{id}`")))?;

        subsession.close().await;
        if let Subsession::Stream { port, .. } = subsession {
            registry.used_ports.remove(&port);
        }

        let removed = self.session_remove(id).await;
        if matches!(removed, Err(Error::Transport(_))) {
            self.mark_closed(&mut registry).await;
        }

        tracing::info!(
            target: LOG_TARGET,
            primary = %self.inner.config.tunnel_name,
            subsession = %id,
            "subsession removed",
        );

        removed
    }

    /// Close the primary.
    ///
    /// Cascades through every registered subsession, releases all reserved
    /// ports, then closes the primary's own control socket. Idempotent.
    pub async fn close(&self) {
        let mut registry = self.inner.registry.write().await;

        if registry.closed {
            return;
        }

        let subsessions = std::mem::take(&mut registry.subsessions);
        for (id, subsession) in &subsessions {
            tracing::debug!(
                target: LOG_TARGET,
                primary = %self.inner.config.tunnel_name,
                subsession = %id,
                "closing subsession",
            );

            subsession.close().await;
        }
        registry.used_ports.clear();

        self.mark_closed(&mut registry).await;

        tracing::info!(
            target: LOG_TARGET,
            id = %self.inner.config.tunnel_name,
            subsessions = subsessions.len(),
            "primary session closed",
        );
    }

    /// Reject operations on a closed primary or a duplicate id.
    fn check_open(&self, registry: &Registry, id: &str) -> Result<(), Error> {
        if registry.closed {
            return Err(Error::Closed);
        }
        if registry.subsessions.contains_key(id) {
            return Err(Error::DuplicateId);
        }

        Ok(())
    }

    /// Shared head of the datagram-style add paths: bind the forwarding
    /// socket, rewrite the options, register with the bridge, and open the
    /// dedicated control connection. The caller holds the registry lock and
    /// inserts the wrapper.
    async fn add_forwarded_subsession(
        &self,
        registry: &mut Registry,
        style: SessionStyle,
        id: &str,
        options: Vec<String>,
    ) -> Result<(SamConnection, Arc<UdpSocket>), Error> {
        self.check_open(registry, id)?;

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let udp_port = socket.local_addr()?.port();

        let options = validate::ensure_port_parameter(validate::ensure_forwarding_params(
            options, udp_port,
        ));
        let options = validate::scrub_subsession_options(&options);

        let control = self.establish_subsession(registry, style, id, &options).await?;

        Ok((control, socket))
    }

    /// Register `id` with the bridge and open its dedicated control
    /// connection, undoing the registration when the connection fails.
    async fn establish_subsession(
        &self,
        registry: &mut Registry,
        style: SessionStyle,
        id: &str,
        options: &[String],
    ) -> Result<SamConnection, Error> {
        if let Err(error) = self.session_add(style, id, options).await {
            if matches!(error, Error::Transport(_)) {
                self.mark_closed(registry).await;
            }
            return Err(error);
        }

        // the subsession is registered bridge-side; a dead data connection
        // makes it unusable, so unregister it again best-effort
        match open_control(&self.inner.config).await {
            Ok(control) => {
                tracing::info!(
                    target: LOG_TARGET,
                    primary = %self.inner.config.tunnel_name,
                    subsession = %id,
                    %style,
                    "subsession added",
                );

                Ok(control)
            }
            Err(error) => {
                let _ = self.session_remove(id).await;
                Err(error)
            }
        }
    }

    /// Issue `SESSION ADD` on the primary's control socket.
    async fn session_add(
        &self,
        style: SessionStyle,
        id: &str,
        options: &[String],
    ) -> Result<(), Error> {
        let mut guard = self.inner.control.lock().await;
        let control = guard.as_mut().ok_or(Error::Closed)?;

        let reply = control.send_command(&command::session_add(style, id, options)).await?;

        if !reply.is("SESSION", "STATUS") {
            return Err(Error::Protocol(format!(
                "unexpected reply to SESSION ADD: {} {}",
                reply.verb, reply.noun
            )));
        }

        reply.classify()
    }

    /// Issue `SESSION REMOVE` on the primary's control socket.
    async fn session_remove(&self, id: &str) -> Result<(), Error> {
        let mut guard = self.inner.control.lock().await;
        let control = guard.as_mut().ok_or(Error::Closed)?;

        let reply = control.send_command(&command::session_remove(id)).await?;

        if !reply.is("SESSION", "STATUS") {
            return Err(Error::Protocol(format!(
                "unexpected reply to SESSION REMOVE: {} {}",
                reply.verb, reply.noun
            )));
        }

        reply.classify()
    }

    /// Mark the primary closed and drop its control socket.
    async fn mark_closed(&self, registry: &mut Registry) {
        registry.closed = true;
        *self.inner.control.lock().await = None;
    }

    /// Config for a subsession: the primary's, renamed.
    fn subsession_config(&self, id: &str) -> SessionConfig {
        let mut config = self.inner.config.clone();
        config.tunnel_name = id.to_string();
        config
    }
}

/// Extract an explicit `FROM_PORT`/`LISTEN_PORT` option value.
fn explicit_listen_port(options: &[String]) -> Result<Option<u16>, Error> {
    for option in options {
        let Some((key, value)) = option.split_once('=') else {
            continue;
        };

        if key == "FROM_PORT" || key == "LISTEN_PORT" {
            let port = value
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid port `{value}`")))?;

            if port == 0 {
                return Ok(None);
            }
            return Ok(Some(port));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dest::dummy_destination;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::mpsc,
    };

    /// Bridge double for a primary session.
    ///
    /// The first connection is handshaked and answers `SESSION CREATE`, then
    /// every further command on it (`SESSION ADD`/`REMOVE`) with
    /// `SESSION STATUS RESULT=OK`. Additional connections are handshaked and
    /// parked. Every received command line is echoed into the channel.
    async fn fake_bridge() -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let private_key = format!("{}AAAA", dummy_destination());
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut first = true;
            let mut parked = Vec::new();

            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buffer = vec![0u8; 4096];

                let _ = stream.read(&mut buffer).await.unwrap();
                stream
                    .write_all(b"HELLO REPLY RESULT=OK VERSION=3.3\n")
                    .await
                    .unwrap();

                if first {
                    first = false;

                    let nread = stream.read(&mut buffer).await.unwrap();
                    let _ = command_tx
                        .send(String::from_utf8_lossy(&buffer[..nread]).to_string());
                    stream
                        .write_all(
                            format!("SESSION STATUS RESULT=OK DESTINATION={private_key}\n")
                                .as_bytes(),
                        )
                        .await
                        .unwrap();

                    // primary control loop: ADD/REMOVE until the socket dies
                    let command_tx = command_tx.clone();
                    tokio::spawn(async move {
                        loop {
                            let Ok(nread) = stream.read(&mut buffer).await else {
                                break;
                            };
                            if nread == 0 {
                                break;
                            }
                            let _ = command_tx
                                .send(String::from_utf8_lossy(&buffer[..nread]).to_string());
                            if stream
                                .write_all(b"SESSION STATUS RESULT=OK\n")
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    });
                } else {
                    parked.push(stream);
                }
            }
        });

        (address, command_rx)
    }

    async fn primary_for(address: &str) -> PrimarySession {
        let keys = DestinationKeys::new(
            Destination::parse(&dummy_destination()).unwrap(),
            format!("{}AAAA", dummy_destination()),
        );

        Sam::connect_with(
            SessionConfig::new()
                .with_sam_address(address)
                .with_tunnel_name("primary")
                .with_destination_keys(keys),
        )
        .await
        .unwrap()
        .primary_session()
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn stream_subsession_allocates_port() {
        let (address, mut commands) = fake_bridge().await;
        let primary = primary_for(&address).await;

        let _create = commands.recv().await.unwrap();

        let session = primary.add_stream_subsession("web", Vec::new()).await.unwrap();
        assert_eq!(session.id(), "web");

        let add = commands.recv().await.unwrap();
        assert!(add.starts_with("SESSION ADD STYLE=STREAM ID=web"));
        assert!(add.contains(&format!("FROM_PORT={AUTO_PORT_FIRST}")));
        assert_eq!(primary.subsession_count().await, 1);
    }

    #[tokio::test]
    async fn add_scrubs_inherited_options() {
        let (address, mut commands) = fake_bridge().await;
        let primary = primary_for(&address).await;

        let _create = commands.recv().await.unwrap();

        primary
            .add_stream_subsession(
                "scrubbed",
                vec![
                    "PORT=7000".to_string(),
                    "SIGNATURE_TYPE=EdDSA_SHA512_Ed25519".to_string(),
                    "DESTINATION=TRANSIENT".to_string(),
                    "i2cp.leaseSetEncType=4,0".to_string(),
                    "inbound.length=2".to_string(),
                    "FROM_PORT=8080".to_string(),
                    "TO_PORT=9090".to_string(),
                ],
            )
            .await
            .unwrap();

        let add = commands.recv().await.unwrap();
        let line = add.trim_end();

        assert!(line.starts_with("SESSION ADD STYLE=STREAM ID=scrubbed"));
        let tail = line
            .strip_prefix("SESSION ADD STYLE=STREAM ID=scrubbed")
            .unwrap()
            .split_whitespace()
            .collect::<Vec<_>>();
        assert_eq!(tail, vec!["PORT=7000", "FROM_PORT=8080", "TO_PORT=9090"]);
    }

    #[tokio::test]
    async fn duplicate_port_is_rejected_without_state_change() {
        let (address, mut commands) = fake_bridge().await;
        let primary = primary_for(&address).await;

        let _create = commands.recv().await.unwrap();

        primary
            .add_stream_subsession("one", vec!["FROM_PORT=50001".to_string()])
            .await
            .unwrap();
        let _add = commands.recv().await.unwrap();

        assert!(matches!(
            primary
                .add_stream_subsession("two", vec!["FROM_PORT=50001".to_string()])
                .await,
            Err(Error::Config(_))
        ));

        // the first reservation is intact, nothing else was reserved
        let registry = primary.inner.registry.read().await;
        assert_eq!(registry.used_ports, HashSet::from([50001]));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let (address, mut commands) = fake_bridge().await;
        let primary = primary_for(&address).await;

        let _create = commands.recv().await.unwrap();

        primary.add_stream_subsession("dup", Vec::new()).await.unwrap();
        let _add = commands.recv().await.unwrap();

        assert!(matches!(
            primary.add_stream_subsession("dup", Vec::new()).await,
            Err(Error::DuplicateId)
        ));
    }

    #[tokio::test]
    async fn datagram_subsession_carries_forwarding_params() {
        let (address, mut commands) = fake_bridge().await;
        let primary = primary_for(&address).await;

        let _create = commands.recv().await.unwrap();

        primary.add_datagram_subsession("dgram", Vec::new()).await.unwrap();

        let add = commands.recv().await.unwrap();
        assert!(add.starts_with("SESSION ADD STYLE=DATAGRAM ID=dgram"));
        assert!(add.contains("PORT="));
        assert!(add.contains("HOST=127.0.0.1"));
    }

    #[tokio::test]
    async fn raw_subsession_requests_header() {
        let (address, mut commands) = fake_bridge().await;
        let primary = primary_for(&address).await;

        let _create = commands.recv().await.unwrap();

        primary.add_raw_subsession("raw", Vec::new()).await.unwrap();

        let add = commands.recv().await.unwrap();
        assert!(add.starts_with("SESSION ADD STYLE=RAW ID=raw"));
        assert!(add.contains("HEADER=true"));
    }

    #[tokio::test]
    async fn remove_subsession_releases_port() {
        let (address, mut commands) = fake_bridge().await;
        let primary = primary_for(&address).await;

        let _create = commands.recv().await.unwrap();

        primary
            .add_stream_subsession("gone", vec!["FROM_PORT=50002".to_string()])
            .await
            .unwrap();
        let _add = commands.recv().await.unwrap();

        primary.remove_subsession("gone").await.unwrap();

        let remove = commands.recv().await.unwrap();
        assert!(remove.starts_with("SESSION REMOVE ID=gone"));
        assert_eq!(primary.subsession_count().await, 0);
        assert!(primary.inner.registry.read().await.used_ports.is_empty());

        // the port can be reserved again
        primary
            .add_stream_subsession("again", vec!["FROM_PORT=50002".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unique_stream_subsession_id_shape() {
        let (address, mut commands) = fake_bridge().await;
        let primary = primary_for(&address).await;

        let _create = commands.recv().await.unwrap();

        let session = primary.new_unique_stream_subsession("fwd").await.unwrap();

        let (prefix, suffix) = session.id().split_once('-').unwrap();
        assert_eq!(prefix, "fwd");
        let suffix: u16 = suffix.parse().unwrap();
        assert!((1000..9999).contains(&suffix));
    }

    #[tokio::test]
    async fn close_cascades_and_is_idempotent() {
        let (address, mut commands) = fake_bridge().await;
        let primary = primary_for(&address).await;

        let _create = commands.recv().await.unwrap();

        let stream = primary.add_stream_subsession("a", Vec::new()).await.unwrap();
        let _add = commands.recv().await.unwrap();
        let datagram = primary.add_datagram_subsession("b", Vec::new()).await.unwrap();
        let _add = commands.recv().await.unwrap();

        primary.close().await;
        primary.close().await;

        assert_eq!(primary.subsession_count().await, 0);
        assert!(primary.inner.registry.read().await.used_ports.is_empty());

        // every subsession was closed exactly once and stays closed
        assert!(matches!(
            stream.connect("host.i2p", None).await,
            Err(Error::Closed)
        ));
        assert!(matches!(datagram.recv().await, Err(Error::Closed)));

        // further operations on the primary fail
        assert!(matches!(
            primary.add_stream_subsession("late", Vec::new()).await,
            Err(Error::Closed)
        ));
        assert!(matches!(
            primary.remove_subsession("a").await,
            Err(Error::Closed)
        ));
    }

    #[test]
    fn explicit_listen_port_parsing() {
        let port = |options: &[&str]| {
            explicit_listen_port(&options.iter().map(|o| o.to_string()).collect::<Vec<_>>())
        };

        assert_eq!(port(&["FROM_PORT=50001"]).unwrap(), Some(50001));
        assert_eq!(port(&["LISTEN_PORT=50002"]).unwrap(), Some(50002));
        assert_eq!(port(&["FROM_PORT=0"]).unwrap(), None);
        assert_eq!(port(&["TO_PORT=9"]).unwrap(), None);
        assert!(port(&["FROM_PORT=bogus"]).is_err());
    }

    #[test]
    fn port_allocation_wraps_and_exhausts() {
        let mut registry = Registry {
            closed: false,
            subsessions: HashMap::new(),
            used_ports: HashSet::new(),
            next_auto_port: AUTO_PORT_LAST,
        };

        assert_eq!(registry.allocate_port().unwrap(), AUTO_PORT_LAST);
        // the cursor wrapped around to the start of the range
        assert_eq!(registry.allocate_port().unwrap(), AUTO_PORT_FIRST);

        // fill the whole window the allocator probes
        registry.used_ports = (0..=u16::MAX).collect();
        assert!(matches!(
            registry.allocate_port(),
            Err(Error::Config(_))
        ));
    }
}
