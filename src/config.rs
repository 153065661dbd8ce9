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

//! Session configuration.
//!
//! [`SessionConfig`] models the tunnel, lease-set, and behavior knobs that the
//! SAM bridge passes through to the router as I2CP `KEY=VALUE` options, plus
//! the connection parameters of the bridge itself. The config is built once
//! with the `with_*` methods and frozen when a session is created from it.

use rand::Rng;

use std::{fmt, time::Duration};

use crate::{dest::DestinationKeys, error::Error};

/// Logging target for the file.
const LOG_TARGET: &str = "shasta::config";

/// Default TCP port of the SAM bridge.
pub const SAM_TCP_PORT: u16 = 7656;

/// Default UDP port of the SAM bridge.
pub const SAM_UDP_PORT: u16 = 7655;

/// Lowest SAM version spoken by `shasta`.
pub const SAM_MIN: &str = "3.1";

/// Highest SAM version spoken by `shasta`.
pub const SAM_MAX: &str = "3.3";

/// Lease-set encryption types requested by default, ECIES-X25519 with
/// ElGamal compatibility.
pub const DEFAULT_LEASE_SET_ENC_TYPE: &str = "4,0";

/// Session style carried in `SESSION CREATE STYLE=`/`SESSION ADD STYLE=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStyle {
    /// Reliable virtual streams.
    Stream,

    /// Repliable datagrams, source destination included.
    Datagram,

    /// Repliable datagrams, source carried as a 32-byte hash.
    Datagram3,

    /// Anonymous datagrams, no source.
    Raw,

    /// Primary session multiplexing subsessions of the other styles.
    Primary,
}

impl SessionStyle {
    /// Wire form of the style.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "STREAM",
            Self::Datagram => "DATAGRAM",
            Self::Datagram3 => "DATAGRAM3",
            Self::Raw => "RAW",
            Self::Primary => "PRIMARY",
        }
    }
}

impl fmt::Display for SessionStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signature algorithm of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigType {
    DsaSha1,
    EcdsaSha256P256,
    EcdsaSha384P384,
    EcdsaSha512P521,
    EdDsaSha512Ed25519,
    RedDsaSha512Ed25519,
}

impl SigType {
    /// Wire form of the signature type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DsaSha1 => "DSA_SHA1",
            Self::EcdsaSha256P256 => "ECDSA_SHA256_P256",
            Self::EcdsaSha384P384 => "ECDSA_SHA384_P384",
            Self::EcdsaSha512P521 => "ECDSA_SHA512_P521",
            Self::EdDsaSha512Ed25519 => "EdDSA_SHA512_Ed25519",
            Self::RedDsaSha512Ed25519 => "RedDSA_SHA512_Ed25519",
        }
    }
}

impl Default for SigType {
    fn default() -> Self {
        Self::EdDsaSha512Ed25519
    }
}

impl fmt::Display for SigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access list mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessListKind {
    /// No access list.
    #[default]
    None,

    /// Only the listed destinations may connect.
    Whitelist,

    /// The listed destinations may not connect.
    Blacklist,
}

/// Shape of one tunnel direction.
///
/// Integer knobs with value 0 are not serialized so the router applies its
/// own defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelShape {
    /// Tunnel length in hops.
    pub length: u8,

    /// Random variance added to the length.
    pub length_variance: i8,

    /// Number of parallel tunnels.
    pub quantity: u8,

    /// Number of backup tunnels.
    pub backup_quantity: u8,

    /// Whether a zero-hop tunnel is acceptable.
    pub allow_zero_hop: bool,
}

/// Tunnel and session configuration.
///
/// ```rust
/// use shasta::{SessionConfig, SessionStyle};
///
/// let config = SessionConfig::new()
///     .with_style(SessionStyle::Datagram)
///     .with_inbound_length(2)
///     .with_outbound_length(2);
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Hostname of the SAM bridge.
    pub(crate) sam_host: String,

    /// TCP control port of the SAM bridge.
    pub(crate) sam_port: u16,

    /// UDP datagram port of the SAM bridge.
    pub(crate) sam_udp_port: u16,

    /// Lowest acceptable SAM version.
    pub(crate) sam_min: String,

    /// Highest acceptable SAM version.
    pub(crate) sam_max: String,

    /// Session id, auto-generated when empty at creation time.
    pub(crate) tunnel_name: String,

    /// Session style.
    pub(crate) style: SessionStyle,

    /// `FROM_PORT`, `"0"` means unset.
    pub(crate) from_port: String,

    /// `TO_PORT`, `"0"` means unset.
    pub(crate) to_port: String,

    /// Signature type for destination generation and `SESSION CREATE`.
    pub(crate) sig_type: Option<SigType>,

    /// Destination keys, minted by the bridge when absent.
    pub(crate) destination_keys: Option<DestinationKeys>,

    /// Encrypt the published lease-set.
    pub(crate) encrypt_lease_set: bool,

    /// `i2cp.leaseSetKey`.
    pub(crate) lease_set_key: String,

    /// `i2cp.leaseSetPrivateKey`.
    pub(crate) lease_set_private_key: String,

    /// `i2cp.leaseSetSigningPrivateKey`.
    pub(crate) lease_set_signing_private_key: String,

    /// `i2cp.leaseSetEncType`, comma-separated type numbers.
    pub(crate) lease_set_enc_type: String,

    /// Inbound tunnel shape.
    pub(crate) inbound: TunnelShape,

    /// Outbound tunnel shape.
    pub(crate) outbound: TunnelShape,

    /// `i2cp.fastReceive`.
    pub(crate) fast_receive: bool,

    /// `i2cp.gzip`.
    pub(crate) use_compression: bool,

    /// `i2cp.messageReliability`, empty means router default.
    pub(crate) message_reliability: String,

    /// Reduce tunnel quantity when idle.
    pub(crate) reduce_on_idle: bool,

    /// Idle time before reducing, milliseconds.
    pub(crate) reduce_idle_time: u32,

    /// Tunnel quantity when reduced.
    pub(crate) reduce_idle_quantity: u8,

    /// Close the session when idle.
    pub(crate) close_on_idle: bool,

    /// Idle time before closing, milliseconds.
    pub(crate) close_idle_time: u32,

    /// Access list mode.
    pub(crate) access_list_kind: AccessListKind,

    /// Destinations on the access list.
    pub(crate) access_list: Vec<String>,

    /// SAMv3.2 `USER` credential.
    pub(crate) user: Option<String>,

    /// SAMv3.2 `PASSWORD` credential.
    pub(crate) password: Option<String>,

    /// Timeout applied to datagram sends.
    pub(crate) send_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sam_host: "127.0.0.1".to_string(),
            sam_port: SAM_TCP_PORT,
            sam_udp_port: SAM_UDP_PORT,
            sam_min: SAM_MIN.to_string(),
            sam_max: SAM_MAX.to_string(),
            tunnel_name: String::new(),
            style: SessionStyle::Stream,
            from_port: "0".to_string(),
            to_port: "0".to_string(),
            sig_type: Some(SigType::default()),
            destination_keys: None,
            encrypt_lease_set: false,
            lease_set_key: String::new(),
            lease_set_private_key: String::new(),
            lease_set_signing_private_key: String::new(),
            lease_set_enc_type: DEFAULT_LEASE_SET_ENC_TYPE.to_string(),
            inbound: TunnelShape::default(),
            outbound: TunnelShape::default(),
            fast_receive: false,
            use_compression: false,
            message_reliability: String::new(),
            reduce_on_idle: false,
            reduce_idle_time: 0,
            reduce_idle_quantity: 0,
            close_on_idle: false,
            close_idle_time: 0,
            access_list_kind: AccessListKind::None,
            access_list: Vec::new(),
            user: None,
            password: None,
            send_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    /// Create a config with router defaults for every knob.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the bridge address, `host` or `host:port`.
    ///
    /// A bare `host` leaves the port at 0.
    pub fn with_sam_address(mut self, address: &str) -> Self {
        match address.rsplit_once(':') {
            Some((host, port)) => {
                self.sam_host = host.to_string();
                self.sam_port = port.parse().unwrap_or(0);
            }
            None => {
                self.sam_host = address.to_string();
                self.sam_port = 0;
            }
        }
        self
    }

    /// Override the bridge's UDP datagram port.
    ///
    /// Defaults to `7655`.
    pub fn with_sam_udp_port(mut self, port: u16) -> Self {
        self.sam_udp_port = port;
        self
    }

    /// Override the SAM version range.
    pub fn with_version_range(mut self, min: &str, max: &str) -> Self {
        self.sam_min = min.to_string();
        self.sam_max = max.to_string();
        self
    }

    /// Set the session id. Auto-generated when left empty.
    pub fn with_tunnel_name(mut self, name: &str) -> Self {
        self.tunnel_name = name.to_string();
        self
    }

    /// Set the session style.
    pub fn with_style(mut self, style: SessionStyle) -> Self {
        self.style = style;
        self
    }

    /// Set `FROM_PORT`.
    pub fn with_from_port(mut self, port: u16) -> Self {
        self.from_port = port.to_string();
        self
    }

    /// Set `TO_PORT`.
    pub fn with_to_port(mut self, port: u16) -> Self {
        self.to_port = port.to_string();
        self
    }

    /// Set the signature type.
    pub fn with_sig_type(mut self, sig_type: SigType) -> Self {
        self.sig_type = Some(sig_type);
        self
    }

    /// Use persistent destination keys instead of bridge-minted ones.
    pub fn with_destination_keys(mut self, keys: DestinationKeys) -> Self {
        self.destination_keys = Some(keys);
        self
    }

    /// Encrypt the published lease-set.
    pub fn with_encrypted_lease_set(mut self, key: &str, private_key: &str, signing_key: &str) -> Self {
        self.encrypt_lease_set = true;
        self.lease_set_key = key.to_string();
        self.lease_set_private_key = private_key.to_string();
        self.lease_set_signing_private_key = signing_key.to_string();
        self
    }

    /// Set the lease-set encryption type list.
    ///
    /// Anything that is not a comma-separated list of decimal integers falls
    /// back to the default of `4,0`.
    pub fn with_lease_set_enc_type(mut self, enc_type: &str) -> Self {
        self.lease_set_enc_type = validate_enc_type_list(enc_type);
        self
    }

    /// Set inbound tunnel length.
    pub fn with_inbound_length(mut self, length: u8) -> Self {
        self.inbound.length = length;
        self
    }

    /// Set outbound tunnel length.
    pub fn with_outbound_length(mut self, length: u8) -> Self {
        self.outbound.length = length;
        self
    }

    /// Set the inbound tunnel shape.
    pub fn with_inbound_shape(mut self, shape: TunnelShape) -> Self {
        self.inbound = shape;
        self
    }

    /// Set the outbound tunnel shape.
    pub fn with_outbound_shape(mut self, shape: TunnelShape) -> Self {
        self.outbound = shape;
        self
    }

    /// Enable `i2cp.fastReceive`.
    pub fn with_fast_receive(mut self) -> Self {
        self.fast_receive = true;
        self
    }

    /// Enable `i2cp.gzip`.
    pub fn with_compression(mut self) -> Self {
        self.use_compression = true;
        self
    }

    /// Set `i2cp.messageReliability`.
    pub fn with_message_reliability(mut self, reliability: &str) -> Self {
        self.message_reliability = reliability.to_string();
        self
    }

    /// Reduce tunnel quantity to `quantity` after `idle_time` of inactivity.
    pub fn with_reduce_on_idle(mut self, idle_time: Duration, quantity: u8) -> Self {
        self.reduce_on_idle = true;
        self.reduce_idle_time = idle_time.as_millis() as u32;
        self.reduce_idle_quantity = quantity;
        self
    }

    /// Close the session after `idle_time` of inactivity.
    pub fn with_close_on_idle(mut self, idle_time: Duration) -> Self {
        self.close_on_idle = true;
        self.close_idle_time = idle_time.as_millis() as u32;
        self
    }

    /// Install an access list.
    pub fn with_access_list(mut self, kind: AccessListKind, destinations: Vec<String>) -> Self {
        self.access_list_kind = kind;
        self.access_list = destinations;
        self
    }

    /// Set SAMv3.2 bridge credentials.
    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.user = Some(user.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Set the timeout applied to datagram sends. Zero disables it.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Session id, generating and pinning a random one on first use.
    pub(crate) fn id(&mut self) -> &str {
        if self.tunnel_name.is_empty() {
            self.tunnel_name = random_tunnel_name();

            tracing::debug!(
                target: LOG_TARGET,
                id = %self.tunnel_name,
                "generated session id",
            );
        }

        &self.tunnel_name
    }

    /// Destination keys, if configured.
    pub fn destination_keys(&self) -> Option<&DestinationKeys> {
        self.destination_keys.as_ref()
    }

    /// Bridge control address, `host:port`.
    pub(crate) fn sam_address(&self) -> String {
        format!("{}:{}", self.sam_host, self.sam_port)
    }

    /// Bridge datagram address, `host:7655` unless overridden.
    pub(crate) fn sam_udp_address(&self) -> String {
        format!("{}:{}", self.sam_host, self.sam_udp_port)
    }

    /// Whether the negotiated version range allows SAMv3.1 tokens
    /// (`FROM_PORT`, `TO_PORT`, `SIGNATURE_TYPE`).
    pub(crate) fn supports_v31(&self) -> bool {
        version_at_least(&self.sam_max, 3, 1)
    }

    /// `FROM_PORT=` fragment, empty when the port is unset or the version
    /// range predates SAMv3.1.
    pub(crate) fn from_port_fragment(&self) -> Option<String> {
        (self.supports_v31() && self.from_port != "0")
            .then(|| format!("FROM_PORT={}", self.from_port))
    }

    /// `TO_PORT=` fragment, gated like [`SessionConfig::from_port_fragment()`].
    pub(crate) fn to_port_fragment(&self) -> Option<String> {
        (self.supports_v31() && self.to_port != "0").then(|| format!("TO_PORT={}", self.to_port))
    }

    /// `SIGNATURE_TYPE=` fragment, gated on SAMv3.1.
    pub(crate) fn sig_type_fragment(&self) -> Option<String> {
        match (self.supports_v31(), self.sig_type) {
            (true, Some(sig_type)) => Some(format!("SIGNATURE_TYPE={sig_type}")),
            _ => None,
        }
    }

    /// `DESTINATION=` fragment, transient when no keys are configured.
    pub(crate) fn destination_fragment(&self) -> String {
        match &self.destination_keys {
            Some(keys) => format!("DESTINATION={}", keys.private_key()),
            None => "DESTINATION=TRANSIENT".to_string(),
        }
    }

    /// Serialize the I2CP option surface into `KEY=VALUE` tokens.
    ///
    /// Tokens are emitted in four groups: tunnel shape, connection behavior,
    /// lease-set, access list. Knobs at their zero value are omitted so the
    /// router applies its own defaults.
    pub fn tunnel_options(&self) -> Vec<String> {
        let mut opts = Vec::new();

        // tunnel shape
        push_nonzero(&mut opts, "inbound.length", self.inbound.length as i64);
        push_nonzero(&mut opts, "outbound.length", self.outbound.length as i64);
        push_nonzero(
            &mut opts,
            "inbound.lengthVariance",
            self.inbound.length_variance as i64,
        );
        push_nonzero(
            &mut opts,
            "outbound.lengthVariance",
            self.outbound.length_variance as i64,
        );
        push_nonzero(
            &mut opts,
            "inbound.backupQuantity",
            self.inbound.backup_quantity as i64,
        );
        push_nonzero(
            &mut opts,
            "outbound.backupQuantity",
            self.outbound.backup_quantity as i64,
        );
        push_nonzero(&mut opts, "inbound.quantity", self.inbound.quantity as i64);
        push_nonzero(&mut opts, "outbound.quantity", self.outbound.quantity as i64);

        // connection behavior
        if self.inbound.allow_zero_hop {
            opts.push("inbound.allowZeroHop=true".to_string());
        }
        if self.outbound.allow_zero_hop {
            opts.push("outbound.allowZeroHop=true".to_string());
        }
        if self.use_compression {
            opts.push("i2cp.gzip=true".to_string());
        }
        if self.fast_receive {
            opts.push("i2cp.fastReceive=true".to_string());
        }
        if self.reduce_on_idle {
            opts.push("i2cp.reduceOnIdle=true".to_string());
            push_nonzero(&mut opts, "i2cp.reduceIdleTime", self.reduce_idle_time as i64);
            push_nonzero(
                &mut opts,
                "i2cp.reduceQuantity",
                self.reduce_idle_quantity as i64,
            );
        }
        if self.close_on_idle {
            opts.push("i2cp.closeOnIdle=true".to_string());
            push_nonzero(&mut opts, "i2cp.closeIdleTime", self.close_idle_time as i64);
        }
        if !self.message_reliability.is_empty() {
            opts.push(format!(
                "i2cp.messageReliability={}",
                self.message_reliability
            ));
        }

        // lease-set
        if self.encrypt_lease_set {
            opts.push("i2cp.encryptLeaseSet=true".to_string());
        }
        if !self.lease_set_key.is_empty() {
            opts.push(format!("i2cp.leaseSetKey={}", self.lease_set_key));
        }
        if !self.lease_set_private_key.is_empty() {
            opts.push(format!(
                "i2cp.leaseSetPrivateKey={}",
                self.lease_set_private_key
            ));
        }
        if !self.lease_set_signing_private_key.is_empty() {
            opts.push(format!(
                "i2cp.leaseSetSigningPrivateKey={}",
                self.lease_set_signing_private_key
            ));
        }
        opts.push(format!(
            "i2cp.leaseSetEncType={}",
            validate_enc_type_list(&self.lease_set_enc_type)
        ));

        // access list
        match self.access_list_kind {
            AccessListKind::Whitelist => opts.push("i2cp.enableAccessList=true".to_string()),
            AccessListKind::Blacklist => opts.push("i2cp.enableBlackList=true".to_string()),
            AccessListKind::None => {}
        }
        if !self.access_list.is_empty() {
            opts.push(format!("i2cp.accessList={}", self.access_list.join(",")));
        }

        opts
    }

    /// Apply a single `KEY=VALUE` token back onto the config.
    ///
    /// Inverse of [`SessionConfig::tunnel_options()`], used to reload a
    /// serialized option list. Unknown keys are left untouched and reported
    /// as `false`.
    pub fn apply_option(&mut self, key: &str, value: &str) -> bool {
        let as_u8 = || value.parse::<u8>().unwrap_or(0);
        let as_i8 = || value.parse::<i8>().unwrap_or(0);
        let as_u32 = || value.parse::<u32>().unwrap_or(0);
        let as_bool = || value == "true";

        match key {
            "inbound.length" => self.inbound.length = as_u8(),
            "outbound.length" => self.outbound.length = as_u8(),
            "inbound.lengthVariance" => self.inbound.length_variance = as_i8(),
            "outbound.lengthVariance" => self.outbound.length_variance = as_i8(),
            "inbound.backupQuantity" => self.inbound.backup_quantity = as_u8(),
            "outbound.backupQuantity" => self.outbound.backup_quantity = as_u8(),
            "inbound.quantity" => self.inbound.quantity = as_u8(),
            "outbound.quantity" => self.outbound.quantity = as_u8(),
            "inbound.allowZeroHop" => self.inbound.allow_zero_hop = as_bool(),
            "outbound.allowZeroHop" => self.outbound.allow_zero_hop = as_bool(),
            "i2cp.gzip" => self.use_compression = as_bool(),
            "i2cp.fastReceive" => self.fast_receive = as_bool(),
            "i2cp.reduceOnIdle" => self.reduce_on_idle = as_bool(),
            "i2cp.reduceIdleTime" => self.reduce_idle_time = as_u32(),
            "i2cp.reduceQuantity" => self.reduce_idle_quantity = as_u8(),
            "i2cp.closeOnIdle" => self.close_on_idle = as_bool(),
            "i2cp.closeIdleTime" => self.close_idle_time = as_u32(),
            "i2cp.messageReliability" => self.message_reliability = value.to_string(),
            "i2cp.encryptLeaseSet" => self.encrypt_lease_set = as_bool(),
            "i2cp.leaseSetKey" => self.lease_set_key = value.to_string(),
            "i2cp.leaseSetPrivateKey" => self.lease_set_private_key = value.to_string(),
            "i2cp.leaseSetSigningPrivateKey" => {
                self.lease_set_signing_private_key = value.to_string()
            }
            "i2cp.leaseSetEncType" => self.lease_set_enc_type = validate_enc_type_list(value),
            "i2cp.enableAccessList" => self.access_list_kind = AccessListKind::Whitelist,
            "i2cp.enableBlackList" => self.access_list_kind = AccessListKind::Blacklist,
            "i2cp.accessList" => {
                self.access_list = value.split(',').map(str::to_string).collect()
            }
            _ => return false,
        }

        true
    }
}

/// Append `key=value` when `value` is non-zero.
fn push_nonzero(opts: &mut Vec<String>, key: &str, value: i64) {
    if value != 0 {
        opts.push(format!("{key}={value}"));
    }
}

/// Validate a comma-separated list of decimal lease-set encryption types,
/// falling back to [`DEFAULT_LEASE_SET_ENC_TYPE`] on malformed input.
pub(crate) fn validate_enc_type_list(list: &str) -> String {
    let valid = !list.is_empty()
        && list.split(',').all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()));

    if valid {
        list.to_string()
    } else {
        tracing::warn!(
            target: LOG_TARGET,
            ?list,
            "malformed lease-set encryption type list, using default",
        );

        DEFAULT_LEASE_SET_ENC_TYPE.to_string()
    }
}

/// Generate a random 12-letter session id.
pub(crate) fn random_tunnel_name() -> String {
    let mut rng = rand::thread_rng();

    (0..12).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

/// `ver` parsed as `major.minor` is at least `major.minor`.
fn version_at_least(ver: &str, major: u32, minor: u32) -> bool {
    let mut parts = ver.split('.');
    let parsed_major = parts.next().and_then(|p| p.parse::<u32>().ok()).unwrap_or(0);
    let parsed_minor = parts.next().and_then(|p| p.parse::<u32>().ok()).unwrap_or(0);

    (parsed_major, parsed_minor) >= (major, minor)
}

/// Find a port on which both a TCP and a UDP socket can be bound on loopback.
///
/// Probes random ports in `10000..65534` and gives up after 30 attempts.
pub fn free_port_pair() -> Result<u16, Error> {
    let mut rng = rand::thread_rng();

    for _ in 0..30 {
        let port = rng.gen_range(10000u16..65534);

        let tcp = std::net::TcpListener::bind(("127.0.0.1", port));
        let udp = std::net::UdpSocket::bind(("127.0.0.1", port));

        if tcp.is_ok() && udp.is_ok() {
            return Ok(port);
        }
    }

    Err(Error::Config(
        "unable to find a pair of available tcp and udp ports".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_carry_only_enc_type() {
        let opts = SessionConfig::new().tunnel_options();

        assert_eq!(opts, vec!["i2cp.leaseSetEncType=4,0".to_string()]);
    }

    #[test]
    fn zero_knobs_are_omitted() {
        let opts = SessionConfig::new()
            .with_inbound_length(3)
            .with_outbound_length(0)
            .tunnel_options();

        assert!(opts.contains(&"inbound.length=3".to_string()));
        assert!(!opts.iter().any(|opt| opt.starts_with("outbound.length=")));
    }

    #[test]
    fn option_groups_are_ordered() {
        let opts = SessionConfig::new()
            .with_inbound_length(2)
            .with_compression()
            .with_encrypted_lease_set("k", "pk", "spk")
            .with_access_list(AccessListKind::Blacklist, vec!["abc.b32.i2p".to_string()])
            .tunnel_options();

        let position = |needle: &str| opts.iter().position(|opt| opt.starts_with(needle)).unwrap();

        assert!(position("inbound.length") < position("i2cp.gzip"));
        assert!(position("i2cp.gzip") < position("i2cp.encryptLeaseSet"));
        assert!(position("i2cp.leaseSetEncType") < position("i2cp.enableBlackList"));
        assert!(position("i2cp.enableBlackList") < position("i2cp.accessList"));
    }

    #[test]
    fn reduce_and_close_groups() {
        let opts = SessionConfig::new()
            .with_reduce_on_idle(Duration::from_secs(300), 2)
            .with_close_on_idle(Duration::from_secs(1800))
            .tunnel_options();

        assert!(opts.contains(&"i2cp.reduceOnIdle=true".to_string()));
        assert!(opts.contains(&"i2cp.reduceIdleTime=300000".to_string()));
        assert!(opts.contains(&"i2cp.reduceQuantity=2".to_string()));
        assert!(opts.contains(&"i2cp.closeOnIdle=true".to_string()));
        assert!(opts.contains(&"i2cp.closeIdleTime=1800000".to_string()));
    }

    #[test]
    fn malformed_enc_type_falls_back_to_default() {
        assert_eq!(validate_enc_type_list("4,0"), "4,0");
        assert_eq!(validate_enc_type_list("6"), "6");
        assert_eq!(validate_enc_type_list("4,x"), "4,0");
        assert_eq!(validate_enc_type_list(""), "4,0");
        assert_eq!(validate_enc_type_list("4,,0"), "4,0");
    }

    #[test]
    fn serialization_roundtrip() {
        let config = SessionConfig::new()
            .with_inbound_shape(TunnelShape {
                length: 2,
                length_variance: 1,
                quantity: 4,
                backup_quantity: 1,
                allow_zero_hop: true,
            })
            .with_outbound_length(3)
            .with_compression()
            .with_fast_receive()
            .with_message_reliability("BestEffort")
            .with_reduce_on_idle(Duration::from_secs(600), 1)
            .with_encrypted_lease_set("key", "private", "signing")
            .with_access_list(
                AccessListKind::Whitelist,
                vec!["a.b32.i2p".to_string(), "b.b32.i2p".to_string()],
            );

        let tokens = config.tunnel_options();

        let mut reparsed = SessionConfig::new();
        for token in &tokens {
            let (key, value) = token.split_once('=').unwrap();
            assert!(reparsed.apply_option(key, value), "unknown key {key}");
        }

        assert_eq!(reparsed.tunnel_options(), tokens);
    }

    #[test]
    fn random_tunnel_name_is_lowercase() {
        let name = random_tunnel_name();

        assert_eq!(name.len(), 12);
        assert!(name.bytes().all(|b| b.is_ascii_lowercase()));
        assert_ne!(name, random_tunnel_name());
    }

    #[test]
    fn id_is_pinned_once_generated() {
        let mut config = SessionConfig::new();

        let id = config.id().to_string();
        assert_eq!(config.id(), id);
    }

    #[test]
    fn sam_address_parsing() {
        let config = SessionConfig::new().with_sam_address("10.0.0.1:7000");
        assert_eq!(config.sam_address(), "10.0.0.1:7000");

        // bare host defaults to port 0
        let config = SessionConfig::new().with_sam_address("sam.local");
        assert_eq!(config.sam_address(), "sam.local:0");
    }

    #[test]
    fn v31_gating() {
        let config = SessionConfig::new()
            .with_version_range("3.0", "3.0")
            .with_from_port(7070)
            .with_to_port(8080);

        assert!(config.from_port_fragment().is_none());
        assert!(config.to_port_fragment().is_none());
        assert!(config.sig_type_fragment().is_none());

        let config = SessionConfig::new().with_from_port(7070).with_to_port(8080);

        assert_eq!(config.from_port_fragment().unwrap(), "FROM_PORT=7070");
        assert_eq!(config.to_port_fragment().unwrap(), "TO_PORT=8080");
        assert_eq!(
            config.sig_type_fragment().unwrap(),
            "SIGNATURE_TYPE=EdDSA_SHA512_Ed25519"
        );
    }

    #[test]
    fn unset_ports_are_suppressed() {
        let config = SessionConfig::new();

        assert!(config.from_port_fragment().is_none());
        assert!(config.to_port_fragment().is_none());
    }

    #[test]
    fn free_port_pair_binds_both() {
        let port = free_port_pair().unwrap();

        assert!((10000..65534).contains(&port));
    }
}
