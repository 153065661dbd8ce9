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

//! Destination key material.
//!
//! Destinations are passed through to the bridge as opaque base64 blobs; the
//! only computation done locally is deriving the base32 short form (SHA-256
//! of the decoded destination, base32-encoded, suffixed `.b32.i2p`).

use data_encoding::{Encoding, Specification};
use sha2::{Digest, Sha256};

use std::{fmt, path::Path, sync::OnceLock};

use crate::error::Error;

/// Logging target for the file.
const LOG_TARGET: &str = "shasta::dest";

/// Suffix of base32 short-form addresses.
pub const B32_SUFFIX: &str = ".b32.i2p";

/// Network name reported to host code.
pub const NETWORK: &str = "i2p-datagram";

/// I2P's base32 alphabet, lowercase and unpadded.
fn base32_i2p() -> &'static Encoding {
    static ENCODING: OnceLock<Encoding> = OnceLock::new();

    ENCODING.get_or_init(|| {
        let mut spec = Specification::new();
        spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
        spec.padding = None;
        spec.encoding().expect("valid base32 specification")
    })
}

/// I2P's base64 alphabet, `-` and `~` in place of `+` and `/`.
fn base64_i2p() -> &'static Encoding {
    static ENCODING: OnceLock<Encoding> = OnceLock::new();

    ENCODING.get_or_init(|| {
        let mut spec = Specification::new();
        spec.symbols
            .push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~");
        spec.padding = Some('=');
        spec.encoding().expect("valid base64 specification")
    })
}

/// A destination on the I2P network, held in its full base64 form.
///
/// The base32 short form is derived on demand with [`Destination::base32()`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    inner: String,
}

impl Destination {
    /// Parse `destination` from its base64 form.
    ///
    /// The blob is validated against I2P's base64 alphabet and the minimum
    /// destination size but is otherwise treated as opaque.
    pub fn parse(destination: &str) -> Result<Self, Error> {
        let decoded = base64_i2p()
            .decode(destination.as_bytes())
            .map_err(|_| Error::Addr(destination.to_string()))?;

        // anything hash-sized or larger is passed through opaquely
        if decoded.len() < 32 {
            return Err(Error::Addr(destination.to_string()));
        }

        Ok(Self {
            inner: destination.to_string(),
        })
    }

    /// Get the full base64 form.
    pub fn base64(&self) -> &str {
        &self.inner
    }

    /// Derive the base32 short form, ending in `.b32.i2p`.
    pub fn base32(&self) -> String {
        let decoded = base64_i2p()
            .decode(self.inner.as_bytes())
            .expect("validated on construction");

        let digest = Sha256::digest(&decoded);
        let mut b32 = base32_i2p().encode(&digest[..]);
        b32.push_str(B32_SUFFIX);
        b32
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

/// 32-byte source hash carried by `DATAGRAM3` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceHash([u8; 32]);

impl SourceHash {
    /// Parse `hash` from its base64 form as it appears in a forwarded header.
    pub fn parse(hash: &str) -> Result<Self, Error> {
        let decoded =
            base64_i2p().decode(hash.as_bytes()).map_err(|_| Error::Addr(hash.to_string()))?;

        <[u8; 32]>::try_from(decoded.as_slice())
            .map(Self)
            .map_err(|_| Error::Addr(hash.to_string()))
    }

    /// Get the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive the base32 short form of the hash, ending in `.b32.i2p`.
    pub fn base32(&self) -> String {
        let mut b32 = base32_i2p().encode(&self.0);
        b32.push_str(B32_SUFFIX);
        b32
    }
}

/// Destination together with its private key material.
///
/// The private key blob is opaque to `shasta`; it is generated by the bridge
/// with `DEST GENERATE` and passed back verbatim in `SESSION CREATE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationKeys {
    /// Public destination.
    destination: Destination,

    /// Base64 private key blob.
    private_key: String,
}

impl DestinationKeys {
    /// Create new [`DestinationKeys`] from a destination and its private key blob.
    pub fn new(destination: Destination, private_key: String) -> Self {
        Self {
            destination,
            private_key,
        }
    }

    /// Get the public destination.
    ///
    /// Deterministic for a given key pair.
    pub fn addr(&self) -> &Destination {
        &self.destination
    }

    /// Get the private key blob passed to `SESSION CREATE`.
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// Serialize into the two-line persisted form.
    pub fn to_persisted(&self) -> String {
        format!("{}\n{}\n", self.destination.base64(), self.private_key)
    }

    /// Parse the two-line persisted form produced by [`DestinationKeys::to_persisted()`].
    pub fn from_persisted(blob: &str) -> Result<Self, Error> {
        let mut lines = blob.lines();

        let destination = lines
            .next()
            .ok_or_else(|| Error::Parse("empty keyfile".to_string()))
            .and_then(Destination::parse)?;
        let private_key = lines
            .next()
            .ok_or_else(|| Error::Parse("keyfile is missing the private key".to_string()))?
            .to_string();

        Ok(Self {
            destination,
            private_key,
        })
    }

    /// Load keys from `path`, previously written by [`DestinationKeys::store()`].
    pub async fn load(path: &Path) -> Result<Self, Error> {
        let blob = tokio::fs::read_to_string(path).await?;
        Self::from_persisted(&blob)
    }

    /// Persist keys to `path` with mode 0600.
    pub async fn store(&self, path: &Path) -> Result<(), Error> {
        tokio::fs::write(path, self.to_persisted()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tracing::debug!(
            target: LOG_TARGET,
            path = %path.display(),
            "destination keys persisted",
        );

        Ok(())
    }
}

/// Base64 of 387 zero bytes in the I2P alphabet, a destination-sized blob
/// for tests.
#[cfg(test)]
pub(crate) fn dummy_destination() -> String {
    base64_i2p().encode(&[0u8; 387])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_destination() {
        let encoded = dummy_destination();
        let destination = Destination::parse(&encoded).unwrap();

        assert_eq!(destination.base64(), encoded);
    }

    #[test]
    fn reject_short_blob() {
        let encoded = base64_i2p().encode(&[0u8; 16]);

        assert!(matches!(Destination::parse(&encoded), Err(Error::Addr(_))));
    }

    #[test]
    fn reject_foreign_alphabet() {
        // `/` is not part of the i2p base64 alphabet
        assert!(matches!(
            Destination::parse("abc/def"),
            Err(Error::Addr(_))
        ));
    }

    #[test]
    fn base32_form_is_stable() {
        let destination = Destination::parse(&dummy_destination()).unwrap();
        let b32 = destination.base32();

        assert!(b32.ends_with(B32_SUFFIX));
        assert_eq!(b32, destination.base32());

        // 32 hash bytes -> 52 base32 characters
        assert_eq!(b32.len(), 52 + B32_SUFFIX.len());
    }

    #[test]
    fn roundtrip_base64_to_base32() {
        let destination = Destination::parse(&dummy_destination()).unwrap();
        let reparsed = Destination::parse(destination.base64()).unwrap();

        assert_eq!(reparsed.base32(), destination.base32());
    }

    #[test]
    fn source_hash_roundtrip() {
        let encoded = base64_i2p().encode(&[7u8; 32]);
        let hash = SourceHash::parse(&encoded).unwrap();

        assert_eq!(hash.as_bytes(), &[7u8; 32]);
        assert!(hash.base32().ends_with(B32_SUFFIX));
    }

    #[test]
    fn source_hash_rejects_wrong_length() {
        let encoded = base64_i2p().encode(&[7u8; 16]);

        assert!(matches!(SourceHash::parse(&encoded), Err(Error::Addr(_))));
    }

    #[test]
    fn persisted_form_roundtrip() {
        let keys = DestinationKeys::new(
            Destination::parse(&dummy_destination()).unwrap(),
            "private-key-blob".to_string(),
        );

        let reloaded = DestinationKeys::from_persisted(&keys.to_persisted()).unwrap();

        assert_eq!(reloaded, keys);
        assert_eq!(reloaded.addr(), keys.addr());
    }

    #[tokio::test]
    async fn keyfile_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("destination.keys");

        let keys = DestinationKeys::new(
            Destination::parse(&dummy_destination()).unwrap(),
            "private-key-blob".to_string(),
        );

        keys.store(&path).await.unwrap();
        let reloaded = DestinationKeys::load(&path).await.unwrap();

        assert_eq!(reloaded, keys);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
