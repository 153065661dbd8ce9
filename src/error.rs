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

/// `shasta` error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A socket read or write failed.
    ///
    /// Fatal for the session that owns the socket.
    #[error("i/o error: `{0}`")]
    Transport(#[from] std::io::Error),

    /// Response from the bridge did not match any known shape.
    #[error("protocol error: `{0}`")]
    Protocol(String),

    /// Response matched the expected shape but carried malformed tokens.
    #[error("malformed response: `{0}`")]
    Parse(String),

    /// Handshake reply was `HELLO REPLY RESULT=NOVERSION`.
    #[error("bridge supports no version in the requested range")]
    UnsupportedVersion,

    /// Bridge reported `RESULT=DUPLICATED_ID`.
    #[error("session id is already in use")]
    DuplicateId,

    /// Bridge reported `RESULT=DUPLICATED_DEST`.
    #[error("destination is already in use")]
    DuplicateDestination,

    /// Bridge reported `RESULT=INVALID_KEY`.
    #[error("invalid destination key")]
    InvalidKey,

    /// Name lookup returned `RESULT=KEY_NOT_FOUND`.
    #[error("unable to resolve `{0}`")]
    NotFound(String),

    /// Router-reported error, `MESSAGE=` text preserved verbatim.
    #[error("router error: `{0}`")]
    Router(String),

    /// Deadline expired before the bridge responded.
    #[error("operation timed out")]
    Timeout,

    /// Operation attempted on a closed session, subsession, or registry.
    #[error("session is closed")]
    Closed,

    /// Invalid user-supplied configuration.
    #[error("invalid configuration: `{0}`")]
    Config(String),

    /// Address is not an I2P destination.
    #[error("not an i2p address: `{0}`")]
    Addr(String),
}

impl Error {
    /// Whether the error was reported by the bridge rather than produced locally.
    pub fn is_bridge_error(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedVersion
                | Error::DuplicateId
                | Error::DuplicateDestination
                | Error::InvalidKey
                | Error::NotFound(_)
                | Error::Router(_)
        )
    }
}
