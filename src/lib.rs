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

#![doc = include_str!("../README.md")]

mod config;
mod dest;
mod error;
mod proto;
mod resolver;
mod sam;
mod session;
mod stream;

pub use config::{
    free_port_pair, AccessListKind, SessionConfig, SessionStyle, SigType, TunnelShape,
    SAM_TCP_PORT, SAM_UDP_PORT,
};
pub use dest::{Destination, DestinationKeys, SourceHash, B32_SUFFIX, NETWORK};
pub use error::Error;
pub use resolver::{Lookup, Resolver};
pub use sam::Sam;
pub use session::{
    datagram::{Datagram, Datagram3, Datagram3Session, DatagramSession},
    primary::PrimarySession,
    raw::{RawDatagram, RawSession},
    stream::{StreamListener, StreamSession},
};
pub use stream::Stream;

/// Result type of the crate.
pub type Result<T> = core::result::Result<T, error::Error>;
