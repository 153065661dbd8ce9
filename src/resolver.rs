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

//! Name resolution.
//!
//! `NAMING LOOKUP` resolves hostnames, base32 addresses, and the literal
//! `ME` into full destinations. With `OPTIONS=true` (SAMv3.2) the bridge may
//! attach service-discovery `KEY=VALUE` pairs which are collected verbatim.

use std::collections::HashMap;

use crate::{
    dest::Destination,
    error::Error,
    proto::{
        command,
        parser::{Reply, Token},
    },
    sam::SamConnection,
    Sam, SessionConfig,
};

/// Logging target for the file.
const LOG_TARGET: &str = "shasta::resolver";

/// Result of a successful lookup.
#[derive(Debug, Clone)]
pub struct Lookup {
    /// Resolved destination.
    pub destination: Destination,

    /// SAMv3.2 service-discovery options attached to the reply.
    pub options: HashMap<String, String>,
}

/// Standalone resolver owning its own control connection.
///
/// Lookup failures are local: the caller may retry on the same resolver.
///
/// ```rust,no_run
/// use shasta::Resolver;
///
/// #[tokio::main]
/// async fn main() -> shasta::Result<()> {
///     let mut resolver = Resolver::connect("127.0.0.1:7656").await?;
///     let lookup = resolver.resolve("service.i2p", true).await?;
///
///     println!("{} {:?}", lookup.destination.base32(), lookup.options);
///     Ok(())
/// }
/// ```
pub struct Resolver {
    /// Handshaked control connection.
    connection: SamConnection,
}

impl Resolver {
    /// Connect a resolver to the bridge at `address`.
    pub async fn connect(address: &str) -> Result<Self, Error> {
        Self::connect_with(SessionConfig::new().with_sam_address(address)).await
    }

    /// Connect a resolver to the bridge named by `config`.
    pub async fn connect_with(config: SessionConfig) -> Result<Self, Error> {
        let sam = Sam::connect_with(config).await?;

        Ok(Self {
            connection: sam.into_connection(),
        })
    }

    /// Resolve `name`, optionally requesting service options.
    pub async fn resolve(&mut self, name: &str, with_options: bool) -> Result<Lookup, Error> {
        let reply = self
            .connection
            .send_command(&command::naming_lookup(name, with_options))
            .await?;

        parse_lookup_reply(&reply, name)
    }
}

/// Extract the lookup result from a `NAMING REPLY` line.
pub(crate) fn parse_lookup_reply(reply: &Reply, name: &str) -> Result<Lookup, Error> {
    if !reply.is("NAMING", "REPLY") {
        return Err(Error::Protocol(format!(
            "unexpected reply to NAMING LOOKUP: {} {}",
            reply.verb, reply.noun
        )));
    }

    let mut destination = None;
    let mut options = HashMap::new();
    let mut failure: Option<Error> = None;
    let mut messages: Vec<String> = Vec::new();

    for token in &reply.tokens {
        let Token::Pair { key, value } = token else {
            continue;
        };

        match key.as_str() {
            "VALUE" => destination = Some(Destination::parse(value)?),
            "NAME" => {}
            "RESULT" if value == "OK" => {}
            "RESULT" if value == "INVALID_KEY" => {
                failure = Some(Error::InvalidKey);
                messages.push("Invalid key - resolver.".to_string());
            }
            "RESULT" if value == "KEY_NOT_FOUND" => {
                failure = Some(Error::NotFound(name.to_string()));
                messages.push(format!("Unable to resolve {name}"));
            }
            "RESULT" => {
                failure = Some(Error::Parse(format!("unknown result `{value}`")));
            }
            "MESSAGE" => messages.push(value.clone()),
            _ if !key.is_empty() && !value.is_empty() => {
                options.insert(key.clone(), value.clone());
            }
            _ => {}
        }
    }

    match destination {
        Some(destination) => {
            tracing::debug!(
                target: LOG_TARGET,
                %name,
                address = %destination.base32(),
                options = options.len(),
                "name resolved",
            );

            Ok(Lookup {
                destination,
                options,
            })
        }
        None => Err(match failure {
            Some(Error::NotFound(name)) => Error::NotFound(name),
            Some(Error::InvalidKey) => Error::InvalidKey,
            Some(error) => error,
            None if !messages.is_empty() => Error::Router(messages.join(" ")),
            None => Error::Protocol("NAMING REPLY carries no VALUE".to_string()),
        }),
    }
}
