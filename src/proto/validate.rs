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

//! Option validation and rewriting.
//!
//! Options are ordered lists of `KEY=VALUE` tokens. The key of a token is
//! the substring before the first `=`; tokens without `=` are flags and pass
//! through every rewrite unchanged.

/// Logging target for the file.
const LOG_TARGET: &str = "shasta::proto::validate";

/// Option keys that a subsession may not carry.
///
/// Destination, signature, lease-set, and tunnel shape are all inherited
/// from the primary session.
const SUBSESSION_FORBIDDEN: &[&str] = &["SIGNATURE_TYPE", "DESTINATION", "i2cp.leaseSetEncType"];

/// Key of `token`, the substring before the first `=`.
fn key_of(token: &str) -> Option<&str> {
    token.split_once('=').map(|(key, _)| key)
}

/// Deduplicate `KEY=VALUE` tokens, keeping the last value of each key.
///
/// Flags pass through unchanged. The surviving token keeps the position of
/// the key's first occurrence.
pub fn dedupe_options(options: &[String]) -> Vec<String> {
    let mut deduped: Vec<String> = Vec::with_capacity(options.len());

    for token in options {
        let Some(key) = key_of(token) else {
            deduped.push(token.clone());
            continue;
        };

        match deduped.iter_mut().find(|kept| key_of(kept) == Some(key)) {
            Some(kept) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    %key,
                    dropped = %kept,
                    kept = %token,
                    "duplicate option, last value wins",
                );

                *kept = token.clone();
            }
            None => deduped.push(token.clone()),
        }
    }

    deduped
}

/// Resolve conflicts between an explicit signature type and the option list.
///
/// A non-empty `sig_type` removes every `SIGNATURE_TYPE=` token from
/// `options`; an empty one returns the list untouched.
pub fn resolve_sigtype_conflict(sig_type: &str, options: Vec<String>) -> Vec<String> {
    if sig_type.is_empty() {
        return options;
    }

    options
        .into_iter()
        .filter(|token| {
            let conflicting = key_of(token) == Some("SIGNATURE_TYPE");

            if conflicting {
                tracing::warn!(
                    target: LOG_TARGET,
                    dropped = %token,
                    %sig_type,
                    "signature type option conflicts with explicit signature type",
                );
            }

            !conflicting
        })
        .collect()
}

/// Strip options that are illegal on a `SESSION ADD` line.
///
/// Drops `SIGNATURE_TYPE`, `DESTINATION`, `i2cp.leaseSetEncType`, and the
/// whole `inbound.*`/`outbound.*` tunnel shape, then deduplicates whatever
/// remains.
pub fn scrub_subsession_options(options: &[String]) -> Vec<String> {
    let kept = options
        .iter()
        .filter(|token| {
            let Some(key) = key_of(token) else {
                return true;
            };

            let forbidden = SUBSESSION_FORBIDDEN.contains(&key)
                || key.starts_with("inbound.")
                || key.starts_with("outbound.");

            if forbidden {
                tracing::warn!(
                    target: LOG_TARGET,
                    dropped = %token,
                    "option is inherited from the primary session, dropping",
                );
            }

            !forbidden
        })
        .cloned()
        .collect::<Vec<_>>();

    dedupe_options(&kept)
}

/// Append `PORT=0` when no `PORT=` token is present.
///
/// `DATAGRAM*` and `RAW` subsessions must carry a `PORT` token. Idempotent.
pub fn ensure_port_parameter(mut options: Vec<String>) -> Vec<String> {
    if !options.iter().any(|token| key_of(token) == Some("PORT")) {
        options.push("PORT=0".to_string());
    }

    options
}

/// Append UDP forwarding parameters when none are present.
///
/// `PORT`/`HOST` here name the local socket the bridge forwards received
/// datagrams to, not the bridge's own UDP listen port.
pub fn ensure_forwarding_params(mut options: Vec<String>, udp_port: u16) -> Vec<String> {
    let has_forwarding = options
        .iter()
        .any(|token| matches!(key_of(token), Some("PORT") | Some("HOST")));

    if !has_forwarding {
        options.push(format!("PORT={udp_port}"));
        options.push("HOST=127.0.0.1".to_string());
    }

    options
}
