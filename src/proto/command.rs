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

//! Command emitter.
//!
//! Every function returns one complete command line, newline-terminated,
//! with tokens space-separated. Reserved tokens (`FROM_PORT`, `TO_PORT`,
//! `SIGNATURE_TYPE`) are emitted by the caller only when the negotiated
//! version range allows them.

use crate::config::{SessionConfig, SessionStyle, SigType};

/// `HELLO VERSION` handshake, with optional SAMv3.2 credentials.
pub fn hello(min: &str, max: &str, user: Option<&str>, password: Option<&str>) -> String {
    let mut line = format!("HELLO VERSION MIN={min} MAX={max}");

    if let (Some(user), Some(password)) = (user, password) {
        line.push_str(&format!(" USER={user} PASSWORD={password}"));
    }

    line.push('\n');
    line
}

/// `DEST GENERATE`, minting a fresh key pair on the bridge.
pub fn dest_generate(sig_type: Option<SigType>) -> String {
    match sig_type {
        Some(sig_type) => format!("DEST GENERATE SIGNATURE_TYPE={sig_type}\n"),
        None => "DEST GENERATE\n".to_string(),
    }
}

/// `NAMING LOOKUP`, optionally requesting SAMv3.2 service options.
pub fn naming_lookup(name: &str, with_options: bool) -> String {
    match with_options {
        true => format!("NAMING LOOKUP NAME={name} OPTIONS=true\r\n"),
        false => format!("NAMING LOOKUP NAME={name}\r\n"),
    }
}

/// `SESSION CREATE` assembled from the config plus pre-validated options.
///
/// Token order is fixed: `STYLE`, ports, `ID`, `DESTINATION`,
/// `SIGNATURE_TYPE`, then the option tail.
pub fn session_create(config: &mut SessionConfig, options: &[String]) -> String {
    let mut line = format!("SESSION CREATE STYLE={}", config.style);

    if let Some(fragment) = config.from_port_fragment() {
        line.push(' ');
        line.push_str(&fragment);
    }
    if let Some(fragment) = config.to_port_fragment() {
        line.push(' ');
        line.push_str(&fragment);
    }

    line.push_str(&format!(" ID={}", config.id()));
    line.push_str(&format!(" {}", config.destination_fragment()));

    if let Some(fragment) = config.sig_type_fragment() {
        line.push(' ');
        line.push_str(&fragment);
    }

    for option in options {
        line.push(' ');
        line.push_str(option);
    }

    line.push('\n');
    line
}

/// `SESSION ADD` for a subsession under a primary.
pub fn session_add(style: SessionStyle, id: &str, options: &[String]) -> String {
    let mut line = format!("SESSION ADD STYLE={style} ID={id}");

    for option in options {
        line.push(' ');
        line.push_str(option);
    }

    line.push('\n');
    line
}

/// `SESSION REMOVE` for a subsession under a primary.
pub fn session_remove(id: &str) -> String {
    format!("SESSION REMOVE ID={id}\n")
}

/// `STREAM CONNECT` on a dedicated control socket.
pub fn stream_connect(config: &SessionConfig, id: &str, destination: &str) -> String {
    let mut line = format!("STREAM CONNECT ID={id}");

    if let Some(fragment) = config.from_port_fragment() {
        line.push(' ');
        line.push_str(&fragment);
    }
    if let Some(fragment) = config.to_port_fragment() {
        line.push(' ');
        line.push_str(&fragment);
    }

    line.push_str(&format!(" DESTINATION={destination}\n"));
    line
}

/// `STREAM ACCEPT` on a dedicated control socket.
pub fn stream_accept(config: &SessionConfig, id: &str) -> String {
    let mut line = format!("STREAM ACCEPT ID={id}");

    if let Some(fragment) = config.from_port_fragment() {
        line.push(' ');
        line.push_str(&fragment);
    }
    if let Some(fragment) = config.to_port_fragment() {
        line.push(' ');
        line.push_str(&fragment);
    }

    line.push('\n');
    line
}
