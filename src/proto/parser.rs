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

//! Response line parser.
//!
//! A SAM response is a two-word literal (`HELLO REPLY`, `SESSION STATUS`,
//! `STREAM STATUS`, `NAMING REPLY`, `DEST REPLY`) followed by whitespace-
//! separated `KEY=VALUE` tokens. `MESSAGE=` swallows the rest of the line as
//! free text unless the value is quoted.

use nom::{
    branch::alt,
    bytes::complete::{escaped, is_not, tag, take_while1},
    character::complete::{char, multispace0},
    multi::many0,
    sequence::{delimited, preceded},
    IResult, Parser,
};

use crate::error::Error;

/// A single token of a response tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// `KEY=VALUE` pair.
    Pair {
        /// Key, the substring before `=`.
        key: String,

        /// Value, unquoted form.
        value: String,
    },

    /// Bare flag token without `=`.
    Flag(String),
}

/// Parsed response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// First literal, e.g. `SESSION`.
    pub verb: String,

    /// Second literal, e.g. `STATUS`.
    pub noun: String,

    /// Tokens after the literal, in wire order.
    pub tokens: Vec<Token>,
}

impl Reply {
    /// Parse a response line.
    pub fn parse(input: &str) -> Result<Self, Error> {
        parse_reply(input)
            .map(|(_, reply)| reply)
            .map_err(|_| Error::Protocol(input.trim_end().to_string()))
    }

    /// Value of the first `key=` pair, if present.
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.tokens.iter().find_map(|token| match token {
            Token::Pair { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// `RESULT=` value, if present.
    pub fn result(&self) -> Option<&str> {
        self.value_of("RESULT")
    }

    /// `MESSAGE=` free text, empty when absent.
    pub fn message(&self) -> &str {
        self.value_of("MESSAGE").unwrap_or("")
    }

    /// Whether the first two literals match `verb noun`.
    pub fn is(&self, verb: &str, noun: &str) -> bool {
        self.verb == verb && self.noun == noun
    }

    /// Map the `RESULT=` token of a status reply onto the error taxonomy.
    ///
    /// `OK` maps to `Ok(())`; an absent `RESULT` is a protocol error. The
    /// `MESSAGE=` text is preserved verbatim where the taxonomy carries one.
    pub fn classify(&self) -> Result<(), Error> {
        match self.result() {
            Some("OK") => Ok(()),
            Some("NOVERSION") => Err(Error::UnsupportedVersion),
            Some("DUPLICATED_ID") => Err(Error::DuplicateId),
            Some("DUPLICATED_DEST") => Err(Error::DuplicateDestination),
            Some("INVALID_KEY") => Err(Error::InvalidKey),
            Some("KEY_NOT_FOUND") => Err(Error::NotFound(
                self.value_of("NAME").unwrap_or_default().to_string(),
            )),
            Some("TIMEOUT") => Err(Error::Timeout),
            Some(result @ ("I2P_ERROR" | "CANT_REACH_PEER" | "PEER_NOT_FOUND" | "INVALID_ID")) => {
                Err(Error::Router(match self.message() {
                    "" => result.to_string(),
                    message => message.to_string(),
                }))
            }
            Some(result) => Err(Error::Parse(format!("unknown result `{result}`"))),
            None => Err(Error::Protocol("response carries no RESULT".to_string())),
        }
    }
}

fn parse_reply(input: &str) -> IResult<&str, Reply> {
    let (rest, verb) = alt((
        tag("HELLO"),
        tag("SESSION"),
        tag("STREAM"),
        tag("NAMING"),
        tag("DEST"),
        tag("DATAGRAM"),
        tag("RAW"),
    ))(input)?;
    let (rest, noun) = preceded(
        char(' '),
        alt((tag("REPLY"), tag("STATUS"), tag("RECEIVED"))),
    )(rest)?;
    let (rest, tokens) = parse_tokens(rest)?;

    Ok((
        rest,
        Reply {
            verb: verb.to_string(),
            noun: noun.to_string(),
            tokens,
        },
    ))
}

fn parse_tokens(input: &str) -> IResult<&str, Vec<Token>> {
    many0(preceded(multispace0, parse_token))(input)
}

fn parse_token(input: &str) -> IResult<&str, Token> {
    let (rest, key) = parse_key(input)?;

    match rest.strip_prefix('=') {
        // `MESSAGE=` swallows the rest of the line unless quoted
        Some(rest) if key == "MESSAGE" && !rest.starts_with('"') => {
            let value = rest.trim_end_matches(['\r', '\n']);

            Ok((
                "",
                Token::Pair {
                    key: key.to_string(),
                    value: value.to_string(),
                },
            ))
        }
        Some(rest) => {
            let (rest, value) = parse_value(rest)?;

            Ok((
                rest,
                Token::Pair {
                    key: key.to_string(),
                    value: value.to_string(),
                },
            ))
        }
        None => Ok((rest, Token::Flag(key.to_string()))),
    }
}

fn parse_key(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '.').parse(input)
}

fn parse_value(input: &str) -> IResult<&str, &str> {
    alt((
        parse_quoted_value,
        take_while1(|c: char| !c.is_whitespace()),
    ))(input)
}

fn parse_quoted_value(input: &str) -> IResult<&str, &str> {
    delimited(
        char('"'),
        escaped(is_not("\\\""), '\\', alt((tag("\""), tag("\\")))),
        char('"'),
    )(input)
}
