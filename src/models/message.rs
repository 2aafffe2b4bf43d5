// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! RFC-1459-style line codec.
//!
//! A line is decomposed into an optional source prefix, a command token,
//! an ordered parameter list and an optional trailing payload:
//!
//! ```text
//! [:<prefix> ]<command>[ <param> ...][ :<trailing>]
//! ```
//!
//! Parsing never fails: malformed input degrades to an empty command,
//! which the router ignores.

/// A single inbound or outbound protocol line. Immutable after parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Source of the line (`nick!ident@host` or a server name), if present.
    pub prefix: Option<String>,
    /// Uppercase command token or 3-digit numeric. May be empty.
    pub command: String,
    /// Ordered middle parameters, command excluded.
    pub params: Vec<String>,
    /// Trailing payload (everything after the first ` :`), if present.
    pub trailing: Option<String>,
}

impl Message {
    /// Parses one raw line. Leading/trailing CR and LF are stripped first.
    pub fn parse(line: &str) -> Self {
        let mut rest = line.trim_matches(['\r', '\n']);

        let mut prefix = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            match stripped.split_once(' ') {
                Some((src, tail)) => {
                    prefix = Some(src.to_string());
                    rest = tail;
                },
                None => {
                    // A bare prefix with nothing after it.
                    prefix = Some(stripped.to_string());
                    rest = "";
                },
            }
        }

        let mut trailing = None;
        if let Some((head, tail)) = rest.split_once(" :") {
            trailing = Some(tail.to_string());
            rest = head;
        }

        let mut params: Vec<String> =
            rest.split_whitespace().map(str::to_string).collect();
        let command = if params.is_empty() {
            String::new()
        } else {
            params.remove(0)
        };

        Self {
            prefix,
            command,
            params,
            trailing,
        }
    }

    /// Decodes raw bytes with UTF-8 replacement of malformed sequences,
    /// then parses. Invalid bytes never abort the reader.
    pub fn decode(raw: &[u8]) -> Self {
        Self::parse(&String::from_utf8_lossy(raw))
    }

    /// Re-emits the line, terminated by exactly one CRLF. No server-side
    /// semantics are validated here.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64);
        if let Some(prefix) = &self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }
        out.push_str(&self.command);
        for param in &self.params {
            out.push(' ');
            out.push_str(param);
        }
        if let Some(trailing) = &self.trailing {
            out.push_str(" :");
            out.push_str(trailing);
        }
        out.push_str("\r\n");
        out
    }

    /// Nick portion of the source prefix, if any.
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.split('!').next().unwrap_or(p))
    }

    /// True when no command token was found; such lines are dropped by the
    /// router.
    pub fn is_empty(&self) -> bool {
        self.command.is_empty()
    }
}
