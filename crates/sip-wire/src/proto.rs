// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

/// Transport protocol a leg speaks and a hop candidate requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Udp,
    Tcp,
}

impl Proto {
    /// Returns the lowercase protocol token used in hop addresses and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Udp => "udp",
            Proto::Tcp => "tcp",
        }
    }

    /// Returns the uppercase transport token used in `Via` headers.
    pub fn via_transport(&self) -> &'static str {
        match self {
            Proto::Udp => "UDP",
            Proto::Tcp => "TCP",
        }
    }

    /// Parses a transport token from a URI parameter or `Via` header.
    ///
    /// # Examples
    ///
    /// ```
    /// use sip_wire::Proto;
    ///
    /// assert_eq!(Proto::parse("UDP"), Some(Proto::Udp));
    /// assert_eq!(Proto::parse(" tcp "), Some(Proto::Tcp));
    /// assert_eq!(Proto::parse("sctp"), None);
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(Proto::Udp),
            "tcp" => Some(Proto::Tcp),
            _ => None,
        }
    }

    /// Returns true if this transport keeps a connection open between sends.
    pub fn is_stream_based(&self) -> bool {
        matches!(self, Proto::Tcp)
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
