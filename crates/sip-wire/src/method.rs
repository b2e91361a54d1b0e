// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use smol_str::SmolStr;

/// SIP request methods the dispatcher distinguishes.
///
/// Only the methods that influence routing and retransmission policy get
/// their own variant; everything else is carried through as `Unknown` without
/// being interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Cancel,
    Bye,
    Register,
    Options,
    Unknown(SmolStr),
}

impl Method {
    /// Returns the canonical uppercase token for this method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Cancel => "CANCEL",
            Method::Bye => "BYE",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Unknown(token) => token.as_str(),
        }
    }

    /// Parses a method token, preserving extension methods verbatim.
    pub fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("INVITE") {
            Method::Invite
        } else if token.eq_ignore_ascii_case("ACK") {
            Method::Ack
        } else if token.eq_ignore_ascii_case("CANCEL") {
            Method::Cancel
        } else if token.eq_ignore_ascii_case("BYE") {
            Method::Bye
        } else if token.eq_ignore_ascii_case("REGISTER") {
            Method::Register
        } else if token.eq_ignore_ascii_case("OPTIONS") {
            Method::Options
        } else {
            Method::Unknown(SmolStr::new(token.to_ascii_uppercase()))
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_methods_parse_case_insensitively() {
        assert_eq!(Method::from_token("invite"), Method::Invite);
        assert_eq!(Method::from_token("ACK"), Method::Ack);
        assert_eq!(Method::from_token("Register"), Method::Register);
    }

    #[test]
    fn extension_methods_are_uppercased() {
        let m = Method::from_token("notify");
        assert_eq!(m.as_str(), "NOTIFY");
        assert_eq!(m, Method::Unknown(SmolStr::new("NOTIFY")));
    }
}
