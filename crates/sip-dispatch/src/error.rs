// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

/// Errors surfaced through delivery callbacks.
///
/// The variants mirror the errno values the dispatcher's contract is written
/// against, so upper layers can translate mechanically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No usable hop or no leg able to reach one (`EHOSTUNREACH`).
    HostUnreachable,
    /// The retransmission window (64·T1) elapsed without a successful send
    /// (`ETIMEDOUT`).
    TimedOut,
    /// Protocol preference and the allowed-protocol filter do not intersect
    /// (`ENOPROTOOPT`).
    ProtocolUnsupported,
    /// A host lookup the packet depended on failed (`EINVAL`).
    DnsFailure,
    /// The transport reported a send failure.
    Transport(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::HostUnreachable => write!(f, "no route to host"),
            DispatchError::TimedOut => write!(f, "delivery timed out"),
            DispatchError::ProtocolUnsupported => write!(f, "no allowed protocol"),
            DispatchError::DnsFailure => write!(f, "dns resolution failed"),
            DispatchError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for DispatchError {}
