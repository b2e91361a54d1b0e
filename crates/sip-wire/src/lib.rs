// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message model consumed by the Manifold dispatcher.
//!
//! Holds just enough of RFC 3261 for routing decisions: the request/response
//! start line, ordered headers, the `Via`/`CSeq`/`Call-ID` accessors the
//! dispatch queue keys on, and a text codec. Anything dialog- or
//! session-level belongs to the layers above.
//!
//! # Example
//! ```
//! use sip_wire::Packet;
//! let raw = b"OPTIONS sip:b@example.com SIP/2.0\r\n\
//!             Via: SIP/2.0/UDP a.example.com;branch=z9hG4bK77\r\n\
//!             CSeq: 1 OPTIONS\r\n\
//!             Call-ID: c1@a.example.com\r\n\
//!             Content-Length: 0\r\n\r\n";
//! let packet = Packet::parse(raw).unwrap();
//! assert!(packet.is_request());
//! assert_eq!(packet.tid().as_str(), "z9hG4bK77|1 OPTIONS");
//! ```

mod branch;
mod headers;
mod method;
mod msg;
mod parse;
mod proto;
mod uri;
mod via;

pub use branch::{derived_branch, generate_branch};
pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{Packet, StartLine};
pub use parse::WireError;
pub use proto::Proto;
pub use uri::SipUri;
pub use via::Via;
