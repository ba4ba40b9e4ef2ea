//! Blob tickets
//!
//! A ticket is everything a peer needs to fetch a published object: its
//! content hash, its format and how to reach the publishing node. Tickets
//! are self-contained strings of the form `blob<base64url>`, where the
//! payload is a bincode record:
//!
//! ```text
//! TicketWire {
//!   version:      u8
//!   hash:         bytes      (CIDv1)
//!   format:       u8         (0 = raw, 1 = collection)
//!   peer_id:      bytes
//!   relay_addrs:  [bytes]    (multiaddrs through a relay)
//!   direct_addrs: [bytes]    (multiaddrs of the node itself)
//! }
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bincode::Options as _;
use cid::Cid;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::cid_blake3::{parse_cid, BLOB_CODEC, COLLECTION_CODEC};

/// Prefix of every ticket string
pub const TICKET_PREFIX: &str = "blob";

/// Current wire version
const TICKET_VERSION: u8 = 1;

/// Upper bound on a decoded ticket record
const MAX_TICKET_BYTES: u64 = 16 * 1024;

/// Most addresses of each kind a ticket carries
pub const MAX_TICKET_ADDRS: usize = 8;

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("Ticket must start with \"blob\"")]
    MissingPrefix,

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Malformed ticket record: {0}")]
    Record(#[from] bincode::Error),

    #[error("Unsupported ticket version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown blob format {0}")]
    UnknownFormat(u8),

    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    #[error("Content hash codec 0x{codec:x} does not match format {format}")]
    FormatMismatch { codec: u64, format: BlobFormat },

    #[error("Invalid peer ID: {0}")]
    InvalidPeerId(String),

    #[error("Invalid multiaddr: {0}")]
    InvalidMultiaddr(String),

    #[error("Ticket record exceeds {MAX_TICKET_BYTES} bytes")]
    TooLarge,
}

/// Whether a hash names a single blob or a collection of named blobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobFormat {
    Raw,
    Collection,
}

impl BlobFormat {
    /// CID codec of root objects in this format
    pub fn codec(self) -> u64 {
        match self {
            BlobFormat::Raw => BLOB_CODEC,
            BlobFormat::Collection => COLLECTION_CODEC,
        }
    }

    /// Format of a root object with the given CID codec
    pub fn from_codec(codec: u64) -> Option<Self> {
        match codec {
            BLOB_CODEC => Some(BlobFormat::Raw),
            COLLECTION_CODEC => Some(BlobFormat::Collection),
            _ => None,
        }
    }

    pub fn is_collection(self) -> bool {
        self == BlobFormat::Collection
    }

    fn to_wire(self) -> u8 {
        match self {
            BlobFormat::Raw => 0,
            BlobFormat::Collection => 1,
        }
    }

    fn from_wire(value: u8) -> Result<Self, TicketError> {
        match value {
            0 => Ok(BlobFormat::Raw),
            1 => Ok(BlobFormat::Collection),
            other => Err(TicketError::UnknownFormat(other)),
        }
    }
}

impl fmt::Display for BlobFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobFormat::Raw => f.write_str("raw"),
            BlobFormat::Collection => f.write_str("collection"),
        }
    }
}

/// A node and the addresses it can be reached at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddr {
    pub peer_id: PeerId,
    /// Circuit addresses through relays the node holds a reservation on
    pub relay_addrs: Vec<Multiaddr>,
    /// Addresses the node listens on directly
    pub direct_addrs: Vec<Multiaddr>,
}

impl NodeAddr {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            relay_addrs: Vec::new(),
            direct_addrs: Vec::new(),
        }
    }

    pub fn with_relay_addrs(mut self, addrs: impl IntoIterator<Item = Multiaddr>) -> Self {
        self.relay_addrs
            .extend(addrs.into_iter().map(|a| strip_peer_suffix(a, &self.peer_id)));
        self
    }

    pub fn with_direct_addrs(mut self, addrs: impl IntoIterator<Item = Multiaddr>) -> Self {
        self.direct_addrs
            .extend(addrs.into_iter().map(|a| strip_peer_suffix(a, &self.peer_id)));
        self
    }

    /// Every address hint, direct ones first
    pub fn dial_addrs(&self) -> impl Iterator<Item = &Multiaddr> {
        self.direct_addrs.iter().chain(self.relay_addrs.iter())
    }
}

/// Drop a trailing `/p2p/<peer>` that only repeats the node's own ID
fn strip_peer_suffix(mut addr: Multiaddr, peer_id: &PeerId) -> Multiaddr {
    if let Some(Protocol::P2p(id)) = addr.iter().last() {
        if &id == peer_id {
            addr.pop();
        }
    }
    addr
}

/// Which connectivity hints a ticket carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddrInfoOptions {
    /// Only the peer ID
    Id,
    /// Peer ID and relay addresses
    Relay,
    /// Peer ID and direct addresses
    Addresses,
    /// Peer ID, relay and direct addresses
    #[default]
    RelayAndAddresses,
}

impl AddrInfoOptions {
    /// Filter the hints of `addr`, keeping at most [`MAX_TICKET_ADDRS`] of each kind
    pub fn apply(self, addr: NodeAddr) -> NodeAddr {
        let (relay, direct) = match self {
            AddrInfoOptions::Id => (false, false),
            AddrInfoOptions::Relay => (true, false),
            AddrInfoOptions::Addresses => (false, true),
            AddrInfoOptions::RelayAndAddresses => (true, true),
        };

        let keep = |addrs: Vec<Multiaddr>, wanted: bool| -> Vec<Multiaddr> {
            if wanted {
                addrs.into_iter().take(MAX_TICKET_ADDRS).collect()
            } else {
                Vec::new()
            }
        };

        NodeAddr {
            peer_id: addr.peer_id,
            relay_addrs: keep(addr.relay_addrs, relay),
            direct_addrs: keep(addr.direct_addrs, direct),
        }
    }
}

/// Where and how to fetch content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    pub format: BlobFormat,
    pub node: NodeAddr,
}

/// A self-contained reference to published content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobTicket {
    node: NodeAddr,
    hash: Cid,
    format: BlobFormat,
}

impl BlobTicket {
    pub fn new(node: NodeAddr, hash: Cid, format: BlobFormat) -> Result<Self, TicketError> {
        if hash.codec() != format.codec() {
            return Err(TicketError::FormatMismatch {
                codec: hash.codec(),
                format,
            });
        }

        let ticket = Self { node, hash, format };
        wire_options()
            .serialized_size(&ticket.to_wire())
            .map_err(|_| TicketError::TooLarge)?;
        Ok(ticket)
    }

    pub fn hash(&self) -> Cid {
        self.hash
    }

    pub fn format(&self) -> BlobFormat {
        self.format
    }

    pub fn node_addr(&self) -> &NodeAddr {
        &self.node
    }

    /// Download options pointing at the node that issued this ticket
    pub fn as_download_options(&self) -> DownloadOptions {
        DownloadOptions {
            format: self.format,
            node: self.node.clone(),
        }
    }

    fn to_wire(&self) -> TicketWire {
        TicketWire {
            version: TICKET_VERSION,
            hash: self.hash.to_bytes(),
            format: self.format.to_wire(),
            peer_id: self.node.peer_id.to_bytes(),
            relay_addrs: self.node.relay_addrs.iter().map(|a| a.to_vec()).collect(),
            direct_addrs: self.node.direct_addrs.iter().map(|a| a.to_vec()).collect(),
        }
    }

    fn from_wire(wire: TicketWire) -> Result<Self, TicketError> {
        if wire.version != TICKET_VERSION {
            return Err(TicketError::UnsupportedVersion(wire.version));
        }

        let hash = parse_cid(&wire.hash).map_err(|e| TicketError::InvalidHash(e.to_string()))?;
        let format = BlobFormat::from_wire(wire.format)?;
        let peer_id = PeerId::from_bytes(&wire.peer_id)
            .map_err(|e| TicketError::InvalidPeerId(e.to_string()))?;

        let node = NodeAddr {
            peer_id,
            relay_addrs: parse_addrs(wire.relay_addrs)?,
            direct_addrs: parse_addrs(wire.direct_addrs)?,
        };

        Self::new(node, hash, format)
    }
}

fn parse_addrs(raw: Vec<Vec<u8>>) -> Result<Vec<Multiaddr>, TicketError> {
    raw.into_iter()
        .map(|bytes| {
            Multiaddr::try_from(bytes).map_err(|e| TicketError::InvalidMultiaddr(e.to_string()))
        })
        .collect()
}

fn wire_options() -> impl bincode::Options {
    bincode::DefaultOptions::new().with_limit(MAX_TICKET_BYTES)
}

#[derive(Serialize, Deserialize)]
struct TicketWire {
    version: u8,
    hash: Vec<u8>,
    format: u8,
    peer_id: Vec<u8>,
    relay_addrs: Vec<Vec<u8>>,
    direct_addrs: Vec<Vec<u8>>,
}

impl fmt::Display for BlobTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = wire_options()
            .serialize(&self.to_wire())
            .map_err(|_| fmt::Error)?;
        write!(f, "{}{}", TICKET_PREFIX, URL_SAFE_NO_PAD.encode(record))
    }
}

impl FromStr for BlobTicket {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let payload = s
            .trim()
            .strip_prefix(TICKET_PREFIX)
            .ok_or(TicketError::MissingPrefix)?;
        let record = URL_SAFE_NO_PAD.decode(payload)?;
        let wire: TicketWire = wire_options().deserialize(&record)?;
        Self::from_wire(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid_blake3::blake3_cid_with_codec;

    fn sample_node() -> NodeAddr {
        let peer_id = PeerId::random();
        NodeAddr::new(peer_id)
            .with_direct_addrs(["/ip4/192.168.1.20/tcp/4001".parse().unwrap()])
            .with_relay_addrs([format!(
                "/ip4/203.0.113.7/tcp/4001/p2p/{}/p2p-circuit",
                PeerId::random()
            )
            .parse()
            .unwrap()])
    }

    fn sample_ticket(format: BlobFormat) -> BlobTicket {
        let hash = blake3_cid_with_codec(format.codec(), b"root").unwrap();
        BlobTicket::new(sample_node(), hash, format).unwrap()
    }

    #[test]
    fn test_ticket_string_roundtrip_is_stable() {
        let ticket = sample_ticket(BlobFormat::Collection);
        let text = ticket.to_string();
        assert!(text.starts_with(TICKET_PREFIX));

        let parsed: BlobTicket = text.parse().unwrap();
        assert_eq!(parsed, ticket);

        let reparsed: BlobTicket = parsed.to_string().parse().unwrap();
        assert_eq!(reparsed, parsed);
        assert_eq!(parsed.to_string(), text);
    }

    #[test]
    fn test_download_options_carry_hints() {
        let ticket = sample_ticket(BlobFormat::Raw);
        let opts = ticket.as_download_options();

        assert_eq!(opts.format, BlobFormat::Raw);
        assert_eq!(opts.node, *ticket.node_addr());
        assert_eq!(opts.node.dial_addrs().count(), 2);
    }

    #[test]
    fn test_truncated_ticket_rejected() {
        let text = sample_ticket(BlobFormat::Raw).to_string();
        let truncated = &text[..text.len() - 10];
        assert!(truncated.parse::<BlobTicket>().is_err());
    }

    #[test]
    fn test_non_conforming_tickets_rejected() {
        assert!(matches!(
            "nodeabc".parse::<BlobTicket>(),
            Err(TicketError::MissingPrefix)
        ));
        assert!(matches!(
            "blob!!!not-base64".parse::<BlobTicket>(),
            Err(TicketError::Base64(_))
        ));
        assert!("blob".parse::<BlobTicket>().is_err());
        assert!("".parse::<BlobTicket>().is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut wire = sample_ticket(BlobFormat::Raw).to_wire();
        wire.version = 9;
        let record = wire_options().serialize(&wire).unwrap();
        let text = format!("{}{}", TICKET_PREFIX, URL_SAFE_NO_PAD.encode(record));

        assert!(matches!(
            text.parse::<BlobTicket>(),
            Err(TicketError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_format_must_match_hash_codec() {
        let hash = blake3_cid_with_codec(BLOB_CODEC, b"root").unwrap();
        assert!(matches!(
            BlobTicket::new(sample_node(), hash, BlobFormat::Collection),
            Err(TicketError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn test_addr_info_options_filter_hints() {
        let node = sample_node();

        let id_only = AddrInfoOptions::Id.apply(node.clone());
        assert!(id_only.relay_addrs.is_empty() && id_only.direct_addrs.is_empty());

        let relay = AddrInfoOptions::Relay.apply(node.clone());
        assert_eq!(relay.relay_addrs.len(), 1);
        assert!(relay.direct_addrs.is_empty());

        let direct = AddrInfoOptions::Addresses.apply(node.clone());
        assert!(direct.relay_addrs.is_empty());
        assert_eq!(direct.direct_addrs.len(), 1);

        assert_eq!(AddrInfoOptions::RelayAndAddresses.apply(node.clone()), node);
    }

    fn many_addrs(count: u32) -> Vec<Multiaddr> {
        (0..count)
            .map(|i| {
                format!("/ip4/10.{}.{}.1/tcp/{}", i / 256 % 256, i % 256, 4000 + i)
                    .parse()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_oversized_ticket_rejected() {
        let node = NodeAddr::new(PeerId::random()).with_direct_addrs(many_addrs(3000));
        let hash = blake3_cid_with_codec(BLOB_CODEC, b"root").unwrap();

        assert!(matches!(
            BlobTicket::new(node, hash, BlobFormat::Raw),
            Err(TicketError::TooLarge)
        ));
    }

    #[test]
    fn test_busy_host_still_gets_a_printable_ticket() {
        let node = NodeAddr::new(PeerId::random())
            .with_direct_addrs(many_addrs(3000))
            .with_relay_addrs(many_addrs(3000));
        let node = AddrInfoOptions::RelayAndAddresses.apply(node);
        assert_eq!(node.direct_addrs.len(), MAX_TICKET_ADDRS);
        assert_eq!(node.relay_addrs.len(), MAX_TICKET_ADDRS);

        let hash = blake3_cid_with_codec(COLLECTION_CODEC, b"root").unwrap();
        let ticket = BlobTicket::new(node, hash, BlobFormat::Collection).unwrap();
        let parsed: BlobTicket = ticket.to_string().parse().unwrap();
        assert_eq!(parsed, ticket);
    }

    #[test]
    fn test_own_peer_suffix_is_stripped() {
        let peer_id = PeerId::random();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/9000/p2p/{}", peer_id)
            .parse()
            .unwrap();
        let node = NodeAddr::new(peer_id).with_direct_addrs([addr]);

        assert_eq!(
            node.direct_addrs[0],
            "/ip4/127.0.0.1/tcp/9000".parse::<Multiaddr>().unwrap()
        );
    }

    #[test]
    fn test_format_codec_mapping() {
        assert_eq!(BlobFormat::from_codec(BLOB_CODEC), Some(BlobFormat::Raw));
        assert_eq!(
            BlobFormat::from_codec(COLLECTION_CODEC),
            Some(BlobFormat::Collection)
        );
        assert_eq!(BlobFormat::from_codec(0x55), None);
        assert!(BlobFormat::Collection.is_collection());
    }
}
