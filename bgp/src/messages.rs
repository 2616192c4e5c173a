// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The slice of BGP-4 message handling the peering controller needs: message
//! framing, OPEN, KEEPALIVE and NOTIFICATION. UPDATE bodies are carried as
//! opaque bytes.

use crate::error::Error;
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, be_u32, u8 as parse_u8},
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

pub const MAX_MESSAGE_SIZE: usize = 4096;

/// BGP Message types.
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum MessageType {
    /// The first message sent by each side once a TCP connection is
    /// established.
    Open = 1,

    /// Used to transfer routing information between BGP peers.
    Update = 2,

    /// Sent when an error condition is detected.
    Notification = 3,

    /// Exchanged between peers often enough not to cause the hold timer to
    /// expire.
    KeepAlive = 4,
}

impl From<&Message> for MessageType {
    fn from(m: &Message) -> Self {
        match m {
            Message::Open(_) => Self::Open,
            Message::Update(_) => Self::Update,
            Message::Notification(_) => Self::Notification,
            Message::KeepAlive => Self::KeepAlive,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Message {
    Open(OpenMessage),
    /// Update message body, not interpreted.
    Update(Vec<u8>),
    Notification(NotificationMessage),
    KeepAlive,
}

impl Message {
    /// Serialize the message body, without the header.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Open(m) => m.to_wire(),
            Self::Update(body) => Ok(body.clone()),
            Self::Notification(m) => Ok(m.to_wire()),
            Self::KeepAlive => Ok(Vec::new()),
        }
    }

    /// Serialize the message including its header.
    pub fn to_frame(&self) -> Result<Vec<u8>, Error> {
        let body = self.to_wire()?;
        let length = u16::try_from(body.len() + Header::WIRE_SIZE)
            .map_err(|_| Error::TooLarge("bgp message".into()))?;
        let header = Header::new(length, MessageType::from(self))?;
        let mut buf = header.to_wire();
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Deserialize a message body described by `header`.
    pub fn from_wire(header: &Header, body: &[u8]) -> Result<Message, Error> {
        match header.typ {
            MessageType::Open => Ok(OpenMessage::from_wire(body)?.into()),
            MessageType::Update => Ok(Message::Update(body.to_vec())),
            MessageType::Notification => {
                Ok(NotificationMessage::from_wire(body)?.into())
            }
            MessageType::KeepAlive => Ok(Message::KeepAlive),
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Message::Open(_) => "open",
            Message::Update(_) => "update",
            Message::Notification(_) => "notification",
            Message::KeepAlive => "keepalive",
        }
    }
}

impl From<OpenMessage> for Message {
    fn from(m: OpenMessage) -> Message {
        Message::Open(m)
    }
}

impl From<NotificationMessage> for Message {
    fn from(m: NotificationMessage) -> Message {
        Message::Notification(m)
    }
}

/// Each BGP message has a fixed sized header.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |                                                               |
///   +                                                               +
///   |                           Marker                              |
///   +                                                               +
///   |                                                               |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |          Length               |      Type     |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, PartialEq, Eq)]
pub struct Header {
    /// Total length of the message, including the header.
    pub length: u16,

    /// Indicates the type of message.
    pub typ: MessageType,
}

/// According to RFC 4271 §4.1 the header marker is all ones.
const MARKER: [u8; 16] = [0xFFu8; 16];

impl Header {
    pub const WIRE_SIZE: usize = 19;

    /// Create a new BGP message header. Length must be between 19 and 4096 per
    /// RFC 4271 §4.1.
    pub fn new(length: u16, typ: MessageType) -> Result<Header, Error> {
        if usize::from(length) < Header::WIRE_SIZE {
            return Err(Error::TooSmall("message header length".into()));
        }
        if usize::from(length) > MAX_MESSAGE_SIZE {
            return Err(Error::TooLarge("message header length".into()));
        }
        Ok(Header { length, typ })
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = MARKER.to_vec();
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.push(self.typ as u8);
        buf
    }

    pub fn from_wire(input: &[u8]) -> Result<Header, Error> {
        let (input, marker) = take(MARKER.len())(input)?;
        if marker != MARKER {
            return Err(Error::NoMarker);
        }
        let (input, length) = be_u16(input)?;
        let (_, typ) = parse_u8(input)?;
        let typ = MessageType::try_from(typ)?;
        Header::new(length, typ)
    }

    /// Length of the message body that follows this header.
    pub fn body_len(&self) -> usize {
        usize::from(self.length) - Header::WIRE_SIZE
    }
}

/// The autonomous system number used in OPEN messages when 4-byte ASNs are in
/// use.
///
/// Ref: RFC 4893 §7
pub const AS_TRANS: u16 = 23456;

/// The version number for BGP-4
pub const BGP4: u8 = 4;

/// Optional parameter type carrying capabilities (RFC 5492).
const PARAM_CAPABILITIES: u8 = 2;

/// The first message sent by each side once a TCP connection is established.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Version    |     My Autonomous System      |   Hold Time   :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :               |                BGP Identifier                 :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :               | Opt Parm Len  |  Optional Parameters (var)    :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Ref: RFC 4271 §4.2
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OpenMessage {
    pub version: u8,
    /// 2-octet ASN, or AS_TRANS when the four-octet capability carries the
    /// real one.
    pub asn: u16,
    pub hold_time: u16,
    /// BGP identifier of the sender.
    pub id: u32,
    pub capabilities: Vec<Capability>,
}

impl OpenMessage {
    /// Create an open message. A four-octet AS capability is always carried;
    /// the 2-octet field holds AS_TRANS when `asn` does not fit.
    pub fn new(
        asn: u32,
        hold_time: u16,
        id: u32,
        afi_safi: impl IntoIterator<Item = AfiSafi>,
    ) -> OpenMessage {
        let mut capabilities: Vec<Capability> = afi_safi
            .into_iter()
            .map(|af| Capability::MultiProtocol {
                afi: af.afi,
                safi: af.safi,
            })
            .collect();
        capabilities.push(Capability::FourOctetAs { asn });
        OpenMessage {
            version: BGP4,
            asn: u16::try_from(asn).unwrap_or(AS_TRANS),
            hold_time,
            id,
            capabilities,
        }
    }

    /// The sender's ASN, taking the four-octet capability into account.
    pub fn effective_asn(&self) -> u32 {
        self.capabilities
            .iter()
            .find_map(|c| match c {
                Capability::FourOctetAs { asn } => Some(*asn),
                _ => None,
            })
            .unwrap_or(u32::from(self.asn))
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![self.version];
        buf.extend_from_slice(&self.asn.to_be_bytes());
        buf.extend_from_slice(&self.hold_time.to_be_bytes());
        buf.extend_from_slice(&self.id.to_be_bytes());

        let mut caps = Vec::new();
        for c in &self.capabilities {
            caps.extend_from_slice(&c.to_wire()?);
        }
        let mut params = Vec::new();
        if !caps.is_empty() {
            params.push(PARAM_CAPABILITIES);
            params.push(u8::try_from(caps.len()).map_err(|_| {
                Error::TooLarge("open message capabilities".into())
            })?);
            params.extend_from_slice(&caps);
        }
        buf.push(u8::try_from(params.len()).map_err(|_| {
            Error::TooLarge("open message optional parameters".into())
        })?);
        buf.extend_from_slice(&params);
        Ok(buf)
    }

    pub fn from_wire(input: &[u8]) -> Result<OpenMessage, Error> {
        let (input, version) = parse_u8(input)?;
        if version != BGP4 {
            return Err(Error::BadVersion(version));
        }
        let (input, asn) = be_u16(input)?;
        let (input, hold_time) = be_u16(input)?;
        let (input, id) = be_u32(input)?;
        let (input, param_len) = parse_u8(input)?;
        let param_len = usize::from(param_len);
        if input.len() < param_len {
            return Err(Error::TooSmall(
                "open message optional parameters".into(),
            ));
        }

        let mut capabilities = Vec::new();
        let mut params = &input[..param_len];
        while !params.is_empty() {
            let (rest, typ) = parse_u8(params)?;
            let (rest, len) = parse_u8(rest)?;
            let (rest, value) = take(len)(rest)?;
            // Parameters other than capabilities are deprecated (RFC 5492)
            // and skipped.
            if typ == PARAM_CAPABILITIES {
                let mut value = value;
                while !value.is_empty() {
                    let (out, cap) = Capability::from_wire(value)?;
                    capabilities.push(cap);
                    value = out;
                }
            }
            params = rest;
        }

        Ok(OpenMessage {
            version,
            asn,
            hold_time,
            id,
            capabilities,
        })
    }
}

/// Capabilities advertised in an OPEN message.
///
/// Ref: RFC 5492
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Capability {
    /// RFC 4760
    MultiProtocol { afi: Afi, safi: Safi },

    /// RFC 6793
    FourOctetAs { asn: u32 },

    /// Anything this implementation does not interpret.
    Unknown { code: u8, data: Vec<u8> },
}

const CAP_MULTIPROTOCOL: u8 = 1;
const CAP_FOUR_OCTET_AS: u8 = 65;

impl Capability {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let (code, data) = match self {
            Self::MultiProtocol { afi, safi } => {
                let mut data = u16::from(*afi).to_be_bytes().to_vec();
                data.push(0);
                data.push(u8::from(*safi));
                (CAP_MULTIPROTOCOL, data)
            }
            Self::FourOctetAs { asn } => {
                (CAP_FOUR_OCTET_AS, asn.to_be_bytes().to_vec())
            }
            Self::Unknown { code, data } => (*code, data.clone()),
        };
        let mut buf = vec![code];
        buf.push(
            u8::try_from(data.len())
                .map_err(|_| Error::TooLarge("capability".into()))?,
        );
        buf.extend_from_slice(&data);
        Ok(buf)
    }

    pub fn from_wire(input: &[u8]) -> Result<(&[u8], Capability), Error> {
        let (input, code) = parse_u8(input)?;
        let (input, len) = parse_u8(input)?;
        let (input, data) = take(len)(input)?;
        let cap = match code {
            CAP_MULTIPROTOCOL if data.len() == 4 => {
                let afi = u16::from_be_bytes([data[0], data[1]]);
                match (Afi::try_from(afi), Safi::try_from(data[3])) {
                    (Ok(afi), Ok(safi)) => Capability::MultiProtocol { afi, safi },
                    _ => Capability::Unknown {
                        code,
                        data: data.to_vec(),
                    },
                }
            }
            CAP_FOUR_OCTET_AS if data.len() == 4 => {
                let (_, asn) = be_u32(data)?;
                Capability::FourOctetAs { asn }
            }
            _ => Capability::Unknown {
                code,
                data: data.to_vec(),
            },
        };
        Ok((input, cap))
    }
}

/// Address family identifiers.
///
/// Ref: IANA Address Family Numbers
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    TryFromPrimitive,
    IntoPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u16)]
#[serde(rename_all = "lowercase")]
pub enum Afi {
    Ipv4 = 1,
    Ipv6 = 2,
}

/// Subsequent address family identifiers.
///
/// Ref: RFC 4760 §6
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    TryFromPrimitive,
    IntoPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
pub enum Safi {
    Unicast = 1,
    Multicast = 2,
}

/// An address family to negotiate with a peer.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct AfiSafi {
    pub afi: Afi,
    pub safi: Safi,
}

impl AfiSafi {
    pub const IPV4_UNICAST: AfiSafi = AfiSafi {
        afi: Afi::Ipv4,
        safi: Safi::Unicast,
    };
}

impl Display for AfiSafi {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.afi, self.safi)
    }
}

/// Sent when an error condition is detected. The connection is closed
/// immediately after.
///
/// Ref: RFC 4271 §4.5
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NotificationMessage {
    pub error_code: u8,
    pub error_subcode: u8,
    pub data: Vec<u8>,
}

/// Notification error codes.
///
/// Ref: RFC 4271 §4.5
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ErrorCode {
    Header = 1,
    Open = 2,
    Update = 3,
    HoldTimerExpired = 4,
    Fsm = 5,
    Cease = 6,
}

/// Open message error subcode for an unexpected peer ASN.
///
/// Ref: RFC 4271 §6.2
pub const OPEN_BAD_PEER_AS: u8 = 2;

/// Cease subcodes.
///
/// Ref: RFC 4486 §4
pub const CEASE_ADMIN_SHUTDOWN: u8 = 2;
pub const CEASE_CONNECTION_COLLISION: u8 = 7;

impl NotificationMessage {
    pub fn new(error_code: ErrorCode, error_subcode: u8) -> Self {
        Self {
            error_code: error_code.into(),
            error_subcode,
            data: Vec::new(),
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = vec![self.error_code, self.error_subcode];
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn from_wire(input: &[u8]) -> Result<NotificationMessage, Error> {
        let (input, error_code) = parse_u8(input)?;
        let (input, error_subcode) = parse_u8(input)?;
        Ok(NotificationMessage {
            error_code,
            error_subcode,
            data: input.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn open_four_octet_asn() {
        let om = OpenMessage::new(
            4200000001,
            90,
            0x0a000001,
            [AfiSafi::IPV4_UNICAST],
        );
        assert_eq!(om.asn, AS_TRANS);

        let frame = Message::from(om.clone()).to_frame().expect("frame");
        assert_eq!(&frame[..16], &MARKER);
        let hdr = Header::from_wire(&frame[..Header::WIRE_SIZE]).expect("hdr");
        assert_eq!(hdr.typ, MessageType::Open);
        assert_eq!(hdr.body_len(), frame.len() - Header::WIRE_SIZE);

        let parsed = Message::from_wire(&hdr, &frame[Header::WIRE_SIZE..])
            .expect("parse open");
        let Message::Open(parsed) = parsed else {
            panic!("expected open, got {parsed:?}");
        };
        assert_eq!(parsed.effective_asn(), 4200000001);
        assert_eq!(parsed.id, 0x0a000001);
        assert_eq!(parsed, om);
    }

    #[test]
    fn open_two_octet_asn_without_capabilities() {
        // version 4, as 65001, hold 180, id 1.2.3.4, no optional parameters
        let body = [4, 0xfd, 0xe9, 0, 180, 1, 2, 3, 4, 0];
        let om = OpenMessage::from_wire(&body).expect("parse open");
        assert_eq!(om.effective_asn(), 65001);
        assert_eq!(om.hold_time, 180);
        assert_eq!(om.id, 0x01020304);
        assert!(om.capabilities.is_empty());
    }

    #[test]
    fn open_bad_version() {
        let body = [3, 0xfd, 0xe9, 0, 180, 1, 2, 3, 4, 0];
        assert!(matches!(
            OpenMessage::from_wire(&body),
            Err(Error::BadVersion(3))
        ));
    }

    #[test]
    fn unknown_capability_is_preserved() {
        // route refresh (2) with no data, then 4-octet as
        let caps = [2, 0, 65, 4, 0, 0, 0xfd, 0xe9];
        let mut body = vec![4, 0x5b, 0xa0, 0, 90, 0, 0, 0, 1];
        body.push(caps.len() as u8 + 2);
        body.push(PARAM_CAPABILITIES);
        body.push(caps.len() as u8);
        body.extend_from_slice(&caps);

        let om = OpenMessage::from_wire(&body).expect("parse open");
        assert_eq!(
            om.capabilities,
            vec![
                Capability::Unknown {
                    code: 2,
                    data: Vec::new()
                },
                Capability::FourOctetAs { asn: 65001 },
            ]
        );
    }

    #[test]
    fn header_rejects_bad_marker_and_length() {
        let mut buf = Header::new(19, MessageType::KeepAlive)
            .expect("header")
            .to_wire();
        buf[3] = 0;
        assert!(matches!(Header::from_wire(&buf), Err(Error::NoMarker)));

        let mut buf = MARKER.to_vec();
        buf.extend_from_slice(&18u16.to_be_bytes());
        buf.push(MessageType::KeepAlive as u8);
        assert!(matches!(Header::from_wire(&buf), Err(Error::TooSmall(_))));
    }

    #[test]
    fn notification_carries_data() {
        let frame = Message::from(NotificationMessage {
            error_code: 6,
            error_subcode: 2,
            data: vec![0xaa],
        })
        .to_frame()
        .expect("frame");
        assert_eq!(frame.len(), Header::WIRE_SIZE + 3);
        assert_eq!(&frame[Header::WIRE_SIZE..], &[6, 2, 0xaa]);
    }
}
