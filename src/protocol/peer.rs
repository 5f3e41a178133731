//! Peer message codec
//!
//! Typed encode/decode for direct peer connections: the init
//! handshake (peer-init / pierce-firewall), search responses, and the
//! transfer negotiation messages. Both directions are encodable so
//! tests can stand in for a remote peer.

use anyhow::Result;
use bytes::BytesMut;
use tracing::trace;

use crate::error::SlskError;
use crate::protocol::frame::Frame;
use crate::protocol::wire;

/// Peer message codes
pub mod code {
    pub const PIERCE_FIREWALL: u32 = 0;
    pub const PEER_INIT: u32 = 1;
    pub const FILE_SEARCH_RESPONSE: u32 = 9;
    pub const TRANSFER_REQUEST: u32 = 40;
    pub const TRANSFER_RESPONSE: u32 = 41;
    pub const QUEUE_UPLOAD: u32 = 43;
    pub const PLACE_IN_QUEUE_RESPONSE: u32 = 44;
    pub const UPLOAD_FAILED: u32 = 46;
    pub const UPLOAD_DENIED: u32 = 50;
    pub const PLACE_IN_QUEUE_REQUEST: u32 = 51;
}

/// What a peer connection is for, announced at init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// Messaging connection (searches, transfer negotiation)
    Peer,
    /// Raw file-transfer connection
    FileTransfer,
    /// Distributed-network connection; accepted on the wire, not acted on
    Distributed,
}

impl ConnKind {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnKind::Peer => "P",
            ConnKind::FileTransfer => "F",
            ConnKind::Distributed => "D",
        }
    }

    /// Parse the wire representation
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "P" => Ok(ConnKind::Peer),
            "F" => Ok(ConnKind::FileTransfer),
            "D" => Ok(ConnKind::Distributed),
            other => Err(SlskError::protocol_error_with_source(
                "Unknown connection kind",
                format!("value: {:?}", other),
            )
            .into()),
        }
    }
}

/// Direction field of a transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// The remote wants to download from us
    Download = 0,
    /// The remote is ready to upload to us
    Upload = 1,
}

impl TransferDirection {
    fn parse(value: u32) -> Result<Self> {
        match value {
            0 => Ok(TransferDirection::Download),
            1 => Ok(TransferDirection::Upload),
            other => Err(SlskError::protocol_error_with_source(
                "Invalid transfer direction",
                format!("value: {}", other),
            )
            .into()),
        }
    }
}

/// One file entry inside a search response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    pub name: String,
    pub size: u64,
    pub extension: String,
    /// (code, value) pairs; code 0 is the bitrate in kbps
    pub attributes: Vec<(u32, u32)>,
}

impl SharedFile {
    /// Bitrate attribute, when the peer reported one
    pub fn bitrate(&self) -> Option<u32> {
        self.attributes
            .iter()
            .find(|(code, _)| *code == 0)
            .map(|(_, value)| *value)
    }
}

/// A peer's full reply to one search token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchReply {
    pub username: String,
    pub token: u32,
    pub files: Vec<SharedFile>,
    pub slots_free: bool,
    pub avg_speed: u32,
    pub queue_length: u32,
}

/// A message on a peer connection, either direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    PierceFirewall {
        token: u32,
    },
    PeerInit {
        username: String,
        kind: ConnKind,
        token: u32,
    },
    FileSearchResponse(SearchReply),
    TransferRequest {
        direction: TransferDirection,
        token: u32,
        filename: String,
        /// Present only when the remote is uploading
        file_size: u64,
    },
    TransferResponse {
        token: u32,
        allowed: bool,
        reason: Option<String>,
    },
    QueueUpload {
        filename: String,
    },
    PlaceInQueueRequest {
        filename: String,
    },
    PlaceInQueueResponse {
        filename: String,
        place: u32,
    },
    UploadDenied {
        filename: String,
        reason: String,
    },
    UploadFailed {
        filename: String,
    },
    /// A code this client does not act on; logged and dropped
    Unknown {
        code: u32,
    },
}

impl PeerMessage {
    /// Message code for this message
    pub fn code(&self) -> u32 {
        match self {
            PeerMessage::PierceFirewall { .. } => code::PIERCE_FIREWALL,
            PeerMessage::PeerInit { .. } => code::PEER_INIT,
            PeerMessage::FileSearchResponse(_) => code::FILE_SEARCH_RESPONSE,
            PeerMessage::TransferRequest { .. } => code::TRANSFER_REQUEST,
            PeerMessage::TransferResponse { .. } => code::TRANSFER_RESPONSE,
            PeerMessage::QueueUpload { .. } => code::QUEUE_UPLOAD,
            PeerMessage::PlaceInQueueRequest { .. } => code::PLACE_IN_QUEUE_REQUEST,
            PeerMessage::PlaceInQueueResponse { .. } => code::PLACE_IN_QUEUE_RESPONSE,
            PeerMessage::UploadDenied { .. } => code::UPLOAD_DENIED,
            PeerMessage::UploadFailed { .. } => code::UPLOAD_FAILED,
            PeerMessage::Unknown { code } => *code,
        }
    }

    /// Serialize the message into a complete wire frame
    pub fn encode(&self) -> BytesMut {
        let mut payload = BytesMut::new();

        match self {
            PeerMessage::PierceFirewall { token } => {
                wire::put_u32(&mut payload, *token);
            }
            PeerMessage::PeerInit { username, kind, token } => {
                wire::put_str(&mut payload, username);
                wire::put_str(&mut payload, kind.as_str());
                wire::put_u32(&mut payload, *token);
            }
            PeerMessage::FileSearchResponse(reply) => {
                wire::put_str(&mut payload, &reply.username);
                wire::put_u32(&mut payload, reply.token);
                wire::put_u32(&mut payload, reply.files.len() as u32);
                for file in &reply.files {
                    wire::put_u8(&mut payload, 1);
                    wire::put_str(&mut payload, &file.name);
                    wire::put_u64(&mut payload, file.size);
                    wire::put_str(&mut payload, &file.extension);
                    wire::put_u32(&mut payload, file.attributes.len() as u32);
                    for (attr_code, value) in &file.attributes {
                        wire::put_u32(&mut payload, *attr_code);
                        wire::put_u32(&mut payload, *value);
                    }
                }
                wire::put_bool(&mut payload, reply.slots_free);
                wire::put_u32(&mut payload, reply.avg_speed);
                wire::put_u32(&mut payload, reply.queue_length);
            }
            PeerMessage::TransferRequest {
                direction,
                token,
                filename,
                file_size,
            } => {
                wire::put_u32(&mut payload, *direction as u32);
                wire::put_u32(&mut payload, *token);
                wire::put_str(&mut payload, filename);
                if *direction == TransferDirection::Upload {
                    wire::put_u64(&mut payload, *file_size);
                }
            }
            PeerMessage::TransferResponse { token, allowed, reason } => {
                wire::put_u32(&mut payload, *token);
                wire::put_bool(&mut payload, *allowed);
                if let Some(reason) = reason {
                    wire::put_str(&mut payload, reason);
                }
            }
            PeerMessage::QueueUpload { filename } => {
                wire::put_str(&mut payload, filename);
            }
            PeerMessage::PlaceInQueueRequest { filename } => {
                wire::put_str(&mut payload, filename);
            }
            PeerMessage::PlaceInQueueResponse { filename, place } => {
                wire::put_str(&mut payload, filename);
                wire::put_u32(&mut payload, *place);
            }
            PeerMessage::UploadDenied { filename, reason } => {
                wire::put_str(&mut payload, filename);
                wire::put_str(&mut payload, reason);
            }
            PeerMessage::UploadFailed { filename } => {
                wire::put_str(&mut payload, filename);
            }
            PeerMessage::Unknown { .. } => {}
        }

        trace!(
            "Encoded peer message: code={}, payload={} bytes",
            self.code(),
            payload.len()
        );
        Frame::encode(self.code(), &payload)
    }

    /// Decode one framed peer message
    pub fn decode(frame: Frame) -> Result<Self> {
        let mut buf = frame.payload;
        match frame.code {
            code::PIERCE_FIREWALL => {
                let token = wire::get_u32(&mut buf)?;
                Ok(PeerMessage::PierceFirewall { token })
            }
            code::PEER_INIT => {
                let username = wire::get_str(&mut buf)?;
                let kind = ConnKind::parse(&wire::get_str(&mut buf)?)?;
                let token = wire::get_u32(&mut buf)?;
                Ok(PeerMessage::PeerInit { username, kind, token })
            }
            code::FILE_SEARCH_RESPONSE => {
                let username = wire::get_str(&mut buf)?;
                let token = wire::get_u32(&mut buf)?;
                let count = wire::get_u32(&mut buf)? as usize;
                let mut files = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let _marker = wire::get_u8(&mut buf)?;
                    let name = wire::get_str(&mut buf)?;
                    let size = wire::get_u64(&mut buf)?;
                    let extension = wire::get_str(&mut buf)?;
                    let attr_count = wire::get_u32(&mut buf)? as usize;
                    let mut attributes = Vec::with_capacity(attr_count.min(16));
                    for _ in 0..attr_count {
                        let attr_code = wire::get_u32(&mut buf)?;
                        let value = wire::get_u32(&mut buf)?;
                        attributes.push((attr_code, value));
                    }
                    files.push(SharedFile {
                        name,
                        size,
                        extension,
                        attributes,
                    });
                }
                let slots_free = wire::get_bool(&mut buf)?;
                let avg_speed = wire::get_u32(&mut buf)?;
                let queue_length = wire::get_u32(&mut buf)?;
                Ok(PeerMessage::FileSearchResponse(SearchReply {
                    username,
                    token,
                    files,
                    slots_free,
                    avg_speed,
                    queue_length,
                }))
            }
            code::TRANSFER_REQUEST => {
                let direction = TransferDirection::parse(wire::get_u32(&mut buf)?)?;
                let token = wire::get_u32(&mut buf)?;
                let filename = wire::get_str(&mut buf)?;
                let file_size = if direction == TransferDirection::Upload {
                    wire::get_u64(&mut buf)?
                } else {
                    0
                };
                Ok(PeerMessage::TransferRequest {
                    direction,
                    token,
                    filename,
                    file_size,
                })
            }
            code::TRANSFER_RESPONSE => {
                let token = wire::get_u32(&mut buf)?;
                let allowed = wire::get_bool(&mut buf)?;
                let reason = if allowed || buf.is_empty() {
                    None
                } else {
                    Some(wire::get_str(&mut buf)?)
                };
                Ok(PeerMessage::TransferResponse { token, allowed, reason })
            }
            code::QUEUE_UPLOAD => {
                let filename = wire::get_str(&mut buf)?;
                Ok(PeerMessage::QueueUpload { filename })
            }
            code::PLACE_IN_QUEUE_REQUEST => {
                let filename = wire::get_str(&mut buf)?;
                Ok(PeerMessage::PlaceInQueueRequest { filename })
            }
            code::PLACE_IN_QUEUE_RESPONSE => {
                let filename = wire::get_str(&mut buf)?;
                let place = wire::get_u32(&mut buf)?;
                Ok(PeerMessage::PlaceInQueueResponse { filename, place })
            }
            code::UPLOAD_DENIED => {
                let filename = wire::get_str(&mut buf)?;
                let reason = wire::get_str(&mut buf)?;
                Ok(PeerMessage::UploadDenied { filename, reason })
            }
            code::UPLOAD_FAILED => {
                let filename = wire::get_str(&mut buf)?;
                Ok(PeerMessage::UploadFailed { filename })
            }
            other => {
                trace!("Unknown peer message code: {}", other);
                Ok(PeerMessage::Unknown { code: other })
            }
        }
    }
}
