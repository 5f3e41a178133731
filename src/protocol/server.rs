//! Server message codec
//!
//! Typed encode/decode for the persistent central-server connection.
//! Requests are client-originated, responses are server-originated;
//! unknown response codes decode to `Unknown` and are ignored upstream.

use anyhow::Result;
use bytes::BytesMut;
use md5::{Digest, Md5};
use std::net::Ipv4Addr;
use tracing::trace;

use crate::config::{CLIENT_VERSION, MINOR_VERSION};
use crate::protocol::frame::Frame;
use crate::protocol::peer::ConnKind;
use crate::protocol::wire;

/// Server message codes
pub mod code {
    pub const LOGIN: u32 = 1;
    pub const SET_WAIT_PORT: u32 = 2;
    pub const GET_PEER_ADDRESS: u32 = 3;
    pub const CONNECT_TO_PEER: u32 = 18;
    pub const FILE_SEARCH: u32 = 26;
    pub const SET_STATUS: u32 = 28;
    pub const SHARED_FOLDERS_FILES: u32 = 35;
    pub const HAVE_NO_PARENTS: u32 = 71;
    pub const SEARCH_PARENT: u32 = 73;
    pub const POSSIBLE_PARENTS: u32 = 102;
    pub const CANT_CONNECT_TO_PEER: u32 = 1001;
}

/// Online presence advertised with SetStatus
pub const STATUS_ONLINE: u32 = 2;

/// A client-to-server request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRequest {
    Login {
        username: String,
        password: String,
    },
    SetWaitPort(u16),
    GetPeerAddress {
        username: String,
    },
    ConnectToPeer {
        token: u32,
        username: String,
        kind: ConnKind,
    },
    FileSearch {
        token: u32,
        query: String,
    },
    SetStatus(u32),
    SharedFoldersFiles {
        dirs: u32,
        files: u32,
    },
    HaveNoParents(bool),
    SearchParent(Ipv4Addr),
    CantConnectToPeer {
        token: u32,
        username: String,
    },
}

impl ServerRequest {
    /// Message code for this request
    pub fn code(&self) -> u32 {
        match self {
            ServerRequest::Login { .. } => code::LOGIN,
            ServerRequest::SetWaitPort(_) => code::SET_WAIT_PORT,
            ServerRequest::GetPeerAddress { .. } => code::GET_PEER_ADDRESS,
            ServerRequest::ConnectToPeer { .. } => code::CONNECT_TO_PEER,
            ServerRequest::FileSearch { .. } => code::FILE_SEARCH,
            ServerRequest::SetStatus(_) => code::SET_STATUS,
            ServerRequest::SharedFoldersFiles { .. } => code::SHARED_FOLDERS_FILES,
            ServerRequest::HaveNoParents(_) => code::HAVE_NO_PARENTS,
            ServerRequest::SearchParent(_) => code::SEARCH_PARENT,
            ServerRequest::CantConnectToPeer { .. } => code::CANT_CONNECT_TO_PEER,
        }
    }

    /// Serialize the request into a complete wire frame
    pub fn encode(&self) -> BytesMut {
        let mut payload = BytesMut::new();

        match self {
            ServerRequest::Login { username, password } => {
                wire::put_str(&mut payload, username);
                wire::put_str(&mut payload, password);
                wire::put_u32(&mut payload, CLIENT_VERSION);
                // The server expects the MD5 hex digest of username+password
                let mut hasher = Md5::new();
                hasher.update(username.as_bytes());
                hasher.update(password.as_bytes());
                wire::put_str(&mut payload, &hex::encode(hasher.finalize()));
                wire::put_u32(&mut payload, MINOR_VERSION);
            }
            ServerRequest::SetWaitPort(port) => {
                wire::put_u32(&mut payload, u32::from(*port));
            }
            ServerRequest::GetPeerAddress { username } => {
                wire::put_str(&mut payload, username);
            }
            ServerRequest::ConnectToPeer { token, username, kind } => {
                wire::put_u32(&mut payload, *token);
                wire::put_str(&mut payload, username);
                wire::put_str(&mut payload, kind.as_str());
            }
            ServerRequest::FileSearch { token, query } => {
                wire::put_u32(&mut payload, *token);
                wire::put_str(&mut payload, query);
            }
            ServerRequest::SetStatus(status) => {
                wire::put_u32(&mut payload, *status);
            }
            ServerRequest::SharedFoldersFiles { dirs, files } => {
                wire::put_u32(&mut payload, *dirs);
                wire::put_u32(&mut payload, *files);
            }
            ServerRequest::HaveNoParents(value) => {
                wire::put_bool(&mut payload, *value);
            }
            ServerRequest::SearchParent(ip) => {
                wire::put_ip(&mut payload, *ip);
            }
            ServerRequest::CantConnectToPeer { token, username } => {
                wire::put_u32(&mut payload, *token);
                wire::put_str(&mut payload, username);
            }
        }

        trace!(
            "Encoded server request: code={}, payload={} bytes",
            self.code(),
            payload.len()
        );
        Frame::encode(self.code(), &payload)
    }
}

/// A peer hint from the distributed-network parent list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentHint {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// A server-to-client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerResponse {
    LoginOk {
        greeting: String,
        own_ip: Ipv4Addr,
    },
    LoginFailed {
        reason: String,
    },
    GetPeerAddress {
        username: String,
        ip: Ipv4Addr,
        port: u16,
    },
    ConnectToPeer {
        username: String,
        kind: ConnKind,
        ip: Ipv4Addr,
        port: u16,
        token: u32,
    },
    PossibleParents(Vec<ParentHint>),
    CantConnectToPeer {
        token: u32,
        username: String,
    },
    /// A code this client does not act on; logged and dropped
    Unknown {
        code: u32,
    },
}

impl ServerResponse {
    /// Decode one framed server message
    pub fn decode(frame: Frame) -> Result<Self> {
        let mut buf = frame.payload;
        match frame.code {
            code::LOGIN => {
                if wire::get_bool(&mut buf)? {
                    let greeting = wire::get_str(&mut buf)?;
                    let own_ip = wire::get_ip(&mut buf)?;
                    Ok(ServerResponse::LoginOk { greeting, own_ip })
                } else {
                    let reason = wire::get_str(&mut buf)?;
                    Ok(ServerResponse::LoginFailed { reason })
                }
            }
            code::GET_PEER_ADDRESS => {
                let username = wire::get_str(&mut buf)?;
                let ip = wire::get_ip(&mut buf)?;
                let port = wire::get_u32(&mut buf)? as u16;
                Ok(ServerResponse::GetPeerAddress { username, ip, port })
            }
            code::CONNECT_TO_PEER => {
                let username = wire::get_str(&mut buf)?;
                let kind = ConnKind::parse(&wire::get_str(&mut buf)?)?;
                let ip = wire::get_ip(&mut buf)?;
                let port = wire::get_u32(&mut buf)? as u16;
                let token = wire::get_u32(&mut buf)?;
                Ok(ServerResponse::ConnectToPeer {
                    username,
                    kind,
                    ip,
                    port,
                    token,
                })
            }
            code::POSSIBLE_PARENTS => {
                let count = wire::get_u32(&mut buf)? as usize;
                let mut parents = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let username = wire::get_str(&mut buf)?;
                    let ip = wire::get_ip(&mut buf)?;
                    let port = wire::get_u32(&mut buf)? as u16;
                    parents.push(ParentHint { username, ip, port });
                }
                Ok(ServerResponse::PossibleParents(parents))
            }
            code::CANT_CONNECT_TO_PEER => {
                let token = wire::get_u32(&mut buf)?;
                let username = wire::get_str(&mut buf)?;
                Ok(ServerResponse::CantConnectToPeer { token, username })
            }
            other => {
                trace!("Unknown server message code: {}", other);
                Ok(ServerResponse::Unknown { code: other })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    fn decode_request_payload(request: &ServerRequest) -> bytes::Bytes {
        let mut encoded = request.encode().freeze();
        let declared = encoded.get_u32_le() as usize;
        assert_eq!(declared, encoded.remaining());
        let code = encoded.get_u32_le();
        assert_eq!(code, request.code());
        encoded
    }

    #[test]
    fn test_login_request_carries_digest() {
        let request = ServerRequest::Login {
            username: "alice".to_string(),
            password: "secret".to_string(),
        };
        let mut payload = decode_request_payload(&request);
        assert_eq!(wire::get_str(&mut payload).unwrap(), "alice");
        assert_eq!(wire::get_str(&mut payload).unwrap(), "secret");
        assert_eq!(wire::get_u32(&mut payload).unwrap(), CLIENT_VERSION);

        let digest = wire::get_str(&mut payload).unwrap();
        let mut hasher = Md5::new();
        hasher.update(b"alicesecret");
        assert_eq!(digest, hex::encode(hasher.finalize()));
        assert_eq!(wire::get_u32(&mut payload).unwrap(), MINOR_VERSION);
    }

    #[test]
    fn test_file_search_round_trip_shape() {
        let request = ServerRequest::FileSearch {
            token: 0xCAFE,
            query: "artist title".to_string(),
        };
        let mut payload = decode_request_payload(&request);
        assert_eq!(wire::get_u32(&mut payload).unwrap(), 0xCAFE);
        assert_eq!(wire::get_str(&mut payload).unwrap(), "artist title");
    }

    #[test]
    fn test_decode_login_ok() {
        let mut payload = BytesMut::new();
        wire::put_bool(&mut payload, true);
        wire::put_str(&mut payload, "Welcome");
        wire::put_ip(&mut payload, "10.1.2.3".parse().unwrap());

        let response = ServerResponse::decode(Frame {
            code: code::LOGIN,
            payload: payload.freeze(),
        })
        .unwrap();
        assert_eq!(
            response,
            ServerResponse::LoginOk {
                greeting: "Welcome".to_string(),
                own_ip: "10.1.2.3".parse().unwrap(),
            }
        );
    }

    #[test]
    fn test_decode_login_failed() {
        let mut payload = BytesMut::new();
        wire::put_bool(&mut payload, false);
        wire::put_str(&mut payload, "INVALIDPASS");

        let response = ServerResponse::decode(Frame {
            code: code::LOGIN,
            payload: payload.freeze(),
        })
        .unwrap();
        assert_eq!(
            response,
            ServerResponse::LoginFailed {
                reason: "INVALIDPASS".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_connect_to_peer() {
        let mut payload = BytesMut::new();
        wire::put_str(&mut payload, "bob");
        wire::put_str(&mut payload, "F");
        wire::put_ip(&mut payload, "192.0.2.7".parse().unwrap());
        wire::put_u32(&mut payload, 2242);
        wire::put_u32(&mut payload, 99);

        let response = ServerResponse::decode(Frame {
            code: code::CONNECT_TO_PEER,
            payload: payload.freeze(),
        })
        .unwrap();
        assert_eq!(
            response,
            ServerResponse::ConnectToPeer {
                username: "bob".to_string(),
                kind: ConnKind::FileTransfer,
                ip: "192.0.2.7".parse().unwrap(),
                port: 2242,
                token: 99,
            }
        );
    }

    #[test]
    fn test_decode_get_peer_address() {
        let mut payload = BytesMut::new();
        wire::put_str(&mut payload, "carol");
        wire::put_ip(&mut payload, "198.51.100.9".parse().unwrap());
        wire::put_u32(&mut payload, 2234);

        let response = ServerResponse::decode(Frame {
            code: code::GET_PEER_ADDRESS,
            payload: payload.freeze(),
        })
        .unwrap();
        assert_eq!(
            response,
            ServerResponse::GetPeerAddress {
                username: "carol".to_string(),
                ip: "198.51.100.9".parse().unwrap(),
                port: 2234,
            }
        );
    }

    #[test]
    fn test_decode_unknown_code() {
        let response = ServerResponse::decode(Frame {
            code: 4040,
            payload: bytes::Bytes::from_static(b"whatever"),
        })
        .unwrap();
        assert_eq!(response, ServerResponse::Unknown { code: 4040 });
    }

    #[test]
    fn test_decode_truncated_login_fails() {
        let mut payload = BytesMut::new();
        wire::put_bool(&mut payload, true);
        // Greeting string missing
        assert!(ServerResponse::decode(Frame {
            code: code::LOGIN,
            payload: payload.freeze(),
        })
        .is_err());
    }
}
