use serde::{Deserialize, Serialize};

/// Tags of the point-to-point protocol messages the controller exchanges
/// with compute nodes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    RequestPing,
    RequestNodeRegistrationStatus,
    RequestRevokeJobCredential,
    ResponseReturnCode,
}

impl MessageType {
    /// True for the request types the dispatch agent is allowed to fan out.
    pub fn is_agent_request(self) -> bool {
        matches!(
            self,
            MessageType::RequestPing
                | MessageType::RequestNodeRegistrationStatus
                | MessageType::RequestRevokeJobCredential
        )
    }
}

/// Wire envelope of a request: a tag plus an opaque serialized body.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestEnvelope {
    pub msg_type: MessageType,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReplyEnvelope {
    pub msg_type: MessageType,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Body of a `ResponseReturnCode` reply.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct ReturnCodeMsg {
    pub return_code: i32,
}

/// Body of a `RequestRevokeJobCredential` request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RevokeCredentialMsg {
    pub job_id: crate::JobId,
    pub expiration: u64,
}
