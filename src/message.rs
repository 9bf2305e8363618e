use crate::{contact::Contact, id::NodeId, value::Value};
use serde::{Deserialize, Serialize};

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct Message {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    /// Decode the message from bencode.
    pub fn decode(input: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(input)
    }

    /// Encode the message into bencode.
    pub fn encode(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

/// Kind of the message, keyed by `y`. Responses and errors carry their payload one level
/// deeper, under `r` and `e`.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "y")]
pub(crate) enum MessageBody {
    #[serde(rename = "q")]
    Request(Request),
    #[serde(rename = "r")]
    Response {
        #[serde(rename = "r")]
        response: Response,
    },
    #[serde(rename = "e")]
    Error {
        #[serde(rename = "e")]
        error: RemoteError,
    },
}

/// Requests exchanged between DHT nodes. Every request carries the sender's contact so the
/// receiver can add it to its routing table.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "q", content = "a")]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Ping(PingRequest),
    FindNode(FindNodeRequest),
    FindValue(FindValueRequest),
    Store(StoreRequest),
}

impl Request {
    pub fn sender(&self) -> &Contact {
        match self {
            Self::Ping(r) => &r.sender,
            Self::FindNode(r) => &r.sender,
            Self::FindValue(r) => &r.sender,
            Self::Store(r) => &r.sender,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PingRequest {
    pub sender: Contact,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FindNodeRequest {
    pub sender: Contact,
    pub target: NodeId,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FindValueRequest {
    pub sender: Contact,
    pub key: NodeId,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct StoreRequest {
    pub sender: Contact,
    pub values: Vec<Value>,
}

/// Answer to any request. Which fields are present depends on the request:
/// `find_node` fills `nodes`, `find_value` fills either `values` or `nodes` and `store` reports
/// how many values were accepted.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Response {
    pub sender: Contact,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Contact>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored: Option<u32>,
}

impl Response {
    pub fn new(sender: Contact) -> Self {
        Self {
            sender,
            nodes: Vec::new(),
            values: Vec::new(),
            stored: None,
        }
    }
}

/// Failure reported by the remote node instead of a response: an error code followed by a
/// human readable message.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct RemoteError(pub u8, pub String);
