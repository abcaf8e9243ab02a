use serde::{Deserialize, Serialize};

use super::{WireError, WireResult};

/// One control frame.
///
/// `TxRequest`/`TxResponse` only announce a payload length; the payload
/// itself follows as raw frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    SessionRequest {
        id: u64,
        sigma_mkl_root: String,
        extra_info: Vec<u8>,
    },
    SessionAck {
        id: u64,
        mode: u8,
        sigma_mkl_root: String,
        extra_info: Vec<u8>,
    },
    NegoRequest {
        payload: Vec<u8>,
    },
    NegoAckReq {
        ack: Vec<u8>,
        request: Vec<u8>,
    },
    NegoAck {
        payload: Vec<u8>,
    },
    TxRequest {
        length: u64,
    },
    TxResponse {
        length: u64,
    },
    TxReceipt {
        payload: Vec<u8>,
    },
}

impl WireMessage {
    pub fn name(&self) -> &'static str {
        match self {
            WireMessage::SessionRequest { .. } => "SessionRequest",
            WireMessage::SessionAck { .. } => "SessionAck",
            WireMessage::NegoRequest { .. } => "NegoRequest",
            WireMessage::NegoAckReq { .. } => "NegoAckReq",
            WireMessage::NegoAck { .. } => "NegoAck",
            WireMessage::TxRequest { .. } => "TxRequest",
            WireMessage::TxResponse { .. } => "TxResponse",
            WireMessage::TxReceipt { .. } => "TxReceipt",
        }
    }

    pub fn encode(&self) -> WireResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| WireError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        bincode::deserialize(bytes).map_err(|e| WireError::Codec(e.to_string()))
    }
}

/// Pricing and mode terms carried as JSON in session request and ack.
///
/// Buyers may leave `sub_mode` out and let the seller pick from its
/// catalog. `addr` is the sender's chain address when the channel does
/// not already authenticate it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraInfo {
    pub price: i64,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_mode: Option<String>,
    pub ot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
}

impl ExtraInfo {
    pub fn to_json(&self) -> WireResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| WireError::Codec(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> WireResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| WireError::Protocol(format!("invalid extra info: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_info_omits_absent_optionals() {
        let info = ExtraInfo {
            price: 100,
            mode: "plain".into(),
            sub_mode: None,
            ot: false,
            addr: None,
        };
        let json = String::from_utf8(info.to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"price":100,"mode":"plain","ot":false}"#);
        assert_eq!(ExtraInfo::from_json(json.as_bytes()).unwrap(), info);
    }

    #[test]
    fn extra_info_reads_sub_mode_key() {
        let info =
            ExtraInfo::from_json(br#"{"price":5,"mode":"table","subMode":"vrf","ot":true}"#)
                .unwrap();
        assert_eq!(info.sub_mode.as_deref(), Some("vrf"));
        assert!(ExtraInfo::from_json(b"{}").is_err());
    }

    #[test]
    fn garbage_frame_is_a_codec_error() {
        assert!(matches!(
            WireMessage::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]),
            Err(WireError::Codec(_))
        ));
    }
}
