// Call-contract attachment decoding

use prost::Message;

/// Protobuf attachment carried by call-contract transactions
#[derive(Clone, PartialEq, Message)]
pub struct CallContractAttachment {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub args: Vec<Vec<u8>>,
}

/// Decode a hex payload (with or without `0x`) into a call attachment
pub fn decode_call_attachment(payload: &str) -> Result<CallContractAttachment, String> {
    let hex_str = payload
        .strip_prefix("0x")
        .or_else(|| payload.strip_prefix("0X"))
        .unwrap_or(payload);
    let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex payload: {}", e))?;
    CallContractAttachment::decode(bytes.as_slice())
        .map_err(|e| format!("invalid call attachment: {}", e))
}
