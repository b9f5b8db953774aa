//! Record encoding and payload compression.
//!
//! Records are bincode (serde, standard config). Snapshot payloads are
//! LZ4 block-compressed with the original size prepended.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::StoreError;

pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(record)
}

pub fn compress_payload(payload: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(payload)
}

pub fn decompress_payload(compressed: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| StoreError::Compression(e.to_string()))
}
