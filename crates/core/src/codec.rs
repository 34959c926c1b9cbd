//! Record codec.
//!
//! Values are encoded with `bincode` over `serde`-derived structs that carry
//! `#[serde(default)]` on every field added after the initial revision, the
//! same forward-compatibility posture `spatio::types::Config` uses for its
//! own fields: a reader that doesn't know about a new field never sees it
//! break, because there is no field to skip — it was defaulted away by the
//! writer's own absence of data for it. The per-entry tag byte lives
//! alongside the value in the substrate, not inside this payload (see
//! `crate::kv`).

use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(Error::Codec)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(Error::Codec)
}
