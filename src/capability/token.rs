// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Opaque capability token value type.

use std::fmt;

use base64ct::{Base64, Encoding};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque OS-issued blob granting access to one filesystem location.
///
/// No structure is assumed. Staleness is only discoverable by resolving
/// the token through the capability API. Serialized as standard base64.
#[derive(Clone, PartialEq, Eq)]
pub struct CapabilityToken(Vec<u8>);

impl CapabilityToken {
    /// Wrap raw bytes from the capability API.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw bytes, as handed back to the capability API.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the blob in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the blob is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Standard base64 encoding of the blob.
    pub fn to_base64(&self) -> String {
        Base64::encode_string(&self.0)
    }

    /// Decode a standard base64 string.
    pub fn from_base64(encoded: &str) -> Result<Self, base64ct::Error> {
        Base64::decode_vec(encoded).map(Self)
    }
}

impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityToken({} bytes)", self.0.len())
    }
}

impl Serialize for CapabilityToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for CapabilityToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}
