//! Shared macros

/// Implements byte access, hex conversion and hex serde for a fixed-size
/// byte newtype `$name(pub [u8; $len])`.
macro_rules! impl_hex_bytes {
    ($name:ident, $len:expr) => {
        impl $name {
            /// Create from raw bytes
            pub fn from_bytes(bytes: &[u8]) -> $crate::crypto::CryptoResult<Self> {
                let arr: [u8; $len] = bytes.try_into().map_err(|_| {
                    $crate::crypto::CryptoError::InvalidLength {
                        expected: $len,
                        actual: bytes.len(),
                    }
                })?;
                Ok($name(arr))
            }

            /// Get raw bytes
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Convert to hex
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Create from hex
            pub fn from_hex(s: &str) -> $crate::crypto::CryptoResult<Self> {
                let bytes = hex::decode(s)
                    .map_err(|e| $crate::crypto::CryptoError::Encoding(e.to_string()))?;
                Self::from_bytes(&bytes)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
