//! Content fingerprints used to decide whether a previous deployment is still valid.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::ClassifierSpec;

/// SHA-256 digest, serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }

    fn finish(h: Sha256) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&h.finalize());
        Self(out)
    }

    /// Digest of the classifier spec alone. The spec is serialized field by field in
    /// declaration order and lists keep their order, so the encoding is stable.
    pub fn of_spec(spec: &ClassifierSpec) -> Self {
        let mut h = Sha256::new();
        // Serializing plain structs and Vecs cannot fail.
        let encoded = serde_json::to_vec(spec).unwrap_or_default();
        h.update(&encoded);
        Self::finish(h)
    }

    /// Fingerprint of what gets deployed for one cluster.
    ///
    /// Without credential material this is the spec digest. With it, the spec digest, the
    /// credential bytes and the endpoint are concatenated and hashed again, so a credential
    /// rotation alone changes the fingerprint and causes a redeploy.
    pub fn compute(spec: &ClassifierSpec, credential: Option<&[u8]>, endpoint: Option<&str>) -> Self {
        let base = Self::of_spec(spec);
        let Some(credential) = credential else { return base };
        let mut h = Sha256::new();
        h.update(base.0);
        h.update(credential);
        if let Some(ep) = endpoint {
            h.update(ep.as_bytes());
        }
        Self::finish(h)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Fingerprint::from_hex(&s).map_err(de::Error::custom)
    }
}
