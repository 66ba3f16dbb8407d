//! Cache key construction.
//!
//! Keys look like `{prefix}{kind}:{fingerprint}` when the store groups entries
//! by tag and `{prefix}{kind}:v{version}:{fingerprint}` under the version
//! fallback. The fingerprint hashes a canonical, type-tagged encoding of the
//! parameter bag, so insertion order never matters and `1` never collides
//! with `"1"`.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use xxhash_rust::xxh3::xxh3_128;
use xxhash_rust::xxh64::xxh64;

use crate::error::CacheError;

/// A single parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<usize> for ParamValue {
    fn from(value: usize) -> Self {
        Self::UInt(value as u64)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<ParameterBag> for ParamValue {
    fn from(bag: ParameterBag) -> Self {
        Self::Map(bag.0)
    }
}

impl From<serde_json::Value> for ParamValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(flag),
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    Self::Int(int)
                } else if let Some(uint) = number.as_u64() {
                    Self::UInt(uint)
                } else {
                    Self::Float(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(text) => Self::Str(text),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

/// Caller supplied parameters that disambiguate entries of one kind.
///
/// Entries are kept sorted by key, so two bags with the same content are equal
/// and fingerprint identically no matter how they were assembled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterBag(BTreeMap<String, ParamValue>);

impl ParameterBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    /// Build a bag from any value that serializes to a map, e.g. a query struct.
    ///
    /// serde_json turns non-finite floats into `null`; insert such values as
    /// [`ParamValue::Float`] directly to have them rejected instead.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, CacheError> {
        let json = serde_json::to_value(value)
            .map_err(|err| CacheError::serialization(err.to_string()))?;
        match ParamValue::from(json) {
            ParamValue::Map(entries) => Ok(Self(entries)),
            ParamValue::Null => Ok(Self::default()),
            other => Err(CacheError::serialization(format!(
                "parameters must serialize to a map, got {}",
                other.type_name()
            ))),
        }
    }
}

impl<K, V> FromIterator<(K, V)> for ParameterBag
where
    K: Into<String>,
    V: Into<ParamValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for ParameterBag
where
    K: Into<String>,
    V: Into<ParamValue>,
{
    fn from(entries: [(K, V); N]) -> Self {
        entries.into_iter().collect()
    }
}

impl ParamValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::UInt(_) => "integer",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }
}

/// Hash used to turn the canonical encoding into a fingerprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HashAlgorithm {
    #[default]
    Xxh64,
    Xxh128,
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Xxh64 => "xxh64",
            Self::Xxh128 => "xxh128",
            Self::Sha256 => "sha256",
        }
    }

    /// Hex digest of `bytes`.
    pub fn digest(self, bytes: &[u8]) -> String {
        match self {
            Self::Xxh64 => format!("{:016x}", xxh64(bytes, 0)),
            Self::Xxh128 => format!("{:032x}", xxh3_128(bytes)),
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(bytes);
                hex::encode(hasher.finalize())
            }
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "xxh64" => Ok(Self::Xxh64),
            "xxh128" | "xxh3" => Ok(Self::Xxh128),
            "sha256" => Ok(Self::Sha256),
            "md5" | "sha1" => Err(format!(
                "hash algorithm `{value}` is not supported; use xxh64, xxh128 or sha256"
            )),
            other => Err(format!("unknown hash algorithm `{other}`")),
        }
    }
}

impl TryFrom<String> for HashAlgorithm {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HashAlgorithm> for String {
    fn from(algorithm: HashAlgorithm) -> Self {
        algorithm.as_str().to_string()
    }
}

/// Builds cache keys for a given prefix and hash algorithm.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
    algorithm: HashAlgorithm,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>, algorithm: HashAlgorithm) -> Self {
        Self {
            prefix: prefix.into(),
            algorithm,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hash of the canonical encoding of `params`.
    pub fn fingerprint(&self, params: &ParameterBag) -> Result<String, CacheError> {
        let canonical = canonicalize(params)?;
        Ok(self.algorithm.digest(canonical.as_bytes()))
    }

    /// Full key for `kind`; `version` is embedded when the version fallback is active.
    pub fn build(
        &self,
        kind: &str,
        params: &ParameterBag,
        version: Option<u64>,
    ) -> Result<String, CacheError> {
        let fingerprint = self.fingerprint(params)?;
        Ok(self.key_for_fingerprint(kind, &fingerprint, version))
    }

    /// Key for an already computed fingerprint.
    pub fn key_for_fingerprint(
        &self,
        kind: &str,
        fingerprint: &str,
        version: Option<u64>,
    ) -> String {
        let kind = escape_kind(kind);
        match version {
            Some(version) => format!("{}{kind}:v{version}:{fingerprint}", self.prefix),
            None => format!("{}{kind}:{fingerprint}", self.prefix),
        }
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new("", HashAlgorithm::default())
    }
}

/// Percent-encode every byte outside `[A-Za-z0-9_.-]`.
///
/// `%` itself is encoded, so distinct kinds never share an encoding.
pub fn escape_kind(kind: &str) -> String {
    let mut out = String::with_capacity(kind.len());
    for byte in kind.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'.' | b'-') {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

/// Canonical, type-tagged text form of a bag.
pub fn canonicalize(params: &ParameterBag) -> Result<String, CacheError> {
    let mut out = String::new();
    encode_map(&params.0, &mut out)?;
    Ok(out)
}

fn encode_map(entries: &BTreeMap<String, ParamValue>, out: &mut String) -> Result<(), CacheError> {
    let _ = write!(out, "m:{}:{{", entries.len());
    for (key, value) in entries {
        encode_str(key, out);
        encode_value(value, out)?;
    }
    out.push('}');
    Ok(())
}

fn encode_str(text: &str, out: &mut String) {
    let _ = write!(out, "s:{}:{text};", text.len());
}

fn encode_value(value: &ParamValue, out: &mut String) -> Result<(), CacheError> {
    match value {
        ParamValue::Null => out.push_str("n;"),
        ParamValue::Bool(flag) => {
            let _ = write!(out, "b:{};", u8::from(*flag));
        }
        ParamValue::Int(int) => {
            let _ = write!(out, "i:{int};");
        }
        ParamValue::UInt(uint) => match i64::try_from(*uint) {
            Ok(int) => {
                let _ = write!(out, "i:{int};");
            }
            Err(_) => {
                let _ = write!(out, "u:{uint};");
            }
        },
        ParamValue::Float(float) => {
            if !float.is_finite() {
                return Err(CacheError::serialization(format!(
                    "non-finite float `{float}` cannot be part of a cache key"
                )));
            }
            // -0.0 == 0.0, keep them on one key
            let float = if *float == 0.0 { 0.0 } else { *float };
            let _ = write!(out, "d:{float:?};");
        }
        ParamValue::Str(text) => encode_str(text, out),
        ParamValue::List(items) => {
            let _ = write!(out, "a:{}:{{", items.len());
            for item in items {
                encode_value(item, out)?;
            }
            out.push('}');
        }
        ParamValue::Map(entries) => encode_map(entries, out)?,
    }
    Ok(())
}
