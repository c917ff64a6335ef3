//! Request fingerprinting.
//!
//! A fingerprint is the identity of a request as far as duplicate filtering
//! and persistence are concerned. It must be a pure function of the request's
//! identity fields and the fingerprinter's own configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::Config;
use crate::error::{Component, Error, Result};
use crate::request::FetchRequest;
use crate::util;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(Box<[u8]>);

impl Fingerprint {
    pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        hex::decode(text.trim()).ok().map(Self::from_bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Reduces a request to a stable byte key.
///
/// Implementations must be deterministic: requests with equal identity fields
/// always map to equal fingerprints.
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, request: &FetchRequest) -> Result<Fingerprint>;
}

pub type UrlNormalizer = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Hashes the canonical locator, method, body and selected headers with `D`.
pub struct DefaultFingerprinter<D = Sha256> {
    include_headers: Vec<String>,
    keep_fragments: bool,
    normalizer: Option<UrlNormalizer>,
    _digest: PhantomData<fn() -> D>,
}

#[derive(Serialize)]
struct Identity<'a> {
    method: String,
    url: String,
    body: String,
    headers: BTreeMap<&'a str, Vec<&'a str>>,
}

impl<D: Digest> DefaultFingerprinter<D> {
    pub fn new() -> Self {
        Self {
            include_headers: vec![],
            keep_fragments: false,
            normalizer: None,
            _digest: PhantomData,
        }
    }

    /// Add header values to the identity. Names are matched
    /// case-insensitively.
    pub fn with_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.include_headers
            .extend(names.into_iter().map(|n| n.as_ref().to_ascii_lowercase()));
        self.include_headers.sort();
        self.include_headers.dedup();
        self
    }

    pub fn keep_fragments(mut self, keep: bool) -> Self {
        self.keep_fragments = keep;
        self
    }

    /// Replace the default locator canonicalization.
    pub fn with_normalizer(mut self, normalizer: UrlNormalizer) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    fn normalize(&self, url: &str) -> String {
        match &self.normalizer {
            Some(f) => f(url),
            None => util::canonicalize_url(url, self.keep_fragments),
        }
    }
}

impl DefaultFingerprinter<Sha256> {
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .with_headers(&config.fingerprint_headers)
            .keep_fragments(config.fingerprint_keep_fragments)
    }
}

impl Default for DefaultFingerprinter<Sha256> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Digest> Fingerprinter for DefaultFingerprinter<D> {
    fn fingerprint(&self, request: &FetchRequest) -> Result<Fingerprint> {
        let mut headers = BTreeMap::new();
        for name in &self.include_headers {
            let values: Vec<&str> = request.header_values(name).collect();
            if !values.is_empty() {
                headers.insert(name.as_str(), values);
            }
        }
        let identity = Identity {
            method: request.method.to_ascii_uppercase(),
            url: self.normalize(&request.url),
            body: hex::encode(&request.body),
            headers,
        };
        let doc = serde_json::to_vec(&identity)
            .map_err(|e| Error::fatal(Component::Fingerprinter, request.url.clone(), e))?;
        Ok(Fingerprint::from_bytes(D::digest(&doc).to_vec()))
    }
}
