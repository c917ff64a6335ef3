use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::util;

pub const DEFAULT_PRIORITY: i32 = 0;

/// In-process data riding along with a request. It never reaches disk: a
/// request carrying one cannot be serialized.
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// One unit of scheduled work.
///
/// The scheduler owns a request from `enqueue_request` until it hands it to
/// the downloader. The fingerprint is computed lazily and cached, so identity
/// fields should not be touched after submission; call
/// [`FetchRequest::clear_fingerprint`] if they are.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub body: Vec<u8>,
    /// Ordered multimap, duplicates allowed.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Higher is more urgent.
    #[serde(default)]
    pub priority: i32,
    /// Opaque to the scheduler, except for `autothrottle_dont_adjust_delay`.
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
    /// Bypass the dupefilter.
    #[serde(default)]
    pub dont_filter: bool,

    #[serde(skip)]
    pub attachment: Option<Attachment>,
    #[serde(skip)]
    fingerprint: OnceLock<Fingerprint>,
}

fn default_method() -> String {
    "GET".to_owned()
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            body: vec![],
            headers: vec![],
            priority: DEFAULT_PRIORITY,
            meta: BTreeMap::new(),
            dont_filter: false,
            attachment: None,
            fingerprint: OnceLock::new(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self.clear_fingerprint();
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.clear_fingerprint();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self.clear_fingerprint();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Mark the request so it skips duplicate filtering.
    pub fn dont_filter(mut self) -> Self {
        self.dont_filter = true;
        self
    }

    /// Header values for `name`, compared case-insensitively, in insertion
    /// order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Lowercased host of the target, used as the throttle and concurrency
    /// slot. Requests without a parseable host share the empty slot.
    pub fn host(&self) -> String {
        util::get_host(&self.url).unwrap_or_default()
    }

    /// Compute (once) and return the request fingerprint.
    pub fn fingerprint(&self, fingerprinter: &dyn Fingerprinter) -> Result<Fingerprint> {
        if let Some(fp) = self.fingerprint.get() {
            return Ok(fp.clone());
        }
        let fp = fingerprinter.fingerprint(self)?;
        Ok(self.fingerprint.get_or_init(|| fp).clone())
    }

    pub fn cached_fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.get()
    }

    pub fn clear_fingerprint(&mut self) {
        self.fingerprint = OnceLock::new();
    }

    pub fn meta_flag(&self, key: &str) -> bool {
        matches!(self.meta.get(key), Some(serde_json::Value::Bool(true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::DefaultFingerprinter;

    #[test]
    fn test_host_is_lowercased() {
        let req = FetchRequest::new("https://Example.COM/a?b=1");
        assert_eq!(req.host(), "example.com");

        let req = FetchRequest::new("not a url");
        assert_eq!(req.host(), "");
    }

    #[test]
    fn test_fingerprint_is_cached_and_cleared() {
        let fpr: DefaultFingerprinter = DefaultFingerprinter::default();
        let req = FetchRequest::new("https://example.com/");
        assert!(req.cached_fingerprint().is_none());
        let first = req.fingerprint(&fpr).unwrap();
        assert_eq!(req.cached_fingerprint(), Some(&first));

        let req = req.with_method("POST");
        assert!(req.cached_fingerprint().is_none());
        assert_ne!(req.fingerprint(&fpr).unwrap(), first);
    }

    #[test]
    fn test_attachment_is_not_serialized() {
        let req = FetchRequest::new("https://example.com/")
            .with_meta("depth", serde_json::json!(2))
            .with_attachment(Arc::new(42u32));
        let text = serde_json::to_string(&req).unwrap();
        let back: FetchRequest = serde_json::from_str(&text).unwrap();
        assert!(back.attachment.is_none());
        assert_eq!(back.meta.get("depth"), Some(&serde_json::json!(2)));
    }
}
