//! Object-store contract and bindings.
//!
//! The scheduler only needs two operations: prefix listing with a
//! `start_after` cursor (and optional delimiter for common-prefix
//! enumeration) and streaming object fetch into a caller-owned buffer.
//! [`S3HttpStore`] is the anonymous-HTTP production binding;
//! [`MemoryStore`] backs tests and offline runs.

use async_trait::async_trait;
use levelii_core::{LeveliiError, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Result of one prefix listing.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    /// Object keys under the prefix, in the store's (lexicographic)
    /// order.
    pub keys: Vec<String>,
    /// Common prefixes, when a delimiter was supplied.
    pub common_prefixes: Vec<String>,
}

/// Anonymous object-store access.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List keys under `prefix`, optionally after `start_after`
    /// (exclusive) and grouped by `delimiter`.
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
        delimiter: Option<&str>,
    ) -> Result<Listing>;

    /// Stream an object, appending its bytes to `buf`. Returns the
    /// byte count appended.
    async fn get_into(&self, bucket: &str, key: &str, buf: &mut Vec<u8>) -> Result<usize>;
}

/// Anonymous HTTP binding against an S3-compatible endpoint.
pub struct S3HttpStore {
    client: reqwest::Client,
}

impl S3HttpStore {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn bucket_url(bucket: &str) -> String {
        format!("https://{bucket}.s3.amazonaws.com")
    }
}

impl Default for S3HttpStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for S3HttpStore {
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
        delimiter: Option<&str>,
    ) -> Result<Listing> {
        let mut query: Vec<(&str, &str)> = vec![("list-type", "2"), ("prefix", prefix)];
        if let Some(start_after) = start_after {
            query.push(("start-after", start_after));
        }
        if let Some(delimiter) = delimiter {
            query.push(("delimiter", delimiter));
        }

        let response = self
            .client
            .get(Self::bucket_url(bucket))
            .query(&query)
            .send()
            .await
            .map_err(|e| LeveliiError::RemoteFetch(format!("list {bucket}/{prefix}: {e}")))?
            .error_for_status()
            .map_err(|e| LeveliiError::RemoteFetch(format!("list {bucket}/{prefix}: {e}")))?;

        let body = response
            .text()
            .await
            .map_err(|e| LeveliiError::RemoteFetch(format!("list body {bucket}/{prefix}: {e}")))?;

        Ok(parse_list_response(&body))
    }

    async fn get_into(&self, bucket: &str, key: &str, buf: &mut Vec<u8>) -> Result<usize> {
        let url = format!("{}/{key}", Self::bucket_url(bucket));
        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LeveliiError::RemoteFetch(format!("get {bucket}/{key}: {e}")))?
            .error_for_status()
            .map_err(|e| LeveliiError::RemoteFetch(format!("get {bucket}/{key}: {e}")))?;

        let mut appended = 0usize;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| LeveliiError::RemoteFetch(format!("get body {bucket}/{key}: {e}")))?
        {
            buf.extend_from_slice(&chunk);
            appended += chunk.len();
        }
        Ok(appended)
    }
}

/// Pull `<Key>` values and `<CommonPrefixes><Prefix>` values out of a
/// ListObjectsV2 response. The schema is flat and fixed; a full XML
/// dependency buys nothing here.
fn parse_list_response(body: &str) -> Listing {
    let mut listing = Listing::default();
    for contents in tag_bodies(body, "Contents") {
        if let Some(key) = tag_bodies(contents, "Key").next() {
            listing.keys.push(xml_unescape(key));
        }
    }
    for group in tag_bodies(body, "CommonPrefixes") {
        if let Some(prefix) = tag_bodies(group, "Prefix").next() {
            listing.common_prefixes.push(xml_unescape(prefix));
        }
    }
    listing
}

/// Iterate the bodies of every `<tag>...</tag>` pair in `input`.
fn tag_bodies<'a>(input: &'a str, tag: &'a str) -> impl Iterator<Item = &'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut rest = input;
    std::iter::from_fn(move || {
        let start = rest.find(&open)? + open.len();
        let len = rest[start..].find(&close)?;
        let body = &rest[start..start + len];
        rest = &rest[start + len + close.len()..];
        Some(body)
    })
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
}

/// In-memory store: an ordered key space shared behind a mutex.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object. The bucket namespace is flat.
    pub fn insert(&self, key: impl Into<String>, data: Vec<u8>) {
        self.objects
            .lock()
            .expect("object map lock")
            .insert(key.into(), data);
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().expect("object map lock").remove(key);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("object map lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(
        &self,
        _bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
        delimiter: Option<&str>,
    ) -> Result<Listing> {
        let objects = self.objects.lock().expect("object map lock");
        let mut listing = Listing::default();

        for key in objects.keys() {
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(cursor) = start_after {
                if key.as_str() <= cursor {
                    continue;
                }
            }
            match delimiter {
                Some(delim) => {
                    let tail = &key[prefix.len()..];
                    if let Some(end) = tail.find(delim) {
                        let common = format!("{prefix}{}{delim}", &tail[..end]);
                        if listing.common_prefixes.last() != Some(&common) {
                            listing.common_prefixes.push(common);
                        }
                    } else {
                        listing.keys.push(key.clone());
                    }
                }
                None => listing.keys.push(key.clone()),
            }
        }
        Ok(listing)
    }

    async fn get_into(&self, _bucket: &str, key: &str, buf: &mut Vec<u8>) -> Result<usize> {
        let objects = self.objects.lock().expect("object map lock");
        let data = objects
            .get(key)
            .ok_or_else(|| LeveliiError::RemoteFetch(format!("no such object: {key}")))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_lists_in_order_with_cursor() {
        let store = MemoryStore::new();
        store.insert("2027/02/13/KTLX/b", vec![2]);
        store.insert("2027/02/13/KTLX/a", vec![1]);
        store.insert("2027/02/13/KTLX/c", vec![3]);
        store.insert("2027/02/13/KCRP/a", vec![9]);

        let listing = store
            .list("bucket", "2027/02/13/KTLX/", None, None)
            .await
            .unwrap();
        assert_eq!(
            listing.keys,
            vec![
                "2027/02/13/KTLX/a",
                "2027/02/13/KTLX/b",
                "2027/02/13/KTLX/c"
            ]
        );

        let after = store
            .list("bucket", "2027/02/13/KTLX/", Some("2027/02/13/KTLX/a"), None)
            .await
            .unwrap();
        assert_eq!(after.keys, vec!["2027/02/13/KTLX/b", "2027/02/13/KTLX/c"]);
    }

    #[tokio::test]
    async fn memory_store_delimiter_groups_stations() {
        let store = MemoryStore::new();
        store.insert("2027/02/13/KTLX/f1", vec![]);
        store.insert("2027/02/13/KTLX/f2", vec![]);
        store.insert("2027/02/13/KCRP/f1", vec![]);

        let listing = store
            .list("bucket", "2027/02/13/", None, Some("/"))
            .await
            .unwrap();
        assert!(listing.keys.is_empty());
        assert_eq!(
            listing.common_prefixes,
            vec!["2027/02/13/KCRP/", "2027/02/13/KTLX/"]
        );
    }

    #[tokio::test]
    async fn memory_store_get_appends() {
        let store = MemoryStore::new();
        store.insert("k", vec![1, 2, 3]);
        let mut buf = vec![9];
        let n = store.get_into("bucket", "k", &mut buf).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf, vec![9, 1, 2, 3]);

        let err = store.get_into("bucket", "missing", &mut buf).await;
        assert!(matches!(err, Err(LeveliiError::RemoteFetch(_))));
    }

    #[test]
    fn list_response_parsing() {
        let body = r#"<?xml version="1.0"?>
<ListBucketResult>
  <Name>unidata-nexrad-level2</Name>
  <Prefix>2027/02/13/</Prefix>
  <KeyCount>2</KeyCount>
  <Contents><Key>2027/02/13/KTLX/KTLX20270213_160000_V06</Key><Size>1</Size></Contents>
  <Contents><Key>2027/02/13/KTLX/KTLX20270213_161234_V06</Key><Size>2</Size></Contents>
  <CommonPrefixes><Prefix>2027/02/13/KCRP/</Prefix></CommonPrefixes>
  <CommonPrefixes><Prefix>2027/02/13/KTLX/</Prefix></CommonPrefixes>
</ListBucketResult>"#;

        let listing = parse_list_response(body);
        assert_eq!(
            listing.keys,
            vec![
                "2027/02/13/KTLX/KTLX20270213_160000_V06",
                "2027/02/13/KTLX/KTLX20270213_161234_V06"
            ]
        );
        // The echoed request <Prefix> is not a common prefix.
        assert_eq!(
            listing.common_prefixes,
            vec!["2027/02/13/KCRP/", "2027/02/13/KTLX/"]
        );
    }

    #[test]
    fn xml_unescape_handles_entities() {
        assert_eq!(xml_unescape("a&amp;b&lt;c"), "a&b<c");
    }
}
