//! S3-compatible object store client.
//!
//! Handles AWS S3 and S3-compatible gateways (Swarm, MinIO, LocalStack).
//! Uses reqwest with manual AWS Signature V4 signing so no SDK dependency
//! is needed. Requests are path-style: `{endpoint}/{bucket}/{key}`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::TryStreamExt;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response, StatusCode};
use sha2::{Digest, Sha256};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use blobrepo_common::backend::{
    ListingPage, ObjectMeta, ObjectReader, ObjectSink, ObjectStoreClient, DIRECTORY_CONTENT_TYPE,
    DIRECTORY_META_ATTRIBUTE,
};
use blobrepo_common::{ObjectKey, RepoError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Multipart part size. S3 rejects non-final parts below 5 MiB.
const PART_SIZE: usize = 16 * 1024 * 1024;
const DELETE_BATCH_SIZE: usize = 1000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>, // Custom endpoint for S3-compatible APIs
    pub access_key_id: String,
    pub secret_access_key: String,
    pub proxy: Option<String>, // http://host:port
}

#[derive(Clone)]
pub struct S3Backend {
    config: S3Config,
    client: Client,
}

impl S3Backend {
    pub fn new(config: S3Config) -> Result<Self> {
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| RepoError::Config(format!("invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| RepoError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        match &self.config.endpoint {
            Some(ep) => ep.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.config.region),
        }
    }

    fn canonical_path(&self, key: Option<&str>) -> String {
        match key {
            Some(key) => format!("/{}/{}", self.config.bucket, encode_key(key)),
            None => format!("/{}", self.config.bucket),
        }
    }

    /// Compute AWS Signature V4 for a request.
    #[allow(clippy::too_many_arguments)]
    fn sign(
        &self,
        method: &str,
        path: &str,
        query: &str,
        headers: &BTreeMap<String, String>,
        body_hash: &str,
        date_time: &str,
        date: &str,
    ) -> Result<String> {
        // Canonical request
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();
        let signed_headers: String = headers.keys().cloned().collect::<Vec<_>>().join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, query, canonical_headers, signed_headers, body_hash
        );

        // String to sign
        let cr_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let credential_scope = format!("{}/{}/s3/aws4_request", date, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            date_time, credential_scope, cr_hash
        );

        // Signing key
        let signing_key =
            derive_signing_key(&self.config.secret_access_key, date, &self.config.region)?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        Ok(format!(
            "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
            self.config.access_key_id, credential_scope, signed_headers, signature
        ))
    }

    /// Sign and send one request against the bucket (`key = None`) or an
    /// object. `query` pairs are encoded here; header names are lowercased
    /// and signed.
    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: &[(&str, &str)],
        extra_headers: &[(&str, String)],
        body: Bytes,
    ) -> Result<Response> {
        let now = Utc::now();
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let endpoint = self.endpoint();
        let path = self.canonical_path(key);
        let query = canonical_query(query);
        let body_hash_str = body_hash(&body);

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), url_host(&endpoint));
        headers.insert("x-amz-content-sha256".to_string(), body_hash_str.clone());
        headers.insert("x-amz-date".to_string(), date_time.clone());
        for (name, value) in extra_headers {
            headers.insert(name.to_ascii_lowercase(), value.clone());
        }

        let auth = self.sign(
            method.as_str(),
            &path,
            &query,
            &headers,
            &body_hash_str,
            &date_time,
            &date,
        )?;

        let mut url = format!("{endpoint}{path}");
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", auth);
        for (name, value) in headers.iter().filter(|(name, _)| *name != "host") {
            req = req.header(name.as_str(), value.as_str());
        }

        req.body(body)
            .send()
            .await
            .map_err(|e| RepoError::Transport(format!("S3 {method} request failed for '{url}': {e}")))
    }

    async fn upload_part(&self, key: &str, upload_id: &str, part_number: u32, data: Bytes) -> Result<String> {
        let part_number = part_number.to_string();
        let resp = self
            .send(
                Method::PUT,
                Some(key),
                &[("partNumber", part_number.as_str()), ("uploadId", upload_id)],
                &[],
                data,
            )
            .await?;
        let resp = check(resp, "UploadPart", key).await?;
        resp.headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RepoError::Transport(format!("S3 UploadPart for '{key}' returned no ETag")))
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let resp = self
            .send(Method::POST, Some(key), &[("uploads", "")], &[], Bytes::new())
            .await?;
        let body = check(resp, "CreateMultipartUpload", key)
            .await?
            .text()
            .await
            .map_err(|e| RepoError::Transport(format!("failed to read S3 response: {e}")))?;
        first_tag(&body, "UploadId").map(xml_unescape).ok_or_else(|| {
            RepoError::Transport(format!("S3 CreateMultipartUpload for '{key}' returned no UploadId"))
        })
    }
}

fn derive_signing_key(secret: &str, date: &str, region: &str) -> Result<Vec<u8>> {
    let key = format!("AWS4{}", secret);
    let k_date = hmac_sha256(key.as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, b"s3")?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| RepoError::Config(format!("invalid signing key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn body_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Map a non-success response onto the error taxonomy.
async fn check(resp: Response, op: &str, key: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(RepoError::NotFound(key.to_string()));
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RepoError::Transport(format!(
        "S3 {op} failed for '{key}': HTTP {status} - {body}"
    )))
}

#[async_trait]
impl ObjectStoreClient for S3Backend {
    async fn head(&self, key: &ObjectKey) -> Result<ObjectMeta> {
        let resp = self
            .send(Method::HEAD, Some(key.as_str()), &[], &[], Bytes::new())
            .await?;
        let resp = check(resp, "HEAD", key.as_str()).await?;
        let headers = resp.headers();
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        let size = header("content-length")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let marker_meta = format!("x-amz-meta-{DIRECTORY_META_ATTRIBUTE}");
        let is_directory = header("content-type") == Some(DIRECTORY_CONTENT_TYPE)
            || header(&marker_meta).is_some_and(|v| v.eq_ignore_ascii_case("true"));

        Ok(ObjectMeta {
            key: key.clone(),
            size,
            is_directory,
        })
    }

    async fn open_read(&self, key: &ObjectKey) -> Result<ObjectReader> {
        let resp = self
            .send(Method::GET, Some(key.as_str()), &[], &[], Bytes::new())
            .await?;
        let resp = check(resp, "GET", key.as_str()).await?;
        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn open_write(&self, key: &ObjectKey) -> Result<Box<dyn ObjectSink>> {
        Ok(Box::new(S3Sink {
            backend: self.clone(),
            key: key.to_string(),
            buffer: BytesMut::new(),
            upload_id: None,
            parts: Vec::new(),
        }))
    }

    async fn put_directory_marker(&self, key: &ObjectKey) -> Result<()> {
        let headers = [
            ("content-type", DIRECTORY_CONTENT_TYPE.to_string()),
            ("x-amz-meta-directory", "true".to_string()),
        ];
        let resp = self
            .send(Method::PUT, Some(key.as_str()), &[], &headers, Bytes::new())
            .await?;
        check(resp, "PUT", key.as_str()).await?;
        debug!(key = %key, "S3 directory marker created");
        Ok(())
    }

    async fn delete_many(&self, keys: &BTreeSet<ObjectKey>) -> Result<()> {
        let keys: Vec<&ObjectKey> = keys.iter().collect();
        let mut missing = Vec::new();

        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            let body = Bytes::from(delete_request_body(batch));
            let checksum = base64::engine::general_purpose::STANDARD
                .encode(crc32fast::hash(&body).to_be_bytes());
            let headers = [
                ("content-type", "application/xml".to_string()),
                ("x-amz-checksum-crc32", checksum),
                ("x-amz-sdk-checksum-algorithm", "CRC32".to_string()),
            ];
            let resp = self
                .send(Method::POST, None, &[("delete", "")], &headers, body)
                .await?;
            let text = check(resp, "DeleteObjects", &self.config.bucket)
                .await?
                .text()
                .await
                .map_err(|e| RepoError::Transport(format!("failed to read S3 response: {e}")))?;

            for (key, code) in parse_delete_errors(&text) {
                if code == "NoSuchKey" {
                    missing.push(key);
                } else {
                    return Err(RepoError::Transport(format!(
                        "S3 DeleteObjects failed for '{key}': {code}"
                    )));
                }
            }
            debug!(count = batch.len(), "S3 batch delete complete");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RepoError::NotFound(missing.join(", ")))
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
    ) -> Result<ListingPage> {
        let mut query = vec![("list-type", "2"), ("prefix", prefix)];
        if let Some(delimiter) = delimiter {
            query.push(("delimiter", delimiter));
        }
        if let Some(token) = continuation {
            query.push(("continuation-token", token));
        }

        let resp = self.send(Method::GET, None, &query, &[], Bytes::new()).await?;
        let body = check(resp, "LIST", prefix)
            .await?
            .text()
            .await
            .map_err(|e| RepoError::Transport(format!("failed to read S3 list response: {e}")))?;
        Ok(parse_list_page(&body))
    }
}

/// Buffers writes into parts; falls back to a single PUT when the object
/// never reaches one part.
struct S3Sink {
    backend: S3Backend,
    key: String,
    buffer: BytesMut,
    upload_id: Option<String>,
    parts: Vec<(u32, String)>,
}

impl S3Sink {
    async fn flush_part(&mut self, data: Bytes) -> Result<()> {
        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => {
                let id = self.backend.create_multipart_upload(&self.key).await?;
                self.upload_id = Some(id.clone());
                id
            }
        };
        let part_number = self.parts.len() as u32 + 1;
        let etag = self
            .backend
            .upload_part(&self.key, &upload_id, part_number, data)
            .await?;
        self.parts.push((part_number, etag));
        Ok(())
    }
}

#[async_trait]
impl ObjectSink for S3Sink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);
        while self.buffer.len() >= PART_SIZE {
            let part = self.buffer.split_to(PART_SIZE).freeze();
            self.flush_part(part).await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        let Some(upload_id) = self.upload_id.clone() else {
            let body = std::mem::take(&mut self.buffer).freeze();
            let size = body.len();
            let resp = self
                .backend
                .send(Method::PUT, Some(self.key.as_str()), &[], &[], body)
                .await?;
            check(resp, "PUT", &self.key).await?;
            debug!(key = %self.key, size, "S3 upload complete");
            return Ok(());
        };

        if !self.buffer.is_empty() {
            let last = std::mem::take(&mut self.buffer).freeze();
            self.flush_part(last).await?;
        }

        let body = Bytes::from(complete_request_body(&self.parts));
        let resp = self
            .backend
            .send(
                Method::POST,
                Some(self.key.as_str()),
                &[("uploadId", upload_id.as_str())],
                &[("content-type", "application/xml".to_string())],
                body,
            )
            .await?;
        let text = check(resp, "CompleteMultipartUpload", &self.key)
            .await?
            .text()
            .await
            .map_err(|e| RepoError::Transport(format!("failed to read S3 response: {e}")))?;
        // CompleteMultipartUpload can fail with HTTP 200 and an <Error> body.
        if let Some(code) = first_tag(&text, "Code") {
            return Err(RepoError::Transport(format!(
                "S3 CompleteMultipartUpload failed for '{}': {}",
                self.key, code
            )));
        }
        debug!(key = %self.key, parts = self.parts.len(), "S3 multipart upload complete");
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        let Some(upload_id) = &self.upload_id else {
            return;
        };
        let query = [("uploadId", upload_id.as_str())];
        let result = match self
            .backend
            .send(Method::DELETE, Some(self.key.as_str()), &query, &[], Bytes::new())
            .await
        {
            Ok(resp) => check(resp, "AbortMultipartUpload", &self.key).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(key = %self.key, error = %e, "Failed to abort multipart upload");
        }
    }
}

/// Percent-encode every path segment of a key, keeping the separators.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Sorted, percent-encoded query string as required by SigV4.
fn canonical_query(params: &[(&str, &str)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Extract the host part from a URL for use in signing.
fn url_host(url: &str) -> String {
    // Strip scheme and path, return just host[:port]
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    without_scheme.split('/').next().unwrap_or(without_scheme).to_string()
}

/// Bodies of every `<tag>…</tag>` element, in document order.
fn elements<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find(&open) {
        remaining = &remaining[start + open.len()..];
        match remaining.find(&close) {
            Some(end) => {
                out.push(&remaining[..end]);
                remaining = &remaining[end + close.len()..];
            }
            None => break,
        }
    }
    out
}

fn first_tag<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    elements(xml, tag).into_iter().next()
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Parse a ListObjectsV2 response.
fn parse_list_page(xml: &str) -> ListingPage {
    let keys = elements(xml, "Contents")
        .into_iter()
        .filter_map(|c| first_tag(c, "Key"))
        .map(xml_unescape)
        .collect();
    let common_prefixes = elements(xml, "CommonPrefixes")
        .into_iter()
        .filter_map(|c| first_tag(c, "Prefix"))
        .map(xml_unescape)
        .collect();
    let truncated = first_tag(xml, "IsTruncated") == Some("true");
    let continuation = if truncated {
        first_tag(xml, "NextContinuationToken").map(xml_unescape)
    } else {
        None
    };
    ListingPage {
        keys,
        common_prefixes,
        continuation,
    }
}

fn delete_request_body(keys: &[&ObjectKey]) -> String {
    let mut body = String::from("<Delete><Quiet>true</Quiet>");
    for key in keys {
        body.push_str("<Object><Key>");
        body.push_str(&xml_escape(key.as_str()));
        body.push_str("</Key></Object>");
    }
    body.push_str("</Delete>");
    body
}

/// `(key, code)` of every per-key failure in a DeleteObjects response.
fn parse_delete_errors(xml: &str) -> Vec<(String, String)> {
    elements(xml, "Error")
        .into_iter()
        .filter_map(|e| {
            let key = first_tag(e, "Key")?;
            let code = first_tag(e, "Code").unwrap_or("Unknown");
            Some((xml_unescape(key), code.to_string()))
        })
        .collect()
}

fn complete_request_body(parts: &[(u32, String)]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for (number, etag) in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{number}</PartNumber><ETag>{}</ETag></Part>",
            xml_escape(etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_page() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <Name>bucket</Name>
  <Prefix>backups/core1/</Prefix>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM=</NextContinuationToken>
  <Contents><Key>backups/core1/_0.cfs</Key><Size>10</Size></Contents>
  <Contents><Key>backups/core1/a&amp;b</Key><Size>3</Size></Contents>
  <CommonPrefixes><Prefix>backups/core1/index/</Prefix></CommonPrefixes>
</ListBucketResult>"#;
        let page = parse_list_page(xml);
        assert_eq!(page.keys, vec!["backups/core1/_0.cfs", "backups/core1/a&b"]);
        assert_eq!(page.common_prefixes, vec!["backups/core1/index/"]);
        assert_eq!(
            page.continuation.as_deref(),
            Some("1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM=")
        );
    }

    #[test]
    fn test_parse_last_list_page() {
        let xml = "<ListBucketResult><IsTruncated>false</IsTruncated>\
                   <Contents><Key>k</Key></Contents></ListBucketResult>";
        let page = parse_list_page(xml);
        assert_eq!(page.keys, vec!["k"]);
        assert_eq!(page.continuation, None);
    }

    #[test]
    fn test_parse_delete_errors() {
        let xml = "<DeleteResult>\
            <Error><Key>a/f1</Key><Code>NoSuchKey</Code><Message>gone</Message></Error>\
            <Error><Key>a/f2</Key><Code>AccessDenied</Code></Error>\
            </DeleteResult>";
        assert_eq!(
            parse_delete_errors(xml),
            vec![
                ("a/f1".to_string(), "NoSuchKey".to_string()),
                ("a/f2".to_string(), "AccessDenied".to_string()),
            ]
        );
        assert!(parse_delete_errors("<DeleteResult/>").is_empty());
    }

    #[test]
    fn test_delete_request_body_escapes_keys() {
        let a = ObjectKey::new("dir/a<b");
        let body = delete_request_body(&[&a]);
        assert_eq!(
            body,
            "<Delete><Quiet>true</Quiet><Object><Key>dir/a&lt;b</Key></Object></Delete>"
        );
    }

    #[test]
    fn test_complete_request_body() {
        let body = complete_request_body(&[(1, "\"e1\"".to_string()), (2, "\"e2\"".to_string())]);
        assert!(body.starts_with("<CompleteMultipartUpload><Part><PartNumber>1</PartNumber>"));
        assert!(body.contains("<ETag>&quot;e2&quot;</ETag>"));
    }

    #[test]
    fn test_encode_key_keeps_separators() {
        assert_eq!(encode_key("backups/core 1/_0.cfs"), "backups/core%201/_0.cfs");
        assert_eq!(encode_key("a/"), "a/");
    }

    #[test]
    fn test_canonical_query_sorted_and_encoded() {
        let query = canonical_query(&[
            ("prefix", "a b/"),
            ("list-type", "2"),
            ("delimiter", "/"),
        ]);
        assert_eq!(query, "delimiter=%2F&list-type=2&prefix=a%20b%2F");
        assert_eq!(canonical_query(&[("uploads", "")]), "uploads=");
    }

    #[test]
    fn test_url_host() {
        assert_eq!(url_host("https://s3.us-east-1.amazonaws.com"), "s3.us-east-1.amazonaws.com");
        assert_eq!(url_host("http://localhost:4566/bucket/key"), "localhost:4566");
    }

    #[test]
    fn test_hmac_sha256() {
        let result = hmac_sha256(b"secret", b"data").unwrap();
        assert_eq!(result.len(), 32);
    }

    #[test]
    fn test_canonical_path() {
        let backend = S3Backend::new(S3Config {
            bucket: "bucket".into(),
            region: "eu-west-1".into(),
            endpoint: Some("http://localhost:4566/".into()),
            access_key_id: "access_key".into(),
            secret_access_key: "secret_key".into(),
            proxy: None,
        })
        .unwrap();
        assert_eq!(backend.endpoint(), "http://localhost:4566");
        assert_eq!(backend.canonical_path(None), "/bucket");
        assert_eq!(backend.canonical_path(Some("a/b c")), "/bucket/a/b%20c");
    }
}
