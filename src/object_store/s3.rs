//! S3-compatible object store client.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 signing over
//! `hmac` + `sha2`; no AWS SDK. Custom endpoints (MinIO and friends) are
//! supported via `endpoint_url`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::ObjectStoreSettings;

use super::ObjectStore;

type HmacSha256 = Hmac<Sha256>;

/// Batch ceiling matching the S3 multi-object delete limit.
const DELETE_BATCH_LIMIT: usize = 1000;
/// Concurrent single-object deletes inside one batch.
const DELETE_CONCURRENCY: usize = 16;

pub struct S3ObjectStore {
    client: reqwest::Client,
    bucket: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
    endpoint_url: Option<String>,
}

impl S3ObjectStore {
    pub fn new(settings: &ObjectStoreSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            bucket: settings.bucket.clone(),
            region: settings.region.clone(),
            access_key_id: settings.access_key_id.clone(),
            secret_access_key: settings.secret_access_key.clone(),
            endpoint_url: settings.endpoint_url.clone(),
        }
    }

    /// Hostname for requests: virtual-hosted AWS style, or the custom
    /// endpoint verbatim.
    fn host(&self) -> String {
        match &self.endpoint_url {
            Some(endpoint) => endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string(),
            None => format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }

    /// Path prefix: custom endpoints are path-style and need the bucket.
    fn canonical_path(&self, key: &str) -> String {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match &self.endpoint_url {
            Some(_) => format!("/{}/{}", self.bucket, encoded_key),
            None => format!("/{encoded_key}"),
        }
    }

    /// Sign and issue one request against the store.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        canonical_path: &str,
        query: &[(String, String)],
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<reqwest::Response> {
        let host = self.host();
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(&body);

        let mut sorted_query = query.to_vec();
        sorted_query.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_query
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String =
            headers.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_path,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(&self.secret_access_key, &date_stamp, &self.region);
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key_id, credential_scope, signed_headers, signature
        );

        let scheme = match &self.endpoint_url {
            Some(e) if e.starts_with("http://") => "http",
            _ => "https",
        };
        let mut url = format!("{scheme}://{host}{canonical_path}");
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut request = self
            .client
            .request(method, &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ct) = content_type {
            request = request.header("Content-Type", ct);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        request
            .send()
            .await
            .with_context(|| format!("object store request to {url} failed"))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        let path = self.canonical_path(key);
        let response = self
            .signed_request(reqwest::Method::PUT, &path, &[], body, Some(content_type))
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("PutObject failed for '{key}' (HTTP {status}): {body}");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.canonical_path(key);
        let response = self
            .signed_request(reqwest::Method::DELETE, &path, &[], Vec::new(), None)
            .await?;
        // 404 means already gone, which is the desired end state.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            bail!("DeleteObject failed for '{key}' (HTTP {})", response.status());
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        for batch in keys.chunks(DELETE_BATCH_LIMIT) {
            for group in batch.chunks(DELETE_CONCURRENCY) {
                let deletes = group.iter().map(|key| self.delete(key));
                for result in join_all(deletes).await {
                    result?;
                }
            }
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(token) = &continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let path = match &self.endpoint_url {
                Some(_) => format!("/{}/", self.bucket),
                None => "/".to_string(),
            };
            let response = self
                .signed_request(reqwest::Method::GET, &path, &query, Vec::new(), None)
                .await?;
            if !response.status().is_success() {
                bail!("ListObjectsV2 failed (HTTP {})", response.status());
            }

            let xml = response.text().await?;
            keys.extend(extract_xml_values(&xml, "Key"));

            let truncated = extract_xml_value(&xml, "IsTruncated")
                .map(|v| v == "true")
                .unwrap_or(false);
            if truncated {
                continuation_token = extract_xml_value(&xml, "NextContinuationToken");
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(keys)
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// SigV4 key derivation chain: date, region, service, terminator.
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding for canonical requests: only unreserved characters
/// pass through.
fn uri_encode(s: &str) -> String {
    let mut out = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}

fn extract_xml_values(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        match after.find(&close) {
            Some(end) => {
                values.push(after[..end].to_string());
                rest = &after[end + close.len()..];
            }
            None => break,
        }
    }
    values
}
