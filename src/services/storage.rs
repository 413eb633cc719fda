//! Object-storage collaborator backed by an S3-compatible endpoint
//!
//! HTTP/1.1 over hyper with native-tls, the same transport the rest of the
//! crate uses. Uploads enforce the configured size ceiling before any bytes
//! leave the process.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::config::StorageConfig;
use crate::services::sign::{uri_encode, RequestSigner};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object of {size} bytes exceeds the {limit} byte upload limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("object `{0}` not found")]
    NotFound(String),

    #[error("storage endpoint returned {status}: {message}")]
    Endpoint { status: StatusCode, message: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),
}

impl From<hyper_util::client::legacy::Error> for StorageError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        StorageError::Transport(err.to_string())
    }
}

impl From<hyper::http::Error> for StorageError {
    fn from(err: hyper::http::Error) -> Self {
        StorageError::Transport(err.to_string())
    }
}

/// Outcome of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub key: String,
    pub url: String,
    pub size: u64,
}

/// Object-storage operations the rest of the system depends on
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<Receipt, StorageError>;

    async fn download(&self, key: &str) -> Result<Bytes, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Stable URL for an object: the CDN URL when one is configured,
    /// otherwise a time-limited presigned URL
    fn object_url(&self, key: &str) -> String;
}

/// S3-backed [`ObjectStore`]
///
/// Clone is cheap, the hyper client is reference counted internally.
#[derive(Clone)]
pub struct S3Store {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    signer: RequestSigner,
    endpoint: String,
    bucket: String,
    acl: String,
    encryption: String,
    max_upload_size: u64,
    cdn_url: Option<String>,
    timeout: Duration,
}

impl S3Store {
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if config.accept_invalid_certs {
            tracing::warn!("storage TLS certificate verification is disabled");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?
        } else {
            TlsConnector::new()?
        };
        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .retry_canceled_requests(true)
            .set_host(true)
            .build(https);

        let endpoint = config.endpoint.clone().unwrap_or_else(|| {
            format!("https://{}.s3.{}.amazonaws.com", config.bucket, config.region)
        });

        Ok(Self {
            client,
            signer: RequestSigner::new(
                config.access_key.clone(),
                &config.secret_key,
                config.region.clone(),
            ),
            endpoint,
            bucket: config.bucket.clone(),
            acl: config.acl.clone(),
            encryption: config.encryption.clone(),
            max_upload_size: config.max_upload_size,
            cdn_url: config.cdn_url.clone(),
            timeout: Duration::from_secs(300),
        })
    }

    fn object_endpoint(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint, uri_encode(key, false))
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: BTreeMap<String, String>,
        body: Bytes,
    ) -> Result<(StatusCode, Bytes), StorageError> {
        let signed = self
            .signer
            .sign_headers(method.as_str(), url, headers, &body);

        let mut builder = Request::builder().method(method).uri(url);
        for (key, value) in signed.iter() {
            builder = builder.header(key, value);
        }
        let request = builder.body(Full::new(body))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| StorageError::Transport("request timed out".to_string()))??;

        let status = response.status();
        let bytes = response
            .collect()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?
            .to_bytes();
        Ok((status, bytes))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn upload(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<Receipt, StorageError> {
        let size = body.len() as u64;
        if size > self.max_upload_size {
            return Err(StorageError::TooLarge {
                size,
                limit: self.max_upload_size,
            });
        }

        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        headers.insert("x-amz-acl".to_string(), self.acl.clone());
        headers.insert(
            "x-amz-server-side-encryption".to_string(),
            self.encryption.clone(),
        );

        let url = self.object_endpoint(key);
        let (status, message) = self.send(Method::PUT, &url, headers, body).await?;
        if !status.is_success() {
            return Err(StorageError::Endpoint {
                status,
                message: String::from_utf8_lossy(&message).into_owned(),
            });
        }

        tracing::info!(bucket = %self.bucket, key, size, "object uploaded");
        Ok(Receipt {
            key: key.to_string(),
            url: self.object_url(key),
            size,
        })
    }

    async fn download(&self, key: &str) -> Result<Bytes, StorageError> {
        let url = self.object_endpoint(key);
        let (status, body) = self.send(Method::GET, &url, BTreeMap::new(), Bytes::new()).await?;
        match status {
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(key.to_string())),
            s if s.is_success() => Ok(body),
            s => Err(StorageError::Endpoint {
                status: s,
                message: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let url = self.object_endpoint(key);
        let (status, body) = self
            .send(Method::DELETE, &url, BTreeMap::new(), Bytes::new())
            .await?;
        // Deleting an absent object is a no-op, matching S3 semantics.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            tracing::debug!(bucket = %self.bucket, key, "object deleted");
            Ok(())
        } else {
            Err(StorageError::Endpoint {
                status,
                message: String::from_utf8_lossy(&body).into_owned(),
            })
        }
    }

    fn object_url(&self, key: &str) -> String {
        match &self.cdn_url {
            Some(cdn) => format!("{}/{}", cdn.trim_end_matches('/'), uri_encode(key, false)),
            None => self.signer.presign_url(&self.object_endpoint(key), 3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StorageConfig {
        StorageConfig {
            access_key: "access".to_string(),
            secret_key: "secret".to_string(),
            region: "us-east-1".to_string(),
            bucket: "assets".to_string(),
            endpoint: None,
            acl: "private".to_string(),
            encryption: "AES256".to_string(),
            max_upload_size: 1024,
            cdn_url: None,
            accept_invalid_certs: false,
        }
    }

    #[tokio::test]
    async fn upload_rejects_oversized_body() {
        let store = S3Store::new(&config()).unwrap();
        let body = Bytes::from(vec![0u8; 2048]);
        let err = store.upload("big.bin", body, "application/octet-stream").await;
        assert!(matches!(
            err,
            Err(StorageError::TooLarge { size: 2048, limit: 1024 })
        ));
    }

    #[test]
    fn endpoint_defaults_to_regional_bucket_host() {
        let store = S3Store::new(&config()).unwrap();
        assert_eq!(
            store.object_endpoint("photos/cat.jpg"),
            "https://assets.s3.us-east-1.amazonaws.com/photos/cat.jpg"
        );
    }

    #[test]
    fn object_url_prefers_cdn() {
        let mut cfg = config();
        cfg.cdn_url = Some("https://cdn.example.com/".to_string());
        let store = S3Store::new(&cfg).unwrap();
        assert_eq!(
            store.object_url("photos/cat.jpg"),
            "https://cdn.example.com/photos/cat.jpg"
        );
    }

    #[test]
    fn object_url_falls_back_to_presigned() {
        let store = S3Store::new(&config()).unwrap();
        let url = store.object_url("photos/cat.jpg");
        assert!(url.contains("X-Amz-Signature="));
    }
}
