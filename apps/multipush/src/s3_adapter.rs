//! [`ObjectStore`] over the S3 multipart REST API.
//!
//! Path-style URLs (`{endpoint}/{bucket}/{key}`). Requests are signed with
//! SigV4 for the configured region when AWS credentials are present in the
//! environment, and sent unsigned otherwise.

use std::time::Duration;

use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::{Client, Request, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use multipush_protocol::{
    AbortUploadRequest, CompleteUploadRequest, CompletedUpload, CreateUploadRequest, PartReceipt,
    UploadPartRequest,
};
use multipush_transfer::checksum_part;
use multipush_upload::{ObjectStore, StoreError, StoreFuture};

use crate::config::AppConfig;
use crate::sigv4::{Credentials, EMPTY_PAYLOAD_SHA256, Signer, UNSIGNED_PAYLOAD};

const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Characters escaped in object keys; `/` stays a path separator.
const KEY_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CompleteMultipartUploadResult {
    location: Option<String>,
    #[serde(rename = "ETag")]
    etag: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorDocument {
    code: String,
    message: Option<String>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload {
    #[serde(rename = "@xmlns")]
    xmlns: String,
    #[serde(rename = "Part", default)]
    parts: Vec<CompletedPart>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CompletedPart {
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

pub struct S3Store {
    client: Client,
    endpoint: String,
    bucket: String,
    label: String,
    signer: Option<Signer>,
}

impl S3Store {
    /// Builds a store for `config`, signing with credentials from the
    /// standard `AWS_*` environment variables.
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        Self::with_credentials(config, Credentials::from_env(|name| std::env::var(name).ok()))
    }

    pub fn with_credentials(
        config: &AppConfig,
        credentials: Option<Credentials>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        let label = format!("s3 {endpoint}/{} ({})", config.bucket, config.region);

        let signer = match credentials {
            Some(credentials) => {
                debug!(access_key = %credentials.access_key, region = %config.region, "signing requests with SigV4");
                Some(Signer::new(credentials, config.region.clone()))
            }
            None => {
                warn!(%endpoint, "no AWS credentials in the environment, sending unsigned requests");
                None
            }
        };

        Ok(Self {
            client,
            endpoint,
            bucket: config.bucket.clone(),
            label,
            signer,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            self.bucket,
            utf8_percent_encode(key, KEY_SET)
        )
    }

    /// Finishes `builder` into a request carrying `payload_hash`, signed
    /// when credentials are configured.
    fn prepare(&self, builder: RequestBuilder, payload_hash: &str) -> Result<Request, StoreError> {
        let mut request = builder
            .header("x-amz-content-sha256", payload_hash)
            .build()
            .map_err(transport)?;
        if let Some(signer) = &self.signer {
            signer
                .sign(&mut request, payload_hash, Utc::now())
                .map_err(|e| StoreError::Rejected(format!("cannot sign request: {e}")))?;
        }
        Ok(request)
    }

    async fn send(&self, builder: RequestBuilder, payload_hash: &str) -> Result<Response, StoreError> {
        let request = self.prepare(builder, payload_hash)?;
        self.client.execute(request).await.map_err(transport)
    }

    async fn create(&self, req: CreateUploadRequest) -> Result<String, StoreError> {
        let url = format!("{}?uploads", self.object_url(&req.key));
        let builder = self
            .client
            .post(&url)
            .header("Expires", http_date(&req.expires_at));
        let resp = self.send(builder, EMPTY_PAYLOAD_SHA256).await?;
        let body = success_body(resp).await?;

        let result: InitiateMultipartUploadResult = parse_xml(&body)?;
        Ok(result.upload_id)
    }

    async fn put_part(&self, req: UploadPartRequest) -> Result<String, StoreError> {
        let part_number = req.part_number.to_string();
        let payload_hash = if req.checksum.is_empty() {
            UNSIGNED_PAYLOAD
        } else {
            req.checksum.as_str()
        };
        let builder = self
            .client
            .put(self.object_url(&req.target.key))
            .query(&[
                ("partNumber", part_number.as_str()),
                ("uploadId", req.target.upload_id.as_str()),
            ])
            .body(req.data.clone());

        let resp = self.send(builder, payload_hash).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        resp.headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StoreError::InvalidResponse("missing ETag header".into()))
    }

    async fn complete(&self, req: CompleteUploadRequest) -> Result<CompletedUpload, StoreError> {
        let url = self.object_url(&req.target.key);
        let body = complete_body(&req.parts)?;
        let payload_hash = checksum_part(body.as_bytes());
        let builder = self
            .client
            .post(&url)
            .query(&[("uploadId", req.target.upload_id.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(body);
        let resp = self.send(builder, &payload_hash).await?;
        let body = success_body(resp).await?;

        // Complete can fail after the 200 status line was sent.
        if root_element(&body).as_deref() == Some("Error") {
            return Err(StoreError::InvalidResponse(error_message(&body)));
        }

        let result: CompleteMultipartUploadResult = parse_xml(&body)?;
        Ok(CompletedUpload {
            location: result.location.unwrap_or(url),
            etag: result.etag.unwrap_or_default(),
        })
    }

    async fn abort(&self, req: AbortUploadRequest) -> Result<(), StoreError> {
        let builder = self
            .client
            .delete(self.object_url(&req.target.key))
            .query(&[("uploadId", req.target.upload_id.as_str())]);
        let resp = self.send(builder, EMPTY_PAYLOAD_SHA256).await?;
        success_body(resp).await.map(|_| ())
    }
}

impl ObjectStore for S3Store {
    fn create_upload(&self, req: CreateUploadRequest) -> StoreFuture<'_, String> {
        Box::pin(self.create(req))
    }

    fn upload_part(&self, req: UploadPartRequest) -> StoreFuture<'_, String> {
        debug!(part = req.part_number, bytes = req.content_length(), "sending part");
        Box::pin(self.put_part(req))
    }

    fn complete_upload(&self, req: CompleteUploadRequest) -> StoreFuture<'_, CompletedUpload> {
        Box::pin(self.complete(req))
    }

    fn abort_upload(&self, req: AbortUploadRequest) -> StoreFuture<'_, ()> {
        Box::pin(self.abort(req))
    }

    fn name(&self) -> &str {
        &self.label
    }
}

fn transport(e: reqwest::Error) -> StoreError {
    StoreError::Transport(e.to_string())
}

async fn success_body(resp: Response) -> Result<String, StoreError> {
    let status = resp.status();
    let body = resp.text().await.map_err(transport)?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(status_error(status, &body))
    }
}

fn status_error(status: StatusCode, body: &str) -> StoreError {
    let message = error_message(body);
    if status == StatusCode::NOT_FOUND {
        StoreError::NotFound(message)
    } else {
        StoreError::Status {
            status: status.as_u16(),
            message,
        }
    }
}

fn parse_xml<T: DeserializeOwned>(body: &str) -> Result<T, StoreError> {
    quick_xml::de::from_str(body).map_err(|e| StoreError::InvalidResponse(e.to_string()))
}

/// Local name of the document's root element.
fn root_element(body: &str) -> Option<String> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// `Code: Message` from an S3 `<Error>` document, or the raw body.
fn error_message(body: &str) -> String {
    match quick_xml::de::from_str::<ErrorDocument>(body) {
        Ok(ErrorDocument {
            code,
            message: Some(message),
        }) => format!("{code}: {message}"),
        Ok(ErrorDocument { code, .. }) => code,
        Err(_) => body.trim().chars().take(200).collect(),
    }
}

fn complete_body(parts: &[PartReceipt]) -> Result<String, StoreError> {
    let document = CompleteMultipartUpload {
        xmlns: S3_XMLNS.to_string(),
        parts: parts
            .iter()
            .map(|part| CompletedPart {
                part_number: part.index,
                etag: part.etag.clone(),
            })
            .collect(),
    };
    quick_xml::se::to_string(&document)
        .map_err(|e| StoreError::Rejected(format!("cannot encode part list: {e}")))
}

fn http_date(at: &DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config(endpoint: &str) -> AppConfig {
        AppConfig {
            endpoint: endpoint.into(),
            bucket: "media".into(),
            ..AppConfig::default()
        }
    }

    fn store(endpoint: &str) -> S3Store {
        S3Store::with_credentials(&config(endpoint), None).unwrap()
    }

    #[test]
    fn object_url_is_path_style() {
        let s = store("http://localhost:9000/");
        assert_eq!(
            s.object_url("recordings/my clip.mp4"),
            "http://localhost:9000/media/recordings/my%20clip.mp4"
        );
        assert_eq!(s.name(), "s3 http://localhost:9000/media (us-east-1)");
    }

    #[test]
    fn key_encoding_keeps_unreserved_and_slashes() {
        let s = store("http://localhost:9000");
        assert_eq!(
            s.object_url("a/b-c_d.e~f/ü+?#%.mp4"),
            "http://localhost:9000/media/a/b-c_d.e~f/%C3%BC%2B%3F%23%25.mp4"
        );
    }

    #[test]
    fn parses_upload_id() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Bucket>media</Bucket><Key>recordings/a.mp4</Key><UploadId>VXBsb2FkSWQ</UploadId>
</InitiateMultipartUploadResult>"#;
        let result: InitiateMultipartUploadResult = parse_xml(body).unwrap();
        assert_eq!(result.upload_id, "VXBsb2FkSWQ");

        let err = parse_xml::<InitiateMultipartUploadResult>(
            "<InitiateMultipartUploadResult><Bucket>media</Bucket></InitiateMultipartUploadResult>",
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidResponse(_)));
    }

    #[test]
    fn complete_result_decodes_entities() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<CompleteMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Location>http://localhost:9000/media/a%26b.mp4</Location>
  <Bucket>media</Bucket>
  <Key>a&amp;b.mp4</Key>
  <ETag>&quot;3858f62230ac3c915f300c664312c11f-9&quot;</ETag>
</CompleteMultipartUploadResult>"#;
        let result: CompleteMultipartUploadResult = parse_xml(body).unwrap();
        assert_eq!(
            result.location.as_deref(),
            Some("http://localhost:9000/media/a%26b.mp4")
        );
        assert_eq!(
            result.etag.as_deref(),
            Some("\"3858f62230ac3c915f300c664312c11f-9\"")
        );
    }

    #[test]
    fn error_root_is_detected() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>InternalError</Code><Message>We encountered an internal error.</Message></Error>"#;
        assert_eq!(root_element(body).as_deref(), Some("Error"));
        assert_eq!(error_message(body), "InternalError: We encountered an internal error.");

        assert_eq!(
            root_element("<CompleteMultipartUploadResult/>").as_deref(),
            Some("CompleteMultipartUploadResult")
        );
        assert_eq!(root_element(""), None);
    }

    #[test]
    fn complete_body_lists_parts_in_given_order() {
        let parts = vec![
            PartReceipt {
                index: 1,
                etag: "\"a&b\"".into(),
            },
            PartReceipt {
                index: 2,
                etag: "\"c\"".into(),
            },
        ];

        let xml = complete_body(&parts).unwrap();

        assert_eq!(root_element(&xml).as_deref(), Some("CompleteMultipartUpload"));
        assert!(xml.contains(S3_XMLNS));
        assert!(!xml.contains("a&b"));
        let parsed: CompleteMultipartUpload = quick_xml::de::from_str(&xml).unwrap();
        assert_eq!(
            parsed,
            CompleteMultipartUpload {
                xmlns: S3_XMLNS.into(),
                parts: vec![
                    CompletedPart {
                        part_number: 1,
                        etag: "\"a&b\"".into(),
                    },
                    CompletedPart {
                        part_number: 2,
                        etag: "\"c\"".into(),
                    },
                ],
            }
        );
    }

    #[test]
    fn status_mapping() {
        let body = "<Error><Code>NoSuchUpload</Code><Message>gone</Message></Error>";
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, body),
            StoreError::NotFound("NoSuchUpload: gone".into())
        );

        let err = status_error(StatusCode::SERVICE_UNAVAILABLE, "<Error><Code>SlowDown</Code></Error>");
        assert_eq!(
            err,
            StoreError::Status {
                status: 503,
                message: "SlowDown".into()
            }
        );
        assert!(err.is_retryable());
        assert!(!status_error(StatusCode::FORBIDDEN, "denied").is_retryable());
    }

    #[test]
    fn unsigned_store_sends_only_the_payload_hash() {
        let s = store("http://localhost:9000");
        let request = s
            .prepare(s.client.post(s.object_url("a.mp4")), EMPTY_PAYLOAD_SHA256)
            .unwrap();

        assert_eq!(request.headers()["x-amz-content-sha256"], EMPTY_PAYLOAD_SHA256);
        assert!(!request.headers().contains_key("authorization"));
    }

    #[test]
    fn signed_store_uses_configured_region() {
        let s = S3Store::with_credentials(
            &AppConfig {
                region: "eu-central-1".into(),
                ..config("http://localhost:9000")
            },
            Some(Credentials {
                access_key: "AKID".into(),
                secret_key: "secret".into(),
                session_token: None,
            }),
        )
        .unwrap();

        let request = s
            .prepare(
                s.client
                    .put(s.object_url("a.mp4"))
                    .query(&[("partNumber", "1"), ("uploadId", "u1")]),
                UNSIGNED_PAYLOAD,
            )
            .unwrap();

        assert_eq!(request.headers()["x-amz-content-sha256"], UNSIGNED_PAYLOAD);
        let authorization = request.headers()["authorization"].to_str().unwrap();
        assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKID/"));
        assert!(authorization.contains("/eu-central-1/s3/aws4_request,"));
        assert!(request.headers().contains_key("x-amz-date"));
    }

    #[test]
    fn http_date_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(http_date(&at), "Tue, 05 Mar 2024 07:08:09 GMT");
    }
}
