//! `ObjectStore` implementation on the AWS SDK for S3

use crate::settings::S3Settings;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_smithy_http_client::{Builder as HttpClientBuilder, tls};
use bytes::Bytes;
use cistash_cache::{CompletedPart, ObjectMeta, ObjectStore, StoreError, StoreResult};
use secrecy::ExposeSecret;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Object store backed by an S3 (or S3-compatible) service
#[derive(Clone)]
pub struct S3Store {
    client: Client,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("region", &self.client.config().region())
            .finish_non_exhaustive()
    }
}

impl S3Store {
    /// Build a client from explicit settings
    pub async fn connect(settings: &S3Settings) -> Self {
        let credentials = Credentials::new(
            settings.access_key_id.clone(),
            settings.secret_access_key.expose_secret().to_string(),
            settings
                .session_token
                .as_ref()
                .map(|t| t.expose_secret().to_string()),
            None,
            "cistash",
        );

        let http_client = HttpClientBuilder::new()
            .tls_provider(tls::Provider::Rustls(
                tls::rustls_provider::CryptoMode::Ring,
            ))
            .build_https();

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .http_client(http_client)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        builder = builder.force_path_style(settings.force_path_style);

        debug!(
            region = %settings.region,
            endpoint = settings.endpoint.as_deref().unwrap_or("default"),
            path_style = settings.force_path_style,
            "Created S3 client"
        );

        Self::from_client(Client::from_conf(builder.build()))
    }

    /// Wrap an existing client
    #[must_use]
    pub const fn from_client(client: Client) -> Self {
        Self { client }
    }
}

/// Map an SDK error to a store error, splitting transient from permanent
fn classify<E>(operation: &'static str, err: &SdkError<E, HttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(err).to_string();
    match err {
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            if status == 429 || status >= 500 || service.err().code() == Some("SlowDown") {
                StoreError::request(operation, message)
            } else {
                StoreError::rejected(operation, message)
            }
        }
        SdkError::ConstructionFailure(_) => StoreError::rejected(operation, message),
        _ => StoreError::request(operation, message),
    }
}

fn strip_quotes(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> StoreResult<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_length(i64::try_from(body.len()).unwrap_or(i64::MAX))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify("put_object", &e))?;
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str, dest: &Path) -> StoreResult<u64> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StoreError::not_found(key)
                } else {
                    classify("get_object", &e)
                }
            })?;

        let mut reader = output.body.into_async_read();
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| StoreError::io("get_object", e))?;
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| StoreError::io("get_object", e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io("get_object", e))?;
        Ok(written)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<Option<ObjectMeta>> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(ObjectMeta {
                size: output
                    .content_length()
                    .and_then(|len| u64::try_from(len).ok())
                    .unwrap_or_default(),
                etag: output.e_tag().map(strip_quotes),
            })),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(None),
            Err(e) => Err(classify("head_object", &e)),
        }
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> StoreResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("create_multipart_upload", &e))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::rejected("create_multipart_upload", "response has no upload id"))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<String> {
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(i64::try_from(body.len()).unwrap_or(i64::MAX))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify("upload_part", &e))?;
        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StoreError::rejected("upload_part", format!("part {part_number} has no ETag")))
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        S3CompletedPart::builder()
                            .part_number(p.part_number)
                            .e_tag(&p.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify("complete_multipart_upload", &e))?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StoreResult<()> {
        match self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_upload()) => {
                Err(StoreError::not_found(upload_id))
            }
            Err(e) => Err(classify("abort_multipart_upload", &e)),
        }
    }

    fn provider_name(&self) -> &'static str {
        "s3"
    }
}
