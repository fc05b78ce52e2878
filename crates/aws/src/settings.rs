//! Connection settings for the S3 client

use cistash_cache::{Error, Result};
use secrecy::SecretString;

/// Environment variable holding the access key id
pub const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
/// Environment variable holding the secret access key
pub const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
/// Environment variable holding the optional session token
pub const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
/// Environment variable holding the region
pub const ENV_REGION: &str = "AWS_REGION";

/// Credentials, region and endpoint of the object store
///
/// Credentials are static: they come from the job environment and are never
/// looked up through profiles or instance metadata.
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// Region the bucket lives in
    pub region: String,
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: SecretString,
    /// Session token for temporary credentials
    pub session_token: Option<SecretString>,
    /// Custom endpoint for S3-compatible stores (MinIO, R2, ...)
    pub endpoint: Option<String>,
    /// Address buckets by path instead of virtual host
    pub force_path_style: bool,
}

impl S3Settings {
    /// Read credentials and region from the standard AWS variables
    ///
    /// # Errors
    /// Returns a configuration error naming every missing variable.
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let access_key_id = var(ENV_ACCESS_KEY_ID);
        let secret_access_key = var(ENV_SECRET_ACCESS_KEY);
        let region = var(ENV_REGION);

        let missing: Vec<&str> = [
            (ENV_ACCESS_KEY_ID, access_key_id.is_none()),
            (ENV_SECRET_ACCESS_KEY, secret_access_key.is_none()),
            (ENV_REGION, region.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();

        match (access_key_id, secret_access_key, region) {
            (Some(access_key_id), Some(secret), Some(region)) => Ok(Self {
                region,
                access_key_id,
                secret_access_key: SecretString::from(secret),
                session_token: var(ENV_SESSION_TOKEN).map(SecretString::from),
                endpoint: None,
                force_path_style: false,
            }),
            _ => Err(Error::configuration(format!(
                "Missing AWS credentials: {} must be set",
                missing.join(", ")
            ))),
        }
    }

    /// Point the client at a custom endpoint
    ///
    /// Custom endpoints use path-style addressing, which S3-compatible stores
    /// expect.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint.filter(|e| !e.trim().is_empty());
        self.force_path_style = self.endpoint.is_some();
        self
    }
}
