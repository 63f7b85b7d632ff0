//! Google Cloud Storage + IAM implementation
//!
//! Talks to the JSON APIs directly over reqwest, authenticating with the
//! daemon's own service-account key via the OAuth2 JWT-bearer grant. The
//! access token is cached until shortly before expiry.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{make_identity_id, ObjectStorageIam, StorageIamError, StorageIamResult};

const STORAGE_API: &str = "https://storage.googleapis.com/storage/v1";
const IAM_API: &str = "https://iam.googleapis.com/v1";
const CLOUD_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Subset of a service-account key file the adapter needs.
#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// GCS/IAM implementation of [`ObjectStorageIam`]
pub struct GcsIam {
    client: Client,
    gcp_project: String,
    region: String,
    key: ServiceAccountKey,
    token: Mutex<Option<CachedToken>>,
}

impl GcsIam {
    /// Build from a service-account key file.
    pub fn from_key_file(
        path: &str,
        gcp_project: &str,
        region: &str,
    ) -> StorageIamResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let key: ServiceAccountKey = serde_json::from_str(&raw)
            .map_err(|e| StorageIamError::Auth(format!("invalid key file {}: {}", path, e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            gcp_project: gcp_project.to_string(),
            region: region.to_string(),
            key,
            token: Mutex::new(None),
        })
    }

    /// Fetch (or reuse) an access token for the cloud APIs.
    async fn access_token(&self) -> StorageIamResult<String> {
        {
            let cached = self.token.lock();
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Instant::now() + Duration::from_secs(60) {
                    return Ok(token.access_token.clone());
                }
            }
        }

        #[derive(serde::Serialize)]
        struct Claims<'a> {
            iss: &'a str,
            scope: &'a str,
            aud: &'a str,
            iat: i64,
            exp: i64,
        }

        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: &self.key.client_email,
            scope: CLOUD_SCOPE,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + 3600,
        };

        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        let signing_key = jsonwebtoken::EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| StorageIamError::Auth(format!("bad private key: {}", e)))?;
        let assertion = jsonwebtoken::encode(&header, &claims, &signing_key)
            .map_err(|e| StorageIamError::Auth(e.to_string()))?;

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }

        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(StorageIamError::Api { status, message });
        }

        let token: TokenResponse = response.json().await?;
        let access_token = token.access_token.clone();

        *self.token.lock() = Some(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });

        Ok(access_token)
    }

    async fn api_error(response: reqwest::Response) -> StorageIamError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        StorageIamError::Api { status, message }
    }

    fn identity_email(&self, identity_id: &str) -> String {
        format!("{}@{}.iam.gserviceaccount.com", identity_id, self.gcp_project)
    }

    /// List object names under a prefix, following pagination.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> StorageIamResult<Vec<String>> {
        #[derive(Deserialize)]
        struct Listing {
            #[serde(default)]
            items: Vec<Item>,
            #[serde(rename = "nextPageToken")]
            next_page_token: Option<String>,
        }

        #[derive(Deserialize)]
        struct Item {
            name: String,
        }

        let token = self.access_token().await?;
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(format!("{}/b/{}/o", STORAGE_API, bucket))
                .bearer_auth(&token)
                .query(&[("prefix", prefix)]);
            if let Some(ref page) = page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }

            let response = request.send().await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(names);
            }
            if !response.status().is_success() {
                return Err(Self::api_error(response).await);
            }

            let listing: Listing = response.json().await?;
            names.extend(listing.items.into_iter().map(|i| i.name));

            match listing.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(names)
    }
}

/// Percent-encode an object name for use in a URL path.
fn encode_object_name(name: &str) -> String {
    name.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                (b as char).to_string()
            }
            other => format!("%{:02X}", other),
        })
        .collect()
}

#[async_trait]
impl ObjectStorageIam for GcsIam {
    async fn create_bucket(&self, name: &str) -> StorageIamResult<()> {
        let token = self.access_token().await?;

        let response = self
            .client
            .post(format!("{}/b", STORAGE_API))
            .bearer_auth(&token)
            .query(&[("project", self.gcp_project.as_str())])
            .json(&json!({
                "name": name,
                "location": self.region,
                "storageClass": "STANDARD",
            }))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                info!("Created bucket {}", name);
                Ok(())
            }
            // Bucket already exists
            StatusCode::CONFLICT => Ok(()),
            _ => Err(Self::api_error(response).await),
        }
    }

    async fn create_identity(&self, user_id: &str) -> StorageIamResult<String> {
        let token = self.access_token().await?;
        let identity_id = make_identity_id(user_id);

        let response = self
            .client
            .post(format!(
                "{}/projects/{}/serviceAccounts",
                IAM_API, self.gcp_project
            ))
            .bearer_auth(&token)
            .json(&json!({
                "accountId": identity_id,
                "serviceAccount": {
                    "displayName": format!("Sandbox identity for user {}", user_id),
                },
            }))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                #[derive(Deserialize)]
                struct Identity {
                    email: String,
                }
                let identity: Identity = response.json().await?;
                info!("Created identity {}", identity.email);
                Ok(identity.email)
            }
            // Identity already exists; its email is derived from the id
            StatusCode::CONFLICT => Ok(self.identity_email(&identity_id)),
            _ => Err(Self::api_error(response).await),
        }
    }

    async fn create_credential(&self, identity: &str) -> StorageIamResult<String> {
        let token = self.access_token().await?;

        let response = self
            .client
            .post(format!(
                "{}/projects/{}/serviceAccounts/{}/keys",
                IAM_API, self.gcp_project, identity
            ))
            .bearer_auth(&token)
            .json(&json!({
                "privateKeyType": "TYPE_GOOGLE_CREDENTIALS_FILE",
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        #[derive(Deserialize)]
        struct Key {
            #[serde(rename = "privateKeyData")]
            private_key_data: String,
        }

        let key: Key = response.json().await?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(key.private_key_data.as_bytes())
            .map_err(|e| StorageIamError::Other(format!("bad key encoding: {}", e)))?;

        String::from_utf8(decoded)
            .map_err(|e| StorageIamError::Other(format!("key is not UTF-8: {}", e)))
    }

    async fn grant_bucket_iam(&self, identity: &str, bucket: &str) -> StorageIamResult<()> {
        let token = self.access_token().await?;
        let iam_url = format!("{}/b/{}/iam", STORAGE_API, bucket);

        let response = self
            .client
            .get(&iam_url)
            .bearer_auth(&token)
            .query(&[("optionsRequestedPolicyVersion", "3")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let mut policy: serde_json::Value = response.json().await?;
        policy["version"] = json!(3);

        let member = format!("serviceAccount:{}", identity);
        let binding = json!({
            "role": "roles/storage.objectAdmin",
            "members": [member],
        });

        match policy["bindings"].as_array_mut() {
            Some(bindings) => bindings.push(binding),
            None => policy["bindings"] = json!([binding]),
        }

        let response = self
            .client
            .put(&iam_url)
            .bearer_auth(&token)
            .json(&policy)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        info!("Granted objectAdmin on {} to {}", bucket, identity);
        Ok(())
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> StorageIamResult<()> {
        let names = self.list_objects(bucket, prefix).await?;
        if names.is_empty() {
            return Ok(());
        }

        let token = self.access_token().await?;
        for name in &names {
            let response = self
                .client
                .delete(format!(
                    "{}/b/{}/o/{}",
                    STORAGE_API,
                    bucket,
                    encode_object_name(name)
                ))
                .bearer_auth(&token)
                .send()
                .await?;

            if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
                return Err(Self::api_error(response).await);
            }
        }

        debug!("Deleted {} object(s) under {}/{}", names.len(), bucket, prefix);
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> StorageIamResult<()> {
        // Buckets must be empty before deletion
        self.delete_prefix(bucket, "").await?;

        let token = self.access_token().await?;
        let response = self
            .client
            .delete(format!("{}/b/{}", STORAGE_API, bucket))
            .bearer_auth(&token)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::api_error(response).await),
        }
    }

    async fn delete_identity(&self, identity: &str) -> StorageIamResult<()> {
        let token = self.access_token().await?;

        let response = self
            .client
            .delete(format!(
                "{}/projects/{}/serviceAccounts/{}",
                IAM_API, self.gcp_project, identity
            ))
            .bearer_auth(&token)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::api_error(response).await),
        }
    }
}
