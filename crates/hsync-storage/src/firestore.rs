//! Cloud Firestore over its REST API.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use hsync_core::{Identity, STATUS};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::document_store::{DocumentStore, Fields, StoreError, WriteBatch, WriteOp, MAX_BATCH_OPS};

pub const DEFAULT_BASE_URL: &str = "https://firestore.googleapis.com/v1";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The subset of a service-account key file needed to mint access tokens.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Firebase credentials not provided: set FIREBASE_SECRET or FIREBASE_SERVICE_ACCOUNT_PATH")]
    Missing,
    #[error("service account file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("reading service account file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing service account key: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("emulator host set but no project id (FIREBASE_PROJECT_ID)")]
    MissingProject,
}

#[derive(Debug, Clone)]
pub enum FirestoreCredentials {
    ServiceAccount(ServiceAccountKey),
    Emulator { host: String, project_id: String },
}

impl FirestoreCredentials {
    pub fn from_inline_json(secret: &str) -> Result<Self, CredentialError> {
        Ok(Self::ServiceAccount(serde_json::from_str(secret)?))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CredentialError::FileNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| CredentialError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_inline_json(&text)
    }

    /// Emulator host wins, then an inline secret, then a key file path.
    pub fn resolve(
        emulator_host: Option<&str>,
        project_id: Option<&str>,
        inline_secret: Option<&str>,
        key_path: Option<&Path>,
    ) -> Result<Self, CredentialError> {
        if let Some(host) = emulator_host.filter(|h| !h.trim().is_empty()) {
            let project_id = project_id
                .filter(|p| !p.trim().is_empty())
                .ok_or(CredentialError::MissingProject)?;
            return Ok(Self::Emulator {
                host: host.trim().to_string(),
                project_id: project_id.trim().to_string(),
            });
        }
        if let Some(secret) = inline_secret.filter(|s| !s.trim().is_empty()) {
            return Self::from_inline_json(secret);
        }
        match key_path {
            Some(path) => Self::from_file(path),
            None => Err(CredentialError::Missing),
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            Self::ServiceAccount(key) => &key.project_id,
            Self::Emulator { project_id, .. } => project_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct TokenClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_after: Instant,
}

#[derive(Debug)]
enum Auth {
    ServiceAccount {
        key: ServiceAccountKey,
        cached: Mutex<Option<CachedToken>>,
    },
    Emulator,
}

#[derive(Debug)]
pub struct FirestoreStore {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    collection: String,
    auth: Auth,
}

impl FirestoreStore {
    pub fn new(
        credentials: FirestoreCredentials,
        collection: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let project_id = credentials.project_id().to_string();
        let (base_url, auth) = match credentials {
            FirestoreCredentials::ServiceAccount(key) => (
                DEFAULT_BASE_URL.to_string(),
                Auth::ServiceAccount {
                    key,
                    cached: Mutex::new(None),
                },
            ),
            FirestoreCredentials::Emulator { host, .. } => {
                (format!("http://{host}/v1"), Auth::Emulator)
            }
        };
        info!(%project_id, %base_url, "firestore client configured");
        Ok(Self {
            http,
            base_url,
            project_id,
            collection: collection.into(),
            auth,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn documents_path(&self) -> String {
        format!("projects/{}/databases/(default)/documents", self.project_id)
    }

    fn document_name(&self, id: &Identity) -> String {
        format!("{}/{}/{}", self.documents_path(), self.collection, id)
    }

    fn documents_url(&self, suffix: &str) -> String {
        format!("{}/{}{}", self.base_url, self.documents_path(), suffix)
    }

    async fn bearer(&self) -> Result<String, StoreError> {
        match &self.auth {
            Auth::Emulator => Ok("owner".to_string()),
            Auth::ServiceAccount { key, cached } => {
                let mut cached = cached.lock().await;
                if let Some(token) = cached.as_ref() {
                    if Instant::now() < token.refresh_after {
                        return Ok(token.token.clone());
                    }
                }
                let fresh = self.fetch_access_token(key).await?;
                let token = fresh.token.clone();
                *cached = Some(fresh);
                Ok(token)
            }
        }
    }

    async fn fetch_access_token(&self, key: &ServiceAccountKey) -> Result<CachedToken, StoreError> {
        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            iss: &key.client_email,
            scope: DATASTORE_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        };
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| StoreError::Auth(format!("invalid private key: {e}")))?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| StoreError::Auth(format!("signing token request: {e}")))?;

        let resp = self
            .http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Auth(format!("token endpoint returned {status}: {body}")));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Auth(format!("decoding token response: {e}")))?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(TOKEN_LIFETIME_SECS as u64));
        debug!(lifetime_secs = lifetime.as_secs(), "obtained firestore access token");
        Ok(CachedToken {
            token: token.access_token,
            refresh_after: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        })
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, StoreError> {
        let resp = self
            .http
            .post(url)
            .bearer_auth(self.bearer().await?)
            .json(body)
            .send()
            .await?;
        let resp = ensure_success(resp).await?;
        resp.json()
            .await
            .map_err(|e| StoreError::Decode(format!("decoding response from {url}: {e}")))
    }

    fn write_json(&self, op: &WriteOp) -> Result<Value, StoreError> {
        Ok(match op {
            WriteOp::Set { id, fields } => json!({
                "update": { "name": self.document_name(id), "fields": encode_fields(fields)? },
            }),
            WriteOp::Update { id, fields } => json!({
                "update": { "name": self.document_name(id), "fields": encode_fields(fields)? },
                "updateMask": { "fieldPaths": fields.keys().map(|k| quote_field_path(k)).collect::<Vec<_>>() },
                "currentDocument": { "exists": true },
            }),
            WriteOp::Delete { id } => json!({ "delete": self.document_name(id) }),
        })
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Status { status, body })
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn exists(&self, id: &Identity) -> Result<bool, StoreError> {
        let url = format!("{}/{}", self.base_url, self.document_name(id));
        let resp = self
            .http
            .get(&url)
            .query(&[("mask.fieldPaths", STATUS)])
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(resp).await?;
        Ok(true)
    }

    async fn commit(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.len() > MAX_BATCH_OPS {
            return Err(StoreError::BatchTooLarge(batch.len()));
        }
        let writes = batch
            .ops()
            .iter()
            .map(|op| self.write_json(op))
            .collect::<Result<Vec<_>, _>>()?;
        self.post_json(&self.documents_url(":commit"), &json!({ "writes": writes }))
            .await?;
        Ok(())
    }

    async fn list_ids(&self, status: Option<&str>) -> Result<Vec<Identity>, StoreError> {
        let mut query = json!({
            "from": [{ "collectionId": self.collection }],
            "select": { "fields": [{ "fieldPath": "__name__" }] },
        });
        if let Some(status) = status {
            query["where"] = json!({
                "fieldFilter": {
                    "field": { "fieldPath": STATUS },
                    "op": "EQUAL",
                    "value": { "stringValue": status },
                }
            });
        }
        let resp = self
            .post_json(&self.documents_url(":runQuery"), &json!({ "structuredQuery": query }))
            .await?;
        let rows = resp
            .as_array()
            .ok_or_else(|| StoreError::Decode("runQuery response is not an array".into()))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.pointer("/document/name").and_then(Value::as_str))
            .filter_map(|name| name.rsplit('/').next())
            .map(Identity::from_key)
            .collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let body = json!({
            "structuredAggregationQuery": {
                "structuredQuery": { "from": [{ "collectionId": self.collection }] },
                "aggregations": [{ "alias": "total", "count": {} }],
            }
        });
        let resp = self
            .post_json(&self.documents_url(":runAggregationQuery"), &body)
            .await?;
        let total = resp
            .as_array()
            .and_then(|rows| {
                rows.iter()
                    .find_map(|row| row.pointer("/result/aggregateFields/total/integerValue"))
            })
            .ok_or_else(|| StoreError::Decode("aggregation response missing total".into()))?;
        let parsed = match total {
            Value::String(s) => s.parse::<usize>().ok(),
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            _ => None,
        };
        parsed.ok_or_else(|| StoreError::Decode(format!("invalid count value {total}")))
    }
}

/// Encode a JSON object as Firestore typed `fields`.
pub fn encode_fields(fields: &Fields) -> Result<Value, StoreError> {
    let mut out = Map::with_capacity(fields.len());
    for (key, value) in fields {
        out.insert(key.clone(), encode_value(value)?);
    }
    Ok(Value::Object(out))
}

pub fn encode_value(value: &Value) -> Result<Value, StoreError> {
    Ok(match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                json!({ "integerValue": i.to_string() })
            } else if n.is_u64() {
                return Err(StoreError::Encode(format!("integer {n} exceeds 64-bit signed range")));
            } else {
                json!({ "doubleValue": n.as_f64() })
            }
        }
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(encode_value).collect::<Result<Vec<_>, _>>()? }
        }),
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map)? } }),
    })
}

/// Backtick-quote field names that are not plain identifiers, e.g. `` `Uploaded On` ``.
pub fn quote_field_path(name: &str) -> String {
    let simple = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn store(server: &MockServer) -> FirestoreStore {
        FirestoreStore::new(
            FirestoreCredentials::Emulator {
                host: "unused".into(),
                project_id: "demo".into(),
            },
            "hackathons",
            Duration::from_secs(5),
        )
        .unwrap()
        .with_base_url(server.url("/v1"))
    }

    const DOCS: &str = "/v1/projects/demo/databases/(default)/documents";

    #[test]
    fn values_encode_to_typed_json() {
        assert_eq!(encode_value(&json!(null)).unwrap(), json!({ "nullValue": null }));
        assert_eq!(encode_value(&json!(12)).unwrap(), json!({ "integerValue": "12" }));
        assert_eq!(encode_value(&json!("x")).unwrap(), json!({ "stringValue": "x" }));
        assert_eq!(encode_value(&json!(1.5)).unwrap(), json!({ "doubleValue": 1.5 }));
        assert!(encode_value(&json!(u64::MAX)).is_err());
    }

    #[test]
    fn field_paths_with_spaces_are_quoted() {
        assert_eq!(quote_field_path("Title"), "Title");
        assert_eq!(quote_field_path("uploaded_to_firebase"), "uploaded_to_firebase");
        assert_eq!(quote_field_path("Uploaded On"), "`Uploaded On`");
        assert_eq!(quote_field_path("a`b"), "`a\\`b`");
    }

    #[test]
    fn credentials_prefer_emulator_then_secret_then_path() {
        let secret = r#"{"project_id":"p","client_email":"svc@p.iam","private_key":"k"}"#;
        let emulator =
            FirestoreCredentials::resolve(Some("localhost:8080"), Some("demo"), Some(secret), None)
                .unwrap();
        assert!(matches!(emulator, FirestoreCredentials::Emulator { .. }));

        let inline = FirestoreCredentials::resolve(None, None, Some(secret), None).unwrap();
        assert_eq!(inline.project_id(), "p");

        let missing = FirestoreCredentials::resolve(None, None, None, None).unwrap_err();
        assert!(matches!(missing, CredentialError::Missing));

        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("nope.json");
        let err = FirestoreCredentials::resolve(None, None, None, Some(&absent)).unwrap_err();
        assert!(matches!(err, CredentialError::FileNotFound(_)));

        let present = dir.path().join("key.json");
        std::fs::write(&present, secret).unwrap();
        let from_file = FirestoreCredentials::resolve(None, None, Some("  "), Some(&present)).unwrap();
        assert_eq!(from_file.project_id(), "p");
    }

    #[tokio::test]
    async fn exists_maps_404_to_false() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path(format!("{DOCS}/hackathons/present"));
            then.status(200).json_body(json!({ "name": "x" }));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("{DOCS}/hackathons/absent"));
            then.status(404).json_body(json!({ "error": { "code": 404 } }));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("{DOCS}/hackathons/broken"));
            then.status(500).body("boom");
        });

        let store = store(&server);
        assert!(store.exists(&Identity::from_key("present")).await.unwrap());
        assert!(!store.exists(&Identity::from_key("absent")).await.unwrap());
        let err = store.exists(&Identity::from_key("broken")).await.unwrap_err();
        assert!(matches!(err, StoreError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn commit_posts_set_update_and_delete_writes() {
        let server = MockServer::start();
        let name = |id: &str| format!("projects/demo/databases/(default)/documents/hackathons/{id}");
        let commit = server.mock(|when, then| {
            when.method(POST)
                .path(format!("{DOCS}:commit"))
                .header("authorization", "Bearer owner")
                .json_body(json!({
                    "writes": [
                        { "update": { "name": name("a"), "fields": { "Title": { "stringValue": "Foo" } } } },
                        {
                            "update": { "name": name("b"), "fields": { "Uploaded On": { "nullValue": null } } },
                            "updateMask": { "fieldPaths": ["`Uploaded On`"] },
                            "currentDocument": { "exists": true }
                        },
                        { "delete": name("c") }
                    ]
                }));
            then.status(200).json_body(json!({ "writeResults": [] }));
        });

        let mut set_fields = Fields::new();
        set_fields.insert("Title".into(), json!("Foo"));
        let mut update_fields = Fields::new();
        update_fields.insert("Uploaded On".into(), Value::Null);
        let mut batch = WriteBatch::new();
        batch.set(Identity::from_key("a"), set_fields);
        batch.update(Identity::from_key("b"), update_fields);
        batch.delete(Identity::from_key("c"));

        store(&server).commit(&batch).await.unwrap();
        commit.assert();
    }

    #[tokio::test]
    async fn list_ids_reads_document_names_and_filters_on_status() {
        let server = MockServer::start();
        let query = server.mock(|when, then| {
            when.method(POST)
                .path(format!("{DOCS}:runQuery"))
                .body_contains(r#""op":"EQUAL""#)
                .body_contains(r#""stringValue":"expired""#);
            then.status(200).json_body(json!([
                { "document": { "name": "projects/demo/databases/(default)/documents/hackathons/abc" }, "readTime": "t" },
                { "document": { "name": "projects/demo/databases/(default)/documents/hackathons/def" }, "readTime": "t" },
                { "readTime": "t" }
            ]));
        });

        let ids = store(&server).list_ids(Some("expired")).await.unwrap();
        query.assert();
        assert_eq!(ids, vec![Identity::from_key("abc"), Identity::from_key("def")]);
    }

    #[tokio::test]
    async fn count_reads_aggregation_total() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path(format!("{DOCS}:runAggregationQuery"));
            then.status(200).json_body(json!([
                { "result": { "aggregateFields": { "total": { "integerValue": "1234" } } }, "readTime": "t" }
            ]));
        });

        assert_eq!(store(&server).count().await.unwrap(), 1234);
    }
}
