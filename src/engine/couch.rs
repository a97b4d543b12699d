use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ETAG;
use reqwest::{Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::{mismatch, Backend, BackendKind, Capabilities, Connection, Operation};
use crate::options::Options;
use crate::{Error, Result};

/// Connection to a CouchDB server, shared by every adapter built from it.
#[derive(Debug, Clone)]
pub struct CouchConnection {
    base: Url,
    http: reqwest::Client,
}

impl CouchConnection {
    /// Targets the server at `url`, e.g. `http://127.0.0.1:5984`.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_client(url, reqwest::Client::new())
    }

    pub fn with_client(url: &str, http: reqwest::Client) -> Result<Self> {
        let base = Url::parse(url).map_err(|e| Error::Config(format!("[Cradle] invalid server url: {}", e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("[Cradle] invalid server url: {}", url)));
        }
        Ok(Self { base, http })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[derive(Deserialize)]
struct Saved {
    rev: String,
}

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    value: Value,
}

/// Document store adapter.
///
/// Each key is a document `{ "value": ... }` in the configured database.
/// Misses on `get` surface as [`Error::NotFound`], the way CouchDB answers
/// them. There is no native expiry, so `expire` is not registered and a TTL
/// passed to `set` is ignored.
pub struct CouchAdapter {
    connection: CouchConnection,
    database: String,
}

impl CouchAdapter {
    pub fn new(connection: CouchConnection, database: &str) -> Result<Self> {
        if database.is_empty() {
            return Err(Error::Config("[Cradle] Provide a database name".to_string()));
        }
        Ok(Self {
            connection,
            database: database.to_string(),
        })
    }

    pub(crate) fn construct(options: &Options, connection: Connection) -> Result<Arc<dyn Backend>> {
        match connection {
            Connection::Couch(connection) => {
                let database = options
                    .database_name()
                    .ok_or_else(|| Error::Config("[Cradle] Provide a database name".to_string()))?;
                Ok(Arc::new(Self::new(connection, database)?))
            }
            other => Err(mismatch(BackendKind::Couch, &other)),
        }
    }

    fn database_url(&self) -> Url {
        self.connection.url(&[&self.database])
    }

    fn document_url(&self, key: &str) -> Url {
        self.connection.url(&[&self.database, key])
    }

    /// Current revision of the document, if it exists.
    async fn revision(&self, key: &str) -> Result<Option<String>> {
        let response = self.connection.http.head(self.document_url(key)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response).await?;
        let rev = response
            .headers()
            .get(ETAG)
            .and_then(|etag| etag.to_str().ok())
            .map(|etag| etag.trim_matches('"').to_string())
            .ok_or_else(|| Error::Backend("couchdb: document without revision".to_string()))?;
        Ok(Some(rev))
    }

    async fn create_database(&self) -> Result<()> {
        let response = self.connection.http.put(self.database_url()).send().await?;
        if response.status() == StatusCode::PRECONDITION_FAILED {
            return Ok(());
        }
        check(response).await.map(|_| ())
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Backend(format!("couchdb {}: {}", status, body.trim())))
}

#[async_trait]
impl Backend for CouchAdapter {
    fn name(&self) -> &'static str {
        BackendKind::Couch.store_name()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::STANDARD
            .without(Operation::Expire)
            .with(Operation::Prepare)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let response = self.connection.http.get(self.document_url(key)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound);
        }
        let document: Document = check(response).await?.json().await?;
        Ok(Some(document.value))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<String> {
        if ttl.is_some() {
            log::warn!("couchdb has no expiring writes, storing {} without a ttl", key);
        }

        let body = match self.revision(key).await? {
            Some(rev) => json!({ "_rev": rev, "value": value }),
            None => json!({ "value": value }),
        };
        let response = self.connection.http.put(self.document_url(key)).json(&body).send().await?;
        let saved: Saved = check(response).await?.json().await?;
        Ok(saved.rev)
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let Some(rev) = self.revision(key).await? else {
            return Ok(0);
        };
        let mut url = self.document_url(key);
        url.query_pairs_mut().append_pair("rev", &rev);
        let response = self.connection.http.delete(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        check(response).await?;
        Ok(1)
    }

    async fn flush(&self) -> Result<String> {
        let response = self.connection.http.delete(self.database_url()).send().await?;
        if response.status() != StatusCode::NOT_FOUND {
            check(response).await?;
        }
        self.create_database().await?;
        Ok("OK".to_string())
    }

    async fn prepare(&self) -> Result<()> {
        let response = self.connection.http.head(self.database_url()).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            check(response).await?;
        }
        log::debug!("creating couchdb database {}", self.database);
        self.create_database().await
    }
}
