//! Typed HTTP clients for the coordinator and shard APIs.
//!
//! The coordinator uses [`ShardClient`] to forward records and drive
//! migrations; shard replicas use [`CoordinatorClient`] for their
//! registration heartbeat; tests use both as an SDK. Every request
//! forwards the ambient trace id (`x-trace-id`) when one is installed.

use std::time::Duration;

use kivet_core::trace::{current_trace_id, TRACE_HEADER};
use kivet_core::{
    BulkKeysRequest, CreateRecordRequest, DumpResponse, ExistsResponse, KeyItem,
    KeysDumpResponse, MigrateDelResponse, MigratePutResponse, RecordResponse,
    RegisterReplicaRequest, RegisterReplicaResponse, ReplicaInfo, StatsResponse, TableDef,
};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("api error: {status}: {detail}")]
    Api { status: StatusCode, detail: String },
}

impl ClientError {
    /// Status code of a downstream error response, if this was one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Transport(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let detail = match response.json::<serde_json::Value>().await {
        Ok(body) => body
            .get("detail")
            .and_then(|d| d.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Err(_) => format!("status {status}"),
    };
    Err(ClientError::Api { status, detail })
}

fn with_trace(builder: RequestBuilder) -> RequestBuilder {
    match current_trace_id() {
        Some(id) => builder.header(TRACE_HEADER, id),
        None => builder,
    }
}

fn record_query<'a>(table_name: &'a str, pk: &'a str, sk: &'a str) -> [(&'static str, &'a str); 3] {
    [("table_name", table_name), ("pk", pk), ("sk", sk)]
}

fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .expect("http client construction")
}

/// Client for the shard node API; takes the target base URL per call since
/// the coordinator talks to many replicas with one client.
#[derive(Clone, Debug)]
pub struct ShardClient {
    http: Client,
}

impl ShardClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: http_client(timeout),
        }
    }

    fn request(&self, method: Method, base: &str, path: &str) -> RequestBuilder {
        let url = format!("{}{}", base.trim_end_matches('/'), path);
        with_trace(self.http.request(method, url))
    }

    pub async fn create_record(&self, base: &str, req: &CreateRecordRequest) -> Result<RecordResponse> {
        let response = self.request(Method::POST, base, "/records").json(req).send().await?;
        decode(response).await
    }

    /// `Ok(None)` when the shard reports the record as not found.
    pub async fn read_record(
        &self,
        base: &str,
        table_name: &str,
        pk: &str,
        sk: &str,
    ) -> Result<Option<RecordResponse>> {
        let response = self
            .request(Method::GET, base, "/records")
            .query(&record_query(table_name, pk, sk))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    /// `Ok(None)` when there was nothing live to delete.
    pub async fn delete_record(
        &self,
        base: &str,
        table_name: &str,
        pk: &str,
        sk: &str,
    ) -> Result<Option<RecordResponse>> {
        let response = self
            .request(Method::DELETE, base, "/records")
            .query(&record_query(table_name, pk, sk))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    pub async fn exists(&self, base: &str, table_name: &str, pk: &str, sk: &str) -> Result<bool> {
        let response = self
            .request(Method::GET, base, "/exists")
            .query(&record_query(table_name, pk, sk))
            .send()
            .await?;
        let body: ExistsResponse = decode(response).await?;
        Ok(body.exists)
    }

    /// Live (non-tombstone) records, optionally restricted to one table.
    pub async fn internal_keys(&self, base: &str, table_name: Option<&str>) -> Result<Vec<KeyItem>> {
        let mut request = self.request(Method::GET, base, "/internal/keys");
        if let Some(table) = table_name {
            request = request.query(&[("table_name", table)]);
        }
        let body: KeysDumpResponse = decode(request.send().await?).await?;
        Ok(body.items)
    }

    pub async fn internal_stats(&self, base: &str) -> Result<StatsResponse> {
        decode(self.request(Method::GET, base, "/internal/stats").send().await?).await
    }

    pub async fn internal_dump(&self, base: &str, table_name: &str) -> Result<DumpResponse> {
        let response = self
            .request(Method::GET, base, "/internal/dump")
            .query(&[("table_name", table_name)])
            .send()
            .await?;
        decode(response).await
    }

    pub async fn migrate_put(&self, base: &str, items: Vec<KeyItem>) -> Result<usize> {
        let response = self
            .request(Method::POST, base, "/internal/migrate-put")
            .json(&BulkKeysRequest { items })
            .send()
            .await?;
        let body: MigratePutResponse = decode(response).await?;
        Ok(body.migrated)
    }

    pub async fn migrate_del(&self, base: &str, items: Vec<KeyItem>) -> Result<usize> {
        let response = self
            .request(Method::POST, base, "/internal/migrate-del")
            .json(&BulkKeysRequest { items })
            .send()
            .await?;
        let body: MigrateDelResponse = decode(response).await?;
        Ok(body.deleted)
    }
}

/// Client for the coordinator API.
#[derive(Clone, Debug)]
pub struct CoordinatorClient {
    http: Client,
    base_url: String,
}

impl CoordinatorClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url: String = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            http: http_client(timeout),
            base_url,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        with_trace(self.http.request(method, format!("{}{}", self.base_url, path)))
    }

    pub async fn register_replica(
        &self,
        req: &RegisterReplicaRequest,
    ) -> Result<RegisterReplicaResponse> {
        decode(self.request(Method::POST, "/register-replica").json(req).send().await?).await
    }

    pub async fn register_table(&self, def: &TableDef) -> Result<TableDef> {
        decode(self.request(Method::POST, "/tables").json(def).send().await?).await
    }

    pub async fn list_tables(&self) -> Result<Vec<TableDef>> {
        decode(self.request(Method::GET, "/tables").send().await?).await
    }

    pub async fn get_table(&self, table_name: &str) -> Result<TableDef> {
        decode(
            self.request(Method::GET, &format!("/tables/{table_name}"))
                .send()
                .await?,
        )
        .await
    }

    pub async fn create_record(&self, req: &CreateRecordRequest) -> Result<RecordResponse> {
        decode(self.request(Method::POST, "/records").json(req).send().await?).await
    }

    /// A missing record is a 200 with `value: null`, never an error.
    pub async fn read_record(&self, table_name: &str, pk: &str, sk: &str) -> Result<RecordResponse> {
        let response = self
            .request(Method::GET, "/records")
            .query(&record_query(table_name, pk, sk))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn delete_record(&self, table_name: &str, pk: &str, sk: &str) -> Result<RecordResponse> {
        let response = self
            .request(Method::DELETE, "/records")
            .query(&record_query(table_name, pk, sk))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn exists(&self, table_name: &str, pk: &str, sk: &str) -> Result<bool> {
        let response = self
            .request(Method::GET, "/exists")
            .query(&record_query(table_name, pk, sk))
            .send()
            .await?;
        let body: ExistsResponse = decode(response).await?;
        Ok(body.exists)
    }

    pub async fn list_replicas(&self) -> Result<Vec<ReplicaInfo>> {
        decode(self.request(Method::GET, "/replicas").send().await?).await
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        decode(self.request(Method::GET, "/health").send().await?).await
    }

    pub async fn version(&self) -> Result<serde_json::Value> {
        decode(self.request(Method::GET, "/version").send().await?).await
    }
}
