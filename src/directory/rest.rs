use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_RANGE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::base_url;
use crate::error::{AppError, AppResult};

use super::{NewResource, Resource, ResourceDirectory, ResourceKind};

/// Row shape in the PostgREST tables. Messages carry `conversation_id`.
#[derive(Debug, Serialize, Deserialize)]
struct Row {
    id: String,
    owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    created_at: DateTime<Utc>,
}

impl Row {
    fn from_resource(r: &Resource) -> Self {
        Row {
            id: r.id.clone(),
            owner_id: r.owner_identity_id.clone(),
            conversation_id: r.parent_id.clone(),
            text: r.text.clone(),
            created_at: r.created_at,
        }
    }

    fn into_resource(self, kind: ResourceKind) -> Resource {
        Resource {
            id: self.id,
            kind,
            owner_identity_id: self.owner_id,
            parent_id: self.conversation_id,
            text: self.text,
            created_at: self.created_at,
        }
    }
}

/// Total from a PostgREST `Content-Range` header: `0-4/5` or `*/0`.
pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

/// Directory backed by a PostgREST endpoint (`/rest/v1/<table>`), authenticated with a
/// service key so migration is not subject to the caller's row-level policies.
#[derive(Clone)]
pub struct RestDirectory {
    base: Url,
    headers: HeaderMap,
    client: reqwest::Client,
}

impl RestDirectory {
    pub fn new(base: &str, api_key: &str, client: reqwest::Client) -> AppResult<Self> {
        let base = base_url(base, "directory")?;
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key).map_err(|e| AppError::config(format!("invalid directory key: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| AppError::config(format!("invalid directory key: {}", e)))?;
        headers.insert("apikey", key);
        headers.insert(reqwest::header::AUTHORIZATION, bearer);
        Ok(Self { base, headers, client })
    }

    fn table_url(&self, kind: ResourceKind) -> AppResult<Url> {
        self.base
            .join(&format!("rest/v1/{}", kind.table()))
            .map_err(|e| AppError::config(format!("invalid directory table URL: {}", e)))
    }

    async fn check(resp: reqwest::Response, op: &str) -> AppResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(AppError::transport(format!("directory {} failed: HTTP {} {}", op, status, body.trim())))
    }

    fn total_from(resp: &reqwest::Response, op: &str) -> AppResult<u64> {
        resp.headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| AppError::transport(format!("directory {} did not report a row count", op)))
    }
}

#[async_trait]
impl ResourceDirectory for RestDirectory {
    async fn insert(&self, new: NewResource) -> AppResult<Resource> {
        let res = new.into_resource();
        let resp = self
            .client
            .post(self.table_url(res.kind)?)
            .headers(self.headers.clone())
            .header("Prefer", "return=minimal")
            .json(&Row::from_resource(&res))
            .send()
            .await?;
        Self::check(resp, "insert").await?;
        Ok(res)
    }

    async fn fetch(&self, kind: ResourceKind, id: &str) -> AppResult<Option<Resource>> {
        let mut url = self.table_url(kind)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{}", id)).append_pair("select", "*");
        let resp = self.client.get(url).headers(self.headers.clone()).send().await?;
        let rows: Vec<Row> = Self::check(resp, "fetch").await?.json().await?;
        Ok(rows.into_iter().next().map(|r| r.into_resource(kind)))
    }

    async fn count_owned(&self, kind: ResourceKind, owner_identity_id: &str) -> AppResult<u64> {
        let mut url = self.table_url(kind)?;
        url.query_pairs_mut()
            .append_pair("owner_id", &format!("eq.{}", owner_identity_id))
            .append_pair("select", "id");
        let resp = self
            .client
            .head(url)
            .headers(self.headers.clone())
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let resp = Self::check(resp, "count").await?;
        Self::total_from(&resp, "count")
    }

    async fn reassign_owner(&self, kind: ResourceKind, from: &str, to: &str) -> AppResult<u64> {
        let mut url = self.table_url(kind)?;
        url.query_pairs_mut().append_pair("owner_id", &format!("eq.{}", from));
        let resp = self
            .client
            .patch(url)
            .headers(self.headers.clone())
            .header("Prefer", "return=minimal,count=exact")
            .json(&serde_json::json!({ "owner_id": to }))
            .send()
            .await?;
        let resp = Self::check(resp, "reassign").await?;
        let moved = Self::total_from(&resp, "reassign")?;
        debug!(target: "migration", table = kind.table(), moved, "directory.reassign_owner");
        Ok(moved)
    }
}
