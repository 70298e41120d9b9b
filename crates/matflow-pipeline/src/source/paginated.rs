//! OPTIMADE-style paginated JSON API
//!
//! Pages are requested as `{base_url}?page_limit={limit}&page_offset={offset}&sort=id`.
//! Items live under `data`. Data ends when a page is short, or when
//! `meta.more_data_available` is `false`.

use super::{FetchedPage, PagePlan, PageSpec, Reject, SourceConnector};
use crate::error::SourceError;
use crate::models::{Cursor, RawRecord};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    meta: Option<PageMeta>,
}

#[derive(Debug, Deserialize)]
struct PageMeta {
    more_data_available: Option<bool>,
}

pub struct PaginatedApiSource {
    name: String,
    base_url: String,
    limit: i64,
    client: reqwest::Client,
}

impl PaginatedApiSource {
    pub fn new(name: &str, base_url: &str, limit: i64) -> Result<Self, SourceError> {
        if limit <= 0 {
            return Err(SourceError::Fatal(format!("page limit must be positive, got {limit}")));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("matflow/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SourceError::Fatal(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('?').to_string(),
            limit,
            client,
        })
    }

    fn page_url(&self, offset: i64) -> String {
        format!(
            "{}?page_limit={}&page_offset={}&sort=id",
            self.base_url, self.limit, offset
        )
    }
}

#[async_trait]
impl SourceConnector for PaginatedApiSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, start: &Cursor) -> Result<PagePlan, SourceError> {
        let next = start.as_offset().ok_or_else(|| {
            SourceError::Fatal(format!("{} resumes from integer offsets, got {start}", self.name))
        })?;
        Ok(PagePlan::Offsets {
            next,
            limit: self.limit,
        })
    }

    #[instrument(skip(self, page), fields(source = %self.name, offset = %page.start))]
    async fn fetch_page(&self, page: &PageSpec) -> Result<FetchedPage, SourceError> {
        let offset = page.start.as_offset().unwrap_or_default();
        let url = self.page_url(offset);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::from_status(status, &url));
        }
        let body: PageResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Permanent(format!("{url}: malformed page: {e}")))?;

        let returned = body.data.len() as i64;
        let more = body.meta.and_then(|m| m.more_data_available);
        let last = returned < self.limit || more == Some(false);

        let mut fetched = FetchedPage {
            next: Cursor::Offset(offset + returned),
            last,
            ..FetchedPage::default()
        };
        for item in body.data {
            match super::id_of(&item, "id") {
                Some(id) => fetched.records.push(RawRecord::new(id, item, page.start.clone())),
                None => fetched.rejects.push(Reject {
                    locator: format!("{url}#{}", fetched.rejects.len()),
                    reason: "item has no id".to_string(),
                }),
            }
        }

        debug!(
            records = fetched.records.len(),
            rejects = fetched.rejects.len(),
            last,
            "page fetched"
        );
        Ok(fetched)
    }

    fn locate(&self, page: &PageSpec) -> String {
        self.page_url(page.start.as_offset().unwrap_or_default())
    }
}
