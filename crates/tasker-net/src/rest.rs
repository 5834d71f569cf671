//! REST collaborator.
//!
//! [`RestApi`] is the seam the stores depend on; [`HttpRestClient`] is the
//! production implementation over reqwest with bearer authentication.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;

use tasker_shared::rest::{ConversationList, ConversationSnapshot, NotificationPage};
use tasker_shared::{NotificationId, UserId};

use crate::error::{NetError, Result};

#[async_trait]
pub trait RestApi: Send + Sync + 'static {
    /// `GET /conversations/{selfId}`
    async fn fetch_conversations(&self, self_id: &UserId) -> Result<Vec<ConversationSnapshot>>;

    /// `GET /user/notifications?page=&per_page=`
    async fn fetch_notifications(&self, page: u32, per_page: u32) -> Result<NotificationPage>;

    /// `POST /user/notifications/{id}/read`
    async fn mark_notification_read(&self, id: &NotificationId) -> Result<()>;
}

/// JSON-over-HTTPS client for the marketplace API.
#[derive(Debug, Clone)]
pub struct HttpRestClient {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpRestClient {
    pub fn new(base_url: &str, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        reqwest::Url::parse(base_url).map_err(|e| NetError::Url(format!("{base_url}: {e}")))?;
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(&self, request: RequestBuilder, url: &str) -> Result<String> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.text().await?)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, u32)]) -> Result<T> {
        let body = self.execute(self.http.get(url).query(query), url).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl RestApi for HttpRestClient {
    async fn fetch_conversations(&self, self_id: &UserId) -> Result<Vec<ConversationSnapshot>> {
        let url = self.url(&format!("/conversations/{self_id}"));
        let list: ConversationList = self.get_json(&url, &[]).await?;
        let list = list.into_vec();
        debug!(count = list.len(), "Fetched conversations");
        Ok(list)
    }

    async fn fetch_notifications(&self, page: u32, per_page: u32) -> Result<NotificationPage> {
        let url = self.url("/user/notifications");
        let page: NotificationPage = self
            .get_json(&url, &[("page", page), ("per_page", per_page)])
            .await?;
        debug!(
            page = page.page,
            pages = page.pages,
            count = page.notifications.len(),
            "Fetched notification page"
        );
        Ok(page)
    }

    async fn mark_notification_read(&self, id: &NotificationId) -> Result<()> {
        let url = self.url(&format!("/user/notifications/{id}/read"));
        self.execute(self.http.post(&url), &url).await?;
        Ok(())
    }
}
