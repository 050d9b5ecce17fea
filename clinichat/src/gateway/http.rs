//! HTTP implementation of [`Gateway`].
//!
//! Routes are defined in [`clinichat_proto::api`]. Staff sessions send their
//! token as a bearer credential; guest sessions send none.

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use url::Url;

use clinichat_proto::api::{
    MarkReadResponse, RosterEntry, UnreadCounts, history_path, mark_read_path, roster_path,
    unread_path,
};
use clinichat_proto::message::{Message, ParticipantId};
use clinichat_proto::scope::Universe;

use super::{Gateway, GatewayError};

/// [`Gateway`] speaking JSON to the clinic backend.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    http: Client,
    base: Url,
    token: Option<String>,
}

impl HttpGateway {
    /// Creates a gateway for the backend at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidUrl`] if `base_url` does not parse and
    /// [`GatewayError::Request`] if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let base = Url::parse(base_url)?;
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base, token })
    }

    /// The backend base URL.
    #[must_use]
    pub const fn base(&self) -> &Url {
        &self.base
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let url = self.base.join(path)?;
        self.send_json(self.http.get(url), path).await
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let url = self.base.join(path)?;
        self.send_json(self.http.post(url), path).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        path: &str,
    ) -> Result<T, GatewayError> {
        let resp = self.authorize(req).send().await?;
        if !resp.status().is_success() {
            return Err(GatewayError::Status {
                path: path.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(resp.json::<T>().await?)
    }
}

impl Gateway for HttpGateway {
    async fn fetch_history(
        &self,
        self_id: &ParticipantId,
        counterpart: &ParticipantId,
    ) -> Result<Vec<Message>, GatewayError> {
        self.get_json(&history_path(self_id, counterpart)).await
    }

    async fn fetch_roster(
        &self,
        universe: Universe,
        self_id: &ParticipantId,
    ) -> Result<Vec<RosterEntry>, GatewayError> {
        self.get_json(&roster_path(universe, self_id)).await
    }

    async fn fetch_unread_counts(
        &self,
        self_id: &ParticipantId,
    ) -> Result<UnreadCounts, GatewayError> {
        self.get_json(&unread_path(self_id)).await
    }

    async fn mark_conversation_read(
        &self,
        self_id: &ParticipantId,
        counterpart: &ParticipantId,
    ) -> Result<u32, GatewayError> {
        let resp: MarkReadResponse = self
            .post_json(&mark_read_path(self_id, counterpart))
            .await?;
        Ok(resp.marked)
    }
}
