//! Minimal Trello REST client: just the board, list, card, label, and
//! comment calls the moderation reconciler needs.

use serde::Deserialize;
use thiserror::Error;

const API_BASE: &str = "https://api.trello.com/1";

#[derive(Debug, Error)]
pub enum TrelloError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("trello api error ({status}): {body}")]
    Api { status: u16, body: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct List {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Card {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(rename = "idList")]
    pub id_list: String,
}

pub struct Trello {
    http: reqwest::Client,
    key: String,
    token: String,
}

impl Trello {
    pub fn new(key: String, token: String) -> Result<Self, TrelloError> {
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Trello { http, key, token })
    }

    fn auth(&self) -> [(&'static str, &str); 2] {
        [("key", self.key.as_str()), ("token", self.token.as_str())]
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, TrelloError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(TrelloError::Api {
            status: status.as_u16(),
            body,
        })
    }

    pub async fn lists(&self, board: &str) -> Result<Vec<List>, TrelloError> {
        let resp = self
            .http
            .get(format!("{API_BASE}/boards/{board}/lists"))
            .query(&self.auth())
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn cards(&self, board: &str) -> Result<Vec<Card>, TrelloError> {
        let resp = self
            .http
            .get(format!("{API_BASE}/boards/{board}/cards"))
            .query(&self.auth())
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn add_card(
        &self,
        list_id: &str,
        name: &str,
        desc: &str,
    ) -> Result<Card, TrelloError> {
        let resp = self
            .http
            .post(format!("{API_BASE}/cards"))
            .query(&self.auth())
            .query(&[("idList", list_id), ("name", name), ("desc", desc)])
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn add_label(
        &self,
        card_id: &str,
        color: &str,
        name: &str,
    ) -> Result<(), TrelloError> {
        let resp = self
            .http
            .post(format!("{API_BASE}/cards/{card_id}/labels"))
            .query(&self.auth())
            .query(&[("color", color), ("name", name)])
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn add_comment(&self, card_id: &str, text: &str) -> Result<(), TrelloError> {
        let resp = self
            .http
            .post(format!("{API_BASE}/cards/{card_id}/actions/comments"))
            .query(&self.auth())
            .query(&[("text", text)])
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}
