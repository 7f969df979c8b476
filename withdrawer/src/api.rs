use crate::config::EndpointsConfig;
use crate::errors::WithdrawError;
use crate::types::{ItemId, ListingPage, LookupPage, RelayRequest, RelayResponse};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use url::Url;

#[cfg(test)]
use mockall::automock;

const LISTING_ENDPOINT: &str = "listing";
const LOOKUP_ENDPOINT: &str = "lookup";
const RELAY_ENDPOINT: &str = "relay";

/// Network prefix the listing endpoint expects in front of owner addresses.
pub const OWNER_NETWORK: &str = "ETHEREUM";

/// The three marketplace endpoints the withdrawal flow talks to.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EscrowApi: Send + Sync {
    /// One page of the inventory owned by `owner`.
    async fn list_items(
        &self,
        owner: &str,
        continuation: Option<String>,
    ) -> Result<ListingPage, WithdrawError>;

    /// Looks up which of `ids` are currently owned by `current_owner`.
    async fn lookup_escrowed(
        &self,
        ids: &[ItemId],
        current_owner: &str,
        page: u32,
    ) -> Result<LookupPage, WithdrawError>;

    /// Exchanges the client's signature for a contract confirmation.
    async fn submit_signature(&self, request: RelayRequest) -> Result<RelayResponse, WithdrawError>;
}

/// [`EscrowApi`] over HTTP.
#[derive(Clone, Debug)]
pub struct HttpEscrowApi {
    client: reqwest::Client,
    listing_url: Url,
    lookup_url: Url,
    relay_url: Url,
}

impl HttpEscrowApi {
    pub fn new(config: &EndpointsConfig) -> Result<Self, WithdrawError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(WithdrawError::transport("client"))?;
        Ok(HttpEscrowApi {
            client,
            listing_url: config.listing_url.clone(),
            lookup_url: config.lookup_url.clone(),
            relay_url: config.relay_url.clone(),
        })
    }

    async fn decode<T: DeserializeOwned>(
        endpoint: &'static str,
        response: reqwest::Response,
    ) -> Result<T, WithdrawError> {
        let response = response
            .error_for_status()
            .map_err(WithdrawError::transport(endpoint))?;
        let body = response
            .bytes()
            .await
            .map_err(WithdrawError::transport(endpoint))?;
        serde_json::from_slice(&body).map_err(|err| WithdrawError::MalformedResponse {
            endpoint,
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl EscrowApi for HttpEscrowApi {
    async fn list_items(
        &self,
        owner: &str,
        continuation: Option<String>,
    ) -> Result<ListingPage, WithdrawError> {
        let mut query = vec![("owner", format!("{OWNER_NETWORK}:{owner}"))];
        if let Some(continuation) = continuation {
            query.push(("continuation", continuation));
        }
        let response = self
            .client
            .get(self.listing_url.clone())
            .query(&query)
            .send()
            .await
            .map_err(WithdrawError::transport(LISTING_ENDPOINT))?;
        Self::decode(LISTING_ENDPOINT, response).await
    }

    async fn lookup_escrowed(
        &self,
        ids: &[ItemId],
        current_owner: &str,
        page: u32,
    ) -> Result<LookupPage, WithdrawError> {
        let encoded_ids =
            serde_json::Value::from(ids.iter().map(ItemId::as_str).collect::<Vec<_>>()).to_string();
        let response = self
            .client
            .get(self.lookup_url.clone())
            .query(&[
                ("transaction_hash", encoded_ids),
                ("current_owner", current_owner.to_string()),
                ("page", page.to_string()),
            ])
            .send()
            .await
            .map_err(WithdrawError::transport(LOOKUP_ENDPOINT))?;
        Self::decode(LOOKUP_ENDPOINT, response).await
    }

    async fn submit_signature(&self, request: RelayRequest) -> Result<RelayResponse, WithdrawError> {
        let response = self
            .client
            .post(self.relay_url.clone())
            .json(&request)
            .send()
            .await
            .map_err(WithdrawError::transport(RELAY_ENDPOINT))?;
        Self::decode(RELAY_ENDPOINT, response).await
    }
}
