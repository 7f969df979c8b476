use crate::errors::WithdrawError;
use derive_more::{Deref, Display, From, Into};
use serde::{Deserialize, Deserializer, Serialize};

/// Transaction hash of an ethscription, i.e. the part of the marketplace
/// identifier after the network prefix.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    From,
    Into,
    Deref,
    Display,
)]
#[serde(transparent)]
pub struct ItemId(String);

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        ItemId(value.to_string())
    }
}

impl ItemId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A record from the marketplace listing endpoint. Only the fields needed to
/// decide whether the item is escrowed are decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    /// Composite `network:transactionHash` identifier.
    pub id: String,
    #[serde(default)]
    pub extension: ItemExtension,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemExtension {
    #[serde(default)]
    pub escrow_state: Option<EscrowState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowState {
    Pending,
    Empty,
    #[serde(untagged)]
    Other(String),
}

impl InventoryItem {
    pub fn escrow_state(&self) -> Option<&EscrowState> {
        self.extension.escrow_state.as_ref()
    }

    /// Strips the network prefix off the identifier.
    pub fn item_id(&self) -> Result<ItemId, WithdrawError> {
        match self.id.split_once(':') {
            Some((_network, hash)) if !hash.is_empty() => Ok(ItemId::from(hash)),
            _ => Err(WithdrawError::MalformedItemId(self.id.clone())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPage {
    #[serde(default)]
    pub items: Vec<InventoryItem>,
    #[serde(default)]
    pub continuation: Option<String>,
    /// Number of items on this page.
    #[serde(default)]
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRecord {
    pub transaction_hash: ItemId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupPage {
    #[serde(default)]
    pub ethscriptions: Vec<LookupRecord>,
    #[serde(default)]
    pub total_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub client: String,
    pub item_ids: Vec<ItemId>,
    pub client_signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub from: String,
    pub to: String,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySignature {
    /// The relay has been observed to send this both as a JSON string and as
    /// a number.
    #[serde(deserialize_with = "deserialize_expiry")]
    pub expiry_timestamp: u64,
    pub v: u8,
    pub r: String,
    pub s: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub confirmation: Confirmation,
    pub sig: RelaySignature,
}

/// Second argument of `bulkWithdrawItems`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawSignature {
    pub expiry_timestamp: u64,
    pub v: u8,
    pub r: String,
    pub s: String,
}

impl From<RelaySignature> for WithdrawSignature {
    fn from(sig: RelaySignature) -> Self {
        WithdrawSignature {
            expiry_timestamp: sig.expiry_timestamp,
            v: sig.v,
            r: sig.r,
            s: sig.s,
        }
    }
}

pub const BULK_WITHDRAW_FUNCTION: &str = "bulkWithdrawItems";

/// A fully prepared call of the escrow contract's withdrawal function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWithdrawCall {
    pub contract: String,
    pub function: String,
    pub confirmation: Confirmation,
    pub signature: WithdrawSignature,
}

impl BulkWithdrawCall {
    pub fn new(contract: String, response: RelayResponse) -> Self {
        BulkWithdrawCall {
            contract,
            function: BULK_WITHDRAW_FUNCTION.to_string(),
            confirmation: response.confirmation,
            signature: response.sig.into(),
        }
    }
}

fn deserialize_expiry<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Expiry {
        Number(u64),
        Text(String),
    }

    match Expiry::deserialize(deserializer)? {
        Expiry::Number(value) => Ok(value),
        Expiry::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}
