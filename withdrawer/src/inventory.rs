use crate::api::EscrowApi;
use crate::errors::WithdrawError;
use crate::types::{EscrowState, InventoryItem, ItemId};
use serde::{Deserialize, Serialize};

/// Which escrow states count as "still in escrow".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowFilter {
    /// Anything but `EMPTY`.
    #[default]
    NotEmpty,
    /// Only `PENDING`.
    PendingOnly,
}

impl EscrowFilter {
    pub fn is_escrowed(&self, state: Option<&EscrowState>) -> bool {
        match (self, state) {
            (_, None) => false,
            (EscrowFilter::NotEmpty, Some(state)) => *state != EscrowState::Empty,
            (EscrowFilter::PendingOnly, Some(state)) => *state == EscrowState::Pending,
        }
    }
}

/// Fetches every item owned by `owner`, following continuation tokens.
///
/// Another page is requested only while the listing returns a continuation
/// token together with a full page of `page_size` items. At most `max_pages`
/// pages are requested.
pub async fn fetch_inventory(
    api: &dyn EscrowApi,
    owner: &str,
    page_size: usize,
    max_pages: usize,
) -> Result<Vec<InventoryItem>, WithdrawError> {
    let mut items = Vec::new();
    let mut continuation = None;
    for page_number in 1..=max_pages {
        let page = api.list_items(owner, continuation.take()).await?;
        tracing::debug!(
            owner,
            page_number,
            page_items = page.items.len(),
            reported_total = page.total,
            has_continuation = page.continuation.is_some(),
            "fetched inventory page"
        );
        items.extend(page.items);
        match page.continuation {
            Some(token) if page.total == page_size => continuation = Some(token),
            _ => return Ok(items),
        }
    }
    Err(WithdrawError::PaginationLimitExceeded { max_pages })
}

/// Transaction hashes of the items `filter` considers escrowed, in inventory
/// order.
pub fn escrowed_item_ids(
    inventory: &[InventoryItem],
    filter: EscrowFilter,
) -> Result<Vec<ItemId>, WithdrawError> {
    inventory
        .iter()
        .filter(|item| filter.is_escrowed(item.escrow_state()))
        .map(InventoryItem::item_id)
        .collect()
}
