use crate::api::EscrowApi;
use crate::errors::WithdrawError;
use crate::types::ItemId;

/// The lookup endpoint is always asked for its first page; a batch never
/// exceeds the endpoint's page size.
const LOOKUP_PAGE: u32 = 1;

/// Result of re-checking candidates against the authoritative lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reverification {
    /// Identifiers still held by the escrow contract, in batch order.
    pub still_escrowed: Vec<ItemId>,
    /// Sum of the `total_count` reported for every batch.
    pub confirmed_count: usize,
}

/// Re-checks `candidates` in batches of `batch_size`, one request at a time,
/// and keeps the identifiers the lookup still reports as owned by
/// `escrow_owner`. The first failing batch aborts the whole check.
pub async fn reverify_escrowed(
    api: &dyn EscrowApi,
    candidates: &[ItemId],
    escrow_owner: &str,
    batch_size: usize,
) -> Result<Reverification, WithdrawError> {
    let mut result = Reverification::default();
    if candidates.is_empty() {
        return Ok(result);
    }
    for (batch_index, batch) in candidates.chunks(batch_size.max(1)).enumerate() {
        let page = api.lookup_escrowed(batch, escrow_owner, LOOKUP_PAGE).await?;
        tracing::debug!(
            batch_index,
            batch_len = batch.len(),
            confirmed = page.ethscriptions.len(),
            total_count = page.total_count,
            "re-verified escrow batch"
        );
        result.confirmed_count += page.total_count;
        result
            .still_escrowed
            .extend(page.ethscriptions.into_iter().map(|record| record.transaction_hash));
    }
    Ok(result)
}
