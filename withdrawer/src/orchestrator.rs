use crate::api::EscrowApi;
use crate::config::ConfigFile;
use crate::contract::ContractWriter;
use crate::errors::WithdrawError;
use crate::inventory::{escrowed_item_ids, fetch_inventory, EscrowFilter};
use crate::message::{build_withdrawal_message, Clock};
use crate::session::{Session, SessionSnapshot};
use crate::types::{BulkWithdrawCall, ItemId, RelayRequest};
use crate::verification::reverify_escrowed;
use crate::wallet::WalletSigner;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::time::FutureExt;

/// Knobs of the discovery and withdrawal sequences.
#[derive(Debug, Clone)]
pub struct WithdrawerSettings {
    pub page_size: usize,
    pub max_pages: usize,
    pub lookup_batch_size: usize,
    pub escrow_filter: EscrowFilter,
    /// Checksummed escrow contract address, the target of the withdrawal call.
    pub escrow_contract: String,
    /// Owner the lookup endpoint reports for items still in escrow.
    pub escrow_owner: String,
    pub discovery_timeout: Duration,
    pub withdrawal_timeout: Duration,
}

impl From<&ConfigFile> for WithdrawerSettings {
    fn from(config: &ConfigFile) -> Self {
        WithdrawerSettings {
            page_size: config.discovery.page_size,
            max_pages: config.discovery.max_pages,
            lookup_batch_size: config.discovery.lookup_batch_size,
            escrow_filter: config.discovery.escrow_filter,
            escrow_contract: config.escrow_contract.address.clone(),
            escrow_owner: config.escrow_contract.lookup_owner(),
            discovery_timeout: config.discovery_timeout(),
            withdrawal_timeout: config.withdrawal_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub inventory_size: usize,
    /// Items the escrow filter selected, in inventory order.
    pub candidates: Vec<ItemId>,
    /// Count confirmed by the authoritative lookup.
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalReceipt {
    pub item_ids: Vec<ItemId>,
    pub message: String,
    pub signature: String,
    pub call: BulkWithdrawCall,
    pub call_reference: String,
}

/// Runs discovery and withdrawal for one connected account, one sequence at a
/// time.
pub struct Withdrawer {
    api: Arc<dyn EscrowApi>,
    wallet: Arc<dyn WalletSigner>,
    contract: Arc<dyn ContractWriter>,
    clock: Clock,
    settings: WithdrawerSettings,
    session: Session,
}

impl Withdrawer {
    pub fn new(
        api: Arc<dyn EscrowApi>,
        wallet: Arc<dyn WalletSigner>,
        contract: Arc<dyn ContractWriter>,
        clock: Clock,
        settings: WithdrawerSettings,
    ) -> Self {
        Withdrawer {
            api,
            wallet,
            contract,
            clock,
            settings,
            session: Session::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.session.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn account(&self) -> String {
        self.wallet.address()
    }

    pub fn reset(&self) -> Result<(), WithdrawError> {
        self.session.reset()
    }

    /// Finds the items `owner` has in escrow. Only starts from the idle state;
    /// ends in `ready` or, on any error or timeout, in `failed`.
    pub async fn discover(&self, owner: &str) -> Result<Discovery, WithdrawError> {
        self.session.begin_discovery()?;
        let started = Instant::now();
        let limit = self.settings.discovery_timeout;
        let result = self
            .run_discovery(owner)
            .timeout(limit)
            .await
            .unwrap_or(Err(WithdrawError::Timeout {
                operation: "discovery",
                limit,
            }));
        match result {
            Ok(discovery) => {
                self.session
                    .finish_discovery(discovery.candidates.clone(), discovery.remaining)?;
                tracing::info!(
                    owner,
                    inventory = discovery.inventory_size,
                    candidates = discovery.candidates.len(),
                    remaining = discovery.remaining,
                    "discovery finished in {}",
                    humantime::format_duration(started.elapsed())
                );
                Ok(discovery)
            }
            Err(err) => {
                tracing::error!(owner, %err, "discovery failed");
                self.session.fail(err.to_string());
                Err(err)
            }
        }
    }

    async fn run_discovery(&self, owner: &str) -> Result<Discovery, WithdrawError> {
        let inventory = fetch_inventory(
            self.api.as_ref(),
            owner,
            self.settings.page_size,
            self.settings.max_pages,
        )
        .await?;
        let candidates = escrowed_item_ids(&inventory, self.settings.escrow_filter)?;
        let verified = reverify_escrowed(
            self.api.as_ref(),
            &candidates,
            &self.settings.escrow_owner,
            self.settings.lookup_batch_size,
        )
        .await?;
        Ok(Discovery {
            inventory_size: inventory.len(),
            candidates,
            remaining: verified.confirmed_count,
        })
    }

    /// Signs and submits a withdrawal of every discovered item that is still
    /// in escrow. Requires a `ready` session with items remaining, which this
    /// call claims until it finishes.
    pub async fn withdraw(&self) -> Result<WithdrawalReceipt, WithdrawError> {
        let candidates = self.session.begin_withdrawal()?;
        let limit = self.settings.withdrawal_timeout;
        let result = self
            .run_withdrawal(candidates)
            .timeout(limit)
            .await
            .unwrap_or(Err(WithdrawError::Timeout {
                operation: "withdrawal",
                limit,
            }));
        match result {
            Ok(receipt) => Ok(receipt),
            Err(WithdrawError::NothingToWithdraw) => {
                tracing::info!("nothing left in escrow after re-verification");
                Err(WithdrawError::NothingToWithdraw)
            }
            Err(err) => {
                tracing::error!(%err, "withdrawal failed");
                self.session.fail(err.to_string());
                Err(err)
            }
        }
    }

    async fn run_withdrawal(
        &self,
        candidates: Vec<ItemId>,
    ) -> Result<WithdrawalReceipt, WithdrawError> {
        let verified = reverify_escrowed(
            self.api.as_ref(),
            &candidates,
            &self.settings.escrow_owner,
            self.settings.lookup_batch_size,
        )
        .await?;
        if verified.still_escrowed.is_empty() || verified.confirmed_count == 0 {
            self.session.finish_verification(0)?;
            return Err(WithdrawError::NothingToWithdraw);
        }
        let item_ids = verified.still_escrowed;

        let message = build_withdrawal_message(&item_ids, self.clock.now());
        self.session.begin_signing(message.clone())?;
        let signature = self.wallet.sign_message(&message).await?;
        self.session.record_signature(signature.clone())?;
        tracing::info!(items = item_ids.len(), "withdrawal message signed");

        let response = self
            .api
            .submit_signature(RelayRequest {
                client: self.wallet.address(),
                item_ids: item_ids.clone(),
                client_signature: signature.clone(),
            })
            .await?;
        tracing::debug!(?response, "relay confirmed withdrawal");

        let call = BulkWithdrawCall::new(self.settings.escrow_contract.clone(), response);
        let call_reference = self.contract.write_bulk_withdraw(call.clone()).await?;
        self.session.finish_submission(call_reference.clone())?;

        Ok(WithdrawalReceipt {
            item_ids,
            message,
            signature,
            call,
            call_reference,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockEscrowApi;
    use crate::contract::MockContractWriter;
    use crate::session::SessionState;
    use crate::types::{
        Confirmation, EscrowState, InventoryItem, ItemExtension, ListingPage, LookupPage,
        LookupRecord, RelayResponse, RelaySignature, WithdrawSignature,
    };
    use crate::wallet::MockWalletSigner;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use time::macros::datetime;

    const OWNER: &str = "0x00000000000000000000000000000000000000aa";
    const ESCROW: &str = "0xC33F8610941bE56fB0d84E25894C0d928CC97ddE";

    fn settings() -> WithdrawerSettings {
        WithdrawerSettings {
            page_size: 50,
            max_pages: 10,
            lookup_batch_size: 100,
            escrow_filter: EscrowFilter::NotEmpty,
            escrow_contract: ESCROW.to_string(),
            escrow_owner: ESCROW.to_lowercase(),
            discovery_timeout: Duration::from_secs(5),
            withdrawal_timeout: Duration::from_secs(5),
        }
    }

    fn hash(n: u8) -> String {
        format!("0x{}", hex::encode([n; 32]))
    }

    fn inventory() -> ListingPage {
        let items = vec![
            (1, EscrowState::Pending),
            (2, EscrowState::Empty),
            (3, EscrowState::Pending),
            (4, EscrowState::Pending),
        ]
        .into_iter()
        .map(|(n, state)| InventoryItem {
            id: format!("ETHEREUM:{}", hash(n)),
            extension: ItemExtension {
                escrow_state: Some(state),
            },
        })
        .collect::<Vec<_>>();
        ListingPage {
            total: items.len(),
            items,
            continuation: None,
        }
    }

    fn echo(ids: &[ItemId]) -> LookupPage {
        LookupPage {
            ethscriptions: ids
                .iter()
                .map(|id| LookupRecord {
                    transaction_hash: id.clone(),
                })
                .collect(),
            total_count: ids.len(),
        }
    }

    fn relay_response() -> RelayResponse {
        RelayResponse {
            confirmation: Confirmation {
                from: ESCROW.to_string(),
                to: OWNER.to_string(),
                ids: vec![hash(1), hash(3), hash(4)],
            },
            sig: RelaySignature {
                expiry_timestamp: 1_709_297_400,
                v: 27,
                r: hash(0xaa),
                s: hash(0xbb),
            },
        }
    }

    fn withdrawer(
        api: impl EscrowApi + 'static,
        wallet: impl WalletSigner + 'static,
        contract: impl ContractWriter + 'static,
        settings: WithdrawerSettings,
    ) -> Withdrawer {
        Withdrawer::new(
            Arc::new(api),
            Arc::new(wallet),
            Arc::new(contract),
            Clock::fixed(datetime!(2024-03-01 12:34:56 UTC)),
            settings,
        )
    }

    #[tokio::test]
    async fn discovers_signs_and_submits_three_items() {
        let expected_ids: Vec<ItemId> = [1, 3, 4].map(|n| ItemId::from(hash(n))).to_vec();

        let mut api = MockEscrowApi::new();
        api.expect_list_items()
            .withf(|owner, continuation| owner == OWNER && continuation.is_none())
            .once()
            .returning(|_, _| Ok(inventory()));
        {
            let expected_ids = expected_ids.clone();
            api.expect_lookup_escrowed()
                .withf(move |ids, owner, page| {
                    ids == expected_ids.as_slice() && owner == ESCROW.to_lowercase() && *page == 1
                })
                .times(2)
                .returning(|ids, _, _| Ok(echo(ids)));
        }
        {
            let expected_ids = expected_ids.clone();
            api.expect_submit_signature()
                .withf(move |request| {
                    request.client == OWNER
                        && request.item_ids == expected_ids
                        && request.client_signature == "0xsigned"
                })
                .once()
                .returning(|_| Ok(relay_response()));
        }

        let mut wallet = MockWalletSigner::new();
        wallet.expect_address().return_const(OWNER.to_string());
        wallet
            .expect_sign_message()
            .withf(|message| {
                message.starts_with("I would like to withdraw the following items: ")
                    && message.contains(&format!("{}, {}, {}", hash(1), hash(3), hash(4)))
                    && message.ends_with("This signature expires at: 2024-03-01T12:50:00.000Z")
            })
            .once()
            .returning(|_| Ok("0xsigned".to_string()));

        let mut contract = MockContractWriter::new();
        contract
            .expect_write_bulk_withdraw()
            .withf(|call| {
                call.contract == ESCROW
                    && call.function == "bulkWithdrawItems"
                    && call.confirmation == relay_response().confirmation
                    && call.signature
                        == WithdrawSignature {
                            expiry_timestamp: 1_709_297_400,
                            v: 27,
                            r: hash(0xaa),
                            s: hash(0xbb),
                        }
            })
            .once()
            .returning(|_| Ok("0xtxhash".to_string()));

        let withdrawer = withdrawer(api, wallet, contract, settings());
        let discovery = withdrawer.discover(OWNER).await.unwrap();
        assert_eq!(discovery.inventory_size, 4);
        assert_eq!(discovery.candidates, expected_ids);
        assert_eq!(discovery.remaining, 3);
        assert_eq!(
            withdrawer.snapshot().state,
            SessionState::Ready { remaining: 3 }
        );

        let receipt = withdrawer.withdraw().await.unwrap();
        assert_eq!(receipt.item_ids, expected_ids);
        assert_eq!(receipt.call_reference, "0xtxhash");

        let snapshot = withdrawer.snapshot();
        assert_eq!(
            snapshot.state,
            SessionState::Submitted {
                call_reference: "0xtxhash".to_string()
            }
        );
        assert_eq!(snapshot.message, Some(receipt.message));
        assert_eq!(snapshot.signature.as_deref(), Some("0xsigned"));
    }

    #[tokio::test]
    async fn wallet_rejection_fails_before_relay() {
        let mut api = MockEscrowApi::new();
        api.expect_list_items().returning(|_, _| Ok(inventory()));
        api.expect_lookup_escrowed()
            .returning(|ids, _, _| Ok(echo(ids)));
        api.expect_submit_signature().never();

        let mut wallet = MockWalletSigner::new();
        wallet.expect_address().return_const(OWNER.to_string());
        wallet
            .expect_sign_message()
            .once()
            .returning(|_| Err(WithdrawError::WalletRejected));

        let mut contract = MockContractWriter::new();
        contract.expect_write_bulk_withdraw().never();

        let withdrawer = withdrawer(api, wallet, contract, settings());
        withdrawer.discover(OWNER).await.unwrap();
        assert_matches!(withdrawer.withdraw().await, Err(WithdrawError::WalletRejected));
        assert_matches!(withdrawer.snapshot().state, SessionState::Failed { .. });
    }

    #[tokio::test]
    async fn items_withdrawn_meanwhile_leave_nothing_to_sign() {
        let mut api = MockEscrowApi::new();
        api.expect_list_items().returning(|_, _| Ok(inventory()));
        let mut seq = mockall::Sequence::new();
        api.expect_lookup_escrowed()
            .once()
            .in_sequence(&mut seq)
            .returning(|ids, _, _| Ok(echo(ids)));
        api.expect_lookup_escrowed()
            .once()
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(LookupPage::default()));

        let mut wallet = MockWalletSigner::new();
        wallet.expect_sign_message().never();
        let mut contract = MockContractWriter::new();
        contract.expect_write_bulk_withdraw().never();

        let withdrawer = withdrawer(api, wallet, contract, settings());
        withdrawer.discover(OWNER).await.unwrap();
        assert_matches!(withdrawer.withdraw().await, Err(WithdrawError::NothingToWithdraw));
        assert_eq!(
            withdrawer.snapshot().state,
            SessionState::Ready { remaining: 0 }
        );
        assert_matches!(withdrawer.withdraw().await, Err(WithdrawError::NothingToWithdraw));
    }

    #[tokio::test]
    async fn empty_escrow_is_ready_with_zero() {
        let mut api = MockEscrowApi::new();
        api.expect_list_items()
            .returning(|_, _| Ok(ListingPage::default()));
        api.expect_lookup_escrowed().never();

        let withdrawer = withdrawer(
            api,
            MockWalletSigner::new(),
            MockContractWriter::new(),
            settings(),
        );
        let discovery = withdrawer.discover(OWNER).await.unwrap();
        assert_eq!(discovery.remaining, 0);
        assert_eq!(
            withdrawer.snapshot().state,
            SessionState::Ready { remaining: 0 }
        );
    }

    #[tokio::test]
    async fn discovery_failure_is_not_stuck_loading() {
        let mut api = MockEscrowApi::new();
        api.expect_list_items().returning(|_, _| {
            Err(WithdrawError::MalformedResponse {
                endpoint: "listing",
                reason: "expected `,` or `}`".to_string(),
            })
        });

        let withdrawer = withdrawer(
            api,
            MockWalletSigner::new(),
            MockContractWriter::new(),
            settings(),
        );
        assert_matches!(
            withdrawer.discover(OWNER).await,
            Err(WithdrawError::MalformedResponse { .. })
        );
        assert_matches!(withdrawer.snapshot().state, SessionState::Failed { .. });
        withdrawer.reset().unwrap();
        assert_eq!(withdrawer.snapshot().state, SessionState::Idle);
    }

    /// Serves the fixed inventory, delaying each endpoint as configured.
    #[derive(Default)]
    struct SlowApi {
        listing_delay: Duration,
        lookup_delay: Duration,
        relay_delay: Duration,
    }

    #[async_trait]
    impl EscrowApi for SlowApi {
        async fn list_items(
            &self,
            _owner: &str,
            _continuation: Option<String>,
        ) -> Result<ListingPage, WithdrawError> {
            tokio::time::sleep(self.listing_delay).await;
            Ok(inventory())
        }

        async fn lookup_escrowed(
            &self,
            ids: &[ItemId],
            _current_owner: &str,
            _page: u32,
        ) -> Result<LookupPage, WithdrawError> {
            tokio::time::sleep(self.lookup_delay).await;
            Ok(echo(ids))
        }

        async fn submit_signature(
            &self,
            _request: RelayRequest,
        ) -> Result<RelayResponse, WithdrawError> {
            tokio::time::sleep(self.relay_delay).await;
            Ok(relay_response())
        }
    }

    fn stalled_listing() -> SlowApi {
        SlowApi {
            listing_delay: Duration::from_secs(30),
            ..SlowApi::default()
        }
    }

    #[tokio::test]
    async fn discovery_times_out_into_failed_state() {
        let withdrawer = withdrawer(
            stalled_listing(),
            MockWalletSigner::new(),
            MockContractWriter::new(),
            WithdrawerSettings {
                discovery_timeout: Duration::from_millis(50),
                ..settings()
            },
        );
        assert_matches!(
            withdrawer.discover(OWNER).await,
            Err(WithdrawError::Timeout {
                operation: "discovery",
                ..
            })
        );
        assert_matches!(withdrawer.snapshot().state, SessionState::Failed { .. });
    }

    #[tokio::test]
    async fn second_discovery_is_refused_while_first_runs() {
        let withdrawer = Arc::new(withdrawer(
            stalled_listing(),
            MockWalletSigner::new(),
            MockContractWriter::new(),
            WithdrawerSettings {
                discovery_timeout: Duration::from_millis(500),
                ..settings()
            },
        ));
        let mut receiver = withdrawer.subscribe();
        let first = {
            let withdrawer = withdrawer.clone();
            tokio::spawn(async move { withdrawer.discover(OWNER).await })
        };
        receiver
            .wait_for(|snapshot| snapshot.state == SessionState::Discovering)
            .await
            .unwrap();

        assert_matches!(
            withdrawer.discover(OWNER).await,
            Err(WithdrawError::InvalidTransition {
                from: SessionState::Discovering,
                ..
            })
        );
        assert_matches!(first.await.unwrap(), Err(WithdrawError::Timeout { .. }));
    }

    fn signing_wallet() -> MockWalletSigner {
        let mut wallet = MockWalletSigner::new();
        wallet.expect_address().return_const(OWNER.to_string());
        wallet
            .expect_sign_message()
            .once()
            .returning(|_| Ok("0xsigned".to_string()));
        wallet
    }

    #[tokio::test]
    async fn concurrent_withdrawal_is_refused_without_disturbing_the_first() {
        let mut contract = MockContractWriter::new();
        contract
            .expect_write_bulk_withdraw()
            .once()
            .returning(|_| Ok("0xtxhash".to_string()));
        let withdrawer = Arc::new(withdrawer(
            SlowApi {
                lookup_delay: Duration::from_millis(50),
                ..SlowApi::default()
            },
            signing_wallet(),
            contract,
            settings(),
        ));
        withdrawer.discover(OWNER).await.unwrap();

        let mut receiver = withdrawer.subscribe();
        let first = {
            let withdrawer = withdrawer.clone();
            tokio::spawn(async move { withdrawer.withdraw().await })
        };
        receiver
            .wait_for(|snapshot| snapshot.state == SessionState::Verifying)
            .await
            .unwrap();

        assert_matches!(
            withdrawer.withdraw().await,
            Err(WithdrawError::InvalidTransition {
                from: SessionState::Verifying,
                ..
            })
        );
        assert_matches!(
            withdrawer.reset(),
            Err(WithdrawError::InvalidTransition { .. })
        );
        assert_eq!(withdrawer.snapshot().state, SessionState::Verifying);

        let receipt = first.await.unwrap().unwrap();
        assert_eq!(receipt.call_reference, "0xtxhash");
        assert_eq!(
            withdrawer.snapshot().state,
            SessionState::Submitted {
                call_reference: "0xtxhash".to_string()
            }
        );
    }

    #[tokio::test]
    async fn withdrawal_times_out_into_failed_state() {
        let mut contract = MockContractWriter::new();
        contract.expect_write_bulk_withdraw().never();
        let withdrawer = withdrawer(
            SlowApi {
                relay_delay: Duration::from_secs(30),
                ..SlowApi::default()
            },
            signing_wallet(),
            contract,
            WithdrawerSettings {
                withdrawal_timeout: Duration::from_millis(100),
                ..settings()
            },
        );
        withdrawer.discover(OWNER).await.unwrap();

        assert_matches!(
            withdrawer.withdraw().await,
            Err(WithdrawError::Timeout {
                operation: "withdrawal",
                ..
            })
        );
        let snapshot = withdrawer.snapshot();
        assert_matches!(snapshot.state, SessionState::Failed { .. });
        assert_eq!(snapshot.signature.as_deref(), Some("0xsigned"));
        withdrawer.reset().unwrap();
    }

    #[tokio::test]
    async fn withdraw_requires_discovery() {
        let withdrawer = withdrawer(
            MockEscrowApi::new(),
            MockWalletSigner::new(),
            MockContractWriter::new(),
            settings(),
        );
        assert_matches!(
            withdrawer.withdraw().await,
            Err(WithdrawError::InvalidTransition {
                from: SessionState::Idle,
                ..
            })
        );
    }
}
