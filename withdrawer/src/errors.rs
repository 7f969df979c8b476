use crate::session::SessionState;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WithdrawError {
    #[error("request to {endpoint} failed")]
    Transport {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("malformed response from {endpoint}: {reason}")]
    MalformedResponse {
        endpoint: &'static str,
        reason: String,
    },
    #[error("item identifier {0:?} is not of the form `network:transactionHash`")]
    MalformedItemId(String),
    #[error("listing endpoint kept returning continuation tokens after {max_pages} pages")]
    PaginationLimitExceeded { max_pages: usize },
    #[error("the wallet declined to sign the withdrawal message")]
    WalletRejected,
    #[error("wallet failure: {0}")]
    Wallet(String),
    #[error("contract call {function} failed: {reason}")]
    ContractCall {
        function: &'static str,
        reason: String,
    },
    #[error("{operation} did not complete within {limit:?}")]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },
    #[error("cannot {operation} while the session is {from}")]
    InvalidTransition {
        operation: &'static str,
        from: SessionState,
    },
    #[error("no escrowed items left to withdraw")]
    NothingToWithdraw,
}

impl WithdrawError {
    pub(crate) fn transport(endpoint: &'static str) -> impl FnOnce(reqwest::Error) -> Self {
        move |source| WithdrawError::Transport { endpoint, source }
    }
}
