use crate::errors::WithdrawError;
use crate::types::{BulkWithdrawCall, BULK_WITHDRAW_FUNCTION};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[cfg(test)]
use mockall::automock;

/// Hands a prepared `bulkWithdrawItems` call to whatever broadcasts it.
/// Returns a reference to the submitted call (a transaction hash or a file).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContractWriter: Send + Sync {
    async fn write_bulk_withdraw(&self, call: BulkWithdrawCall) -> Result<String, WithdrawError>;
}

/// Writes each call as a JSON document into a directory, together with the
/// contract ABI if one is configured, for an external wallet to encode and
/// broadcast.
#[derive(Debug, Clone)]
pub struct CallFileWriter {
    output_dir: PathBuf,
    abi: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct CallFile<'a> {
    #[serde(flatten)]
    call: &'a BulkWithdrawCall,
    #[serde(skip_serializing_if = "Option::is_none")]
    abi: Option<&'a serde_json::Value>,
}

impl CallFileWriter {
    pub fn new(output_dir: PathBuf, abi_file: Option<&Path>) -> anyhow::Result<Self> {
        let abi = match abi_file {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                Some(serde_json::from_str(&contents)?)
            }
            None => None,
        };
        Ok(CallFileWriter { output_dir, abi })
    }

    fn file_name(call: &BulkWithdrawCall) -> String {
        format!(
            "{}-{}-{}.json",
            BULK_WITHDRAW_FUNCTION,
            call.signature.expiry_timestamp,
            call.signature.r.trim_start_matches("0x").chars().take(16).collect::<String>()
        )
    }
}

#[async_trait]
impl ContractWriter for CallFileWriter {
    async fn write_bulk_withdraw(&self, call: BulkWithdrawCall) -> Result<String, WithdrawError> {
        let to_error = |reason: String| WithdrawError::ContractCall {
            function: BULK_WITHDRAW_FUNCTION,
            reason,
        };
        let document = serde_json::to_vec_pretty(&CallFile {
            call: &call,
            abi: self.abi.as_ref(),
        })
        .map_err(|err| to_error(err.to_string()))?;
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|err| to_error(err.to_string()))?;
        let path = self.output_dir.join(Self::file_name(&call));
        tokio::fs::write(&path, document)
            .await
            .map_err(|err| to_error(err.to_string()))?;
        tracing::info!(
            contract = %call.contract,
            items = call.confirmation.ids.len(),
            path = %path.display(),
            "prepared {BULK_WITHDRAW_FUNCTION} call"
        );
        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Confirmation, WithdrawSignature};
    use std::io::Write;

    fn call() -> BulkWithdrawCall {
        BulkWithdrawCall {
            contract: "0xC33F8610941bE56fB0d84E25894C0d928CC97ddE".to_string(),
            function: BULK_WITHDRAW_FUNCTION.to_string(),
            confirmation: Confirmation {
                from: "0xescrow".to_string(),
                to: "0xowner".to_string(),
                ids: vec!["0x01".to_string(), "0x02".to_string()],
            },
            signature: WithdrawSignature {
                expiry_timestamp: 1_700_000_000,
                v: 28,
                r: "0x1111111111111111111111111111111111111111111111111111111111111111"
                    .to_string(),
                s: "0x2222222222222222222222222222222222222222222222222222222222222222"
                    .to_string(),
            },
        }
    }

    #[tokio::test]
    async fn writes_call_with_abi() {
        let dir = tempfile::tempdir().unwrap();
        let mut abi_file = tempfile::NamedTempFile::new().unwrap();
        abi_file
            .write_all(br#"[{"type": "function", "name": "bulkWithdrawItems"}]"#)
            .unwrap();

        let writer =
            CallFileWriter::new(dir.path().join("calls"), Some(abi_file.path())).unwrap();
        let reference = writer.write_bulk_withdraw(call()).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&reference).unwrap()).unwrap();
        assert_eq!(written["function"], "bulkWithdrawItems");
        assert_eq!(written["confirmation"]["ids"], serde_json::json!(["0x01", "0x02"]));
        assert_eq!(written["signature"]["expiryTimestamp"], 1_700_000_000u64);
        assert_eq!(written["abi"][0]["name"], "bulkWithdrawItems");
        assert!(reference.ends_with("bulkWithdrawItems-1700000000-1111111111111111.json"));
    }

    #[tokio::test]
    async fn abi_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CallFileWriter::new(dir.path().to_path_buf(), None).unwrap();
        let reference = writer.write_bulk_withdraw(call()).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&reference).unwrap()).unwrap();
        assert!(written.get("abi").is_none());
    }
}
