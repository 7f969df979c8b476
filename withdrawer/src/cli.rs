use crate::{
    api::HttpEscrowApi,
    config::{load_config_file, ConfigFile},
    contract::CallFileWriter,
    errors::WithdrawError,
    message::{build_withdrawal_message, Clock},
    orchestrator::{Withdrawer, WithdrawerSettings},
    types::ItemId,
    wallet::{ConfirmingSigner, LocalKeySigner, WalletSigner, WatchOnlyWallet},
    web::start_web_server,
};
use anyhow::Context;
use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
pub enum Cli {
    /// Lists the items an account still has in escrow.
    Discover(DiscoverCmd),
    /// Discovers, signs and submits a withdrawal of every escrowed item.
    Withdraw(WithdrawCmd),
    /// Prints the withdrawal message for the given transaction hashes.
    Message {
        #[arg(required = true)]
        item_ids: Vec<String>,
    },
    /// Writes a config file with every default filled in.
    InitConfig {
        #[arg(long)]
        output: PathBuf,
        /// Replace the file if it exists.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Parser, Debug)]
pub struct DiscoverCmd {
    #[arg(long, env("WITHDRAWER_CONFIG"))]
    pub config: PathBuf,
    /// Account to inspect. Defaults to the address of the private key.
    #[arg(long)]
    pub owner: Option<String>,
    /// Hex-encoded secp256k1 private key of the account.
    #[arg(long, env("WITHDRAWER_PRIVATE_KEY"), hide_env_values = true)]
    pub private_key: Option<String>,
}

#[derive(Parser, Debug)]
pub struct WithdrawCmd {
    #[arg(long, env("WITHDRAWER_CONFIG"))]
    pub config: PathBuf,
    /// Hex-encoded secp256k1 private key of the account.
    #[arg(long, env("WITHDRAWER_PRIVATE_KEY"), hide_env_values = true)]
    pub private_key: String,
    /// Sign without asking for confirmation.
    #[arg(long)]
    pub yes: bool,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self {
            Cli::Discover(cmd) => cmd.run().await,
            Cli::Withdraw(cmd) => cmd.run().await,
            Cli::Message { item_ids } => {
                let item_ids = item_ids.into_iter().map(ItemId::from).collect::<Vec<_>>();
                println!("{}", build_withdrawal_message(&item_ids, Clock::real().now()));
                Ok(())
            }
            Cli::InitConfig { output, force } => write_default_config(&output, force),
        }
    }
}

impl DiscoverCmd {
    async fn run(self) -> anyhow::Result<()> {
        let config = load_config_file(&self.config)?;
        let wallet: Arc<dyn WalletSigner> = match (self.private_key, self.owner) {
            (_, Some(owner)) => Arc::new(WatchOnlyWallet::new(owner)),
            (Some(private_key), None) => Arc::new(
                LocalKeySigner::from_hex(&private_key).context("Parse WITHDRAWER_PRIVATE_KEY")?,
            ),
            (None, None) => anyhow::bail!("Either --owner or WITHDRAWER_PRIVATE_KEY is required"),
        };
        let withdrawer = build_withdrawer(&config, wallet)?;
        spawn_status_server(&config, &withdrawer).await?;

        let owner = withdrawer.account();
        let discovery = withdrawer
            .discover(&owner)
            .await
            .with_context(|| format!("Discover escrowed items of {owner}"))?;
        println!("{} item(s) remaining in escrow", discovery.remaining);
        for item_id in &discovery.candidates {
            println!("{item_id}");
        }
        Ok(())
    }
}

impl WithdrawCmd {
    async fn run(self) -> anyhow::Result<()> {
        let config = load_config_file(&self.config)?;
        let signer =
            LocalKeySigner::from_hex(&self.private_key).context("Parse WITHDRAWER_PRIVATE_KEY")?;
        let skip_approval = self.yes;
        let wallet = ConfirmingSigner::new(signer, move |message| {
            skip_approval || prompt_approval(message)
        });
        let withdrawer = build_withdrawer(&config, Arc::new(wallet))?;
        spawn_status_server(&config, &withdrawer).await?;

        let owner = withdrawer.account();
        let discovery = withdrawer
            .discover(&owner)
            .await
            .with_context(|| format!("Discover escrowed items of {owner}"))?;
        println!("{} item(s) remaining in escrow", discovery.remaining);

        match withdrawer.withdraw().await {
            Ok(receipt) => {
                println!(
                    "Withdrawal of {} item(s) prepared: {}",
                    receipt.item_ids.len(),
                    receipt.call_reference
                );
                Ok(())
            }
            Err(WithdrawError::NothingToWithdraw) => {
                println!("Nothing to withdraw");
                Ok(())
            }
            Err(err) => Err(err).context("Withdraw escrowed items"),
        }
    }
}

fn build_withdrawer(
    config: &ConfigFile,
    wallet: Arc<dyn WalletSigner>,
) -> anyhow::Result<Withdrawer> {
    let api = HttpEscrowApi::new(&config.endpoints).context("Build HTTP client")?;
    let contract = CallFileWriter::new(
        config.withdrawal.output_dir.clone(),
        config.escrow_contract.abi_file.as_deref(),
    )
    .context("Load escrow contract ABI")?;
    Ok(Withdrawer::new(
        Arc::new(api),
        wallet,
        Arc::new(contract),
        Clock::real(),
        WithdrawerSettings::from(config),
    ))
}

async fn spawn_status_server(config: &ConfigFile, withdrawer: &Withdrawer) -> anyhow::Result<()> {
    let Some(web_ui) = config.web_ui.clone() else {
        return Ok(());
    };
    let server = start_web_server(web_ui, withdrawer.subscribe())
        .await
        .context("Start status server")?;
    tokio::spawn(async move {
        if let Err(err) = server.await {
            tracing::error!(%err, "status server stopped");
        }
    });
    Ok(())
}

fn prompt_approval(message: &str) -> bool {
    eprintln!("\n{message}\n");
    eprint!("Sign this message? [y/N] ");
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

fn write_default_config(output: &Path, force: bool) -> anyhow::Result<()> {
    anyhow::ensure!(
        force || !output.exists(),
        "{} already exists, pass --force to replace it",
        output.display()
    );
    let yaml = serde_yaml::to_string(&ConfigFile::default())?;
    std::fs::write(output, yaml).with_context(|| format!("Write {}", output.display()))?;
    println!("Wrote default config to {}", output.display());
    Ok(())
}
