//! Wiring from configuration to a ready [`IntentProcessor`].

use std::path::Path;
use std::sync::Arc;

use keyward_core::{
    AllowanceStore, AuthorizationPipeline, BundlerClient, DigestSigner, IntentProcessor,
    KeywardConfig, KeywardError, KeywardResult, LocalSessionModule, LocalSigner, SessionBuilder,
    StaticDenylist,
};
use tracing::debug;

pub(crate) const OWNER_KEY_ENV: &str = "KEYWARD_OWNER_KEY";
pub(crate) const SESSION_KEY_ENV: &str = "KEYWARD_SESSION_KEY";

/// YAML file when given, environment otherwise.
pub(crate) fn load_config(path: Option<&Path>) -> KeywardResult<KeywardConfig> {
    match path {
        Some(path) => {
            debug!(path = %path.display(), "loading config file");
            KeywardConfig::from_yaml_file(path)
        }
        None => KeywardConfig::from_env(),
    }
}

fn signer_from_env(var: &str) -> KeywardResult<Arc<LocalSigner>> {
    let secret = std::env::var(var).map_err(|_| KeywardError::Config {
        message: format!("{var} is not set"),
    })?;
    let signer = LocalSigner::from_hex(secret.trim()).map_err(|e| KeywardError::Config {
        message: format!("{var}: {e}"),
    })?;
    Ok(Arc::new(signer))
}

pub(crate) async fn build_processor(config: &KeywardConfig) -> KeywardResult<IntentProcessor> {
    let owner = signer_from_env(OWNER_KEY_ENV)?;
    let session_key = signer_from_env(SESSION_KEY_ENV)?;
    debug!(owner = %owner.address(), session_signer = %session_key.address(), "keys loaded");

    let store = AllowanceStore::open(config.allowances_path()?).await;
    let pipeline = AuthorizationPipeline::new(
        config.smart_account(owner.address())?,
        config.session_validator,
        store,
        Arc::new(BundlerClient::from_config(config)?),
        Arc::new(StaticDenylist::new(config.denylist.iter().copied())),
    )
    .with_receipt_timeout(config.receipt_timeout())
    .with_poll_interval(config.receipt_poll_interval());

    Ok(IntentProcessor::new(
        SessionBuilder::new(
            config.chain_id,
            config.allow_paymaster,
            config.token_directory(),
        ),
        Arc::new(LocalSessionModule),
        owner,
        session_key,
        pipeline,
    ))
}

/// Print a setup error and map it to its exit code.
pub(crate) fn fail(err: &KeywardError) -> i32 {
    eprintln!("error: {err}");
    err.exit_code()
}
