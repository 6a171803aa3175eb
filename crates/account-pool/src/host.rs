//! `CredentialProvider` implementation for the pool manager
//!
//! Bridges the host request pipeline to `PoolManager`: selection maps onto
//! `get_credential_for_request`, outcomes onto `report_success` and
//! `report_classified`.

use std::future::Future;
use std::pin::Pin;

use common::now_millis;
use provider::{
    BearerCredential, CredentialProvider, Outcome, ProviderError, ProviderHealth,
    Result as ProviderResult,
};

use crate::error::Error;
use crate::pool::PoolManager;
use crate::rate_limit::classify_failure;

impl From<Error> for ProviderError {
    fn from(e: Error) -> Self {
        match e {
            Error::EmptyPool => ProviderError::PoolExhausted(e.to_string()),
            Error::UpstreamAuth(_) => ProviderError::Auth(e.to_string()),
            other => ProviderError::Internal(other.to_string()),
        }
    }
}

impl CredentialProvider for PoolManager {
    fn id(&self) -> &str {
        "account-pool"
    }

    fn select_credential(
        &self,
        now: u64,
    ) -> Pin<Box<dyn Future<Output = ProviderResult<BearerCredential>> + Send + '_>> {
        Box::pin(async move { Ok(self.get_credential_for_request(now).await?) })
    }

    fn report_outcome<'a>(
        &'a self,
        outcome: &'a Outcome,
    ) -> Pin<Box<dyn Future<Output = ProviderResult<()>> + Send + 'a>> {
        Box::pin(async move {
            match outcome {
                Outcome::Success => self.report_success().await?,
                Outcome::Failure { status, .. } => {
                    let text = outcome.failure_text().unwrap_or_default();
                    let classification = classify_failure(*status, &text);
                    self.report_classified(classification, &text, now_millis())
                        .await?;
                }
            }
            Ok(())
        })
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = ProviderHealth> + Send + '_>> {
        Box::pin(async move {
            let pool = PoolManager::health(self, now_millis()).await;
            ProviderHealth {
                status: pool["status"].as_str().unwrap_or("unhealthy").to_string(),
                pool: Some(pool),
            }
        })
    }
}
