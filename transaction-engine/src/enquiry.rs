//! Name and balance enquiries

use crate::error::{Result, TransactionError};
use crate::types::{BalanceEnquiry, NameEnquiry};
use chrono::Utc;
use ledger_core::{Account, LedgerStore};
use regex::Regex;
use security::masking::mask_balance;
use security::{mask_account, AuditEventType, AuditLog};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Read-only account lookups keyed by account identifier
#[derive(Clone)]
pub struct AccountEnquiry {
    store: Arc<dyn LedgerStore>,
    audit: AuditLog,
    account_id: Regex,
}

impl std::fmt::Debug for AccountEnquiry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountEnquiry").finish_non_exhaustive()
    }
}

impl AccountEnquiry {
    pub fn new(store: Arc<dyn LedgerStore>, audit: AuditLog) -> Result<Self> {
        Ok(Self {
            store,
            audit,
            account_id: Regex::new(r"^[0-9A-Za-z_-]{4,34}$")?,
        })
    }

    async fn active_account(&self, account_id: &str) -> Result<Account> {
        let account_id = account_id.trim();
        if !self.account_id.is_match(account_id) {
            return Err(TransactionError::Validation("invalid account id format".to_string()));
        }
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| TransactionError::AccountNotFound(mask_account(account_id)))?;
        if !account.is_active() {
            return Err(TransactionError::AccountNotActive(mask_account(account_id)));
        }
        Ok(account)
    }

    /// Holder name of an active account
    pub async fn name_enquiry(&self, account_id: &str) -> Result<NameEnquiry> {
        let account = self.active_account(account_id).await?;
        debug!(account = %mask_account(&account.id), "Name enquiry");
        Ok(NameEnquiry {
            account_id: account.id,
            account_name: account.name,
        })
    }

    /// Balance of an active account; only its owner sees the figure
    pub async fn balance_enquiry(&self, caller: &str, account_id: &str) -> Result<BalanceEnquiry> {
        let account = self.active_account(account_id).await?;
        let owner = account.owner_id == caller;

        self.audit.security(
            AuditEventType::Enquiry,
            None,
            Some(&account.id),
            json!({ "kind": "balance", "authorized": owner }),
        );

        let (available_balance, display_balance) = if owner {
            (Some(account.balance), account.balance.to_string())
        } else {
            (None, mask_balance())
        };
        Ok(BalanceEnquiry {
            account_id: account.id,
            available_balance,
            display_balance,
            currency: account.currency,
            as_of: Utc::now(),
        })
    }
}
