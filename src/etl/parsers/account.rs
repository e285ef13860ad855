/// Account Creation Parser
///
/// Detects operations that introduce a new account name into the chain
/// (`account_create`, `account_create_with_delegation`, `create_claimed_account`).
use crate::models::BlockOperation;

/// Operation kinds known to create accounts
pub const ACCOUNT_CREATION_OPS: &[&str] = &["account_create", "account_create_with_delegation", "create_claimed_account"];

/// A new account found in an operation payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCreation {
    pub new_account_name: String,
    pub creator: Option<String>,
}

/// Parse an operation for an account creation
///
/// Any operation carrying a non-empty string `new_account_name` counts, so future creation
/// variants are picked up without a code change. Returns None for everything else.
pub fn parse_account_creation(op: &BlockOperation) -> Option<AccountCreation> {
    let name = op.payload.get("new_account_name").and_then(|v| v.as_str())?.trim();
    if name.is_empty() {
        if ACCOUNT_CREATION_OPS.contains(&op.kind.as_str()) {
            tracing::warn!(kind = %op.kind, "Account creation operation with empty new_account_name");
        }
        return None;
    }

    let creator = op.payload.get("creator").and_then(|v| v.as_str()).map(|s| s.to_string());

    Some(AccountCreation { new_account_name: name.to_string(), creator })
}
