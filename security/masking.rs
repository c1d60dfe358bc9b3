//! Identifier masking for logs and audit output.
//!
//! Account and card identifiers never appear in full outside the ledger
//! tables; only a fixed-length trailing suffix is kept.

/// Number of trailing characters left visible
pub const VISIBLE_SUFFIX: usize = 4;

const MASK_PREFIX: &str = "******";

/// Mask an account or card identifier: `1234567890` becomes `******7890`.
///
/// The prefix length is fixed so the output does not leak the identifier's
/// length. Identifiers no longer than the visible suffix are fully masked.
pub fn mask_account(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() <= VISIBLE_SUFFIX {
        return MASK_PREFIX.to_string();
    }
    let suffix: String = chars[chars.len() - VISIBLE_SUFFIX..].iter().collect();
    format!("{}{}", MASK_PREFIX, suffix)
}

/// Placeholder shown instead of a balance the caller may not see
pub fn mask_balance() -> String {
    "****".to_string()
}
