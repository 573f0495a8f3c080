//! Ownership scoping overlay.
//!
//! # Responsibility
//! - Turn the authenticated caller (or its absence) into the owner filter
//!   applied to every read.
//! - Rewrite the owner claimed by incoming changes to the authenticated
//!   identity.
//!
//! # Invariants
//! - With an authenticated caller, reads are always restricted to that
//!   caller; a request for another owner's data is narrowed, never widened.
//! - With an authenticated caller, incoming ownership is always the caller,
//!   whatever the payload claims.
//! - Without a caller (single-owner mode) nothing is filtered or rewritten.

use crate::model::identity::{IdentityError, UserId};
use log::warn;
use rusqlite::types::Value;

/// Owner filter for reads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OwnerScope {
    /// Single-owner mode: every row is visible.
    #[default]
    All,
    /// Multi-tenant mode: only rows owned by this user are visible.
    Owner(UserId),
}

impl OwnerScope {
    /// Resolves the effective scope of a read.
    ///
    /// `requested` is honored only when there is no authenticated caller.
    pub fn resolve(caller: Option<&UserId>, requested: Option<&UserId>) -> Self {
        match (caller, requested) {
            (Some(caller), Some(requested)) if caller != requested => {
                warn!(
                    "event=owner_scope module=sync status=narrowed reason=foreign_owner_requested"
                );
                Self::Owner(caller.clone())
            }
            (Some(caller), _) => Self::Owner(caller.clone()),
            (None, Some(requested)) => Self::Owner(requested.clone()),
            (None, None) => Self::All,
        }
    }

    /// Scope of the authenticated caller itself.
    pub fn for_caller(caller: Option<&UserId>) -> Self {
        Self::resolve(caller, None)
    }

    pub fn owner(&self) -> Option<&UserId> {
        match self {
            Self::All => None,
            Self::Owner(owner) => Some(owner),
        }
    }

    /// Whether a row owned by `owner` is visible in this scope.
    pub fn permits(&self, owner: Option<&UserId>) -> bool {
        match self {
            Self::All => true,
            Self::Owner(expected) => owner == Some(expected),
        }
    }

    /// Appends ` AND <column> = ?` when scoped.
    pub(crate) fn push_sql_filter(&self, column: &str, sql: &mut String, binds: &mut Vec<Value>) {
        if let Self::Owner(owner) = self {
            sql.push_str(&format!(" AND {column} = ?"));
            binds.push(Value::Text(owner.as_str().to_string()));
        }
    }
}

/// Owner an incoming change is stored under.
///
/// The authenticated caller wins over the claimed owner, which is then
/// discarded unparsed. Only single-owner deployments (no caller) keep the
/// claimed value, and only if it is a valid user id.
pub fn rewrite_owner(
    claimed: Option<&str>,
    caller: Option<&UserId>,
) -> Result<Option<UserId>, IdentityError> {
    match caller {
        Some(caller) => {
            if claimed.is_some_and(|claimed| claimed.trim() != caller.as_str()) {
                warn!("event=owner_rewrite module=sync status=rewritten reason=claimed_owner_mismatch");
            }
            Ok(Some(caller.clone()))
        }
        None => claimed.map(UserId::parse).transpose(),
    }
}

#[cfg(test)]
mod tests {
    use super::{rewrite_owner, OwnerScope};
    use crate::model::identity::{IdentityError, UserId};

    fn user(value: &str) -> UserId {
        UserId::parse(value).expect("valid user id")
    }

    #[test]
    fn caller_scope_cannot_be_widened() {
        let alice = user("alice");
        let bob = user("bob");

        assert_eq!(
            OwnerScope::resolve(Some(&alice), Some(&bob)),
            OwnerScope::Owner(alice.clone())
        );
        assert_eq!(
            OwnerScope::resolve(Some(&alice), None),
            OwnerScope::Owner(alice.clone())
        );
        assert_eq!(OwnerScope::resolve(None, Some(&bob)), OwnerScope::Owner(bob));
        assert_eq!(OwnerScope::resolve(None, None), OwnerScope::All);
    }

    #[test]
    fn permits_matches_owner_only_when_scoped() {
        let alice = user("alice");
        let scope = OwnerScope::Owner(alice.clone());
        assert!(scope.permits(Some(&alice)));
        assert!(!scope.permits(Some(&user("bob"))));
        assert!(!scope.permits(None));
        assert!(OwnerScope::All.permits(None));
    }

    #[test]
    fn rewrite_prefers_authenticated_caller() {
        let alice = user("alice");
        let bob = user("bob");
        assert_eq!(rewrite_owner(Some("bob"), Some(&alice)), Ok(Some(alice.clone())));
        assert_eq!(rewrite_owner(None, Some(&alice)), Ok(Some(alice.clone())));
        assert_eq!(rewrite_owner(Some(" bob "), None), Ok(Some(bob)));
        assert_eq!(rewrite_owner(None, None), Ok(None));
    }

    #[test]
    fn unparseable_claim_only_matters_without_a_caller() {
        let alice = user("alice");
        let too_long = "x".repeat(300);
        assert_eq!(
            rewrite_owner(Some(too_long.as_str()), Some(&alice)),
            Ok(Some(alice.clone()))
        );
        assert_eq!(rewrite_owner(Some(""), Some(&alice)), Ok(Some(alice)));
        assert_eq!(rewrite_owner(Some(""), None), Err(IdentityError::EmptyUserId));
        assert_eq!(
            rewrite_owner(Some(too_long.as_str()), None),
            Err(IdentityError::UserIdTooLong(300))
        );
    }
}
