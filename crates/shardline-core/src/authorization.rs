//! Authorization policy
//!
//! The execution core only asks two questions of the policy: does a
//! permission exist, and do a set of provided permissions (plus a delay)
//! satisfy the authorizations an action list declares. Signature recovery
//! happens outside the core, so key weights never count here.

use std::collections::BTreeSet;

use tracing::trace;

use crate::action::{Action, PermissionLevel};
use crate::error::{Error, Result};
use crate::objects::PermissionObject;
use crate::store::Database;
use crate::types::Microseconds;

/// Inputs to one authorization check
pub struct AuthorizationCheck<'a> {
    pub actions: &'a [Action],
    /// Permissions granted outright, such as `receiver@system.code`
    pub provided_permissions: &'a BTreeSet<PermissionLevel>,
    pub provided_delay: Microseconds,
    /// Report nothing on failure
    pub check_but_dont_fail: bool,
    /// Declared authorizations already satisfied by the caller
    pub satisfied_authorizations: &'a BTreeSet<PermissionLevel>,
}

pub trait AuthorizationManager {
    fn find_permission(&self, db: &Database, level: &PermissionLevel) -> bool;

    fn check_authorization(
        &self,
        db: &Database,
        check: &AuthorizationCheck<'_>,
        checktime: &dyn Fn() -> Result<()>,
    ) -> Result<()>;
}

/// Policy over the permission rows of the shared tier
#[derive(Debug, Clone)]
pub struct StoreAuthorizationManager {
    max_authority_depth: u16,
}

impl StoreAuthorizationManager {
    pub fn new(max_authority_depth: u16) -> Self {
        Self {
            max_authority_depth,
        }
    }

    fn satisfies(
        &self,
        db: &Database,
        level: &PermissionLevel,
        provided: &BTreeSet<PermissionLevel>,
        delay: Microseconds,
        depth: u16,
        checktime: &dyn Fn() -> Result<()>,
    ) -> Result<bool> {
        checktime()?;
        if provided.contains(level) {
            return Ok(true);
        }
        if depth >= self.max_authority_depth {
            return Ok(false);
        }
        let Some(permission) = db.find::<PermissionObject>(&(level.actor, level.permission)) else {
            return Ok(false);
        };

        let threshold = permission.auth.threshold as u64;
        let mut weight: u64 = 0;
        for delegated in &permission.auth.accounts {
            if self.satisfies(db, &delegated.permission, provided, delay, depth + 1, checktime)? {
                weight += delegated.weight as u64;
                if weight >= threshold {
                    return Ok(true);
                }
            }
        }
        for wait in &permission.auth.waits {
            if delay >= Microseconds::seconds(wait.wait_sec as i64) {
                weight += wait.weight as u64;
            }
        }
        Ok(weight >= threshold)
    }
}

impl Default for StoreAuthorizationManager {
    fn default() -> Self {
        Self::new(crate::config::ChainConfig::DEFAULT.max_authority_depth)
    }
}

impl AuthorizationManager for StoreAuthorizationManager {
    fn find_permission(&self, db: &Database, level: &PermissionLevel) -> bool {
        db.find::<PermissionObject>(&(level.actor, level.permission))
            .is_some()
    }

    fn check_authorization(
        &self,
        db: &Database,
        check: &AuthorizationCheck<'_>,
        checktime: &dyn Fn() -> Result<()>,
    ) -> Result<()> {
        for act in check.actions {
            for level in &act.authorization {
                if check.satisfied_authorizations.contains(level) {
                    continue;
                }
                let ok = self.satisfies(
                    db,
                    level,
                    check.provided_permissions,
                    check.provided_delay,
                    0,
                    checktime,
                )?;
                trace!(authority = %level, satisfied = ok, "authorization checked");
                if !ok && !check.check_but_dont_fail {
                    let provided: Vec<String> = check
                        .provided_permissions
                        .iter()
                        .map(|p| p.to_string())
                        .collect();
                    return Err(Error::UnsatisfiedAuthorization(format!(
                        "action {}::{} declares authority '{}', which is not satisfied by provided permissions [{}] under a provided delay of {} ms",
                        act.account,
                        act.name,
                        level,
                        provided.join(", "),
                        check.provided_delay.count() / 1000
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{Authority, PermissionLevelWeight, WaitWeight};
    use crate::config::{ACTIVE_PERMISSION, CODE_PERMISSION};
    use crate::name::Name;

    fn n(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn level(actor: &str, permission: Name) -> PermissionLevel {
        PermissionLevel::new(n(actor), permission)
    }

    fn add_permission(db: &mut Database, owner: &str, auth: Authority) {
        db.create::<PermissionObject>(|p| {
            p.owner = n(owner);
            p.name = ACTIVE_PERMISSION;
            p.auth = auth;
        })
        .unwrap();
    }

    fn action(auth: PermissionLevel) -> Action {
        Action::new(n("token"), n("transfer"), vec![auth], vec![])
    }

    fn no_deadline() -> Result<()> {
        Ok(())
    }

    fn check(
        db: &Database,
        actions: &[Action],
        provided: &BTreeSet<PermissionLevel>,
        delay: Microseconds,
        satisfied: &BTreeSet<PermissionLevel>,
    ) -> Result<()> {
        StoreAuthorizationManager::default().check_authorization(
            db,
            &AuthorizationCheck {
                actions,
                provided_permissions: provided,
                provided_delay: delay,
                check_but_dont_fail: false,
                satisfied_authorizations: satisfied,
            },
            &no_deadline,
        )
    }

    #[test]
    fn test_code_permission_delegation() {
        let mut db = Database::new();
        add_permission(
            &mut db,
            "alice",
            Authority::from_permission(level("token", CODE_PERMISSION)),
        );
        let actions = [action(level("alice", ACTIVE_PERMISSION))];
        let provided: BTreeSet<_> = [level("token", CODE_PERMISSION)].into();
        assert!(check(&db, &actions, &provided, Microseconds(0), &BTreeSet::new()).is_ok());

        let other: BTreeSet<_> = [level("evil", CODE_PERMISSION)].into();
        let err = check(&db, &actions, &other, Microseconds(0), &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, Error::UnsatisfiedAuthorization(_)));
    }

    #[test]
    fn test_satisfied_set_skips_check() {
        let db = Database::new();
        let actions = [action(level("alice", ACTIVE_PERMISSION))];
        let satisfied: BTreeSet<_> = [level("alice", ACTIVE_PERMISSION)].into();
        assert!(check(&db, &actions, &BTreeSet::new(), Microseconds(0), &satisfied).is_ok());
    }

    #[test]
    fn test_wait_weight_needs_delay() {
        let mut db = Database::new();
        let mut auth = Authority::from_key("PUB_K1_alice");
        auth.threshold = 1;
        auth.keys.clear();
        auth.waits.push(WaitWeight {
            wait_sec: 60,
            weight: 1,
        });
        add_permission(&mut db, "alice", auth);
        let actions = [action(level("alice", ACTIVE_PERMISSION))];
        assert!(check(&db, &actions, &BTreeSet::new(), Microseconds::seconds(59), &BTreeSet::new()).is_err());
        assert!(check(&db, &actions, &BTreeSet::new(), Microseconds::seconds(60), &BTreeSet::new()).is_ok());
    }

    #[test]
    fn test_recursion_bounded() {
        let mut db = Database::new();
        // a -> b -> a cycle never satisfies
        add_permission(&mut db, "a", Authority::from_permission(level("b", ACTIVE_PERMISSION)));
        add_permission(&mut db, "b", Authority::from_permission(level("a", ACTIVE_PERMISSION)));
        let actions = [action(level("a", ACTIVE_PERMISSION))];
        assert!(check(&db, &actions, &BTreeSet::new(), Microseconds(0), &BTreeSet::new()).is_err());
    }

    #[test]
    fn test_weighted_threshold() {
        let mut db = Database::new();
        let auth = Authority {
            threshold: 2,
            keys: vec![],
            accounts: vec![
                PermissionLevelWeight {
                    permission: level("bob", CODE_PERMISSION),
                    weight: 1,
                },
                PermissionLevelWeight {
                    permission: level("carol", CODE_PERMISSION),
                    weight: 1,
                },
            ],
            waits: vec![],
        };
        add_permission(&mut db, "alice", auth);
        let actions = [action(level("alice", ACTIVE_PERMISSION))];
        let one: BTreeSet<_> = [level("bob", CODE_PERMISSION)].into();
        let both: BTreeSet<_> = [level("bob", CODE_PERMISSION), level("carol", CODE_PERMISSION)].into();
        assert!(check(&db, &actions, &one, Microseconds(0), &BTreeSet::new()).is_err());
        assert!(check(&db, &actions, &both, Microseconds(0), &BTreeSet::new()).is_ok());
    }

    #[test]
    fn test_deadline_propagates() {
        let db = Database::new();
        let actions = [action(level("alice", ACTIVE_PERMISSION))];
        let err = StoreAuthorizationManager::default()
            .check_authorization(
                &db,
                &AuthorizationCheck {
                    actions: &actions,
                    provided_permissions: &BTreeSet::new(),
                    provided_delay: Microseconds(0),
                    check_but_dont_fail: true,
                    satisfied_authorizations: &BTreeSet::new(),
                },
                &|| Err(Error::DeadlineExceeded),
            )
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
    }

    #[test]
    fn test_find_permission() {
        let mut db = Database::new();
        add_permission(&mut db, "alice", Authority::from_key("k"));
        let mgr = StoreAuthorizationManager::default();
        assert!(mgr.find_permission(&db, &level("alice", ACTIVE_PERMISSION)));
        assert!(!mgr.find_permission(&db, &level("alice", n("owner"))));
    }
}
