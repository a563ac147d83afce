use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crm_access_core::model::{
    EffectiveFieldList, EffectiveFls, EffectiveOls, EffectivePermissions, FieldId,
    FieldPermission, ObjectFields, ObjectId, ObjectPermission, PermissionSet, PermissionSetId,
    PermissionSetType, UserId,
};
use crm_access_core::permission::{FieldAccess, effective, has_fls};
use crm_access_storage::{DirectorySource, EffectiveCacheWriter, PermissionSource};

use crate::error::RecomputeError;

/// Tally of a multi-user recompute that keeps going past individual failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

/// Per-id grant and deny masks collected before the algebra is applied.
#[derive(Debug, Default)]
struct Masks {
    grants: Vec<u8>,
    denies: Vec<u8>,
}

impl Masks {
    fn push(&mut self, ps_type: PermissionSetType, mask: u8) {
        match ps_type {
            PermissionSetType::Grant => self.grants.push(mask),
            PermissionSetType::Deny => self.denies.push(mask),
        }
    }

    fn resolve(&self) -> u8 {
        effective(self.grants.iter().copied(), self.denies.iter().copied())
    }
}

/// Builds one user's OLS, FLS and field-name lists from already loaded rows.
/// Permission rows whose set is not in `sets` are ignored. Zero masks produce
/// no rows.
pub fn compute_effective(
    user_id: UserId,
    sets: &[PermissionSet],
    object_permissions: &[ObjectPermission],
    field_permissions: &[FieldPermission],
    objects: &[ObjectFields],
) -> EffectivePermissions {
    let types: HashMap<PermissionSetId, PermissionSetType> =
        sets.iter().map(|ps| (ps.id, ps.ps_type)).collect();

    let mut by_object: BTreeMap<ObjectId, Masks> = BTreeMap::new();
    for op in object_permissions {
        if let Some(ps_type) = types.get(&op.permission_set_id) {
            by_object
                .entry(op.object_id)
                .or_default()
                .push(*ps_type, op.permissions);
        }
    }

    let mut by_field: BTreeMap<FieldId, Masks> = BTreeMap::new();
    for fp in field_permissions {
        if let Some(ps_type) = types.get(&fp.permission_set_id) {
            by_field
                .entry(fp.field_id)
                .or_default()
                .push(*ps_type, fp.permissions);
        }
    }

    let ols: Vec<EffectiveOls> = by_object
        .iter()
        .map(|(object_id, masks)| (*object_id, masks.resolve()))
        .filter(|(_, permissions)| *permissions != 0)
        .map(|(object_id, permissions)| EffectiveOls {
            user_id,
            object_id,
            permissions,
        })
        .collect();

    let fls_masks: BTreeMap<FieldId, u8> = by_field
        .iter()
        .map(|(field_id, masks)| (*field_id, masks.resolve()))
        .filter(|(_, permissions)| *permissions != 0)
        .collect();

    let fls = fls_masks
        .iter()
        .map(|(field_id, permissions)| EffectiveFls {
            user_id,
            field_id: *field_id,
            permissions: *permissions,
        })
        .collect();

    let mut field_lists = Vec::new();
    for object in objects {
        for access in [FieldAccess::Read, FieldAccess::Write] {
            let mut names: Vec<String> = object
                .fields
                .iter()
                .filter(|f| has_fls(fls_masks.get(&f.id).copied().unwrap_or(0), access))
                .map(|f| f.name.clone())
                .collect();
            if names.is_empty() {
                continue;
            }
            names.sort();
            field_lists.push(EffectiveFieldList {
                user_id,
                object_id: object.object_id,
                mask: access,
                field_names: names,
            });
        }
    }

    EffectivePermissions {
        ols,
        fls,
        field_lists,
    }
}

pub struct EffectivePermissionComputer<S> {
    store: Arc<S>,
}

impl<S> EffectivePermissionComputer<S>
where
    S: DirectorySource + PermissionSource + EffectiveCacheWriter,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn recompute_for_user(&self, user_id: &UserId) -> Result<(), RecomputeError> {
        let Some(user) = self.store.get_user(user_id).await? else {
            tracing::info!(
                user_id = %user_id,
                "user no longer exists, skipping permission recompute"
            );
            return Ok(());
        };

        let profile = self
            .store
            .get_profile(&user.profile_id)
            .await?
            .ok_or(RecomputeError::MissingProfile {
                user_id: user.id,
                profile_id: user.profile_id,
            })?;

        let mut set_ids: BTreeSet<PermissionSetId> = BTreeSet::new();
        set_ids.insert(profile.base_permission_set_id);
        set_ids.extend(self.store.list_assigned_permission_sets(user_id).await?);
        let set_ids: Vec<PermissionSetId> = set_ids.into_iter().collect();

        // Sets deleted since assignment simply drop out here.
        let sets = self.store.get_permission_sets(&set_ids).await?;
        let known: Vec<PermissionSetId> = sets.iter().map(|ps| ps.id).collect();

        let object_permissions = self.store.list_object_permissions(&known).await?;
        let field_permissions = self.store.list_field_permissions(&known).await?;
        let objects = self.store.list_objects_with_fields().await?;

        let computed = compute_effective(
            user.id,
            &sets,
            &object_permissions,
            &field_permissions,
            &objects,
        );

        self.store
            .replace_user_permissions(user_id, &computed)
            .await?;

        tracing::debug!(
            user_id = %user_id,
            permission_sets = sets.len(),
            ols_rows = computed.ols.len(),
            fls_rows = computed.fls.len(),
            field_list_rows = computed.field_lists.len(),
            "effective permissions replaced"
        );
        Ok(())
    }

    /// Recomputes every user holding the set directly or through their profile.
    /// A failing user is logged and counted; the rest still run.
    pub async fn recompute_for_permission_set(
        &self,
        permission_set_id: &PermissionSetId,
    ) -> Result<BatchOutcome, RecomputeError> {
        let mut users: BTreeSet<UserId> = BTreeSet::new();
        users.extend(
            self.store
                .list_users_assigned_permission_set(permission_set_id)
                .await?,
        );
        users.extend(
            self.store
                .list_users_with_base_permission_set(permission_set_id)
                .await?,
        );

        let outcome = self.recompute_users(users).await;
        tracing::info!(
            permission_set_id = %permission_set_id,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "permission set recompute finished"
        );
        Ok(outcome)
    }

    pub async fn recompute_all(&self) -> Result<BatchOutcome, RecomputeError> {
        let users = self.store.list_users().await?;
        let outcome = self.recompute_users(users.into_iter().map(|u| u.id)).await;
        tracing::info!(
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "full permission recompute finished"
        );
        Ok(outcome)
    }

    async fn recompute_users(&self, users: impl IntoIterator<Item = UserId>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for user_id in users {
            match self.recompute_for_user(&user_id).await {
                Ok(()) => outcome.succeeded += 1,
                Err(e) => {
                    tracing::error!(user_id = %user_id, error = %e, "permission recompute failed");
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_access_core::model::{FieldDef, Profile, ProfileId, User};
    use crm_access_core::permission::{fls, ols};
    use crm_access_storage::{EffectiveCacheReader, InMemoryStore, StorageError};
    use uuid::Uuid;

    fn grant(id: PermissionSetId) -> PermissionSet {
        PermissionSet {
            id,
            ps_type: PermissionSetType::Grant,
        }
    }

    fn deny(id: PermissionSetId) -> PermissionSet {
        PermissionSet {
            id,
            ps_type: PermissionSetType::Deny,
        }
    }

    fn new_ps() -> PermissionSetId {
        PermissionSetId::new(Uuid::new_v4())
    }

    fn object_perm(ps: PermissionSetId, object_id: ObjectId, permissions: u8) -> ObjectPermission {
        ObjectPermission {
            permission_set_id: ps,
            object_id,
            permissions,
        }
    }

    fn field_perm(ps: PermissionSetId, field_id: FieldId, permissions: u8) -> FieldPermission {
        FieldPermission {
            permission_set_id: ps,
            field_id,
            permissions,
        }
    }

    fn field(name: &str) -> FieldDef {
        FieldDef {
            id: FieldId::new(Uuid::new_v4()),
            name: name.to_string(),
        }
    }

    #[test]
    fn deny_set_subtracts_from_grants() {
        let user_id = UserId::new(Uuid::new_v4());
        let object_id = ObjectId::new(Uuid::new_v4());
        let (g, d) = (new_ps(), new_ps());

        let result = compute_effective(
            user_id,
            &[grant(g), deny(d)],
            &[
                object_perm(g, object_id, ols::READ | ols::CREATE),
                object_perm(d, object_id, ols::CREATE),
            ],
            &[],
            &[],
        );

        assert_eq!(result.ols.len(), 1);
        assert_eq!(result.ols[0].permissions, ols::READ);
    }

    #[test]
    fn grants_from_several_sets_are_combined() {
        let user_id = UserId::new(Uuid::new_v4());
        let object_id = ObjectId::new(Uuid::new_v4());
        let (a, b) = (new_ps(), new_ps());

        let result = compute_effective(
            user_id,
            &[grant(a), grant(b)],
            &[
                object_perm(a, object_id, ols::READ),
                object_perm(b, object_id, ols::UPDATE | ols::DELETE),
            ],
            &[],
            &[],
        );

        assert_eq!(
            result.ols[0].permissions,
            ols::READ | ols::UPDATE | ols::DELETE
        );
    }

    #[test]
    fn fully_denied_object_emits_no_row() {
        let user_id = UserId::new(Uuid::new_v4());
        let object_id = ObjectId::new(Uuid::new_v4());
        let (g, d) = (new_ps(), new_ps());

        let result = compute_effective(
            user_id,
            &[grant(g), deny(d)],
            &[
                object_perm(g, object_id, ols::READ),
                object_perm(d, object_id, ols::ALL),
            ],
            &[],
            &[],
        );

        assert!(result.ols.is_empty());
    }

    #[test]
    fn deny_only_object_grants_nothing() {
        let user_id = UserId::new(Uuid::new_v4());
        let object_id = ObjectId::new(Uuid::new_v4());
        let d = new_ps();

        let result = compute_effective(
            user_id,
            &[deny(d)],
            &[object_perm(d, object_id, ols::READ)],
            &[],
            &[],
        );

        assert!(result.ols.is_empty());
    }

    #[test]
    fn rows_of_unknown_sets_are_ignored() {
        let user_id = UserId::new(Uuid::new_v4());
        let object_id = ObjectId::new(Uuid::new_v4());
        let stale = new_ps();

        let result = compute_effective(
            user_id,
            &[],
            &[object_perm(stale, object_id, ols::ALL)],
            &[],
            &[],
        );

        assert!(result.ols.is_empty());
    }

    #[test]
    fn field_lists_split_by_direction_and_sorted_by_name() {
        let user_id = UserId::new(Uuid::new_v4());
        let object_id = ObjectId::new(Uuid::new_v4());
        let phone = field("phone");
        let email = field("email");
        let secret = field("secret");
        let g = new_ps();

        let result = compute_effective(
            user_id,
            &[grant(g)],
            &[],
            &[
                field_perm(g, phone.id, fls::READ),
                field_perm(g, email.id, fls::ALL),
            ],
            &[ObjectFields {
                object_id,
                fields: vec![phone.clone(), secret, email.clone()],
            }],
        );

        assert_eq!(result.fls.len(), 2);
        assert_eq!(result.field_lists.len(), 2);
        let read = &result.field_lists[0];
        assert_eq!(read.mask, FieldAccess::Read);
        assert_eq!(read.field_names, vec!["email", "phone"]);
        let write = &result.field_lists[1];
        assert_eq!(write.mask, FieldAccess::Write);
        assert_eq!(write.field_names, vec!["email"]);
    }

    #[test]
    fn object_without_accessible_fields_has_no_field_list() {
        let user_id = UserId::new(Uuid::new_v4());
        let object_id = ObjectId::new(Uuid::new_v4());

        let result = compute_effective(
            user_id,
            &[],
            &[],
            &[],
            &[ObjectFields {
                object_id,
                fields: vec![field("name")],
            }],
        );

        assert!(result.field_lists.is_empty());
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        computer: EffectivePermissionComputer<InMemoryStore>,
        base: PermissionSetId,
        profile: ProfileId,
        object_id: ObjectId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let base = new_ps();
        let profile = ProfileId::new(Uuid::new_v4());
        let object_id = ObjectId::new(Uuid::new_v4());
        store.insert_permission_set(grant(base));
        store.insert_profile(Profile {
            id: profile,
            base_permission_set_id: base,
        });
        store.insert_object(ObjectFields {
            object_id,
            fields: vec![],
        });
        store.insert_object_permission(object_perm(base, object_id, ols::READ));

        Fixture {
            computer: EffectivePermissionComputer::new(Arc::clone(&store)),
            store,
            base,
            profile,
            object_id,
        }
    }

    fn add_user(fx: &Fixture) -> UserId {
        let id = UserId::new(Uuid::new_v4());
        fx.store.insert_user(User {
            id,
            profile_id: fx.profile,
            role_id: None,
        });
        id
    }

    #[tokio::test]
    async fn recompute_for_user_applies_profile_base_set() {
        let fx = fixture();
        let user_id = add_user(&fx);

        fx.computer.recompute_for_user(&user_id).await.unwrap();

        let rows = fx.store.read_effective_ols(&user_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].object_id, fx.object_id);
        assert_eq!(rows[0].permissions, ols::READ);
    }

    #[tokio::test]
    async fn recompute_for_missing_user_is_a_no_op() {
        let fx = fixture();
        let ghost = UserId::new(Uuid::new_v4());

        fx.computer.recompute_for_user(&ghost).await.unwrap();

        assert!(
            fx.store
                .read_effective_ols(&ghost)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn user_without_profile_is_a_data_integrity_error() {
        let fx = fixture();
        let user_id = UserId::new(Uuid::new_v4());
        let missing = ProfileId::new(Uuid::new_v4());
        fx.store.insert_user(User {
            id: user_id,
            profile_id: missing,
            role_id: None,
        });

        let err = fx.computer.recompute_for_user(&user_id).await.unwrap_err();

        assert!(matches!(
            err,
            RecomputeError::MissingProfile { profile_id, .. } if profile_id == missing
        ));
        assert!(fx.store.permissions_computed_at(&user_id).is_none());
    }

    #[tokio::test]
    async fn assigned_deny_set_is_subtracted() {
        let fx = fixture();
        let user_id = add_user(&fx);
        let d = new_ps();
        fx.store.insert_permission_set(deny(d));
        fx.store
            .insert_object_permission(object_perm(d, fx.object_id, ols::READ));
        fx.store.assign_permission_set(user_id, d);

        fx.computer.recompute_for_user(&user_id).await.unwrap();

        assert!(
            fx.store
                .read_effective_ols(&user_id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn assignment_to_deleted_set_is_skipped() {
        let fx = fixture();
        let user_id = add_user(&fx);
        let extra = new_ps();
        fx.store.insert_permission_set(grant(extra));
        fx.store.assign_permission_set(user_id, extra);
        fx.store.remove_permission_set(&extra);

        fx.computer.recompute_for_user(&user_id).await.unwrap();

        let rows = fx.store.read_effective_ols(&user_id).await.unwrap();
        assert_eq!(rows[0].permissions, ols::READ);
    }

    #[tokio::test]
    async fn recompute_twice_yields_identical_rows() {
        let fx = fixture();
        let user_id = add_user(&fx);

        fx.computer.recompute_for_user(&user_id).await.unwrap();
        let first = fx.store.read_effective_ols(&user_id).await.unwrap();
        fx.computer.recompute_for_user(&user_id).await.unwrap();
        let second = fx.store.read_effective_ols(&user_id).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn permission_set_fan_out_covers_base_and_direct_holders() {
        let fx = fixture();
        let via_profile = add_user(&fx);
        let other_profile = ProfileId::new(Uuid::new_v4());
        let other_base = new_ps();
        fx.store.insert_permission_set(grant(other_base));
        fx.store.insert_profile(Profile {
            id: other_profile,
            base_permission_set_id: other_base,
        });
        let direct = UserId::new(Uuid::new_v4());
        fx.store.insert_user(User {
            id: direct,
            profile_id: other_profile,
            role_id: None,
        });
        fx.store.assign_permission_set(direct, fx.base);

        let outcome = fx
            .computer
            .recompute_for_permission_set(&fx.base)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            BatchOutcome {
                succeeded: 2,
                failed: 0
            }
        );
        assert!(fx.store.permissions_computed_at(&via_profile).is_some());
        assert!(fx.store.permissions_computed_at(&direct).is_some());
    }

    #[tokio::test]
    async fn recompute_all_continues_past_broken_user() {
        let fx = fixture();
        let good = add_user(&fx);
        let broken = UserId::new(Uuid::new_v4());
        fx.store.insert_user(User {
            id: broken,
            profile_id: ProfileId::new(Uuid::new_v4()),
            role_id: None,
        });

        let outcome = fx.computer.recompute_all().await.unwrap();

        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 1);
        assert!(fx.store.permissions_computed_at(&good).is_some());
    }

    #[tokio::test]
    async fn fan_out_counts_holder_whose_write_fails_and_finishes_the_rest() {
        let fx = fixture();
        let users: Vec<UserId> = (0..3).map(|_| add_user(&fx)).collect();
        fx.store.fail_user(users[1]);

        let outcome = fx
            .computer
            .recompute_for_permission_set(&fx.base)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            BatchOutcome {
                succeeded: 2,
                failed: 1
            }
        );
        assert!(fx.store.permissions_computed_at(&users[0]).is_some());
        assert!(fx.store.permissions_computed_at(&users[1]).is_none());
        assert!(fx.store.permissions_computed_at(&users[2]).is_some());
    }

    #[tokio::test]
    async fn holder_deleted_after_listing_is_skipped() {
        let fx = fixture();
        let extra = new_ps();
        fx.store.insert_permission_set(grant(extra));
        let kept = add_user(&fx);
        let vanished = add_user(&fx);
        fx.store.assign_permission_set(kept, extra);
        fx.store.assign_permission_set(vanished, extra);
        fx.store.remove_after_holder_listing(vanished);

        let outcome = fx
            .computer
            .recompute_for_permission_set(&extra)
            .await
            .unwrap();

        assert_eq!(outcome.failed, 0);
        assert!(fx.store.permissions_computed_at(&kept).is_some());
        assert!(fx.store.permissions_computed_at(&vanished).is_none());
    }

    #[tokio::test]
    async fn read_failure_propagates_and_keeps_previous_rows() {
        let fx = fixture();
        let user_id = add_user(&fx);
        fx.computer.recompute_for_user(&user_id).await.unwrap();
        let before = fx.store.read_effective_ols(&user_id).await.unwrap();
        fx.store.fail_operation("list_object_permissions");

        let err = fx.computer.recompute_for_user(&user_id).await.unwrap_err();

        assert!(matches!(
            err,
            RecomputeError::Storage(StorageError::Internal(_))
        ));
        let after = fx.store.read_effective_ols(&user_id).await.unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn holder_listing_failure_aborts_fan_out() {
        let fx = fixture();
        let user_id = add_user(&fx);
        fx.store.fail_operation("list_users_assigned_permission_set");

        let result = fx.computer.recompute_for_permission_set(&fx.base).await;

        assert!(matches!(result, Err(RecomputeError::Storage(_))));
        assert!(fx.store.permissions_computed_at(&user_id).is_none());
    }

    #[test]
    fn storage_error_converts_into_recompute_error() {
        let err: RecomputeError = StorageError::ConnectionLost.into();
        assert!(matches!(
            err,
            RecomputeError::Storage(StorageError::ConnectionLost)
        ));
    }
}
