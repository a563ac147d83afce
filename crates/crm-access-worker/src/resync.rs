use std::sync::Arc;

use crm_access_storage::{DirectorySource, EffectiveCacheWriter, PermissionSource, SecuritySource};

use crate::effective::{BatchOutcome, EffectivePermissionComputer};
use crate::error::RecomputeError;
use crate::rls::RlsEffectiveComputer;

/// Rebuilds every effective cache. The role closure goes first because
/// visible-owner sets are derived from it.
pub async fn resync_all<S>(store: Arc<S>) -> Result<BatchOutcome, RecomputeError>
where
    S: DirectorySource + PermissionSource + SecuritySource + EffectiveCacheWriter,
{
    let permissions = EffectivePermissionComputer::new(Arc::clone(&store));
    let rls = RlsEffectiveComputer::new(store);

    rls.recompute_role_hierarchy().await?;
    rls.recompute_object_hierarchy().await?;
    rls.recompute_group_members_all().await?;
    let outcome = permissions.recompute_all().await?;
    rls.recompute_visible_owners_all().await?;

    tracing::info!(
        users_succeeded = outcome.succeeded,
        users_failed = outcome.failed,
        "effective caches resynchronized"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crm_access_core::model::{
        Group, GroupId, GroupMember, GroupType, Member, ObjectFields, ObjectId, ObjectPermission,
        PermissionSet, PermissionSetId, PermissionSetType, Profile, ProfileId, Role, RoleId, User,
        UserId,
    };
    use crm_access_core::permission::ols;
    use crm_access_storage::{EffectiveCacheReader, InMemoryStore};
    use uuid::Uuid;

    #[tokio::test]
    async fn resync_populates_every_cache() {
        let store = Arc::new(InMemoryStore::new());
        let base = PermissionSetId::new(Uuid::new_v4());
        let profile = ProfileId::new(Uuid::new_v4());
        let object_id = ObjectId::new(Uuid::new_v4());
        let top = RoleId::new(Uuid::new_v4());
        let below = RoleId::new(Uuid::new_v4());
        let group_id = GroupId::new(Uuid::new_v4());

        store.insert_permission_set(PermissionSet {
            id: base,
            ps_type: PermissionSetType::Grant,
        });
        store.insert_profile(Profile {
            id: profile,
            base_permission_set_id: base,
        });
        store.insert_object(ObjectFields {
            object_id,
            fields: vec![],
        });
        store.insert_object_permission(ObjectPermission {
            permission_set_id: base,
            object_id,
            permissions: ols::READ,
        });
        store.insert_role(Role {
            id: top,
            parent_id: None,
        });
        store.insert_role(Role {
            id: below,
            parent_id: Some(top),
        });
        let manager = UserId::new(Uuid::new_v4());
        let worker = UserId::new(Uuid::new_v4());
        for (id, role_id) in [(manager, top), (worker, below)] {
            store.insert_user(User {
                id,
                profile_id: profile,
                role_id: Some(role_id),
            });
        }
        store.insert_group(Group {
            id: group_id,
            group_type: GroupType::Public,
            related_role_id: None,
            related_user_id: None,
        });
        store.add_group_member(GroupMember {
            group_id,
            member: Member::User(worker),
        });

        let outcome = resync_all(Arc::clone(&store)).await.unwrap();

        assert_eq!(outcome.succeeded, 2);
        assert_eq!(store.read_role_hierarchy().await.unwrap().len(), 3);
        assert_eq!(store.read_object_hierarchy().await.unwrap().len(), 1);
        assert_eq!(
            store.read_group_members(&group_id).await.unwrap(),
            BTreeSet::from([worker])
        );
        assert_eq!(store.read_effective_ols(&worker).await.unwrap().len(), 1);
        assert_eq!(
            store.read_visible_owners(&manager).await.unwrap(),
            BTreeSet::from([manager, worker])
        );
    }
}
