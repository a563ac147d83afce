pub mod migrations;
mod queries;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};

use crm_access_core::hierarchy::ClosureEdge;
use crm_access_core::model::{
    CompositionEdge, EffectiveFieldList, EffectiveFls, EffectiveOls, EffectivePermissions,
    FieldPermission, Group, GroupId, GroupMember, ObjectFields, ObjectId, ObjectPermission,
    PermissionSet, PermissionSetId, Profile, ProfileId, Role, RoleId, User, UserId,
};
use crm_access_core::outbox::{EventId, NewOutboxEvent, OutboxEvent};

use crate::traits::{
    ChangeFeed, ChangeSubscription, DirectorySource, EffectiveCacheReader, EffectiveCacheWriter,
    OutboxStore, PermissionSource, SecuritySource, StorageError, Wake,
};

pub use queries::append_outbox_event;
use queries::{OBJECT_HIERARCHY, ROLE_HIERARCHY, to_storage_error};

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(to_storage_error)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl DirectorySource for PostgresStore {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>, StorageError> {
        queries::get_user(&self.pool, user_id).await
    }

    async fn list_users(&self) -> Result<Vec<User>, StorageError> {
        queries::list_users(&self.pool).await
    }
}

impl PermissionSource for PostgresStore {
    async fn get_profile(&self, profile_id: &ProfileId) -> Result<Option<Profile>, StorageError> {
        queries::get_profile(&self.pool, profile_id).await
    }

    async fn list_assigned_permission_sets(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<PermissionSetId>, StorageError> {
        queries::list_assigned_permission_sets(&self.pool, user_id).await
    }

    async fn get_permission_sets(
        &self,
        ids: &[PermissionSetId],
    ) -> Result<Vec<PermissionSet>, StorageError> {
        queries::get_permission_sets(&self.pool, ids).await
    }

    async fn list_object_permissions(
        &self,
        ids: &[PermissionSetId],
    ) -> Result<Vec<ObjectPermission>, StorageError> {
        queries::list_object_permissions(&self.pool, ids).await
    }

    async fn list_field_permissions(
        &self,
        ids: &[PermissionSetId],
    ) -> Result<Vec<FieldPermission>, StorageError> {
        queries::list_field_permissions(&self.pool, ids).await
    }

    async fn list_objects_with_fields(&self) -> Result<Vec<ObjectFields>, StorageError> {
        queries::list_objects_with_fields(&self.pool).await
    }

    async fn list_users_assigned_permission_set(
        &self,
        permission_set_id: &PermissionSetId,
    ) -> Result<Vec<UserId>, StorageError> {
        queries::list_users_assigned_permission_set(&self.pool, permission_set_id).await
    }

    async fn list_users_with_base_permission_set(
        &self,
        permission_set_id: &PermissionSetId,
    ) -> Result<Vec<UserId>, StorageError> {
        queries::list_users_with_base_permission_set(&self.pool, permission_set_id).await
    }
}

impl SecuritySource for PostgresStore {
    async fn list_roles(&self) -> Result<Vec<Role>, StorageError> {
        queries::list_roles(&self.pool).await
    }

    async fn list_role_descendants(&self, role_id: &RoleId) -> Result<Vec<RoleId>, StorageError> {
        queries::list_role_descendants(&self.pool, role_id).await
    }

    async fn list_groups(&self) -> Result<Vec<Group>, StorageError> {
        queries::list_groups(&self.pool).await
    }

    async fn get_group(&self, group_id: &GroupId) -> Result<Option<Group>, StorageError> {
        queries::get_group(&self.pool, group_id).await
    }

    async fn list_group_members(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<GroupMember>, StorageError> {
        queries::list_group_members(&self.pool, group_id).await
    }

    async fn list_object_ids(&self) -> Result<Vec<ObjectId>, StorageError> {
        queries::list_object_ids(&self.pool).await
    }

    async fn list_composition_edges(&self) -> Result<Vec<CompositionEdge>, StorageError> {
        queries::list_composition_edges(&self.pool).await
    }
}

impl EffectiveCacheWriter for PostgresStore {
    async fn replace_user_permissions(
        &self,
        user_id: &UserId,
        permissions: &EffectivePermissions,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(to_storage_error)?;

        queries::delete_user_permissions(&mut tx, user_id).await?;
        queries::insert_effective_ols(&mut *tx, user_id, &permissions.ols).await?;
        queries::insert_effective_fls(&mut *tx, user_id, &permissions.fls).await?;
        for list in &permissions.field_lists {
            queries::insert_field_list(&mut *tx, list).await?;
        }

        tx.commit().await.map_err(to_storage_error)
    }

    async fn replace_role_hierarchy(
        &self,
        edges: &[ClosureEdge<RoleId>],
    ) -> Result<(), StorageError> {
        let rows = queries::closure_rows(edges, RoleId::as_uuid);
        let mut tx = self.pool.begin().await.map_err(to_storage_error)?;
        queries::replace_closure(&mut tx, &ROLE_HIERARCHY, &rows).await?;
        tx.commit().await.map_err(to_storage_error)
    }

    async fn replace_visible_owners(
        &self,
        user_id: &UserId,
        owners: &BTreeSet<UserId>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(to_storage_error)?;
        queries::replace_visible_owners(&mut tx, user_id, owners).await?;
        tx.commit().await.map_err(to_storage_error)
    }

    async fn replace_group_members(
        &self,
        group_id: &GroupId,
        members: &BTreeSet<UserId>,
    ) -> Result<(), StorageError> {
        let pairs: Vec<_> = members
            .iter()
            .map(|u| (*group_id.as_uuid(), *u.as_uuid()))
            .collect();

        let mut tx = self.pool.begin().await.map_err(to_storage_error)?;
        queries::delete_group_members(&mut *tx, Some(group_id)).await?;
        queries::insert_group_members(&mut *tx, &pairs).await?;
        tx.commit().await.map_err(to_storage_error)
    }

    async fn replace_all_group_members(
        &self,
        memberships: &BTreeMap<GroupId, BTreeSet<UserId>>,
    ) -> Result<(), StorageError> {
        let pairs: Vec<_> = memberships
            .iter()
            .flat_map(|(g, users)| users.iter().map(move |u| (*g.as_uuid(), *u.as_uuid())))
            .collect();

        let mut tx = self.pool.begin().await.map_err(to_storage_error)?;
        queries::delete_group_members(&mut *tx, None).await?;
        queries::insert_group_members(&mut *tx, &pairs).await?;
        tx.commit().await.map_err(to_storage_error)
    }

    async fn replace_object_hierarchy(
        &self,
        edges: &[ClosureEdge<ObjectId>],
    ) -> Result<(), StorageError> {
        let rows = queries::closure_rows(edges, ObjectId::as_uuid);
        let mut tx = self.pool.begin().await.map_err(to_storage_error)?;
        queries::replace_closure(&mut tx, &OBJECT_HIERARCHY, &rows).await?;
        tx.commit().await.map_err(to_storage_error)
    }
}

impl EffectiveCacheReader for PostgresStore {
    async fn read_effective_ols(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<EffectiveOls>, StorageError> {
        queries::read_effective_ols(&self.pool, user_id).await
    }

    async fn read_effective_fls(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<EffectiveFls>, StorageError> {
        queries::read_effective_fls(&self.pool, user_id).await
    }

    async fn read_field_lists(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<EffectiveFieldList>, StorageError> {
        queries::read_field_lists(&self.pool, user_id).await
    }

    async fn read_role_hierarchy(&self) -> Result<Vec<ClosureEdge<RoleId>>, StorageError> {
        let rows = queries::read_closure(&self.pool, &ROLE_HIERARCHY).await?;
        Ok(rows
            .into_iter()
            .map(|(a, d, depth)| ClosureEdge::new(a.into(), d.into(), depth))
            .collect())
    }

    async fn read_visible_owners(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeSet<UserId>, StorageError> {
        queries::read_visible_owners(&self.pool, user_id).await
    }

    async fn read_group_members(
        &self,
        group_id: &GroupId,
    ) -> Result<BTreeSet<UserId>, StorageError> {
        queries::read_group_members(&self.pool, group_id).await
    }

    async fn read_object_hierarchy(&self) -> Result<Vec<ClosureEdge<ObjectId>>, StorageError> {
        let rows = queries::read_closure(&self.pool, &OBJECT_HIERARCHY).await?;
        Ok(rows
            .into_iter()
            .map(|(a, d, depth)| ClosureEdge::new(a.into(), d.into(), depth))
            .collect())
    }
}

impl OutboxStore for PostgresStore {
    async fn append_event(&self, event: &NewOutboxEvent) -> Result<EventId, StorageError> {
        queries::append_outbox_event(&self.pool, event).await
    }

    async fn list_unprocessed(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StorageError> {
        queries::list_unprocessed(&self.pool, offset, limit).await
    }

    async fn mark_processed(&self, event_id: &EventId) -> Result<(), StorageError> {
        queries::mark_processed(&self.pool, event_id).await
    }
}

/// A dedicated LISTEN connection, separate from the pool's query connections.
pub struct PgSubscription {
    listener: PgListener,
}

impl ChangeSubscription for PgSubscription {
    async fn wait(&mut self, timeout: Duration) -> Result<Wake, StorageError> {
        match tokio::time::timeout(timeout, self.listener.try_recv()).await {
            Err(_) => Ok(Wake::TimedOut),
            Ok(Ok(Some(_))) => Ok(Wake::Notified),
            // Notifications sent while disconnected are gone; the caller resweeps.
            Ok(Ok(None)) => Err(StorageError::ConnectionLost),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "notification listener failed");
                Err(StorageError::ConnectionLost)
            }
        }
    }
}

impl ChangeFeed for PostgresStore {
    type Subscription = PgSubscription;

    async fn subscribe(&self, channel: &str) -> Result<PgSubscription, StorageError> {
        migrations::validate_channel_name(channel)?;
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(to_storage_error)?;
        listener.listen(channel).await.map_err(to_storage_error)?;
        Ok(PgSubscription { listener })
    }
}
