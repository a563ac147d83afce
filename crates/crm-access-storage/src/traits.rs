use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crm_access_core::hierarchy::ClosureEdge;
use crm_access_core::model::{
    CompositionEdge, EffectiveFieldList, EffectiveFls, EffectiveOls, EffectivePermissions,
    FieldPermission, Group, GroupId, GroupMember, ObjectFields, ObjectId, ObjectPermission,
    PermissionSet, PermissionSetId, Profile, ProfileId, Role, RoleId, User, UserId,
};
use crm_access_core::outbox::{EventId, NewOutboxEvent, OutboxEvent};
use crm_access_core::permission::BitmaskError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("notification connection lost")]
    ConnectionLost,
    #[error("invalid stored bitmask: {0}")]
    InvalidBitmask(#[from] BitmaskError),
    #[error("invalid stored value in {table}: {detail}")]
    InvalidRow { table: &'static str, detail: String },
    #[error("internal storage error: {0}")]
    Internal(String),
}

/// Users, as needed by both computers.
pub trait DirectorySource: Send + Sync {
    fn get_user(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Option<User>, StorageError>> + Send;

    fn list_users(&self) -> impl Future<Output = Result<Vec<User>, StorageError>> + Send;
}

/// Raw profile, permission-set, and OLS/FLS assignment data.
pub trait PermissionSource: Send + Sync {
    fn get_profile(
        &self,
        profile_id: &ProfileId,
    ) -> impl Future<Output = Result<Option<Profile>, StorageError>> + Send;

    fn list_assigned_permission_sets(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Vec<PermissionSetId>, StorageError>> + Send;

    /// Returns the sets that still exist; unknown ids are silently absent.
    fn get_permission_sets(
        &self,
        ids: &[PermissionSetId],
    ) -> impl Future<Output = Result<Vec<PermissionSet>, StorageError>> + Send;

    fn list_object_permissions(
        &self,
        ids: &[PermissionSetId],
    ) -> impl Future<Output = Result<Vec<ObjectPermission>, StorageError>> + Send;

    fn list_field_permissions(
        &self,
        ids: &[PermissionSetId],
    ) -> impl Future<Output = Result<Vec<FieldPermission>, StorageError>> + Send;

    fn list_objects_with_fields(
        &self,
    ) -> impl Future<Output = Result<Vec<ObjectFields>, StorageError>> + Send;

    fn list_users_assigned_permission_set(
        &self,
        permission_set_id: &PermissionSetId,
    ) -> impl Future<Output = Result<Vec<UserId>, StorageError>> + Send;

    fn list_users_with_base_permission_set(
        &self,
        permission_set_id: &PermissionSetId,
    ) -> impl Future<Output = Result<Vec<UserId>, StorageError>> + Send;
}

/// Raw role, group, and object composition data for row-level visibility.
pub trait SecuritySource: Send + Sync {
    fn list_roles(&self) -> impl Future<Output = Result<Vec<Role>, StorageError>> + Send;

    /// Reads the materialized role closure: the role itself plus every descendant.
    fn list_role_descendants(
        &self,
        role_id: &RoleId,
    ) -> impl Future<Output = Result<Vec<RoleId>, StorageError>> + Send;

    fn list_groups(&self) -> impl Future<Output = Result<Vec<Group>, StorageError>> + Send;

    fn get_group(
        &self,
        group_id: &GroupId,
    ) -> impl Future<Output = Result<Option<Group>, StorageError>> + Send;

    fn list_group_members(
        &self,
        group_id: &GroupId,
    ) -> impl Future<Output = Result<Vec<GroupMember>, StorageError>> + Send;

    fn list_object_ids(&self) -> impl Future<Output = Result<Vec<ObjectId>, StorageError>> + Send;

    fn list_composition_edges(
        &self,
    ) -> impl Future<Output = Result<Vec<CompositionEdge>, StorageError>> + Send;
}

/// Every method deletes the scope's rows and inserts the new ones in one transaction.
pub trait EffectiveCacheWriter: Send + Sync {
    fn replace_user_permissions(
        &self,
        user_id: &UserId,
        permissions: &EffectivePermissions,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn replace_role_hierarchy(
        &self,
        edges: &[ClosureEdge<RoleId>],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn replace_visible_owners(
        &self,
        user_id: &UserId,
        owners: &BTreeSet<UserId>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn replace_group_members(
        &self,
        group_id: &GroupId,
        members: &BTreeSet<UserId>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn replace_all_group_members(
        &self,
        memberships: &BTreeMap<GroupId, BTreeSet<UserId>>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn replace_object_hierarchy(
        &self,
        edges: &[ClosureEdge<ObjectId>],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Read side of the cache tables, as used by the query engine.
pub trait EffectiveCacheReader: Send + Sync {
    fn read_effective_ols(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Vec<EffectiveOls>, StorageError>> + Send;

    fn read_effective_fls(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Vec<EffectiveFls>, StorageError>> + Send;

    fn read_field_lists(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Vec<EffectiveFieldList>, StorageError>> + Send;

    fn read_role_hierarchy(
        &self,
    ) -> impl Future<Output = Result<Vec<ClosureEdge<RoleId>>, StorageError>> + Send;

    fn read_visible_owners(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<BTreeSet<UserId>, StorageError>> + Send;

    fn read_group_members(
        &self,
        group_id: &GroupId,
    ) -> impl Future<Output = Result<BTreeSet<UserId>, StorageError>> + Send;

    fn read_object_hierarchy(
        &self,
    ) -> impl Future<Output = Result<Vec<ClosureEdge<ObjectId>>, StorageError>> + Send;
}

pub trait OutboxStore: Send + Sync {
    fn append_event(
        &self,
        event: &NewOutboxEvent,
    ) -> impl Future<Output = Result<EventId, StorageError>> + Send;

    /// Pending events in creation order, skipping the first `offset` of them.
    fn list_unprocessed(
        &self,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OutboxEvent>, StorageError>> + Send;

    fn mark_processed(
        &self,
        event_id: &EventId,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Notified,
    TimedOut,
}

pub trait ChangeSubscription: Send {
    /// Waits up to `timeout` for a notification. An error means the
    /// subscription is gone and must be re-established.
    fn wait(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Wake, StorageError>> + Send;
}

/// Best-effort push channel announcing new outbox rows.
pub trait ChangeFeed: Send + Sync {
    type Subscription: ChangeSubscription;

    fn subscribe(
        &self,
        channel: &str,
    ) -> impl Future<Output = Result<Self::Subscription, StorageError>> + Send;
}

/// Everything the outbox pipeline needs from one backing store.
pub trait AccessStore:
    DirectorySource
    + PermissionSource
    + SecuritySource
    + EffectiveCacheWriter
    + OutboxStore
    + ChangeFeed
    + 'static
{
}

impl<T> AccessStore for T where
    T: DirectorySource
        + PermissionSource
        + SecuritySource
        + EffectiveCacheWriter
        + OutboxStore
        + ChangeFeed
        + 'static
{
}
