use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crm_access_core::hierarchy::ClosureEdge;
use crm_access_core::model::{
    CompositionEdge, EffectiveFieldList, EffectiveFls, EffectiveOls, EffectivePermissions,
    FieldPermission, Group, GroupId, GroupMember, Member, ObjectFields, ObjectId,
    ObjectPermission, PermissionSet, PermissionSetId, Profile, ProfileId, Role, RoleId, User,
    UserId,
};
use crm_access_core::outbox::{EventId, NewOutboxEvent, OutboxEvent};

use crate::traits::{
    ChangeFeed, ChangeSubscription, DirectorySource, EffectiveCacheReader, EffectiveCacheWriter,
    OutboxStore, PermissionSource, SecuritySource, StorageError, Wake,
};

const NOTIFY_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct CachedPermissions {
    permissions: EffectivePermissions,
    computed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct InnerState {
    users: BTreeMap<UserId, User>,
    profiles: HashMap<ProfileId, Profile>,
    permission_sets: HashMap<PermissionSetId, PermissionSet>,
    object_permissions: Vec<ObjectPermission>,
    field_permissions: Vec<FieldPermission>,
    assignments: BTreeSet<(UserId, PermissionSetId)>,
    objects: BTreeMap<ObjectId, ObjectFields>,
    composition_edges: Vec<CompositionEdge>,
    roles: BTreeMap<RoleId, Role>,
    groups: BTreeMap<GroupId, Group>,
    group_members: Vec<GroupMember>,

    user_permissions: BTreeMap<UserId, CachedPermissions>,
    role_hierarchy: Vec<ClosureEdge<RoleId>>,
    visible_owners: BTreeMap<UserId, BTreeSet<UserId>>,
    group_membership: BTreeMap<GroupId, BTreeSet<UserId>>,
    object_hierarchy: Vec<ClosureEdge<ObjectId>>,

    outbox: Vec<OutboxEvent>,
    notifier: broadcast::Sender<EventId>,
    faults: Faults,
}

/// Failures armed by tests to exercise storage error paths.
#[derive(Debug, Default)]
struct Faults {
    operations: BTreeSet<&'static str>,
    users: BTreeSet<UserId>,
    vanish_after_holder_listing: BTreeSet<UserId>,
}

impl Faults {
    fn check(&self, operation: &'static str) -> Result<(), StorageError> {
        if self.operations.contains(operation) {
            return Err(StorageError::Internal(format!(
                "injected failure in {operation}"
            )));
        }
        Ok(())
    }

    fn check_user(&self, user_id: &UserId) -> Result<(), StorageError> {
        if self.users.contains(user_id) {
            return Err(StorageError::Internal(format!(
                "injected failure for user {user_id}"
            )));
        }
        Ok(())
    }
}

/// Process-local store implementing every repository contract. Each method runs
/// under one lock, which gives cache replacement the same all-or-nothing
/// visibility a database transaction would.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<InnerState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(InnerState {
                users: BTreeMap::new(),
                profiles: HashMap::new(),
                permission_sets: HashMap::new(),
                object_permissions: Vec::new(),
                field_permissions: Vec::new(),
                assignments: BTreeSet::new(),
                objects: BTreeMap::new(),
                composition_edges: Vec::new(),
                roles: BTreeMap::new(),
                groups: BTreeMap::new(),
                group_members: Vec::new(),
                user_permissions: BTreeMap::new(),
                role_hierarchy: Vec::new(),
                visible_owners: BTreeMap::new(),
                group_membership: BTreeMap::new(),
                object_hierarchy: Vec::new(),
                outbox: Vec::new(),
                notifier,
                faults: Faults::default(),
            })),
        }
    }

    pub fn insert_user(&self, user: User) {
        let mut state = self.state.lock().unwrap();
        state.users.insert(user.id, user);
    }

    pub fn remove_user(&self, user_id: &UserId) {
        let mut state = self.state.lock().unwrap();
        state.users.remove(user_id);
        state.assignments.retain(|(u, _)| u != user_id);
    }

    pub fn insert_profile(&self, profile: Profile) {
        let mut state = self.state.lock().unwrap();
        state.profiles.insert(profile.id, profile);
    }

    pub fn insert_permission_set(&self, permission_set: PermissionSet) {
        let mut state = self.state.lock().unwrap();
        state
            .permission_sets
            .insert(permission_set.id, permission_set);
    }

    pub fn remove_permission_set(&self, permission_set_id: &PermissionSetId) {
        let mut state = self.state.lock().unwrap();
        state.permission_sets.remove(permission_set_id);
        state
            .object_permissions
            .retain(|p| &p.permission_set_id != permission_set_id);
        state
            .field_permissions
            .retain(|p| &p.permission_set_id != permission_set_id);
    }

    pub fn insert_object_permission(&self, permission: ObjectPermission) {
        let mut state = self.state.lock().unwrap();
        state.object_permissions.retain(|p| {
            !(p.permission_set_id == permission.permission_set_id
                && p.object_id == permission.object_id)
        });
        state.object_permissions.push(permission);
    }

    pub fn insert_field_permission(&self, permission: FieldPermission) {
        let mut state = self.state.lock().unwrap();
        state.field_permissions.retain(|p| {
            !(p.permission_set_id == permission.permission_set_id
                && p.field_id == permission.field_id)
        });
        state.field_permissions.push(permission);
    }

    pub fn assign_permission_set(&self, user_id: UserId, permission_set_id: PermissionSetId) {
        let mut state = self.state.lock().unwrap();
        state.assignments.insert((user_id, permission_set_id));
    }

    pub fn insert_object(&self, object: ObjectFields) {
        let mut state = self.state.lock().unwrap();
        state.objects.insert(object.object_id, object);
    }

    pub fn insert_composition_edge(&self, edge: CompositionEdge) {
        let mut state = self.state.lock().unwrap();
        state.composition_edges.push(edge);
    }

    pub fn insert_role(&self, role: Role) {
        let mut state = self.state.lock().unwrap();
        state.roles.insert(role.id, role);
    }

    pub fn insert_group(&self, group: Group) {
        let mut state = self.state.lock().unwrap();
        state.groups.insert(group.id, group);
    }

    pub fn remove_group(&self, group_id: &GroupId) {
        let mut state = self.state.lock().unwrap();
        state.groups.remove(group_id);
        state
            .group_members
            .retain(|m| &m.group_id != group_id && m.member != Member::Group(*group_id));
    }

    pub fn add_group_member(&self, member: GroupMember) {
        let mut state = self.state.lock().unwrap();
        if !state.group_members.contains(&member) {
            state.group_members.push(member);
        }
    }

    pub fn outbox_events(&self) -> Vec<OutboxEvent> {
        let state = self.state.lock().unwrap();
        state.outbox.clone()
    }

    pub fn permissions_computed_at(&self, user_id: &UserId) -> Option<DateTime<Utc>> {
        let state = self.state.lock().unwrap();
        state.user_permissions.get(user_id).map(|c| c.computed_at)
    }

    /// Makes every later call to the named repository method fail.
    pub fn fail_operation(&self, operation: &'static str) {
        let mut state = self.state.lock().unwrap();
        state.faults.operations.insert(operation);
    }

    /// Makes cache writes scoped to `user_id` fail.
    pub fn fail_user(&self, user_id: UserId) {
        let mut state = self.state.lock().unwrap();
        state.faults.users.insert(user_id);
    }

    /// Deletes the user row right after a permission-set holder listing has
    /// returned it, as a concurrent delete would. Assignments are left behind.
    pub fn remove_after_holder_listing(&self, user_id: UserId) {
        let mut state = self.state.lock().unwrap();
        state.faults.vanish_after_holder_listing.insert(user_id);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock().unwrap();
        state.faults = Faults::default();
    }

    /// Closes every open subscription, as a dropped database connection would.
    pub fn drop_subscriptions(&self) {
        let mut state = self.state.lock().unwrap();
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        state.notifier = notifier;
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectorySource for InMemoryStore {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("get_user")?;
        Ok(state.users.get(user_id).cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("list_users")?;
        Ok(state.users.values().cloned().collect())
    }
}

impl PermissionSource for InMemoryStore {
    async fn get_profile(&self, profile_id: &ProfileId) -> Result<Option<Profile>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("get_profile")?;
        Ok(state.profiles.get(profile_id).cloned())
    }

    async fn list_assigned_permission_sets(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<PermissionSetId>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("list_assigned_permission_sets")?;
        Ok(state
            .assignments
            .iter()
            .filter(|(u, _)| u == user_id)
            .map(|(_, ps)| *ps)
            .collect())
    }

    async fn get_permission_sets(
        &self,
        ids: &[PermissionSetId],
    ) -> Result<Vec<PermissionSet>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("get_permission_sets")?;
        Ok(ids
            .iter()
            .filter_map(|id| state.permission_sets.get(id).cloned())
            .collect())
    }

    async fn list_object_permissions(
        &self,
        ids: &[PermissionSetId],
    ) -> Result<Vec<ObjectPermission>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("list_object_permissions")?;
        Ok(state
            .object_permissions
            .iter()
            .filter(|p| ids.contains(&p.permission_set_id))
            .cloned()
            .collect())
    }

    async fn list_field_permissions(
        &self,
        ids: &[PermissionSetId],
    ) -> Result<Vec<FieldPermission>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("list_field_permissions")?;
        Ok(state
            .field_permissions
            .iter()
            .filter(|p| ids.contains(&p.permission_set_id))
            .cloned()
            .collect())
    }

    async fn list_objects_with_fields(&self) -> Result<Vec<ObjectFields>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("list_objects_with_fields")?;
        Ok(state.objects.values().cloned().collect())
    }

    async fn list_users_assigned_permission_set(
        &self,
        permission_set_id: &PermissionSetId,
    ) -> Result<Vec<UserId>, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.faults.check("list_users_assigned_permission_set")?;
        let holders: Vec<UserId> = state
            .assignments
            .iter()
            .filter(|(_, ps)| ps == permission_set_id)
            .map(|(u, _)| *u)
            .collect();

        for user_id in &holders {
            if state.faults.vanish_after_holder_listing.remove(user_id) {
                state.users.remove(user_id);
            }
        }
        Ok(holders)
    }

    async fn list_users_with_base_permission_set(
        &self,
        permission_set_id: &PermissionSetId,
    ) -> Result<Vec<UserId>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("list_users_with_base_permission_set")?;
        Ok(state
            .users
            .values()
            .filter(|u| {
                state
                    .profiles
                    .get(&u.profile_id)
                    .is_some_and(|p| &p.base_permission_set_id == permission_set_id)
            })
            .map(|u| u.id)
            .collect())
    }
}

impl SecuritySource for InMemoryStore {
    async fn list_roles(&self) -> Result<Vec<Role>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("list_roles")?;
        Ok(state.roles.values().cloned().collect())
    }

    async fn list_role_descendants(&self, role_id: &RoleId) -> Result<Vec<RoleId>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("list_role_descendants")?;
        Ok(state
            .role_hierarchy
            .iter()
            .filter(|e| &e.ancestor == role_id)
            .map(|e| e.descendant)
            .collect())
    }

    async fn list_groups(&self) -> Result<Vec<Group>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("list_groups")?;
        Ok(state.groups.values().cloned().collect())
    }

    async fn get_group(&self, group_id: &GroupId) -> Result<Option<Group>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("get_group")?;
        Ok(state.groups.get(group_id).cloned())
    }

    async fn list_group_members(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<GroupMember>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("list_group_members")?;
        Ok(state
            .group_members
            .iter()
            .filter(|m| &m.group_id == group_id)
            .copied()
            .collect())
    }

    async fn list_object_ids(&self) -> Result<Vec<ObjectId>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("list_object_ids")?;
        Ok(state.objects.keys().copied().collect())
    }

    async fn list_composition_edges(&self) -> Result<Vec<CompositionEdge>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("list_composition_edges")?;
        Ok(state.composition_edges.clone())
    }
}

impl EffectiveCacheWriter for InMemoryStore {
    async fn replace_user_permissions(
        &self,
        user_id: &UserId,
        permissions: &EffectivePermissions,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.faults.check("replace_user_permissions")?;
        state.faults.check_user(user_id)?;
        state.user_permissions.insert(
            *user_id,
            CachedPermissions {
                permissions: permissions.clone(),
                computed_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn replace_role_hierarchy(
        &self,
        edges: &[ClosureEdge<RoleId>],
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.faults.check("replace_role_hierarchy")?;
        state.role_hierarchy = edges.to_vec();
        Ok(())
    }

    async fn replace_visible_owners(
        &self,
        user_id: &UserId,
        owners: &BTreeSet<UserId>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.faults.check("replace_visible_owners")?;
        state.faults.check_user(user_id)?;
        state.visible_owners.insert(*user_id, owners.clone());
        Ok(())
    }

    async fn replace_group_members(
        &self,
        group_id: &GroupId,
        members: &BTreeSet<UserId>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.faults.check("replace_group_members")?;
        if members.is_empty() {
            state.group_membership.remove(group_id);
        } else {
            state.group_membership.insert(*group_id, members.clone());
        }
        Ok(())
    }

    async fn replace_all_group_members(
        &self,
        memberships: &BTreeMap<GroupId, BTreeSet<UserId>>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.faults.check("replace_all_group_members")?;
        state.group_membership = memberships
            .iter()
            .filter(|(_, users)| !users.is_empty())
            .map(|(g, users)| (*g, users.clone()))
            .collect();
        Ok(())
    }

    async fn replace_object_hierarchy(
        &self,
        edges: &[ClosureEdge<ObjectId>],
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.faults.check("replace_object_hierarchy")?;
        state.object_hierarchy = edges.to_vec();
        Ok(())
    }
}

impl EffectiveCacheReader for InMemoryStore {
    async fn read_effective_ols(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<EffectiveOls>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("read_effective_ols")?;
        Ok(state
            .user_permissions
            .get(user_id)
            .map(|c| c.permissions.ols.clone())
            .unwrap_or_default())
    }

    async fn read_effective_fls(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<EffectiveFls>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("read_effective_fls")?;
        Ok(state
            .user_permissions
            .get(user_id)
            .map(|c| c.permissions.fls.clone())
            .unwrap_or_default())
    }

    async fn read_field_lists(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<EffectiveFieldList>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("read_field_lists")?;
        Ok(state
            .user_permissions
            .get(user_id)
            .map(|c| c.permissions.field_lists.clone())
            .unwrap_or_default())
    }

    async fn read_role_hierarchy(&self) -> Result<Vec<ClosureEdge<RoleId>>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("read_role_hierarchy")?;
        Ok(state.role_hierarchy.clone())
    }

    async fn read_visible_owners(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeSet<UserId>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("read_visible_owners")?;
        Ok(state
            .visible_owners
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_group_members(
        &self,
        group_id: &GroupId,
    ) -> Result<BTreeSet<UserId>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("read_group_members")?;
        Ok(state
            .group_membership
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_object_hierarchy(&self) -> Result<Vec<ClosureEdge<ObjectId>>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("read_object_hierarchy")?;
        Ok(state.object_hierarchy.clone())
    }
}

impl OutboxStore for InMemoryStore {
    async fn append_event(&self, event: &NewOutboxEvent) -> Result<EventId, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.faults.check("append_event")?;
        let id = EventId::new(Uuid::new_v4());
        state.outbox.push(OutboxEvent {
            id,
            event_type: event.event_type.clone(),
            entity_type: event.entity_type.clone(),
            entity_id: event.entity_id,
            payload: event.payload.clone(),
            created_at: Utc::now(),
            processed_at: None,
        });
        // No receivers is not an error: the sweep picks the row up later.
        let _ = state.notifier.send(id);
        Ok(id)
    }

    async fn list_unprocessed(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("list_unprocessed")?;
        Ok(state
            .outbox
            .iter()
            .filter(|e| e.is_pending())
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, event_id: &EventId) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.faults.check("mark_processed")?;
        if let Some(event) = state.outbox.iter_mut().find(|e| &e.id == event_id) {
            event.processed_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct InMemorySubscription {
    receiver: broadcast::Receiver<EventId>,
}

impl ChangeSubscription for InMemorySubscription {
    async fn wait(&mut self, timeout: Duration) -> Result<Wake, StorageError> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Err(_) => Ok(Wake::TimedOut),
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => Ok(Wake::Notified),
            Ok(Err(broadcast::error::RecvError::Closed)) => Err(StorageError::ConnectionLost),
        }
    }
}

impl ChangeFeed for InMemoryStore {
    type Subscription = InMemorySubscription;

    async fn subscribe(&self, _channel: &str) -> Result<InMemorySubscription, StorageError> {
        let state = self.state.lock().unwrap();
        state.faults.check("subscribe")?;
        Ok(InMemorySubscription {
            receiver: state.notifier.subscribe(),
        })
    }
}
