use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use crm_access_core::hierarchy::{object_closure, role_closure};
use crm_access_core::membership::MembershipGraph;
use crm_access_core::model::{GroupId, Member, RoleId, User, UserId};
use crm_access_storage::{DirectorySource, EffectiveCacheWriter, SecuritySource};

use crate::error::RecomputeError;

/// Maintains the row-level visibility caches: role and object closures,
/// visible owners per user, and flattened group membership. Every storage
/// error aborts the operation; nothing is partially written.
pub struct RlsEffectiveComputer<S> {
    store: Arc<S>,
}

impl<S> RlsEffectiveComputer<S>
where
    S: DirectorySource + SecuritySource + EffectiveCacheWriter,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn recompute_role_hierarchy(&self) -> Result<(), RecomputeError> {
        let roles = self.store.list_roles().await?;
        let edges = role_closure(&roles);
        self.store.replace_role_hierarchy(&edges).await?;

        tracing::debug!(roles = roles.len(), edges = edges.len(), "role hierarchy replaced");
        Ok(())
    }

    pub async fn recompute_visible_owners_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<(), RecomputeError> {
        let Some(user) = self.store.get_user(user_id).await? else {
            tracing::info!(
                user_id = %user_id,
                "user no longer exists, skipping visibility recompute"
            );
            return Ok(());
        };

        let users = match user.role_id {
            Some(_) => self.store.list_users().await?,
            None => Vec::new(),
        };
        self.replace_visible_owners(&user, &users).await
    }

    /// Stops at the first failing user. The permission computer's bulk paths
    /// keep going instead; callers wanting isolation wrap per user.
    pub async fn recompute_visible_owners_all(&self) -> Result<(), RecomputeError> {
        let users = self.store.list_users().await?;
        for user in &users {
            self.replace_visible_owners(user, &users).await?;
        }

        tracing::info!(users = users.len(), "visible owners recomputed for all users");
        Ok(())
    }

    async fn replace_visible_owners(
        &self,
        user: &User,
        users: &[User],
    ) -> Result<(), RecomputeError> {
        let mut owners = BTreeSet::from([user.id]);

        if let Some(role_id) = user.role_id {
            let mut visible_roles: BTreeSet<RoleId> = self
                .store
                .list_role_descendants(&role_id)
                .await?
                .into_iter()
                .collect();
            visible_roles.insert(role_id);

            owners.extend(
                users
                    .iter()
                    .filter(|u| u.role_id.is_some_and(|r| visible_roles.contains(&r)))
                    .map(|u| u.id),
            );
        }

        self.store.replace_visible_owners(&user.id, &owners).await?;
        tracing::debug!(user_id = %user.id, owners = owners.len(), "visible owners replaced");
        Ok(())
    }

    /// Flattens one group through every nested group reachable from it. A
    /// group that no longer exists ends up with an empty membership.
    pub async fn recompute_group_members_for_group(
        &self,
        group_id: &GroupId,
    ) -> Result<(), RecomputeError> {
        if self.store.get_group(group_id).await?.is_none() {
            self.store
                .replace_group_members(group_id, &BTreeSet::new())
                .await?;
            tracing::info!(group_id = %group_id, "group no longer exists, membership cleared");
            return Ok(());
        }

        let graph = self.load_reachable(*group_id).await?;
        let members = graph.flatten(*group_id);
        self.store.replace_group_members(group_id, &members).await?;

        tracing::debug!(group_id = %group_id, members = members.len(), "group membership replaced");
        Ok(())
    }

    pub async fn recompute_group_members_all(&self) -> Result<(), RecomputeError> {
        let groups = self.store.list_groups().await?;
        let mut graph = MembershipGraph::new();
        for group in &groups {
            graph.insert_empty(group.id);
            for row in self.store.list_group_members(&group.id).await? {
                graph.add(row.group_id, row.member);
            }
        }

        let memberships = graph.flatten_all();
        self.store.replace_all_group_members(&memberships).await?;

        tracing::info!(groups = groups.len(), "group memberships recomputed for all groups");
        Ok(())
    }

    /// Loads direct members for `root` and every group nested beneath it.
    async fn load_reachable(&self, root: GroupId) -> Result<MembershipGraph, RecomputeError> {
        let mut graph = MembershipGraph::new();
        let mut pending = VecDeque::from([root]);

        while let Some(group_id) = pending.pop_front() {
            if graph.contains(&group_id) {
                continue;
            }
            graph.insert_empty(group_id);
            for row in self.store.list_group_members(&group_id).await? {
                if let Member::Group(nested) = row.member
                    && !graph.contains(&nested)
                {
                    pending.push_back(nested);
                }
                graph.add(row.group_id, row.member);
            }
        }
        Ok(graph)
    }

    pub async fn recompute_object_hierarchy(&self) -> Result<(), RecomputeError> {
        let objects = self.store.list_object_ids().await?;
        let edges = self.store.list_composition_edges().await?;
        let closure = object_closure(&objects, &edges);
        self.store.replace_object_hierarchy(&closure).await?;

        tracing::debug!(
            objects = objects.len(),
            composition_edges = edges.len(),
            closure_edges = closure.len(),
            "object hierarchy replaced"
        );
        Ok(())
    }
}
