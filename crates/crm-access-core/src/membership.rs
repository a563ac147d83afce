use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::model::{GroupId, GroupMember, Member, UserId};

/// Direct membership of a set of groups, keyed by the enclosing group.
#[derive(Debug, Clone, Default)]
pub struct MembershipGraph {
    direct: BTreeMap<GroupId, Vec<Member>>,
}

impl MembershipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_members(members: impl IntoIterator<Item = GroupMember>) -> Self {
        let mut graph = Self::new();
        for m in members {
            graph.add(m.group_id, m.member);
        }
        graph
    }

    pub fn add(&mut self, group_id: GroupId, member: Member) {
        self.direct.entry(group_id).or_default().push(member);
    }

    /// Records that a group was loaded, even if it has no members.
    pub fn insert_empty(&mut self, group_id: GroupId) {
        self.direct.entry(group_id).or_default();
    }

    pub fn contains(&self, group_id: &GroupId) -> bool {
        self.direct.contains_key(group_id)
    }

    pub fn direct_members(&self, group_id: &GroupId) -> &[Member] {
        self.direct.get(group_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolves nested groups down to users.
    pub fn flatten(&self, group_id: GroupId) -> BTreeSet<UserId> {
        let mut visited = HashSet::new();
        self.flatten_into(group_id, &mut visited)
    }

    /// Flattens every group independently, each with a fresh visited set.
    pub fn flatten_all(&self) -> BTreeMap<GroupId, BTreeSet<UserId>> {
        self.direct
            .keys()
            .map(|group_id| (*group_id, self.flatten(*group_id)))
            .collect()
    }

    fn flatten_into(&self, group_id: GroupId, visited: &mut HashSet<GroupId>) -> BTreeSet<UserId> {
        if !visited.insert(group_id) {
            return BTreeSet::new();
        }

        let mut users = BTreeSet::new();
        for member in self.direct_members(&group_id) {
            match member {
                Member::User(user_id) => {
                    users.insert(*user_id);
                }
                Member::Group(nested) => {
                    users.extend(self.flatten_into(*nested, visited));
                }
            }
        }
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn gid() -> GroupId {
        GroupId::new(Uuid::new_v4())
    }

    fn uid() -> UserId {
        UserId::new(Uuid::new_v4())
    }

    #[test]
    fn nested_group_users_surface_in_parent() {
        let (group_a, group_b) = (gid(), gid());
        let (user_x, user_y) = (uid(), uid());
        let mut graph = MembershipGraph::new();
        graph.add(group_a, Member::User(user_x));
        graph.add(group_a, Member::Group(group_b));
        graph.add(group_b, Member::User(user_y));

        let flat = graph.flatten(group_a);

        assert_eq!(flat, BTreeSet::from([user_x, user_y]));
    }

    #[test]
    fn self_nested_group_terminates() {
        let group_a = gid();
        let user_x = uid();
        let mut graph = MembershipGraph::new();
        graph.add(group_a, Member::User(user_x));
        graph.add(group_a, Member::Group(group_a));

        let flat = graph.flatten(group_a);

        assert_eq!(flat, BTreeSet::from([user_x]));
    }

    #[test]
    fn mutual_nesting_terminates_and_unions_both() {
        let (group_a, group_b) = (gid(), gid());
        let (user_x, user_y) = (uid(), uid());
        let mut graph = MembershipGraph::new();
        graph.add(group_a, Member::User(user_x));
        graph.add(group_a, Member::Group(group_b));
        graph.add(group_b, Member::User(user_y));
        graph.add(group_b, Member::Group(group_a));

        assert_eq!(graph.flatten(group_a), BTreeSet::from([user_x, user_y]));
        assert_eq!(graph.flatten(group_b), BTreeSet::from([user_x, user_y]));
    }

    #[test]
    fn user_three_levels_deep_appears_in_every_enclosing_group() {
        let (outer, middle, inner) = (gid(), gid(), gid());
        let deep = uid();
        let mut graph = MembershipGraph::new();
        graph.add(outer, Member::Group(middle));
        graph.add(middle, Member::Group(inner));
        graph.add(inner, Member::User(deep));

        let all = graph.flatten_all();

        assert!(all[&outer].contains(&deep));
        assert!(all[&middle].contains(&deep));
        assert!(all[&inner].contains(&deep));
    }

    #[test]
    fn diamond_nesting_counts_each_user_once() {
        let (top, left, right, bottom) = (gid(), gid(), gid(), gid());
        let shared = uid();
        let mut graph = MembershipGraph::new();
        graph.add(top, Member::Group(left));
        graph.add(top, Member::Group(right));
        graph.add(left, Member::Group(bottom));
        graph.add(right, Member::Group(bottom));
        graph.add(bottom, Member::User(shared));

        assert_eq!(graph.flatten(top), BTreeSet::from([shared]));
    }

    #[test]
    fn unknown_group_flattens_to_empty() {
        let graph = MembershipGraph::new();

        assert!(graph.flatten(gid()).is_empty());
    }

    #[test]
    fn empty_group_is_kept_in_flatten_all() {
        let lonely = gid();
        let mut graph = MembershipGraph::new();
        graph.insert_empty(lonely);

        let all = graph.flatten_all();

        assert!(all.contains_key(&lonely));
        assert!(all[&lonely].is_empty());
    }
}
