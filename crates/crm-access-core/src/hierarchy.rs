use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::model::{CompositionEdge, ObjectId, Role, RoleId};

/// One materialized ancestor/descendant pair. Every node has a depth-0 edge to itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClosureEdge<T> {
    pub ancestor: T,
    pub descendant: T,
    pub depth: u32,
}

impl<T> ClosureEdge<T> {
    pub fn new(ancestor: T, descendant: T, depth: u32) -> Self {
        Self {
            ancestor,
            descendant,
            depth,
        }
    }
}

/// Walks upward from every node, emitting one edge per reachable ancestor at its
/// shortest distance.
///
/// Each walk keeps its own visited set, so a cycle that slipped past validation
/// truncates the walk where it closes instead of looping. Nodes that only appear
/// as parents still get walked so their self edges exist.
pub fn transitive_closure<T>(parents: &BTreeMap<T, Vec<T>>) -> Vec<ClosureEdge<T>>
where
    T: Copy + Ord + std::hash::Hash,
{
    let mut nodes: Vec<T> = parents.keys().copied().collect();
    for ps in parents.values() {
        nodes.extend(ps.iter().copied());
    }
    nodes.sort();
    nodes.dedup();

    let mut edges = Vec::new();
    for node in nodes {
        edges.push(ClosureEdge::new(node, node, 0));

        let mut visited = HashSet::from([node]);
        let mut queue = VecDeque::from([(node, 0u32)]);

        while let Some((current, depth)) = queue.pop_front() {
            let Some(ps) = parents.get(&current) else {
                continue;
            };
            for &parent in ps {
                if !visited.insert(parent) {
                    continue;
                }
                edges.push(ClosureEdge::new(parent, node, depth + 1));
                queue.push_back((parent, depth + 1));
            }
        }
    }

    edges
}

pub fn role_closure(roles: &[Role]) -> Vec<ClosureEdge<RoleId>> {
    let mut parents: BTreeMap<RoleId, Vec<RoleId>> = BTreeMap::new();
    for role in roles {
        let entry = parents.entry(role.id).or_default();
        if let Some(parent) = role.parent_id {
            entry.push(parent);
        }
    }
    transitive_closure(&parents)
}

/// Closure over the object composition graph. An object may be composed into
/// more than one parent, so this is a DAG walk rather than a chain walk.
pub fn object_closure(
    objects: &[ObjectId],
    edges: &[CompositionEdge],
) -> Vec<ClosureEdge<ObjectId>> {
    let mut parents: BTreeMap<ObjectId, Vec<ObjectId>> =
        objects.iter().map(|id| (*id, Vec::new())).collect();
    for edge in edges {
        parents
            .entry(edge.child_object_id)
            .or_default()
            .push(edge.parent_object_id);
    }
    for ps in parents.values_mut() {
        ps.sort();
        ps.dedup();
    }
    transitive_closure(&parents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn role(id: RoleId, parent: Option<RoleId>) -> Role {
        Role {
            id,
            parent_id: parent,
        }
    }

    fn new_role_id() -> RoleId {
        RoleId::new(Uuid::new_v4())
    }

    #[test]
    fn chain_of_three_yields_six_edges() {
        let (a, b, c) = (new_role_id(), new_role_id(), new_role_id());
        let roles = vec![role(a, None), role(b, Some(a)), role(c, Some(b))];

        let mut edges = role_closure(&roles);
        edges.sort();

        let mut expected = vec![
            ClosureEdge::new(a, a, 0),
            ClosureEdge::new(b, b, 0),
            ClosureEdge::new(c, c, 0),
            ClosureEdge::new(a, b, 1),
            ClosureEdge::new(b, c, 1),
            ClosureEdge::new(a, c, 2),
        ];
        expected.sort();

        assert_eq!(edges, expected);
    }

    #[test]
    fn every_role_gets_a_self_edge() {
        let roles: Vec<Role> = (0..5).map(|_| role(new_role_id(), None)).collect();

        let edges = role_closure(&roles);

        assert_eq!(edges.len(), 5);
        assert!(
            edges
                .iter()
                .all(|e| e.ancestor == e.descendant && e.depth == 0)
        );
    }

    #[test]
    fn two_node_cycle_terminates_within_bound() {
        let (a, b) = (new_role_id(), new_role_id());
        let roles = vec![role(a, Some(b)), role(b, Some(a))];

        let edges = role_closure(&roles);

        assert!(edges.len() <= 2 * roles.len());
        assert!(edges.contains(&ClosureEdge::new(b, a, 1)));
        assert!(edges.contains(&ClosureEdge::new(a, b, 1)));
    }

    #[test]
    fn self_parented_role_terminates() {
        let a = new_role_id();
        let roles = vec![role(a, Some(a))];

        let edges = role_closure(&roles);

        assert_eq!(edges, vec![ClosureEdge::new(a, a, 0)]);
    }

    #[test]
    fn longer_cycle_is_truncated_per_walk() {
        let (a, b, c) = (new_role_id(), new_role_id(), new_role_id());
        let roles = vec![role(a, Some(c)), role(b, Some(a)), role(c, Some(b))];

        let edges = role_closure(&roles);

        // Each node reaches the other two, plus itself.
        assert_eq!(edges.len(), 9);
        let unique: HashSet<_> = edges.iter().map(|e| (e.ancestor, e.descendant)).collect();
        assert_eq!(unique.len(), edges.len());
    }

    #[test]
    fn siblings_do_not_see_each_other() {
        let (root, left, right) = (new_role_id(), new_role_id(), new_role_id());
        let roles = vec![
            role(root, None),
            role(left, Some(root)),
            role(right, Some(root)),
        ];

        let edges = role_closure(&roles);

        assert!(
            !edges
                .iter()
                .any(|e| e.ancestor == left && e.descendant == right)
        );
        assert!(
            !edges
                .iter()
                .any(|e| e.ancestor == right && e.descendant == left)
        );
        assert_eq!(edges.len(), 5);
    }

    #[test]
    fn object_closure_uses_shortest_depth_across_parents() {
        let account = ObjectId::new(Uuid::new_v4());
        let opportunity = ObjectId::new(Uuid::new_v4());
        let line_item = ObjectId::new(Uuid::new_v4());
        let edges = vec![
            CompositionEdge {
                child_object_id: opportunity,
                parent_object_id: account,
            },
            CompositionEdge {
                child_object_id: line_item,
                parent_object_id: opportunity,
            },
            CompositionEdge {
                child_object_id: line_item,
                parent_object_id: account,
            },
        ];

        let closure = object_closure(&[account, opportunity, line_item], &edges);

        let shortest = ClosureEdge::new(account, line_item, 1);
        let longer = ClosureEdge::new(account, line_item, 2);
        let direct = ClosureEdge::new(opportunity, line_item, 1);
        assert!(closure.contains(&shortest));
        assert!(!closure.contains(&longer));
        assert!(closure.contains(&direct));
        assert_eq!(closure.len(), 6);
    }

    #[test]
    fn object_without_composition_keeps_self_edge() {
        let lone = ObjectId::new(Uuid::new_v4());

        let closure = object_closure(&[lone], &[]);

        assert_eq!(closure, vec![ClosureEdge::new(lone, lone, 0)]);
    }
}
