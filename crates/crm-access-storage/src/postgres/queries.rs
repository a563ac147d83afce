use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crm_access_core::hierarchy::ClosureEdge;
use crm_access_core::model::{
    CompositionEdge, EffectiveFieldList, EffectiveFls, EffectiveOls, FieldDef, FieldId,
    FieldPermission, Group, GroupId, GroupMember, GroupType, Member, ObjectFields, ObjectId,
    ObjectPermission, PermissionSet, PermissionSetId, PermissionSetType, Profile, ProfileId, Role,
    RoleId, User, UserId,
};
use crm_access_core::outbox::{EventId, EventType, NewOutboxEvent, OutboxEvent};
use crm_access_core::permission::{FieldAccess, check_field_bitmask, check_object_bitmask};

use crate::traits::StorageError;

pub(crate) fn to_storage_error(e: sqlx::Error) -> StorageError {
    StorageError::Internal(e.to_string())
}

fn uuids<T>(ids: &[T], f: impl Fn(&T) -> &Uuid) -> Vec<Uuid> {
    ids.iter().map(|id| *f(id)).collect()
}

pub async fn get_user<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    user_id: &UserId,
) -> Result<Option<User>, StorageError> {
    let row: Option<(Uuid, Uuid, Option<Uuid>)> =
        sqlx::query_as("SELECT id, profile_id, role_id FROM users WHERE id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(executor)
            .await
            .map_err(to_storage_error)?;

    Ok(row.map(|(id, profile_id, role_id)| User {
        id: id.into(),
        profile_id: profile_id.into(),
        role_id: role_id.map(RoleId::from),
    }))
}

pub async fn list_users<'e>(
    executor: impl sqlx::PgExecutor<'e>,
) -> Result<Vec<User>, StorageError> {
    let rows: Vec<(Uuid, Uuid, Option<Uuid>)> =
        sqlx::query_as("SELECT id, profile_id, role_id FROM users ORDER BY id")
            .fetch_all(executor)
            .await
            .map_err(to_storage_error)?;

    Ok(rows
        .into_iter()
        .map(|(id, profile_id, role_id)| User {
            id: id.into(),
            profile_id: profile_id.into(),
            role_id: role_id.map(RoleId::from),
        })
        .collect())
}

pub async fn get_profile<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    profile_id: &ProfileId,
) -> Result<Option<Profile>, StorageError> {
    let row: Option<(Uuid, Uuid)> =
        sqlx::query_as("SELECT id, base_permission_set_id FROM profiles WHERE id = $1")
            .bind(profile_id.as_uuid())
            .fetch_optional(executor)
            .await
            .map_err(to_storage_error)?;

    Ok(row.map(|(id, base)| Profile {
        id: id.into(),
        base_permission_set_id: base.into(),
    }))
}

pub async fn list_assigned_permission_sets<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    user_id: &UserId,
) -> Result<Vec<PermissionSetId>, StorageError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT permission_set_id FROM permission_set_to_users WHERE user_id = $1",
    )
    .bind(user_id.as_uuid())
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    Ok(rows.into_iter().map(|(id,)| id.into()).collect())
}

pub async fn get_permission_sets<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    ids: &[PermissionSetId],
) -> Result<Vec<PermissionSet>, StorageError> {
    let rows: Vec<(Uuid, String)> =
        sqlx::query_as("SELECT id, ps_type FROM permission_sets WHERE id = ANY($1)")
            .bind(uuids(ids, PermissionSetId::as_uuid))
            .fetch_all(executor)
            .await
            .map_err(to_storage_error)?;

    rows.into_iter()
        .map(|(id, ps_type)| -> Result<PermissionSet, StorageError> {
            let ps_type =
                PermissionSetType::parse(&ps_type).ok_or_else(|| StorageError::InvalidRow {
                    table: "permission_sets",
                    detail: format!("unknown ps_type '{ps_type}'"),
                })?;
            Ok(PermissionSet {
                id: id.into(),
                ps_type,
            })
        })
        .collect()
}

pub async fn list_object_permissions<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    ids: &[PermissionSetId],
) -> Result<Vec<ObjectPermission>, StorageError> {
    let rows: Vec<(Uuid, Uuid, i16)> = sqlx::query_as(
        r#"SELECT permission_set_id, object_id, permissions
           FROM object_permissions
           WHERE permission_set_id = ANY($1)"#,
    )
    .bind(uuids(ids, PermissionSetId::as_uuid))
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    rows.into_iter()
        .map(|(ps, object, perms)| -> Result<ObjectPermission, StorageError> {
            Ok(ObjectPermission {
                permission_set_id: ps.into(),
                object_id: object.into(),
                permissions: check_object_bitmask(i64::from(perms))?,
            })
        })
        .collect()
}

pub async fn list_field_permissions<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    ids: &[PermissionSetId],
) -> Result<Vec<FieldPermission>, StorageError> {
    let rows: Vec<(Uuid, Uuid, i16)> = sqlx::query_as(
        r#"SELECT permission_set_id, field_id, permissions
           FROM field_permissions
           WHERE permission_set_id = ANY($1)"#,
    )
    .bind(uuids(ids, PermissionSetId::as_uuid))
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    rows.into_iter()
        .map(|(ps, field, perms)| -> Result<FieldPermission, StorageError> {
            Ok(FieldPermission {
                permission_set_id: ps.into(),
                field_id: field.into(),
                permissions: check_field_bitmask(i64::from(perms))?,
            })
        })
        .collect()
}

pub async fn list_objects_with_fields<'e>(
    executor: impl sqlx::PgExecutor<'e>,
) -> Result<Vec<ObjectFields>, StorageError> {
    let rows: Vec<(Uuid, Option<Uuid>, Option<String>)> = sqlx::query_as(
        r#"SELECT o.id, f.id, f.api_name
           FROM objects o
           LEFT JOIN fields f ON f.object_id = o.id
           ORDER BY o.id, f.api_name"#,
    )
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    let mut objects: BTreeMap<Uuid, Vec<FieldDef>> = BTreeMap::new();
    for (object_id, field_id, name) in rows {
        let fields = objects.entry(object_id).or_default();
        if let (Some(id), Some(name)) = (field_id, name) {
            fields.push(FieldDef {
                id: FieldId::from(id),
                name,
            });
        }
    }

    Ok(objects
        .into_iter()
        .map(|(object_id, fields)| ObjectFields {
            object_id: object_id.into(),
            fields,
        })
        .collect())
}

pub async fn list_users_assigned_permission_set<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    permission_set_id: &PermissionSetId,
) -> Result<Vec<UserId>, StorageError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT user_id FROM permission_set_to_users WHERE permission_set_id = $1",
    )
    .bind(permission_set_id.as_uuid())
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    Ok(rows.into_iter().map(|(id,)| id.into()).collect())
}

pub async fn list_users_with_base_permission_set<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    permission_set_id: &PermissionSetId,
) -> Result<Vec<UserId>, StorageError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"SELECT u.id
           FROM users u
           JOIN profiles p ON p.id = u.profile_id
           WHERE p.base_permission_set_id = $1"#,
    )
    .bind(permission_set_id.as_uuid())
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    Ok(rows.into_iter().map(|(id,)| id.into()).collect())
}

pub async fn list_roles<'e>(
    executor: impl sqlx::PgExecutor<'e>,
) -> Result<Vec<Role>, StorageError> {
    let rows: Vec<(Uuid, Option<Uuid>)> = sqlx::query_as("SELECT id, parent_id FROM roles")
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;

    Ok(rows
        .into_iter()
        .map(|(id, parent)| Role {
            id: id.into(),
            parent_id: parent.map(RoleId::from),
        })
        .collect())
}

pub async fn list_role_descendants<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    role_id: &RoleId,
) -> Result<Vec<RoleId>, StorageError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT descendant_role_id FROM effective_role_hierarchy WHERE ancestor_role_id = $1",
    )
    .bind(role_id.as_uuid())
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    Ok(rows.into_iter().map(|(id,)| id.into()).collect())
}

fn decode_group(
    (id, group_type, related_role, related_user): (Uuid, String, Option<Uuid>, Option<Uuid>),
) -> Result<Group, StorageError> {
    let group_type = GroupType::parse(&group_type).ok_or_else(|| StorageError::InvalidRow {
        table: "groups",
        detail: format!("unknown group_type '{group_type}'"),
    })?;
    Ok(Group {
        id: id.into(),
        group_type,
        related_role_id: related_role.map(RoleId::from),
        related_user_id: related_user.map(UserId::from),
    })
}

pub async fn list_groups<'e>(
    executor: impl sqlx::PgExecutor<'e>,
) -> Result<Vec<Group>, StorageError> {
    let rows: Vec<(Uuid, String, Option<Uuid>, Option<Uuid>)> = sqlx::query_as(
        "SELECT id, group_type, related_role_id, related_user_id FROM groups ORDER BY id",
    )
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    rows.into_iter().map(decode_group).collect()
}

pub async fn get_group<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    group_id: &GroupId,
) -> Result<Option<Group>, StorageError> {
    let row: Option<(Uuid, String, Option<Uuid>, Option<Uuid>)> = sqlx::query_as(
        "SELECT id, group_type, related_role_id, related_user_id FROM groups WHERE id = $1",
    )
    .bind(group_id.as_uuid())
    .fetch_optional(executor)
    .await
    .map_err(to_storage_error)?;

    row.map(decode_group).transpose()
}

pub async fn list_group_members<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    group_id: &GroupId,
) -> Result<Vec<GroupMember>, StorageError> {
    let rows: Vec<(Option<Uuid>, Option<Uuid>)> = sqlx::query_as(
        "SELECT member_user_id, member_group_id FROM group_members WHERE group_id = $1",
    )
    .bind(group_id.as_uuid())
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    rows.into_iter()
        .map(|(user, group)| -> Result<GroupMember, StorageError> {
            let member = Member::from_columns(user.map(UserId::from), group.map(GroupId::from))
                .ok_or_else(|| StorageError::InvalidRow {
                    table: "group_members",
                    detail: format!("group {group_id} has a member row with both or neither ids"),
                })?;
            Ok(GroupMember {
                group_id: *group_id,
                member,
            })
        })
        .collect()
}

pub async fn list_object_ids<'e>(
    executor: impl sqlx::PgExecutor<'e>,
) -> Result<Vec<ObjectId>, StorageError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM objects ORDER BY id")
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;

    Ok(rows.into_iter().map(|(id,)| id.into()).collect())
}

pub async fn list_composition_edges<'e>(
    executor: impl sqlx::PgExecutor<'e>,
) -> Result<Vec<CompositionEdge>, StorageError> {
    let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
        r#"SELECT object_id, reference_object_id
           FROM fields
           WHERE is_composition AND reference_object_id IS NOT NULL"#,
    )
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    Ok(rows
        .into_iter()
        .map(|(child, parent)| CompositionEdge {
            child_object_id: child.into(),
            parent_object_id: parent.into(),
        })
        .collect())
}

pub async fn delete_user_permissions(
    conn: &mut sqlx::PgConnection,
    user_id: &UserId,
) -> Result<(), StorageError> {
    for table in ["effective_ols", "effective_fls", "effective_field_lists"] {
        let query = format!("DELETE FROM {table} WHERE user_id = $1");
        sqlx::query(&query)
            .bind(user_id.as_uuid())
            .execute(&mut *conn)
            .await
            .map_err(to_storage_error)?;
    }
    Ok(())
}

pub async fn insert_effective_ols<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    user_id: &UserId,
    rows: &[EffectiveOls],
) -> Result<(), StorageError> {
    let object_ids: Vec<Uuid> = rows.iter().map(|r| *r.object_id.as_uuid()).collect();
    let perms: Vec<i16> = rows.iter().map(|r| i16::from(r.permissions)).collect();
    sqlx::query(
        r#"INSERT INTO effective_ols (user_id, object_id, permissions)
           SELECT $1, t.object_id, t.permissions
           FROM UNNEST($2::uuid[], $3::smallint[]) AS t(object_id, permissions)"#,
    )
    .bind(user_id.as_uuid())
    .bind(object_ids)
    .bind(perms)
    .execute(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(())
}

pub async fn insert_effective_fls<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    user_id: &UserId,
    rows: &[EffectiveFls],
) -> Result<(), StorageError> {
    let field_ids: Vec<Uuid> = rows.iter().map(|r| *r.field_id.as_uuid()).collect();
    let perms: Vec<i16> = rows.iter().map(|r| i16::from(r.permissions)).collect();
    sqlx::query(
        r#"INSERT INTO effective_fls (user_id, field_id, permissions)
           SELECT $1, t.field_id, t.permissions
           FROM UNNEST($2::uuid[], $3::smallint[]) AS t(field_id, permissions)"#,
    )
    .bind(user_id.as_uuid())
    .bind(field_ids)
    .bind(perms)
    .execute(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(())
}

pub async fn insert_field_list<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    row: &EffectiveFieldList,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"INSERT INTO effective_field_lists (user_id, object_id, mask, field_names)
           VALUES ($1, $2, $3, $4)"#,
    )
    .bind(row.user_id.as_uuid())
    .bind(row.object_id.as_uuid())
    .bind(i16::from(row.mask.bit()))
    .bind(&row.field_names)
    .execute(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(())
}

/// Shared shape of the two closure tables.
pub(crate) struct ClosureTable {
    pub table: &'static str,
    pub ancestor: &'static str,
    pub descendant: &'static str,
}

pub(crate) const ROLE_HIERARCHY: ClosureTable = ClosureTable {
    table: "effective_role_hierarchy",
    ancestor: "ancestor_role_id",
    descendant: "descendant_role_id",
};

pub(crate) const OBJECT_HIERARCHY: ClosureTable = ClosureTable {
    table: "effective_object_hierarchy",
    ancestor: "ancestor_object_id",
    descendant: "descendant_object_id",
};

pub async fn replace_closure(
    conn: &mut sqlx::PgConnection,
    target: &ClosureTable,
    edges: &[(Uuid, Uuid, u32)],
) -> Result<(), StorageError> {
    let ClosureTable {
        table,
        ancestor,
        descendant,
    } = target;

    sqlx::query(&format!("DELETE FROM {table}"))
        .execute(&mut *conn)
        .await
        .map_err(to_storage_error)?;

    let ancestors: Vec<Uuid> = edges.iter().map(|e| e.0).collect();
    let descendants: Vec<Uuid> = edges.iter().map(|e| e.1).collect();
    let depths = edges
        .iter()
        .map(|e| i32::try_from(e.2))
        .collect::<Result<Vec<i32>, _>>()
        .map_err(|e| StorageError::Internal(format!("closure depth overflow: {e}")))?;

    let insert = format!(
        r#"INSERT INTO {table} ({ancestor}, {descendant}, depth)
           SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::int4[])"#
    );
    sqlx::query(&insert)
        .bind(ancestors)
        .bind(descendants)
        .bind(depths)
        .execute(&mut *conn)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

pub async fn read_closure<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    target: &ClosureTable,
) -> Result<Vec<(Uuid, Uuid, u32)>, StorageError> {
    let ClosureTable {
        table,
        ancestor,
        descendant,
    } = target;
    let query = format!("SELECT {ancestor}, {descendant}, depth FROM {table}");
    let rows: Vec<(Uuid, Uuid, i32)> = sqlx::query_as(&query)
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;

    rows.into_iter()
        .map(|(a, d, depth)| -> Result<(Uuid, Uuid, u32), StorageError> {
            let depth = u32::try_from(depth).map_err(|_| StorageError::InvalidRow {
                table: target.table,
                detail: format!("negative depth {depth}"),
            })?;
            Ok((a, d, depth))
        })
        .collect()
}

pub fn closure_rows<T>(
    edges: &[ClosureEdge<T>],
    f: impl Fn(&T) -> &Uuid,
) -> Vec<(Uuid, Uuid, u32)> {
    edges
        .iter()
        .map(|e| (*f(&e.ancestor), *f(&e.descendant), e.depth))
        .collect()
}

pub async fn replace_visible_owners(
    conn: &mut sqlx::PgConnection,
    user_id: &UserId,
    owners: &BTreeSet<UserId>,
) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM effective_visible_owners WHERE user_id = $1")
        .bind(user_id.as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(to_storage_error)?;

    let owner_ids: Vec<Uuid> = owners.iter().map(|o| *o.as_uuid()).collect();
    sqlx::query(
        r#"INSERT INTO effective_visible_owners (user_id, visible_owner_id)
           SELECT $1, owner FROM UNNEST($2::uuid[]) AS owner"#,
    )
    .bind(user_id.as_uuid())
    .bind(owner_ids)
    .execute(&mut *conn)
    .await
    .map_err(to_storage_error)?;
    Ok(())
}

pub async fn delete_group_members<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    group_id: Option<&GroupId>,
) -> Result<(), StorageError> {
    match group_id {
        Some(id) => sqlx::query("DELETE FROM effective_group_members WHERE group_id = $1")
            .bind(id.as_uuid())
            .execute(executor)
            .await,
        None => {
            sqlx::query("DELETE FROM effective_group_members")
                .execute(executor)
                .await
        }
    }
    .map_err(to_storage_error)?;
    Ok(())
}

pub async fn insert_group_members<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    pairs: &[(Uuid, Uuid)],
) -> Result<(), StorageError> {
    let groups: Vec<Uuid> = pairs.iter().map(|p| p.0).collect();
    let users: Vec<Uuid> = pairs.iter().map(|p| p.1).collect();
    sqlx::query(
        r#"INSERT INTO effective_group_members (group_id, user_id)
           SELECT * FROM UNNEST($1::uuid[], $2::uuid[])"#,
    )
    .bind(groups)
    .bind(users)
    .execute(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(())
}

pub async fn read_effective_ols<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    user_id: &UserId,
) -> Result<Vec<EffectiveOls>, StorageError> {
    let rows: Vec<(Uuid, i16)> = sqlx::query_as(
        "SELECT object_id, permissions FROM effective_ols WHERE user_id = $1 ORDER BY object_id",
    )
    .bind(user_id.as_uuid())
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    rows.into_iter()
        .map(|(object, perms)| -> Result<EffectiveOls, StorageError> {
            Ok(EffectiveOls {
                user_id: *user_id,
                object_id: object.into(),
                permissions: check_object_bitmask(i64::from(perms))?,
            })
        })
        .collect()
}

pub async fn read_effective_fls<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    user_id: &UserId,
) -> Result<Vec<EffectiveFls>, StorageError> {
    let rows: Vec<(Uuid, i16)> = sqlx::query_as(
        "SELECT field_id, permissions FROM effective_fls WHERE user_id = $1 ORDER BY field_id",
    )
    .bind(user_id.as_uuid())
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    rows.into_iter()
        .map(|(field, perms)| -> Result<EffectiveFls, StorageError> {
            Ok(EffectiveFls {
                user_id: *user_id,
                field_id: field.into(),
                permissions: check_field_bitmask(i64::from(perms))?,
            })
        })
        .collect()
}

pub async fn read_field_lists<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    user_id: &UserId,
) -> Result<Vec<EffectiveFieldList>, StorageError> {
    let rows: Vec<(Uuid, i16, Vec<String>)> = sqlx::query_as(
        r#"SELECT object_id, mask, field_names
           FROM effective_field_lists
           WHERE user_id = $1
           ORDER BY object_id, mask"#,
    )
    .bind(user_id.as_uuid())
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    rows.into_iter()
        .map(|(object, mask, field_names)| -> Result<EffectiveFieldList, StorageError> {
            let mask = u8::try_from(mask)
                .ok()
                .and_then(FieldAccess::from_bit)
                .ok_or_else(|| StorageError::InvalidRow {
                    table: "effective_field_lists",
                    detail: format!("unknown mask {mask}"),
                })?;
            Ok(EffectiveFieldList {
                user_id: *user_id,
                object_id: object.into(),
                mask,
                field_names,
            })
        })
        .collect()
}

pub async fn read_visible_owners<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    user_id: &UserId,
) -> Result<BTreeSet<UserId>, StorageError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT visible_owner_id FROM effective_visible_owners WHERE user_id = $1",
    )
    .bind(user_id.as_uuid())
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    Ok(rows.into_iter().map(|(id,)| id.into()).collect())
}

pub async fn read_group_members<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    group_id: &GroupId,
) -> Result<BTreeSet<UserId>, StorageError> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT user_id FROM effective_group_members WHERE group_id = $1")
            .bind(group_id.as_uuid())
            .fetch_all(executor)
            .await
            .map_err(to_storage_error)?;

    Ok(rows.into_iter().map(|(id,)| id.into()).collect())
}

/// Appends an outbox row through whatever executor the caller holds. CRUD
/// services pass their open transaction so the event commits with the write.
pub async fn append_outbox_event<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    event: &NewOutboxEvent,
) -> Result<EventId, StorageError> {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"INSERT INTO outbox_events (event_type, entity_type, entity_id, payload)
           VALUES ($1, $2, $3, $4)
           RETURNING id"#,
    )
    .bind(event.event_type.as_str())
    .bind(&event.entity_type)
    .bind(event.entity_id)
    .bind(&event.payload)
    .fetch_one(executor)
    .await
    .map_err(to_storage_error)?;

    Ok(EventId::new(id))
}

type OutboxRow = (
    Uuid,
    String,
    String,
    Uuid,
    serde_json::Value,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

pub async fn list_unprocessed<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    offset: usize,
    limit: usize,
) -> Result<Vec<OutboxEvent>, StorageError> {
    let offset = i64::try_from(offset).unwrap_or(i64::MAX);
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows: Vec<OutboxRow> = sqlx::query_as(
        r#"SELECT id, event_type, entity_type, entity_id, payload, created_at, processed_at
           FROM outbox_events
           WHERE processed_at IS NULL
           ORDER BY seq
           OFFSET $1
           LIMIT $2"#,
    )
    .bind(offset)
    .bind(limit)
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    Ok(rows
        .into_iter()
        .map(
            |(id, event_type, entity_type, entity_id, payload, created_at, processed_at)| {
                OutboxEvent {
                    id: EventId::new(id),
                    event_type: EventType::from(event_type.as_str()),
                    entity_type,
                    entity_id,
                    payload,
                    created_at,
                    processed_at,
                }
            },
        )
        .collect())
}

pub async fn mark_processed<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    event_id: &EventId,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE outbox_events SET processed_at = now() WHERE id = $1 AND processed_at IS NULL",
    )
    .bind(event_id.as_uuid())
    .execute(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(())
}
