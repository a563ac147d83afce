use sqlx::PgPool;

use super::queries::to_storage_error;
use crate::traits::StorageError;

const MAX_CHANNEL_LEN: usize = 63;

/// Channel names are spliced into trigger DDL, so only plain identifiers pass.
pub fn validate_channel_name(name: &str) -> Result<(), StorageError> {
    let is_valid = !name.is_empty()
        && name.len() <= MAX_CHANNEL_LEN
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !is_valid {
        return Err(StorageError::Internal(format!(
            "invalid notification channel name: {name}"
        )));
    }
    Ok(())
}

const RAW_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS permission_sets (
        id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name        TEXT NOT NULL UNIQUE,
        ps_type     TEXT NOT NULL CHECK (ps_type IN ('grant', 'deny')),
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS objects (
        id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        api_name    TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fields (
        id                  UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        object_id           UUID NOT NULL REFERENCES objects(id) ON DELETE CASCADE,
        api_name            TEXT NOT NULL,
        reference_object_id UUID REFERENCES objects(id) ON DELETE SET NULL,
        is_composition      BOOLEAN NOT NULL DEFAULT false,
        UNIQUE (object_id, api_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS object_permissions (
        permission_set_id   UUID NOT NULL REFERENCES permission_sets(id) ON DELETE CASCADE,
        object_id           UUID NOT NULL REFERENCES objects(id) ON DELETE CASCADE,
        permissions         SMALLINT NOT NULL CHECK (permissions BETWEEN 0 AND 15),
        PRIMARY KEY (permission_set_id, object_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS field_permissions (
        permission_set_id   UUID NOT NULL REFERENCES permission_sets(id) ON DELETE CASCADE,
        field_id            UUID NOT NULL REFERENCES fields(id) ON DELETE CASCADE,
        permissions         SMALLINT NOT NULL CHECK (permissions BETWEEN 0 AND 3),
        PRIMARY KEY (permission_set_id, field_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS profiles (
        id                      UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name                    TEXT NOT NULL UNIQUE,
        base_permission_set_id  UUID NOT NULL REFERENCES permission_sets(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS roles (
        id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name        TEXT NOT NULL UNIQUE,
        parent_id   UUID REFERENCES roles(id) ON DELETE SET NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        profile_id  UUID NOT NULL REFERENCES profiles(id),
        role_id     UUID REFERENCES roles(id) ON DELETE SET NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS permission_set_to_users (
        permission_set_id   UUID NOT NULL REFERENCES permission_sets(id) ON DELETE CASCADE,
        user_id             UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        PRIMARY KEY (permission_set_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS groups (
        id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        group_type      TEXT NOT NULL
                        CHECK (group_type IN
                            ('public', 'role', 'role_and_subordinates', 'personal')),
        related_role_id UUID REFERENCES roles(id) ON DELETE CASCADE,
        related_user_id UUID REFERENCES users(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS group_members (
        id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        group_id        UUID NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
        member_user_id  UUID REFERENCES users(id) ON DELETE CASCADE,
        member_group_id UUID REFERENCES groups(id) ON DELETE CASCADE,
        CHECK ((member_user_id IS NULL) <> (member_group_id IS NULL))
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_group_members_group
    ON group_members (group_id)
    "#,
];

const CACHE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS effective_ols (
        user_id     UUID NOT NULL,
        object_id   UUID NOT NULL,
        permissions SMALLINT NOT NULL,
        computed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (user_id, object_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS effective_fls (
        user_id     UUID NOT NULL,
        field_id    UUID NOT NULL,
        permissions SMALLINT NOT NULL,
        computed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (user_id, field_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS effective_field_lists (
        user_id     UUID NOT NULL,
        object_id   UUID NOT NULL,
        mask        SMALLINT NOT NULL CHECK (mask IN (1, 2)),
        field_names TEXT[] NOT NULL,
        computed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (user_id, object_id, mask)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS effective_role_hierarchy (
        ancestor_role_id    UUID NOT NULL,
        descendant_role_id  UUID NOT NULL,
        depth               INTEGER NOT NULL,
        PRIMARY KEY (ancestor_role_id, descendant_role_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_role_hierarchy_descendant
    ON effective_role_hierarchy (descendant_role_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS effective_visible_owners (
        user_id             UUID NOT NULL,
        visible_owner_id    UUID NOT NULL,
        PRIMARY KEY (user_id, visible_owner_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS effective_group_members (
        group_id    UUID NOT NULL,
        user_id     UUID NOT NULL,
        PRIMARY KEY (group_id, user_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_effective_group_members_user
    ON effective_group_members (user_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS effective_object_hierarchy (
        ancestor_object_id      UUID NOT NULL,
        descendant_object_id    UUID NOT NULL,
        depth                   INTEGER NOT NULL,
        PRIMARY KEY (ancestor_object_id, descendant_object_id)
    )
    "#,
];

const OUTBOX_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS outbox_events (
        id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        seq             BIGSERIAL NOT NULL UNIQUE,
        event_type      TEXT NOT NULL,
        entity_type     TEXT NOT NULL,
        entity_id       UUID NOT NULL,
        payload         JSONB NOT NULL DEFAULT 'null'::jsonb,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        processed_at    TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_events_pending
    ON outbox_events (seq)
    WHERE processed_at IS NULL
    "#,
    r#"
    CREATE OR REPLACE FUNCTION notify_outbox_event() RETURNS trigger AS $$
    BEGIN
        PERFORM pg_notify(TG_ARGV[0], NEW.id::text);
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    "#,
];

pub async fn run_migrations(pool: &PgPool, channel: &str) -> Result<(), StorageError> {
    validate_channel_name(channel)?;

    for statement in RAW_TABLES.iter().chain(CACHE_TABLES).chain(OUTBOX_TABLES) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(to_storage_error)?;
    }

    sqlx::query("DROP TRIGGER IF EXISTS outbox_events_notify ON outbox_events")
        .execute(pool)
        .await
        .map_err(to_storage_error)?;

    // pg_notify inside the trigger is delivered on commit, never before the row is visible.
    let create_trigger = format!(
        r#"
        CREATE TRIGGER outbox_events_notify
        AFTER INSERT ON outbox_events
        FOR EACH ROW EXECUTE FUNCTION notify_outbox_event('{channel}')
        "#
    );
    sqlx::query(&create_trigger)
        .execute(pool)
        .await
        .map_err(to_storage_error)?;

    Ok(())
}
