use std::fmt;

use uuid::Uuid;

use crate::permission::FieldAccess;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(UserId);
uuid_id!(ProfileId);
uuid_id!(PermissionSetId);
uuid_id!(ObjectId);
uuid_id!(FieldId);
uuid_id!(RoleId);
uuid_id!(GroupId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionSetType {
    Grant,
    Deny,
}

impl PermissionSetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Deny => "deny",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "grant" => Some(Self::Grant),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionSet {
    pub id: PermissionSetId,
    pub ps_type: PermissionSetType,
}

/// CRUD bitmask granted (or denied) on one object by one permission set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPermission {
    pub permission_set_id: PermissionSetId,
    pub object_id: ObjectId,
    pub permissions: u8,
}

/// Read/Write bitmask granted (or denied) on one field by one permission set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPermission {
    pub permission_set_id: PermissionSetId,
    pub field_id: FieldId,
    pub permissions: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: ProfileId,
    pub base_permission_set_id: PermissionSetId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub profile_id: ProfileId,
    pub role_id: Option<RoleId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub id: RoleId,
    pub parent_id: Option<RoleId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub id: FieldId,
    pub name: String,
}

/// An object together with every field defined on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFields {
    pub object_id: ObjectId,
    pub fields: Vec<FieldDef>,
}

/// Reference field flagged as composition: `child` records are structurally owned by `parent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositionEdge {
    pub child_object_id: ObjectId,
    pub parent_object_id: ObjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupType {
    Public,
    Role,
    RoleAndSubordinates,
    Personal,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Role => "role",
            Self::RoleAndSubordinates => "role_and_subordinates",
            Self::Personal => "personal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(Self::Public),
            "role" => Some(Self::Role),
            "role_and_subordinates" => Some(Self::RoleAndSubordinates),
            "personal" => Some(Self::Personal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub group_type: GroupType,
    pub related_role_id: Option<RoleId>,
    pub related_user_id: Option<UserId>,
}

/// A group member is either a user or a nested group, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Member {
    User(UserId),
    Group(GroupId),
}

impl Member {
    /// Builds a member from the two nullable columns of a membership row.
    pub fn from_columns(user: Option<UserId>, group: Option<GroupId>) -> Option<Self> {
        match (user, group) {
            (Some(u), None) => Some(Self::User(u)),
            (None, Some(g)) => Some(Self::Group(g)),
            _ => None,
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Group(id) => write!(f, "group:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMember {
    pub group_id: GroupId,
    pub member: Member,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveOls {
    pub user_id: UserId,
    pub object_id: ObjectId,
    pub permissions: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveFls {
    pub user_id: UserId,
    pub field_id: FieldId,
    pub permissions: u8,
}

/// Names of the fields on one object a user may read (or write), ordered by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveFieldList {
    pub user_id: UserId,
    pub object_id: ObjectId,
    pub mask: FieldAccess,
    pub field_names: Vec<String>,
}

/// Full OLS/FLS result for one user; replaces that user's cache rows as a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectivePermissions {
    pub ols: Vec<EffectiveOls>,
    pub fls: Vec<EffectiveFls>,
    pub field_lists: Vec<EffectiveFieldList>,
}

impl EffectivePermissions {
    pub fn row_count(&self) -> usize {
        self.ols.len() + self.fls.len() + self.field_lists.len()
    }
}
