use crm_access_core::model::{ProfileId, UserId};
use crm_access_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum RecomputeError {
    #[error("user {user_id} references missing profile {profile_id}")]
    MissingProfile {
        user_id: UserId,
        profile_id: ProfileId,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("recompute failed: {0}")]
    Recompute(#[from] RecomputeError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
