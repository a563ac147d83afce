pub mod hierarchy;
pub mod membership;
pub mod model;
pub mod outbox;
pub mod permission;
