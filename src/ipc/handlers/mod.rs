pub mod accounts;
pub mod core;
pub mod identities;
pub mod legacy_attendance;
pub mod setup;
