pub mod clean;
pub mod engine;
pub mod paths;
pub mod permissions;
pub mod transfer;
pub mod verify;
