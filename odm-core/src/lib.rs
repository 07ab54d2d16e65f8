mod backoff;
mod drive;
mod gdrive;
mod graph;
mod http;
mod local;
pub mod quickxor;

pub use backoff::Backoff;
pub use drive::{DriveError, Lookup, RemoteDriveClient, UploadTarget};
pub use gdrive::{DriveFile, GoogleDriveClient};
pub use graph::GraphClient;
pub use local::LocalDriveClient;
pub use quickxor::QuickXorHash;
