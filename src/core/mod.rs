/// Core data types shared by discovery, selection and the coordinator
pub mod descriptor;
pub mod session;
pub mod target;

pub use descriptor::{ConnectionDescriptor, ConnectionStringSyntax};
pub use session::{SessionState, SnapshotSession};
pub use target::BackupTarget;
