//! Domain model shared by the store, the mapper, and the gateways.

mod mapping;
mod member;
mod registry;
mod status;
mod task;

pub use mapping::{ForgeIssueRef, Mapping, SheetRecordRef, SyncStatus};
pub use member::{Member, MemberRole, MemberStatus};
pub use registry::{FieldMap, SheetTableRef, TableRegistryEntry};
pub use status::{CloseReason, IssueState, Priority, StateReason, TaskSource, TaskStatus};
pub use task::Task;
