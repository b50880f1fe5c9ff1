//! Internal entity types mirrored from the remote feed.
//!
//! Everything the pipeline reads or writes is expressed in these types;
//! the wire shape only exists inside the mapper.

mod history;
mod listing;
mod media;
mod party;
mod resource;
mod run;

pub use history::{ChangeLogEntry, PriceChange, StatusChange};
pub use listing::{Listing, Room, UnitType};
pub use media::{MediaAsset, MediaDownloadAudit, MediaStatus};
pub use party::{LookupValue, Member, Office, OpenHouse};
pub use resource::ResourceKind;
pub use run::{ReplicationRun, RequestKind, RequestLogEntry, RunCounters, RunMode, RunStatus};
