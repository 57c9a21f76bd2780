//! Service layer for business logic and orchestration.
//!
//! Services sit between the repositories and the HTTP layer. They run inside a
//! transaction opened by a repository and never talk to the database directly.

pub mod error;
pub mod sex_tokens;
pub mod sync;

pub use error::{SyncError, SyncResult};
pub use sex_tokens::{bridge_to_legacy, normalize_sex, SexKind, SexVocabulary};
pub use sync::{
    delete_single_range, insert_single_range, list_ranges, load_unified, sync_parameters,
    update_single_range, SyncOutcome,
};
