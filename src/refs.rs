//! Reference commands, their application to a repository namespace, and
//! the read path that advertises current references.

mod advertised;
mod command;
mod update;
mod value;

pub use advertised::{advertised_refs, list_refs, AdvertisedRefs, CAPABILITIES};
pub use command::{RefAction, RefUpdateCommand};
pub use update::{
    initialize_repository, RefStatus, RefUpdateMode, RefUpdateReport, ReferenceUpdateApplier,
    BARE_CONFIG,
};
pub use value::RefValue;

/// Prefix every updatable reference name must carry
pub const REFS_PREFIX: &str = "refs/";

/// Branch HEAD points at in a freshly initialized repository
pub const DEFAULT_HEAD: &str = "refs/heads/master";
