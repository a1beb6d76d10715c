//! File system access: enumeration, metadata capture and space preflight.

pub mod metadata;
pub mod space;
pub mod walker;

pub use space::{DiskSpaceProbe, SpaceChecker, SpaceProbe};
pub use walker::{FileEntry, SourceWalker, WalkResult, WalkTotals};
