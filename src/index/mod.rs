//! Collection-to-index mapping, field mappings and write visibility.

pub mod manager;
pub mod mapping;
pub mod naming;
pub mod refresh;

pub use manager::IndexManager;
pub use mapping::{FieldKind, IndexMapping};
pub use naming::IndexNaming;
pub use refresh::RefreshPolicy;
