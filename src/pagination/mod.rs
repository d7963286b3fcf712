pub mod cursor;
pub mod paginator;

pub use cursor::{CursorCodec, Fingerprint, SortKey};
pub use paginator::{Page, PageHit, Paginator};
