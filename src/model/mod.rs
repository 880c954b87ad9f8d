pub mod common;
pub mod diff;
pub mod document;
pub mod fingerprint;
pub mod locator;
pub mod revision;
pub mod user_context;

pub use common::*;
pub use diff::*;
pub use document::*;
pub use fingerprint::*;
pub use locator::*;
pub use revision::*;
pub use user_context::*;
