pub mod command;
pub mod coordinator;
pub mod diff;
pub mod outcome;
pub mod resolver;
pub mod validate;

pub use command::*;
pub use coordinator::*;
pub use diff::*;
pub use outcome::*;
pub use resolver::*;
pub use validate::*;
