//! Static analysis of user source: import/require discovery, version-pin
//! comments, and peer-import injection.

pub mod scanner;
pub mod writer;

pub use scanner::{scan, ModuleMap};
pub use writer::{insert, write};
