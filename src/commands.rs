//! Commands for the `treesnap` tool.

mod build;

pub use self::build::*;
