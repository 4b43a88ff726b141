pub mod error;

pub use error::{ObjectKind, Result, VmError};
