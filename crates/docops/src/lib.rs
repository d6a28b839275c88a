/// Line-aware document operations for operational transform
/// An operation is a sequence of retain, retain-line, insert and delete
/// components walked left to right over a document's characters.
use thiserror::Error;

mod component;
pub use component::*;

mod builder;
pub use builder::*;

mod apply;
pub use apply::*;

mod lines;

mod compose;
pub use compose::*;

mod transform;
pub use transform::*;

mod position;
pub use position::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocOpError {
    #[error("malformed operation: {0}")]
    MalformedOperation(String),

    #[error("incompatible operations: {0}")]
    IncompatibleOperation(String),
}

pub type Result<T> = std::result::Result<T, DocOpError>;
