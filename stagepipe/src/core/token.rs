//! Values carried on the edges between stages.

use crate::errors::FailureDescriptor;

/// One message on an edge.
///
/// Every worker of the producing stage sends exactly one `Done` on each of
/// its edges when it exits, so a consumer knows its input is exhausted once it
/// has counted as many `Done` tokens as the producer has workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<T> {
    /// A data item.
    Item(T),
    /// One upstream worker finished.
    Done,
    /// An upstream worker recorded a failure.
    Failed(FailureDescriptor),
}
