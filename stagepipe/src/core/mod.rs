//! Core value types shared by the queue network and the workers.

mod bag;
mod info;
mod status;
mod token;

pub use bag::WorkerBag;
pub use info::{StageStatus, WorkerInfo};
pub use status::{StageKind, Substrate};
pub use token::Token;
