pub mod execution;
pub mod proposal;

pub use execution::*;
pub use proposal::*;
