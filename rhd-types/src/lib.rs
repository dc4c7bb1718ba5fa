pub mod block;
pub mod board;
pub mod error;
pub mod layout;

pub use block::*;
pub use board::*;
pub use error::*;
pub use layout::*;
