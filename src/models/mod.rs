pub mod call;
pub mod number;
pub mod batch;

pub use call::*;
pub use number::*;
pub use batch::*;
