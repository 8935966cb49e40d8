pub mod change;
pub mod policy;
pub mod tag;
pub mod webhook;

pub use change::*;
pub use policy::*;
pub use tag::*;
pub use webhook::*;
