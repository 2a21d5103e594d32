pub mod broker;
pub mod common;
pub mod instance;
pub mod object;
pub mod offering;
pub mod operation;
pub mod visibility;

pub use broker::*;
pub use common::*;
pub use instance::*;
pub use object::*;
pub use offering::*;
pub use operation::*;
pub use visibility::*;
