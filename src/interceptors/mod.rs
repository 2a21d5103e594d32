//! Create/update/delete hook chains.
//!
//! Every intercepted mutation runs the around-tx hooks (outermost first), then opens a storage
//! transaction and runs the on-tx hooks inside it before the storage write itself.

pub mod create;
pub mod delete;
pub mod guard;
pub mod order;
pub mod registry;
pub mod update;

pub use create::*;
pub use delete::*;
pub use guard::*;
pub use order::*;
pub use registry::*;
pub use update::*;
