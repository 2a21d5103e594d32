pub mod criteria;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use criteria::{Criterion, Operator, SortOrder};
pub use memory::*;
pub use postgres::*;
pub use traits::*;
