pub mod reconcile;
pub mod visibility;

pub use reconcile::*;
pub use visibility::*;
