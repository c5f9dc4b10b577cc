pub mod result;
pub mod row;
pub mod table;

pub use result::*;
pub use row::*;
pub use table::*;
