pub mod descriptor;
pub mod federation;
pub mod maintenance;
pub mod status;
pub mod table;

pub use descriptor::*;
pub use federation::*;
pub use maintenance::*;
pub use status::*;
pub use table::*;
