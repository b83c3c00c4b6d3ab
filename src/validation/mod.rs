pub mod column_defs;

pub use column_defs::ColumnDefParser;
