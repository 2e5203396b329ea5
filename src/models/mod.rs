mod schema;

pub use schema::{ColumnDef, ColumnRegion, ColumnType, Schema};
