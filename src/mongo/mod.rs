pub mod connection;
pub mod order;
pub mod projection;
pub mod schema;
pub mod transform;
pub mod types;


pub use connection::MongoSource;
pub use order::{compare_bson, same_type_bracket};
pub use projection::{apply_projection, oplog_projection};
pub use schema::SchemaAccumulator;
pub use transform::{row_to_record, transform_value, SDC_DELETED_AT};
pub use types::{LogEntry, Namespace, OplogOp, OplogPosition};
