pub use crate::command::{CommandInterface, CommandProtocol, CommandResponse};
pub use crate::info::{InfoReader, InfoWriter};
pub use crate::node::Node;
pub use crate::path::{Mode, Uid};
pub use crate::table::{MemoryBroker, MemoryHub, SharedTable, TableEvents};
pub use crate::types::{FieldDef, FieldSchema, Value, ValueType};
