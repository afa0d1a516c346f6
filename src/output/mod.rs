pub mod messages;
pub mod serializer;
pub mod sink;


pub use messages::Message;
pub use serializer::JsonSerializer;
pub use sink::{MemorySink, MessageSink, StdoutSink};
