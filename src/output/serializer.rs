use super::Message;
use crate::Result;

pub struct JsonSerializer;

impl JsonSerializer {
    /// One message as a single line of JSON, without the trailing newline.
    pub fn serialize(message: &Message) -> Result<String> {
        serde_json::to_string(message).map_err(Into::into)
    }
}
