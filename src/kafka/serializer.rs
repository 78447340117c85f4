use crate::{postgres::Event, Result};

/// Encodes events into the JSON wire payload.
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn serialize(event: &Event) -> Result<Vec<u8>> {
        serde_json::to_vec(event).map_err(Into::into)
    }
}
