use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

/// Returns all fields and values of the hash stored at `key`, as a flat list where every
/// field name is followed by its value.
///
/// Ref: <https://redis.io/docs/latest/commands/hgetall/>
#[derive(Debug, PartialEq)]
pub struct HGetAll {
    pub key: String,
}

impl Executable for HGetAll {
    fn exec(self, store: &Store) -> Result<Frame, Error> {
        let store = store.lock();
        let frames = store
            .hgetall(&self.key)
            .flat_map(|(field, value)| {
                [
                    Frame::Bulk(field.clone().into()),
                    Frame::Bulk(value.clone()),
                ]
            })
            .collect();

        Ok(Frame::Array(frames))
    }
}

impl TryFrom<&mut CommandParser> for HGetAll {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_string()?;
        Ok(Self { key })
    }
}
