use bytes::Bytes;

use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

/// Sets the specified fields to their respective values in the hash stored at `key`. Returns
/// the number of fields that were added.
///
/// Ref: <https://redis.io/docs/latest/commands/hset/>
#[derive(Debug, PartialEq)]
pub struct HSet {
    pub key: String,
    pub fields: Vec<(String, Bytes)>,
}

impl Executable for HSet {
    fn exec(self, store: &Store) -> Result<Frame, Error> {
        let mut store = store.lock();

        let added = self
            .fields
            .into_iter()
            .map(|(field, value)| store.hset(&self.key, field, value))
            .filter(|added| *added)
            .count();

        Ok(Frame::Integer(added as i64))
    }
}

impl TryFrom<&mut CommandParser> for HSet {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_string()?;

        // At least one field/value pair is required, an incomplete pair fails with the usual
        // wrong number of arguments error.
        let mut fields = vec![];
        loop {
            let field = parser.next_string()?;
            let value = parser.next_bytes()?;
            fields.push((field, value));

            if !parser.has_remaining() {
                break;
            }
        }

        Ok(Self { key, fields })
    }
}
