use std::any::Any;

use bytes::{BufMut, BytesMut};

use crate::message::{Message, MessageCodec};


/// A message that is just a UTF-8 string on the wire
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TestMessage {
    pub text: String,
}

impl TestMessage {
    pub const MESSAGE_TYPE: u16 = 1;

    pub fn new(text: &str) -> TestMessage {
        TestMessage {
            text: text.to_string(),
        }
    }
}

impl Message for TestMessage {
    fn message_type(&self) -> u16 {
        Self::MESSAGE_TYPE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_slice(self.text.as_bytes());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TestCodec;

impl MessageCodec for TestCodec {
    fn deserialize(&self, buf: &[u8]) -> anyhow::Result<Box<dyn Message>> {
        let text = std::str::from_utf8(buf)?;
        Ok(Box::new(TestMessage::new(text)))
    }
}
