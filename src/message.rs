use std::any::Any;
use std::fmt::Debug;

use bytes::BytesMut;
#[cfg(test)] use mockall::automock;


/// An application message. The wire encoding is entirely up to the application; the networking
///  layer only frames and correlates serialized messages.
pub trait Message: Debug + 'static {
    /// A discriminator for caller-side dispatch, e.g. to match a response to the expected type.
    fn message_type(&self) -> u16;

    /// Appends the serialized message to `buf`.
    fn serialize(&self, buf: &mut BytesMut);

    fn as_any(&self) -> &dyn Any;
}

impl dyn Message {
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: Message>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// The application's deserializer, which turns a payload back into a message.
#[cfg_attr(test, automock)]
pub trait MessageCodec {
    fn deserialize(&self, buf: &[u8]) -> anyhow::Result<Box<dyn Message>>;
}
