use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};


/// How a frame relates to other frames, derived from its correlation id.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EnvelopeKind {
    /// Fire-and-forget, correlation id 0
    Push,
    /// A request that expects a response echoing this (positive) id
    Request(i32),
    /// The response to a request that was sent with this id
    Response(i32),
}

/// The four bytes that precede every serialized message on the wire: a little-endian i32
///  correlation id. 0 is a push, a positive id a response, and a negative id a request whose
///  absolute value the response must echo.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Envelope {
    pub correlation_id: i32,
}

impl Envelope {
    pub const SERIALIZED_LEN: usize = size_of::<i32>();

    pub fn new(correlation_id: i32) -> Envelope {
        Envelope { correlation_id }
    }

    pub fn push() -> Envelope {
        Envelope::new(0)
    }

    /// `id` is the positive id the response will echo
    pub fn request(id: i32) -> Envelope {
        Envelope::new(-id)
    }

    pub fn response(id: i32) -> Envelope {
        Envelope::new(id)
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self.correlation_id {
            0 => EnvelopeKind::Push,
            id if id > 0 => EnvelopeKind::Response(id),
            id => EnvelopeKind::Request(-id),
        }
    }

    pub fn try_read(buf: &mut impl Buf) -> anyhow::Result<Envelope> {
        let correlation_id = buf.try_get_i32_le()?;
        if correlation_id == i32::MIN {
            bail!("correlation id {} is out of range", correlation_id);
        }
        Ok(Envelope { correlation_id })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.correlation_id);
    }
}

impl Debug for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Envelope{{{:?}}}", self.kind())
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::push(Envelope::push(), vec![0, 0, 0, 0], EnvelopeKind::Push)]
    #[case::request(Envelope::request(1), vec![0xff, 0xff, 0xff, 0xff], EnvelopeKind::Request(1))]
    #[case::request_max(Envelope::request(i32::MAX), vec![1, 0, 0, 0x80], EnvelopeKind::Request(i32::MAX))]
    #[case::response(Envelope::response(258), vec![2, 1, 0, 0], EnvelopeKind::Response(258))]
    fn test_envelope(#[case] envelope: Envelope, #[case] expected_bytes: Vec<u8>, #[case] expected_kind: EnvelopeKind) {
        let mut buf = BytesMut::new();
        envelope.write(&mut buf);
        assert_eq!(&buf, &expected_bytes);
        assert_eq!(envelope.kind(), expected_kind);

        let mut b: &[u8] = &buf;
        let deser = Envelope::try_read(&mut b).unwrap();
        assert_eq!(deser, envelope);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::too_short(vec![1, 2, 3])]
    #[case::min(vec![0, 0, 0, 0x80])]
    fn test_try_read_invalid(#[case] bytes: Vec<u8>) {
        let mut b: &[u8] = &bytes;
        assert!(Envelope::try_read(&mut b).is_err());
    }

    #[test]
    fn test_debug() {
        assert_eq!(format!("{:?}", Envelope::request(5)), "Envelope{Request(5)}");
    }
}
