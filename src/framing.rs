//! Splitting a byte stream into whole LDAPMessage PDUs.

use crate::error::ProtocolError;
use crate::ldap_protocol::LDAP_TAG_MESSAGE;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest PDU accepted from a client (2^18 - 1).
pub const MAX_CLIENT_PDU: usize = (1 << 18) - 1;
/// Largest PDU accepted from an upstream server (2^24 - 1).
pub const MAX_UPSTREAM_PDU: usize = (1 << 24) - 1;

/// Takes the next complete PDU off the front of `buffer`.
///
/// Returns `Ok(None)` while more bytes are needed. The size limit is checked
/// as soon as the length header is readable, so an oversized PDU is refused
/// before it is buffered.
pub fn next_frame(buffer: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>, ProtocolError> {
    if buffer.is_empty() {
        return Ok(None);
    }
    // Top-level LDAP message is always a SEQUENCE (BER tag 0x30)
    if buffer[0] != LDAP_TAG_MESSAGE {
        return Err(ProtocolError::NotSequence(buffer[0]));
    }
    if buffer.len() < 2 {
        return Ok(None);
    }

    let first_byte = buffer[1];
    let (header_len, content_len) = if (first_byte & 0x80) == 0 {
        (2, first_byte as usize)
    } else {
        let length_bytes = (first_byte & 0x7F) as usize;
        if length_bytes == 0 || length_bytes > 4 {
            return Err(ProtocolError::BadLength);
        }
        if buffer.len() < 2 + length_bytes {
            return Ok(None);
        }
        let length = buffer[2..2 + length_bytes]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (2 + length_bytes, length)
    };

    let total = header_len
        .checked_add(content_len)
        .ok_or(ProtocolError::TooLarge { len: usize::MAX, max: max_len })?;
    if total > max_len {
        return Err(ProtocolError::TooLarge { len: total, max: max_len });
    }
    if buffer.len() < total {
        buffer.reserve(total - buffer.len());
        return Ok(None);
    }
    Ok(Some(buffer.split_to(total).freeze()))
}

/// Reads until one complete PDU is available. Used during connection
/// handshakes, before the connection gets its own I/O driver.
pub async fn read_frame<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    max_len: usize,
) -> std::io::Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    loop {
        match next_frame(buffer, max_len) {
            Ok(Some(frame)) => return Ok(frame),
            Ok(None) => {}
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        }
        let n = stream.read_buf(buffer).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-handshake",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNBIND: [u8; 7] = [0x30, 0x05, 0x02, 0x01, 0x03, 0x42, 0x00];

    #[test]
    fn test_incomplete() {
        let mut buf = BytesMut::from(&UNBIND[..4]);
        assert_eq!(next_frame(&mut buf, MAX_CLIENT_PDU).unwrap(), None);
        assert_eq!(buf.len(), 4);
        let mut empty = BytesMut::new();
        assert_eq!(next_frame(&mut empty, MAX_CLIENT_PDU).unwrap(), None);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&UNBIND);
        buf.extend_from_slice(&UNBIND);
        buf.extend_from_slice(&UNBIND[..3]);
        let first = next_frame(&mut buf, MAX_CLIENT_PDU).unwrap().unwrap();
        let second = next_frame(&mut buf, MAX_CLIENT_PDU).unwrap().unwrap();
        assert_eq!(&first[..], &UNBIND[..]);
        assert_eq!(first, second);
        assert_eq!(next_frame(&mut buf, MAX_CLIENT_PDU).unwrap(), None);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_long_form_length() {
        let mut msg = vec![0x30, 0x82, 0x01, 0x00];
        msg.extend(std::iter::repeat(0u8).take(256));
        let mut buf = BytesMut::from(&msg[..]);
        let frame = next_frame(&mut buf, MAX_CLIENT_PDU).unwrap().unwrap();
        assert_eq!(frame.len(), 260);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_not_sequence() {
        let mut buf = BytesMut::from(&[0x04u8, 0x02, 0x30, 0x00][..]);
        assert_eq!(
            next_frame(&mut buf, MAX_CLIENT_PDU).unwrap_err(),
            ProtocolError::NotSequence(0x04)
        );
    }

    #[test]
    fn test_too_large_refused_from_header() {
        // Header announces 2^18 bytes of content; nothing else buffered yet
        let mut buf = BytesMut::from(&[0x30u8, 0x83, 0x04, 0x00, 0x00][..]);
        let err = next_frame(&mut buf, MAX_CLIENT_PDU).unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge { .. }));
        let mut buf = BytesMut::from(&[0x30u8, 0x83, 0x04, 0x00, 0x00][..]);
        assert_eq!(next_frame(&mut buf, MAX_UPSTREAM_PDU).unwrap(), None);
    }

    #[test]
    fn test_largest_length_header_refused() {
        let mut buf = BytesMut::from(&[0x30u8, 0x84, 0xFF, 0xFF, 0xFF, 0xFF][..]);
        let err = next_frame(&mut buf, MAX_UPSTREAM_PDU).unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge { max: MAX_UPSTREAM_PDU, .. }));
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_bad_length_encoding() {
        let mut indefinite = BytesMut::from(&[0x30u8, 0x80, 0x00][..]);
        assert_eq!(next_frame(&mut indefinite, MAX_CLIENT_PDU).unwrap_err(), ProtocolError::BadLength);
        let mut huge = BytesMut::from(&[0x30u8, 0x85, 0, 0, 0, 0, 1][..]);
        assert_eq!(next_frame(&mut huge, MAX_CLIENT_PDU).unwrap_err(), ProtocolError::BadLength);
    }

    #[tokio::test]
    async fn test_read_frame_across_chunks() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(&UNBIND[..2]).await.unwrap();
            client.write_all(&UNBIND[2..]).await.unwrap();
        });
        let mut buf = BytesMut::new();
        let frame = read_frame(&mut server, &mut buf, MAX_UPSTREAM_PDU).await.unwrap();
        assert_eq!(&frame[..], &UNBIND[..]);
    }
}
