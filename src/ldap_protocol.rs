// LDAPv3 message codec for a pass-through proxy.
// Only the envelope is decoded: message id, protocolOp tag and controls. The
// protocolOp body is forwarded byte for byte; a few fields (bind name, result
// code, abandon target, extended OID) are peeked at when routing needs them.

use crate::error::ProtocolError;
use bytes::Bytes;

type Result<T> = std::result::Result<T, ProtocolError>;

// LDAP protocol tag constants
pub const LDAP_TAG_MESSAGE: u8 = 0x30;
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;
/// `controls [0] Controls` inside LDAPMessage.
pub const LDAP_TAG_CONTROLS: u8 = 0xA0;

const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_ENUMERATED: u8 = 0x0A;
const TAG_SEQUENCE: u8 = 0x30;
/// ExtendedRequest requestName [0] / BindRequest simple [0].
const TAG_CONTEXT_0: u8 = 0x80;
/// ExtendedResponse responseName [10].
const TAG_CONTEXT_10: u8 = 0x8A;

/// OID for StartTLS extended operation (RFC 4511).
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";
/// Notice of Disconnection unsolicited notification (RFC 4511 4.4.1).
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";
/// Proxied Authorization control (RFC 4370).
pub const PROXY_AUTHZ_OID: &str = "2.16.840.1.113730.3.4.18";

/// LDAP result codes used by the proxy itself.
pub mod result_code {
    pub const SUCCESS: u32 = 0;
    pub const OPERATIONS_ERROR: u32 = 1;
    pub const PROTOCOL_ERROR: u32 = 2;
    pub const CONFIDENTIALITY_REQUIRED: u32 = 13;
    pub const SASL_BIND_IN_PROGRESS: u32 = 14;
    pub const BUSY: u32 = 51;
    pub const UNAVAILABLE: u32 = 52;
    pub const UNWILLING_TO_PERFORM: u32 = 53;
    pub const OTHER: u32 = 80;
}

// BER parsing utilities
pub(crate) struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_tag(&mut self) -> Result<u8> {
        let tag = *self.data.get(self.pos).ok_or(ProtocolError::Truncated)?;
        self.pos += 1;
        Ok(tag)
    }

    fn read_length(&mut self) -> Result<usize> {
        let first_byte = self.read_tag().map_err(|_| ProtocolError::Truncated)?;
        if (first_byte & 0x80) == 0 {
            return Ok(first_byte as usize);
        }
        // Long form; indefinite lengths are not valid in LDAP
        let length_bytes = (first_byte & 0x7F) as usize;
        if length_bytes == 0 || length_bytes > 4 {
            return Err(ProtocolError::BadLength);
        }
        if self.remaining() < length_bytes {
            return Err(ProtocolError::Truncated);
        }
        let mut length = 0usize;
        for &b in &self.data[self.pos..self.pos + length_bytes] {
            length = (length << 8) | b as usize;
        }
        self.pos += length_bytes;
        Ok(length)
    }

    /// Reads one TLV, returning its tag and content.
    pub(crate) fn read_element(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.read_tag()?;
        let length = self.read_length()?;
        if self.remaining() < length {
            return Err(ProtocolError::Truncated);
        }
        let content = &self.data[self.pos..self.pos + length];
        self.pos += length;
        Ok((tag, content))
    }

    fn expect(&mut self, expected: u8) -> Result<&'a [u8]> {
        let (found, content) = self.read_element()?;
        if found != expected {
            return Err(ProtocolError::UnexpectedTag { expected, found });
        }
        Ok(content)
    }

    pub(crate) fn read_integer(&mut self) -> Result<i64> {
        let content = self.expect(TAG_INTEGER)?;
        integer_from_content(content)
    }

    pub(crate) fn read_enumerated(&mut self) -> Result<u32> {
        let content = self.expect(TAG_ENUMERATED)?;
        let value = integer_from_content(content)?;
        u32::try_from(value).map_err(|_| ProtocolError::BadLength)
    }

    pub(crate) fn read_octet_string(&mut self) -> Result<&'a [u8]> {
        self.expect(TAG_OCTET_STRING)
    }
}

fn integer_from_content(content: &[u8]) -> Result<i64> {
    if content.is_empty() || content.len() > 8 {
        return Err(ProtocolError::BadLength);
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in content {
        value = (value << 8) | byte as i64;
    }
    Ok(value)
}

// BER encoding utilities
#[derive(Default)]
pub(crate) struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            self.buffer.push(length as u8);
        } else {
            let bytes = length.to_be_bytes();
            let skip = bytes.iter().take_while(|&&b| b == 0).count();
            self.buffer.push(0x80 | (bytes.len() - skip) as u8);
            self.buffer.extend_from_slice(&bytes[skip..]);
        }
    }

    /// Opens a constructed element; pair with [`BerWriter::finish`].
    pub(crate) fn start(&mut self, tag: u8) -> usize {
        self.buffer.push(tag);
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patches the length reserved by `start`, switching to long form when needed.
    pub(crate) fn finish(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        if content_len < 128 {
            self.buffer[pos] = content_len as u8;
            return;
        }
        let bytes = content_len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        self.buffer[pos] = 0x80 | (bytes.len() - skip) as u8;
        let content = self.buffer.split_off(pos + 1);
        self.buffer.extend_from_slice(&bytes[skip..]);
        self.buffer.extend_from_slice(&content);
    }

    pub(crate) fn write_primitive(&mut self, tag: u8, data: &[u8]) {
        self.buffer.push(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub(crate) fn write_integer_tagged(&mut self, tag: u8, value: i32) {
        let bytes = value.to_be_bytes();
        // Minimal two's complement: drop leading bytes that only repeat the sign bit
        let mut start = 0;
        while start < 3 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        self.write_primitive(tag, &bytes[start..]);
    }

    pub(crate) fn write_integer(&mut self, value: i32) {
        self.write_integer_tagged(TAG_INTEGER, value);
    }

    pub(crate) fn write_enumerated(&mut self, value: u32) {
        self.write_integer_tagged(TAG_ENUMERATED, value as i32);
    }

    pub(crate) fn write_octet_string(&mut self, data: &[u8]) {
        self.write_primitive(TAG_OCTET_STRING, data);
    }

    pub(crate) fn write_boolean(&mut self, value: bool) {
        self.write_primitive(TAG_BOOLEAN, &[if value { 0xFF } else { 0x00 }]);
    }

    pub(crate) fn write_raw(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        Bytes::from(self.buffer)
    }
}

/// One LDAPMessage split into the parts the proxy routes on.
///
/// `op` and `controls` are full TLVs sliced out of the received buffer and
/// are written back unchanged; only the message id is re-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub msgid: i32,
    pub tag: u8,
    pub op: Bytes,
    pub controls: Option<Bytes>,
}

impl Pdu {
    pub fn decode(raw: Bytes) -> Result<Pdu> {
        let mut outer = BerReader::new(&raw);
        let (tag, body) = outer.read_element()?;
        if tag != LDAP_TAG_MESSAGE {
            return Err(ProtocolError::NotSequence(tag));
        }
        if outer.remaining() != 0 {
            return Err(ProtocolError::TrailingData);
        }
        let body_start = raw.len() - body.len();

        let mut reader = BerReader::new(body);
        let msgid = reader.read_integer()?;
        if !(0..=i32::MAX as i64).contains(&msgid) {
            return Err(ProtocolError::InvalidMessageId(msgid));
        }

        let op_start = reader.position();
        let (op_tag, _) = reader.read_element()?;
        let op = raw.slice(body_start + op_start..body_start + reader.position());

        let controls = if reader.remaining() > 0 {
            let start = reader.position();
            let (ctag, _) = reader.read_element()?;
            if ctag != LDAP_TAG_CONTROLS {
                return Err(ProtocolError::UnexpectedTag {
                    expected: LDAP_TAG_CONTROLS,
                    found: ctag,
                });
            }
            Some(raw.slice(body_start + start..body_start + reader.position()))
        } else {
            None
        };
        if reader.remaining() != 0 {
            return Err(ProtocolError::TrailingData);
        }

        Ok(Pdu {
            msgid: msgid as i32,
            tag: op_tag,
            op,
            controls,
        })
    }

    /// Re-frames the message under a new message id.
    pub fn encode(&self, msgid: i32) -> Bytes {
        let mut writer = BerWriter::new();
        let seq = writer.start(LDAP_TAG_MESSAGE);
        writer.write_integer(msgid);
        writer.write_raw(&self.op);
        if let Some(controls) = &self.controls {
            writer.write_raw(controls);
        }
        writer.finish(seq);
        writer.into_bytes()
    }

    /// Like [`Pdu::encode`], with a critical Proxied Authorization control
    /// for `authz_id` placed ahead of the client's own controls.
    pub fn encode_with_proxy_authz(&self, msgid: i32, authz_id: &str) -> Bytes {
        let mut writer = BerWriter::new();
        let seq = writer.start(LDAP_TAG_MESSAGE);
        writer.write_integer(msgid);
        writer.write_raw(&self.op);
        let controls = writer.start(LDAP_TAG_CONTROLS);
        let control = writer.start(TAG_SEQUENCE);
        writer.write_octet_string(PROXY_AUTHZ_OID.as_bytes());
        writer.write_boolean(true);
        writer.write_octet_string(authz_id.as_bytes());
        writer.finish(control);
        if let Some(existing) = &self.controls {
            if let Ok((_, content)) = BerReader::new(existing).read_element() {
                writer.write_raw(content);
            }
        }
        writer.finish(controls);
        writer.finish(seq);
        writer.into_bytes()
    }

    fn op_content(&self) -> Result<&[u8]> {
        BerReader::new(&self.op).read_element().map(|(_, c)| c)
    }

    /// resultCode of an LDAPResult-shaped response.
    pub fn result_code(&self) -> Result<u32> {
        BerReader::new(self.op_content()?).read_enumerated()
    }

    /// Diagnostic message of an LDAPResult-shaped response.
    pub fn diagnostic_message(&self) -> Result<String> {
        let mut reader = BerReader::new(self.op_content()?);
        reader.read_enumerated()?;
        reader.read_octet_string()?;
        let msg = reader.read_octet_string()?;
        Ok(String::from_utf8_lossy(msg).into_owned())
    }

    /// Message id targeted by an AbandonRequest.
    pub fn abandon_target(&self) -> Result<i32> {
        if self.tag != LDAP_TAG_ABANDON_REQUEST {
            return Err(ProtocolError::UnexpectedOp(self.tag));
        }
        let id = integer_from_content(self.op_content()?)?;
        i32::try_from(id).map_err(|_| ProtocolError::InvalidMessageId(id))
    }

    /// Name (DN) of a BindRequest.
    pub fn bind_dn(&self) -> Result<String> {
        if self.tag != LDAP_TAG_BIND_REQUEST {
            return Err(ProtocolError::UnexpectedOp(self.tag));
        }
        let mut reader = BerReader::new(self.op_content()?);
        reader.read_integer()?;
        let name = reader.read_octet_string()?;
        Ok(String::from_utf8_lossy(name).into_owned())
    }

    /// requestName of an ExtendedRequest.
    pub fn extended_oid(&self) -> Option<String> {
        if self.tag != LDAP_TAG_EXTENDED_REQUEST {
            return None;
        }
        let mut reader = BerReader::new(self.op_content().ok()?);
        match reader.read_element() {
            Ok((TAG_CONTEXT_0, oid)) => Some(String::from_utf8_lossy(oid).into_owned()),
            _ => None,
        }
    }
}

/// Encodes an LDAPResult-shaped response. Every reject the proxy synthesizes goes through here.
pub fn encode_result(
    msgid: i32,
    response_tag: u8,
    result_code: u32,
    matched_dn: &str,
    diagnostic_message: &str,
) -> Bytes {
    let mut writer = BerWriter::new();
    let seq = writer.start(LDAP_TAG_MESSAGE);
    writer.write_integer(msgid);
    let res = writer.start(response_tag);
    writer.write_enumerated(result_code);
    writer.write_octet_string(matched_dn.as_bytes());
    writer.write_octet_string(diagnostic_message.as_bytes());
    writer.finish(res);
    writer.finish(seq);
    writer.into_bytes()
}

/// Unsolicited Notice of Disconnection sent before dropping a misbehaving client.
pub fn encode_notice_of_disconnection(result_code: u32, diagnostic_message: &str) -> Bytes {
    let mut writer = BerWriter::new();
    let seq = writer.start(LDAP_TAG_MESSAGE);
    writer.write_integer(0);
    let res = writer.start(LDAP_TAG_EXTENDED_RESPONSE);
    writer.write_enumerated(result_code);
    writer.write_octet_string(b"");
    writer.write_octet_string(diagnostic_message.as_bytes());
    writer.write_primitive(TAG_CONTEXT_10, NOTICE_OF_DISCONNECTION_OID.as_bytes());
    writer.finish(res);
    writer.finish(seq);
    writer.into_bytes()
}

pub fn encode_abandon(msgid: i32, target: i32) -> Bytes {
    let mut writer = BerWriter::new();
    let seq = writer.start(LDAP_TAG_MESSAGE);
    writer.write_integer(msgid);
    writer.write_integer_tagged(LDAP_TAG_ABANDON_REQUEST, target);
    writer.finish(seq);
    writer.into_bytes()
}

pub fn encode_start_tls(msgid: i32) -> Bytes {
    let mut writer = BerWriter::new();
    let seq = writer.start(LDAP_TAG_MESSAGE);
    writer.write_integer(msgid);
    let ext = writer.start(LDAP_TAG_EXTENDED_REQUEST);
    writer.write_primitive(TAG_CONTEXT_0, START_TLS_OID.as_bytes());
    writer.finish(ext);
    writer.finish(seq);
    writer.into_bytes()
}

pub fn encode_simple_bind(msgid: i32, version: u8, dn: &str, password: &str) -> Bytes {
    let mut writer = BerWriter::new();
    let seq = writer.start(LDAP_TAG_MESSAGE);
    writer.write_integer(msgid);
    let bind = writer.start(LDAP_TAG_BIND_REQUEST);
    writer.write_integer(version as i32);
    writer.write_octet_string(dn.as_bytes());
    writer.write_primitive(TAG_CONTEXT_0, password.as_bytes());
    writer.finish(bind);
    writer.finish(seq);
    writer.into_bytes()
}

/// Response tag a reject for `request_tag` must carry. None for requests
/// that never get a response (Unbind, Abandon).
pub fn response_tag_for_request(request_tag: u8) -> Option<u8> {
    match request_tag {
        LDAP_TAG_BIND_REQUEST => Some(LDAP_TAG_BIND_RESPONSE),
        LDAP_TAG_SEARCH_REQUEST => Some(LDAP_TAG_SEARCH_RESULT_DONE),
        LDAP_TAG_MODIFY_REQUEST => Some(LDAP_TAG_MODIFY_RESPONSE),
        LDAP_TAG_ADD_REQUEST => Some(LDAP_TAG_ADD_RESPONSE),
        LDAP_TAG_DEL_REQUEST => Some(LDAP_TAG_DEL_RESPONSE),
        LDAP_TAG_MODIFY_DN_REQUEST => Some(LDAP_TAG_MODIFY_DN_RESPONSE),
        LDAP_TAG_COMPARE_REQUEST => Some(LDAP_TAG_COMPARE_RESPONSE),
        LDAP_TAG_EXTENDED_REQUEST => Some(LDAP_TAG_EXTENDED_RESPONSE),
        _ => None,
    }
}

pub fn is_request_tag(tag: u8) -> bool {
    tag == LDAP_TAG_UNBIND_REQUEST
        || tag == LDAP_TAG_ABANDON_REQUEST
        || response_tag_for_request(tag).is_some()
}

/// Tags that indicate the final response for a request (one response per operation, or last of many for Search).
pub fn is_final_response_tag(tag: u8) -> bool {
    matches!(
        tag,
        LDAP_TAG_BIND_RESPONSE
            | LDAP_TAG_SEARCH_RESULT_DONE
            | LDAP_TAG_MODIFY_RESPONSE
            | LDAP_TAG_ADD_RESPONSE
            | LDAP_TAG_DEL_RESPONSE
            | LDAP_TAG_MODIFY_DN_RESPONSE
            | LDAP_TAG_COMPARE_RESPONSE
            | LDAP_TAG_EXTENDED_RESPONSE
    )
}

/// Operation name for logs and metrics labels.
pub fn op_name(tag: u8) -> &'static str {
    match tag {
        LDAP_TAG_BIND_REQUEST => "bind",
        LDAP_TAG_UNBIND_REQUEST => "unbind",
        LDAP_TAG_SEARCH_REQUEST => "search",
        LDAP_TAG_MODIFY_REQUEST => "modify",
        LDAP_TAG_ADD_REQUEST => "add",
        LDAP_TAG_DEL_REQUEST => "delete",
        LDAP_TAG_MODIFY_DN_REQUEST => "modify_dn",
        LDAP_TAG_COMPARE_REQUEST => "compare",
        LDAP_TAG_ABANDON_REQUEST => "abandon",
        LDAP_TAG_EXTENDED_REQUEST => "extended",
        _ => "other",
    }
}
