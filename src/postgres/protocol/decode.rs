//! Protocol message decoding

use super::constants::{auth, tags, MAX_MESSAGE_LENGTH};
use super::message::{AuthenticationMessage, BackendMessage, ErrorFields, FieldDescription};
use crate::{Error, Result};
use bytes::Bytes;

/// Decode one backend message from the front of `data`
///
/// Returns `Ok(None)` when `data` does not yet hold a complete message, and
/// `Ok(Some((msg, consumed)))` otherwise; the caller advances its buffer by
/// `consumed`. Malformed input is a protocol error.
pub fn decode_message(data: &[u8]) -> Result<Option<(BackendMessage, usize)>> {
    if data.len() < 5 {
        return Ok(None);
    }

    let tag = data[0];
    let len = i32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    if len < 4 {
        return Err(Error::Protocol(format!("invalid message length {}", len)));
    }
    let len = len as usize;
    if len > MAX_MESSAGE_LENGTH {
        return Err(Error::Protocol(format!(
            "message length {} exceeds maximum allowed {}",
            len, MAX_MESSAGE_LENGTH
        )));
    }
    if data.len() < len + 1 {
        return Ok(None);
    }

    let mut body = Cursor::new(&data[5..len + 1]);
    let msg = match tag {
        tags::AUTHENTICATION => BackendMessage::Authentication(decode_authentication(&mut body)?),
        tags::BACKEND_KEY_DATA => BackendMessage::BackendKeyData {
            process_id: body.i32()?,
            secret_key: body.i32()?,
        },
        tags::COMMAND_COMPLETE => BackendMessage::CommandComplete(body.cstr()?),
        tags::DATA_ROW => BackendMessage::DataRow(decode_data_row(&mut body)?),
        tags::EMPTY_QUERY_RESPONSE => BackendMessage::EmptyQueryResponse,
        tags::ERROR_RESPONSE => BackendMessage::ErrorResponse(decode_error_fields(&mut body)?),
        tags::NOTICE_RESPONSE => BackendMessage::NoticeResponse(decode_error_fields(&mut body)?),
        tags::NOTIFICATION_RESPONSE => BackendMessage::NotificationResponse {
            process_id: body.i32()?,
            channel: body.cstr()?,
            payload: body.cstr()?,
        },
        tags::PARAMETER_STATUS => BackendMessage::ParameterStatus {
            name: body.cstr()?,
            value: body.cstr()?,
        },
        tags::READY_FOR_QUERY => BackendMessage::ReadyForQuery { status: body.u8()? },
        tags::ROW_DESCRIPTION => BackendMessage::RowDescription(decode_row_description(&mut body)?),
        _ => {
            return Err(Error::Protocol(format!(
                "unknown message tag: 0x{:02X}",
                tag
            )))
        }
    };

    Ok(Some((msg, len + 1)))
}

/// Bounds-checked reader over a message body
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining().len() < n {
            return Err(Error::Protocol(format!("truncated {}", what)));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    fn i16(&mut self) -> Result<i16> {
        let b = self.take(2, "int16")?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4, "int32")?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstr(&mut self) -> Result<String> {
        let end = self
            .remaining()
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Protocol("missing null terminator in string".into()))?;
        let s = String::from_utf8_lossy(&self.remaining()[..end]).into_owned();
        self.pos += end + 1;
        Ok(s)
    }

    fn rest(&mut self) -> Vec<u8> {
        let rest = self.remaining().to_vec();
        self.pos = self.data.len();
        rest
    }
}

fn decode_authentication(body: &mut Cursor<'_>) -> Result<AuthenticationMessage> {
    let auth_type = body.i32()?;
    let msg = match auth_type {
        auth::OK => AuthenticationMessage::Ok,
        auth::CLEARTEXT_PASSWORD => AuthenticationMessage::CleartextPassword,
        auth::MD5_PASSWORD => {
            let mut salt = [0u8; 4];
            salt.copy_from_slice(body.take(4, "md5 salt")?);
            AuthenticationMessage::Md5Password { salt }
        }
        auth::SASL => {
            let mut mechanisms = Vec::new();
            while !body.remaining().is_empty() {
                let mechanism = body.cstr()?;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            AuthenticationMessage::Sasl { mechanisms }
        }
        auth::SASL_CONTINUE => AuthenticationMessage::SaslContinue { data: body.rest() },
        auth::SASL_FINAL => AuthenticationMessage::SaslFinal { data: body.rest() },
        other => {
            return Err(Error::Authentication(format!(
                "unsupported authentication type: {}",
                other
            )))
        }
    };
    Ok(msg)
}

fn decode_data_row(body: &mut Cursor<'_>) -> Result<Vec<Option<Bytes>>> {
    let count = body.i16()?.max(0) as usize;
    let mut cells = Vec::with_capacity(count);
    for _ in 0..count {
        let len = body.i32()?;
        let cell = if len < 0 {
            None
        } else {
            Some(Bytes::copy_from_slice(body.take(len as usize, "field data")?))
        };
        cells.push(cell);
    }
    Ok(cells)
}

fn decode_row_description(body: &mut Cursor<'_>) -> Result<Vec<FieldDescription>> {
    let count = body.i16()?.max(0) as usize;
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        fields.push(FieldDescription {
            name: body.cstr()?,
            table_oid: body.i32()?,
            column_attr: body.i16()?,
            type_oid: body.i32()? as u32,
            type_size: body.i16()?,
            type_modifier: body.i32()?,
            format_code: body.i16()?,
        });
    }
    Ok(fields)
}

fn decode_error_fields(body: &mut Cursor<'_>) -> Result<ErrorFields> {
    let mut fields = ErrorFields::default();
    while !body.remaining().is_empty() {
        let field_type = body.u8()?;
        if field_type == 0 {
            break;
        }
        let value = body.cstr()?;
        match field_type {
            b'S' => fields.severity = Some(value),
            b'C' => fields.code = Some(value),
            b'M' => fields.message = Some(value),
            b'D' => fields.detail = Some(value),
            b'H' => fields.hint = Some(value),
            b'P' => fields.position = Some(value),
            _ => {} // Ignore unknown fields
        }
    }
    Ok(fields)
}
