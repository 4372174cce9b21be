//! Attribute Protocol (ATT) PDU encoding and decoding.
//!
//! See the Bluetooth Core Specification, Vol 3, Part F, §3.4. Multi-octet fields are little-endian. Only the
//! PDUs used by a GATT client (and the matching server responses) are modelled.

use num_enum::TryFromPrimitive;
use uuid::Uuid;

use crate::btuuid::BluetoothUuidExt;
use crate::error::{AttError, AttErrorCode, ErrorKind};
use crate::Error;

/// The default (and minimum) ATT_MTU on an LE link.
pub const DEFAULT_MTU: u16 = 23;

/// The largest ATT_MTU this crate will negotiate.
pub const MAX_MTU: u16 = 517;

/// The maximum length of an attribute value (Vol 3, Part F, §3.2.9).
pub const MAX_ATTRIBUTE_LEN: usize = 512;

/// ATT opcodes.
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive)]
pub enum Opcode {
    ErrorResponse = 0x01,
    ExchangeMtuRequest = 0x02,
    ExchangeMtuResponse = 0x03,
    FindInformationRequest = 0x04,
    FindInformationResponse = 0x05,
    FindByTypeValueRequest = 0x06,
    FindByTypeValueResponse = 0x07,
    ReadByTypeRequest = 0x08,
    ReadByTypeResponse = 0x09,
    ReadRequest = 0x0a,
    ReadResponse = 0x0b,
    ReadBlobRequest = 0x0c,
    ReadBlobResponse = 0x0d,
    ReadMultipleRequest = 0x0e,
    ReadMultipleResponse = 0x0f,
    ReadByGroupTypeRequest = 0x10,
    ReadByGroupTypeResponse = 0x11,
    WriteRequest = 0x12,
    WriteResponse = 0x13,
    PrepareWriteRequest = 0x16,
    PrepareWriteResponse = 0x17,
    ExecuteWriteRequest = 0x18,
    ExecuteWriteResponse = 0x19,
    HandleValueNotification = 0x1b,
    HandleValueIndication = 0x1d,
    HandleValueConfirmation = 0x1e,
    WriteCommand = 0x52,
    SignedWriteCommand = 0xd2,
}

impl Opcode {
    /// The request this opcode answers, if it is a response.
    pub fn request(self) -> Option<Opcode> {
        use Opcode::*;
        Some(match self {
            ExchangeMtuResponse => ExchangeMtuRequest,
            FindInformationResponse => FindInformationRequest,
            FindByTypeValueResponse => FindByTypeValueRequest,
            ReadByTypeResponse => ReadByTypeRequest,
            ReadResponse => ReadRequest,
            ReadBlobResponse => ReadBlobRequest,
            ReadMultipleResponse => ReadMultipleRequest,
            ReadByGroupTypeResponse => ReadByGroupTypeRequest,
            WriteResponse => WriteRequest,
            PrepareWriteResponse => PrepareWriteRequest,
            ExecuteWriteResponse => ExecuteWriteRequest,
            _ => return None,
        })
    }

    /// Whether a PDU with this opcode expects a response from the peer.
    pub fn is_request(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            ExchangeMtuRequest
                | FindInformationRequest
                | FindByTypeValueRequest
                | ReadByTypeRequest
                | ReadRequest
                | ReadBlobRequest
                | ReadMultipleRequest
                | ReadByGroupTypeRequest
                | WriteRequest
                | PrepareWriteRequest
                | ExecuteWriteRequest
        )
    }
}

/// Returns `true` if `opcode` has the command flag set (Vol 3, Part F, §3.3.1). Commands never get a response.
pub fn is_command(opcode: u8) -> bool {
    opcode & 0x40 != 0
}

/// One entry of a Read By Group Type Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    /// Handle of the grouping declaration
    pub handle: u16,
    /// Last handle of the group
    pub end_group: u16,
    /// Declaration value (the service UUID for service groups)
    pub value: Vec<u8>,
}

/// An Attribute Protocol PDU.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    ErrorResponse { request: u8, handle: u16, error: AttError },
    ExchangeMtuRequest { mtu: u16 },
    ExchangeMtuResponse { mtu: u16 },
    FindInformationRequest { start: u16, end: u16 },
    /// Entries must share one UUID width; encoding stops at the first entry of a different width.
    FindInformationResponse { entries: Vec<(u16, Uuid)> },
    ReadByTypeRequest { start: u16, end: u16, attribute_type: Uuid },
    /// Entries must share one value length; encoding stops at the first entry of a different length.
    ReadByTypeResponse { entries: Vec<(u16, Vec<u8>)> },
    ReadRequest { handle: u16 },
    ReadResponse { value: Vec<u8> },
    ReadBlobRequest { handle: u16, offset: u16 },
    ReadBlobResponse { value: Vec<u8> },
    ReadByGroupTypeRequest { start: u16, end: u16, group_type: Uuid },
    /// Entries must share one value length; encoding stops at the first entry of a different length.
    ReadByGroupTypeResponse { entries: Vec<GroupEntry> },
    WriteRequest { handle: u16, value: Vec<u8> },
    WriteResponse,
    WriteCommand { handle: u16, value: Vec<u8> },
    PrepareWriteRequest { handle: u16, offset: u16, value: Vec<u8> },
    PrepareWriteResponse { handle: u16, offset: u16, value: Vec<u8> },
    ExecuteWriteRequest { commit: bool },
    ExecuteWriteResponse,
    HandleValueNotification { handle: u16, value: Vec<u8> },
    HandleValueIndication { handle: u16, value: Vec<u8> },
    HandleValueConfirmation,
}

/// Errors produced when decoding a malformed PDU.
#[derive(Debug, displaydoc::Display, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// empty PDU
    Empty,
    /// unsupported opcode 0x{0:02x}
    UnknownOpcode(u8),
    /// truncated {0:?} PDU
    Truncated(Opcode),
    /// malformed {0:?} PDU
    Malformed(Opcode),
}

impl std::error::Error for DecodeError {}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::with_source(ErrorKind::Protocol(AttError::Known(AttErrorCode::InvalidPdu)), err)
    }
}

impl Pdu {
    /// The opcode of this PDU.
    pub fn opcode(&self) -> Opcode {
        match self {
            Pdu::ErrorResponse { .. } => Opcode::ErrorResponse,
            Pdu::ExchangeMtuRequest { .. } => Opcode::ExchangeMtuRequest,
            Pdu::ExchangeMtuResponse { .. } => Opcode::ExchangeMtuResponse,
            Pdu::FindInformationRequest { .. } => Opcode::FindInformationRequest,
            Pdu::FindInformationResponse { .. } => Opcode::FindInformationResponse,
            Pdu::ReadByTypeRequest { .. } => Opcode::ReadByTypeRequest,
            Pdu::ReadByTypeResponse { .. } => Opcode::ReadByTypeResponse,
            Pdu::ReadRequest { .. } => Opcode::ReadRequest,
            Pdu::ReadResponse { .. } => Opcode::ReadResponse,
            Pdu::ReadBlobRequest { .. } => Opcode::ReadBlobRequest,
            Pdu::ReadBlobResponse { .. } => Opcode::ReadBlobResponse,
            Pdu::ReadByGroupTypeRequest { .. } => Opcode::ReadByGroupTypeRequest,
            Pdu::ReadByGroupTypeResponse { .. } => Opcode::ReadByGroupTypeResponse,
            Pdu::WriteRequest { .. } => Opcode::WriteRequest,
            Pdu::WriteResponse => Opcode::WriteResponse,
            Pdu::WriteCommand { .. } => Opcode::WriteCommand,
            Pdu::PrepareWriteRequest { .. } => Opcode::PrepareWriteRequest,
            Pdu::PrepareWriteResponse { .. } => Opcode::PrepareWriteResponse,
            Pdu::ExecuteWriteRequest { .. } => Opcode::ExecuteWriteRequest,
            Pdu::ExecuteWriteResponse => Opcode::ExecuteWriteResponse,
            Pdu::HandleValueNotification { .. } => Opcode::HandleValueNotification,
            Pdu::HandleValueIndication { .. } => Opcode::HandleValueIndication,
            Pdu::HandleValueConfirmation => Opcode::HandleValueConfirmation,
        }
    }

    /// Builds an Error Response for `request` at `handle`.
    pub fn error(request: Opcode, handle: u16, code: AttErrorCode) -> Pdu {
        Pdu::ErrorResponse {
            request: request as u8,
            handle,
            error: AttError::Known(code),
        }
    }

    /// Serializes this PDU into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.opcode() as u8];
        match self {
            Pdu::ErrorResponse { request, handle, error } => {
                buf.push(*request);
                put_u16(&mut buf, *handle);
                buf.push(error.code());
            }
            Pdu::ExchangeMtuRequest { mtu } | Pdu::ExchangeMtuResponse { mtu } => put_u16(&mut buf, *mtu),
            Pdu::FindInformationRequest { start, end } => {
                put_u16(&mut buf, *start);
                put_u16(&mut buf, *end);
            }
            Pdu::FindInformationResponse { entries } => {
                let short = entries.first().map(|(_, uuid)| uuid.is_u16_uuid()).unwrap_or(true);
                buf.push(if short { 0x01 } else { 0x02 });
                for (handle, uuid) in entries.iter().take_while(|(_, uuid)| uuid.is_u16_uuid() == short) {
                    put_u16(&mut buf, *handle);
                    buf.extend(uuid.to_att_bytes());
                }
            }
            Pdu::ReadByTypeRequest {
                start,
                end,
                attribute_type,
            } => {
                put_u16(&mut buf, *start);
                put_u16(&mut buf, *end);
                buf.extend(attribute_type.to_att_bytes());
            }
            Pdu::ReadByTypeResponse { entries } => {
                let len = entries.first().map(|(_, value)| value.len()).unwrap_or(0);
                buf.push((len + 2) as u8);
                for (handle, value) in entries.iter().take_while(|(_, value)| value.len() == len) {
                    put_u16(&mut buf, *handle);
                    buf.extend_from_slice(value);
                }
            }
            Pdu::ReadRequest { handle } => put_u16(&mut buf, *handle),
            Pdu::ReadResponse { value } | Pdu::ReadBlobResponse { value } => buf.extend_from_slice(value),
            Pdu::ReadBlobRequest { handle, offset } => {
                put_u16(&mut buf, *handle);
                put_u16(&mut buf, *offset);
            }
            Pdu::ReadByGroupTypeRequest { start, end, group_type } => {
                put_u16(&mut buf, *start);
                put_u16(&mut buf, *end);
                buf.extend(group_type.to_att_bytes());
            }
            Pdu::ReadByGroupTypeResponse { entries } => {
                let len = entries.first().map(|e| e.value.len()).unwrap_or(0);
                buf.push((len + 4) as u8);
                for entry in entries.iter().take_while(|e| e.value.len() == len) {
                    put_u16(&mut buf, entry.handle);
                    put_u16(&mut buf, entry.end_group);
                    buf.extend_from_slice(&entry.value);
                }
            }
            Pdu::WriteRequest { handle, value }
            | Pdu::WriteCommand { handle, value }
            | Pdu::HandleValueNotification { handle, value }
            | Pdu::HandleValueIndication { handle, value } => {
                put_u16(&mut buf, *handle);
                buf.extend_from_slice(value);
            }
            Pdu::PrepareWriteRequest { handle, offset, value }
            | Pdu::PrepareWriteResponse { handle, offset, value } => {
                put_u16(&mut buf, *handle);
                put_u16(&mut buf, *offset);
                buf.extend_from_slice(value);
            }
            Pdu::ExecuteWriteRequest { commit } => buf.push(u8::from(*commit)),
            Pdu::WriteResponse | Pdu::ExecuteWriteResponse | Pdu::HandleValueConfirmation => {}
        }
        buf
    }

    /// Parses a PDU from its wire form.
    pub fn decode(bytes: &[u8]) -> Result<Pdu, DecodeError> {
        let (&raw, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
        let opcode = Opcode::try_from(raw).map_err(|_| DecodeError::UnknownOpcode(raw))?;
        let mut r = Reader { opcode, buf: body };
        let pdu = match opcode {
            Opcode::ErrorResponse => Pdu::ErrorResponse {
                request: r.u8()?,
                handle: r.u16()?,
                error: AttError::from(r.u8()?),
            },
            Opcode::ExchangeMtuRequest => Pdu::ExchangeMtuRequest { mtu: r.u16()? },
            Opcode::ExchangeMtuResponse => Pdu::ExchangeMtuResponse { mtu: r.u16()? },
            Opcode::FindInformationRequest => Pdu::FindInformationRequest {
                start: r.u16()?,
                end: r.u16()?,
            },
            Opcode::FindInformationResponse => {
                let width = match r.u8()? {
                    0x01 => 2,
                    0x02 => 16,
                    _ => return Err(DecodeError::Malformed(opcode)),
                };
                let entries = r
                    .records(2 + width)?
                    .map(|record| (u16::from_le_bytes([record[0], record[1]]), uuid_at(&record[2..])))
                    .collect();
                Pdu::FindInformationResponse { entries }
            }
            Opcode::ReadByTypeRequest => Pdu::ReadByTypeRequest {
                start: r.u16()?,
                end: r.u16()?,
                attribute_type: r.uuid()?,
            },
            Opcode::ReadByTypeResponse => {
                let len = usize::from(r.u8()?);
                if len < 2 {
                    return Err(DecodeError::Malformed(opcode));
                }
                let entries = r
                    .records(len)?
                    .map(|record| (u16::from_le_bytes([record[0], record[1]]), record[2..].to_vec()))
                    .collect();
                Pdu::ReadByTypeResponse { entries }
            }
            Opcode::ReadRequest => Pdu::ReadRequest { handle: r.u16()? },
            Opcode::ReadResponse => Pdu::ReadResponse { value: r.rest() },
            Opcode::ReadBlobRequest => Pdu::ReadBlobRequest {
                handle: r.u16()?,
                offset: r.u16()?,
            },
            Opcode::ReadBlobResponse => Pdu::ReadBlobResponse { value: r.rest() },
            Opcode::ReadByGroupTypeRequest => Pdu::ReadByGroupTypeRequest {
                start: r.u16()?,
                end: r.u16()?,
                group_type: r.uuid()?,
            },
            Opcode::ReadByGroupTypeResponse => {
                let len = usize::from(r.u8()?);
                if len < 4 {
                    return Err(DecodeError::Malformed(opcode));
                }
                let entries = r
                    .records(len)?
                    .map(|record| GroupEntry {
                        handle: u16::from_le_bytes([record[0], record[1]]),
                        end_group: u16::from_le_bytes([record[2], record[3]]),
                        value: record[4..].to_vec(),
                    })
                    .collect();
                Pdu::ReadByGroupTypeResponse { entries }
            }
            Opcode::WriteRequest => Pdu::WriteRequest {
                handle: r.u16()?,
                value: r.rest(),
            },
            Opcode::WriteResponse => Pdu::WriteResponse,
            Opcode::WriteCommand => Pdu::WriteCommand {
                handle: r.u16()?,
                value: r.rest(),
            },
            Opcode::PrepareWriteRequest => Pdu::PrepareWriteRequest {
                handle: r.u16()?,
                offset: r.u16()?,
                value: r.rest(),
            },
            Opcode::PrepareWriteResponse => Pdu::PrepareWriteResponse {
                handle: r.u16()?,
                offset: r.u16()?,
                value: r.rest(),
            },
            Opcode::ExecuteWriteRequest => Pdu::ExecuteWriteRequest {
                commit: match r.u8()? {
                    0x00 => false,
                    0x01 => true,
                    _ => return Err(DecodeError::Malformed(opcode)),
                },
            },
            Opcode::ExecuteWriteResponse => Pdu::ExecuteWriteResponse,
            Opcode::HandleValueNotification => Pdu::HandleValueNotification {
                handle: r.u16()?,
                value: r.rest(),
            },
            Opcode::HandleValueIndication => Pdu::HandleValueIndication {
                handle: r.u16()?,
                value: r.rest(),
            },
            Opcode::HandleValueConfirmation => Pdu::HandleValueConfirmation,
            Opcode::FindByTypeValueRequest
            | Opcode::FindByTypeValueResponse
            | Opcode::ReadMultipleRequest
            | Opcode::ReadMultipleResponse
            | Opcode::SignedWriteCommand => return Err(DecodeError::UnknownOpcode(raw)),
        };
        Ok(pdu)
    }
}

/// The value of a characteristic declaration attribute (Vol 3, Part G, §3.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicDeclaration {
    /// Raw property bits
    pub properties: u8,
    /// Handle of the characteristic value attribute
    pub value_handle: u16,
    /// Characteristic UUID
    pub uuid: Uuid,
}

impl CharacteristicDeclaration {
    /// Parses a declaration value as returned in a Read By Type Response.
    pub fn parse(value: &[u8]) -> Option<Self> {
        if value.len() != 5 && value.len() != 19 {
            return None;
        }
        Some(CharacteristicDeclaration {
            properties: value[0],
            value_handle: u16::from_le_bytes([value[1], value[2]]),
            uuid: Uuid::from_le_bytes_slice(&value[3..])?,
        })
    }

    /// Serializes the declaration value.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![self.properties];
        put_u16(&mut buf, self.value_handle);
        buf.extend(self.uuid.to_att_bytes());
        buf
    }
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

// Only called on slices whose length was checked by `Reader::records`.
fn uuid_at(bytes: &[u8]) -> Uuid {
    Uuid::from_le_bytes_slice(bytes).unwrap_or_default()
}

struct Reader<'a> {
    opcode: Opcode,
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated(self.opcode));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn uuid(&mut self) -> Result<Uuid, DecodeError> {
        let rest = self.rest();
        Uuid::from_le_bytes_slice(&rest).ok_or(DecodeError::Malformed(self.opcode))
    }

    fn rest(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf).to_vec()
    }

    fn records(&mut self, len: usize) -> Result<std::slice::ChunksExact<'a, u8>, DecodeError> {
        if self.buf.is_empty() || self.buf.len() % len != 0 {
            return Err(DecodeError::Malformed(self.opcode));
        }
        Ok(std::mem::take(&mut self.buf).chunks_exact(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btuuid::{attributes, services};

    #[test]
    fn request_layouts() {
        assert_eq!(Pdu::ExchangeMtuRequest { mtu: 500 }.encode(), [0x02, 0xf4, 0x01]);
        assert_eq!(Pdu::ReadRequest { handle: 0x0003 }.encode(), [0x0a, 0x03, 0x00]);
        assert_eq!(
            Pdu::ReadBlobRequest {
                handle: 0x0010,
                offset: 22
            }
            .encode(),
            [0x0c, 0x10, 0x00, 0x16, 0x00]
        );
        assert_eq!(
            Pdu::ReadByGroupTypeRequest {
                start: 0x0001,
                end: 0xffff,
                group_type: attributes::PRIMARY_SERVICE
            }
            .encode(),
            [0x10, 0x01, 0x00, 0xff, 0xff, 0x00, 0x28]
        );
        assert_eq!(
            Pdu::WriteRequest {
                handle: 0x000b,
                value: vec![0x01, 0xff, 0x00, 0x00]
            }
            .encode(),
            [0x12, 0x0b, 0x00, 0x01, 0xff, 0x00, 0x00]
        );
        assert_eq!(Pdu::ExecuteWriteRequest { commit: true }.encode(), [0x18, 0x01]);
    }

    #[test]
    fn decode_error_response() {
        let pdu = Pdu::decode(&[0x01, 0x10, 0x01, 0x00, 0x0a]).unwrap();
        assert_eq!(
            pdu,
            Pdu::ErrorResponse {
                request: Opcode::ReadByGroupTypeRequest as u8,
                handle: 1,
                error: AttError::Known(AttErrorCode::AttributeNotFound),
            }
        );
    }

    #[test]
    fn decode_group_response() {
        // two 16-bit services: 0x0001..=0x0005 Generic Access, 0x0006..=0x0009 Battery
        let bytes = [
            0x11, 0x06, 0x01, 0x00, 0x05, 0x00, 0x00, 0x18, 0x06, 0x00, 0x09, 0x00, 0x0f, 0x18,
        ];
        let Pdu::ReadByGroupTypeResponse { entries } = Pdu::decode(&bytes).unwrap() else {
            panic!("wrong PDU");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].handle, 6);
        assert_eq!(entries[1].end_group, 9);
        assert_eq!(Uuid::from_le_bytes_slice(&entries[1].value), Some(services::BATTERY));
        assert_eq!(Pdu::ReadByGroupTypeResponse { entries }.encode(), bytes);
    }

    #[test]
    fn decode_find_information_long_format() {
        let led: Uuid = "ef680301-9b35-4933-9b10-52ffa9740042".parse().unwrap();
        let mut bytes = vec![0x05, 0x02, 0x0c, 0x00];
        bytes.extend(led.to_att_bytes());
        assert_eq!(
            Pdu::decode(&bytes).unwrap(),
            Pdu::FindInformationResponse {
                entries: vec![(0x000c, led)]
            }
        );
    }

    #[test]
    fn encoding_stops_at_width_change() {
        let led: Uuid = "ef680301-9b35-4933-9b10-52ffa9740042".parse().unwrap();
        let pdu = Pdu::FindInformationResponse {
            entries: vec![(1, services::BATTERY), (2, led)],
        };
        assert_eq!(pdu.encode(), [0x05, 0x01, 0x01, 0x00, 0x0f, 0x18]);
    }

    #[test]
    fn malformed_pdus() {
        assert_eq!(Pdu::decode(&[]), Err(DecodeError::Empty));
        assert_eq!(Pdu::decode(&[0x20]), Err(DecodeError::UnknownOpcode(0x20)));
        assert_eq!(
            Pdu::decode(&[0x0a, 0x01]),
            Err(DecodeError::Truncated(Opcode::ReadRequest))
        );
        assert_eq!(
            Pdu::decode(&[0x09, 0x07, 0x02, 0x00, 0x0a]),
            Err(DecodeError::Malformed(Opcode::ReadByTypeResponse))
        );
    }

    #[test]
    fn characteristic_declaration() {
        let decl = CharacteristicDeclaration::parse(&[0x0a, 0x03, 0x00, 0x00, 0x2a]).unwrap();
        assert_eq!(decl.properties, 0x0a);
        assert_eq!(decl.value_handle, 3);
        assert_eq!(decl.uuid, Uuid::from_u16(0x2a00));
        assert_eq!(decl.to_bytes(), [0x0a, 0x03, 0x00, 0x00, 0x2a]);
        assert!(CharacteristicDeclaration::parse(&[0x0a, 0x03]).is_none());
    }

    #[test]
    fn response_pairs() {
        assert_eq!(Opcode::ReadBlobResponse.request(), Some(Opcode::ReadBlobRequest));
        assert_eq!(Opcode::HandleValueNotification.request(), None);
        assert!(is_command(Opcode::WriteCommand as u8));
        assert!(!is_command(Opcode::WriteRequest as u8));
    }
}
