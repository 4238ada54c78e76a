use bytes::Buf;

use crate::protocol::lenenc::get_lenenc_int;
use crate::protocol::response::{ERR_HEADER, LOCAL_INFILE_HEADER, OK_HEADER};
use crate::protocol::{is_eof_packet, Packet, ProtocolError};

/// One complete step of a backend response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    Ok(Packet),
    Error(Packet),
    /// LOAD DATA LOCAL file request
    LocalInfile(Packet),
    FieldEof {
        header: Packet,
        fields: Vec<Packet>,
        eof: Packet,
    },
    Row(Packet),
    RowEof(Packet),
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Response,
    Fields {
        header: Packet,
        remaining: usize,
        fields: Vec<Packet>,
    },
    FieldEof {
        header: Packet,
        fields: Vec<Packet>,
    },
    Rows,
}

/// Splits a stream of backend packets into response events.
///
/// After an OK, ERR or trailing EOF the reader expects a new response. When
/// the server announced more results (CALL, multi statements) the next
/// result simply follows.
#[derive(Debug, Default)]
pub struct ResponseReader {
    state: State,
}

impl ResponseReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the reader sits in the middle of a result set
    pub fn in_result_set(&self) -> bool {
        !matches!(self.state, State::Response)
    }

    /// Feed one packet; returns the event it completes, if any
    pub fn feed(&mut self, packet: Packet) -> Result<Option<ResponseEvent>, ProtocolError> {
        match std::mem::take(&mut self.state) {
            State::Response => match packet.marker() {
                Some(OK_HEADER) => Ok(Some(ResponseEvent::Ok(packet))),
                Some(ERR_HEADER) => Ok(Some(ResponseEvent::Error(packet))),
                Some(LOCAL_INFILE_HEADER) => Ok(Some(ResponseEvent::LocalInfile(packet))),
                Some(_) => {
                    let mut payload = packet.payload.clone();
                    let count = get_lenenc_int(&mut payload)? as usize;
                    if count == 0 || payload.has_remaining() {
                        return Err(ProtocolError::Malformed(format!(
                            "bad column count packet of {} bytes",
                            packet.payload.len()
                        )));
                    }
                    self.state = State::Fields {
                        header: packet,
                        remaining: count,
                        fields: Vec::with_capacity(count),
                    };
                    Ok(None)
                }
                None => Err(ProtocolError::Malformed("empty response packet".into())),
            },
            State::Fields {
                header,
                remaining,
                mut fields,
            } => {
                if packet.marker() == Some(ERR_HEADER) {
                    return Ok(Some(ResponseEvent::Error(packet)));
                }
                fields.push(packet);
                self.state = if remaining > 1 {
                    State::Fields {
                        header,
                        remaining: remaining - 1,
                        fields,
                    }
                } else {
                    State::FieldEof { header, fields }
                };
                Ok(None)
            }
            State::FieldEof { header, fields } => {
                if packet.marker() == Some(ERR_HEADER) {
                    return Ok(Some(ResponseEvent::Error(packet)));
                }
                if !is_eof_packet(&packet.payload) {
                    return Err(ProtocolError::UnexpectedHeader {
                        expected: "EOF",
                        found: packet.marker().unwrap_or(0),
                    });
                }
                self.state = State::Rows;
                Ok(Some(ResponseEvent::FieldEof {
                    header,
                    fields,
                    eof: packet,
                }))
            }
            State::Rows => {
                if is_eof_packet(&packet.payload) {
                    return Ok(Some(ResponseEvent::RowEof(packet)));
                }
                if packet.marker() == Some(ERR_HEADER) {
                    return Ok(Some(ResponseEvent::Error(packet)));
                }
                self.state = State::Rows;
                Ok(Some(ResponseEvent::Row(packet)))
            }
        }
    }
}
