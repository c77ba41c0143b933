//! P-Data fragmentation and reassembly
//!
//! The DIMSE layer exchanges whole command and data sets;
//! on the wire they travel as presentation data value fragments
//! inside P-DATA-TF PDUs bounded by the peer's maximum length.
//! [`fragment_message`] performs the outbound split,
//! [`MessageAssembler`] the inbound reassembly,
//! and [`PDataWriter`] offers a streaming alternative
//! for data sets that should not be buffered whole.

use snafu::Snafu;
use std::io::Write;

use crate::pdu::{PDataValue, PDataValueType, Pdu, PDV_HEADER_SIZE};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// presentation data values of one message
    /// must all refer to the same presentation context
    #[snafu(display(
        "presentation context mismatch within message: expected {}, got {}",
        expected,
        got
    ))]
    ContextMismatch { expected: u8, got: u8 },

    /// a fragment arrived for a stream that was already completed
    #[snafu(display("unexpected {:?} fragment after its last fragment", value_type))]
    FragmentAfterLast { value_type: PDataValueType },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Split a DIMSE message into P-DATA-TF PDUs
/// no larger than `max_pdu_length`.
///
/// Command fragments are emitted first,
/// the last fragment of each stream marked as such.
/// A command and its data set share one PDU when both fit;
/// otherwise every PDU carries a single fragment
/// filled up to the maximum length.
pub fn fragment_message(
    presentation_context_id: u8,
    command: Vec<u8>,
    data: Option<Vec<u8>>,
    max_pdu_length: u32,
) -> Vec<Pdu> {
    let max_payload = (max_pdu_length - PDV_HEADER_SIZE) as usize;

    // a command with a small data set travels in a single PDU
    let data = match data {
        Some(data_bytes)
            if command.len() + data_bytes.len() + 2 * PDV_HEADER_SIZE as usize
                <= max_pdu_length as usize =>
        {
            return vec![Pdu::PData {
                data: vec![
                    PDataValue {
                        presentation_context_id,
                        value_type: PDataValueType::Command,
                        is_last: true,
                        data: command,
                    },
                    PDataValue {
                        presentation_context_id,
                        value_type: PDataValueType::Data,
                        is_last: true,
                        data: data_bytes,
                    },
                ],
            }];
        }
        other => other,
    };

    let mut pdus = Vec::new();
    fragment_stream(
        &mut pdus,
        presentation_context_id,
        PDataValueType::Command,
        command,
        max_payload,
    );
    if let Some(data) = data {
        fragment_stream(
            &mut pdus,
            presentation_context_id,
            PDataValueType::Data,
            data,
            max_payload,
        );
    }
    pdus
}

fn fragment_stream(
    pdus: &mut Vec<Pdu>,
    presentation_context_id: u8,
    value_type: PDataValueType,
    mut bytes: Vec<u8>,
    max_payload: usize,
) {
    while bytes.len() > max_payload {
        let rest = bytes.split_off(max_payload);
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: false,
                data: std::mem::replace(&mut bytes, rest),
            }],
        });
    }
    pdus.push(Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id,
            value_type,
            is_last: true,
            data: bytes,
        }],
    });
}

/// A fully reassembled command or data set stream.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AssembledPart {
    /// a complete command set, in Implicit VR Little Endian
    Command { context_id: u8, data: Vec<u8> },
    /// a complete data set, in the context's transfer syntax
    Data { context_id: u8, data: Vec<u8> },
}

/// Incremental reassembly of presentation data values
/// into complete command and data set streams.
///
/// All fragments pushed between two calls to [`reset`](Self::reset)
/// must belong to the same presentation context.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    context_id: Option<u8>,
    command: Vec<u8>,
    command_done: bool,
    data: Vec<u8>,
    data_done: bool,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The presentation context of the message being assembled, if any.
    pub fn context_id(&self) -> Option<u8> {
        self.context_id
    }

    /// Feed one fragment,
    /// returning a completed stream when its last fragment arrives.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<AssembledPart>> {
        match self.context_id {
            Some(expected) if expected != pdv.presentation_context_id => {
                return ContextMismatchSnafu {
                    expected,
                    got: pdv.presentation_context_id,
                }
                .fail();
            }
            None => self.context_id = Some(pdv.presentation_context_id),
            _ => {}
        }

        let context_id = pdv.presentation_context_id;
        match pdv.value_type {
            PDataValueType::Command => {
                if self.command_done {
                    return FragmentAfterLastSnafu {
                        value_type: PDataValueType::Command,
                    }
                    .fail();
                }
                self.command.extend(pdv.data);
                if pdv.is_last {
                    self.command_done = true;
                    return Ok(Some(AssembledPart::Command {
                        context_id,
                        data: std::mem::take(&mut self.command),
                    }));
                }
            }
            PDataValueType::Data => {
                if self.data_done {
                    return FragmentAfterLastSnafu {
                        value_type: PDataValueType::Data,
                    }
                    .fail();
                }
                self.data.extend(pdv.data);
                if pdv.is_last {
                    self.data_done = true;
                    return Ok(Some(AssembledPart::Data {
                        context_id,
                        data: std::mem::take(&mut self.data),
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Discard all progress and prepare for the next message.
    pub fn reset(&mut self) {
        *self = MessageAssembler::new();
    }
}

/// A P-Data value writer.
///
/// This exposes an API to iteratively construct and send data messages
/// to another node.
/// Using this as a [standard writer](std::io::Write)
/// will automatically split the incoming bytes
/// into separate PDUs if they do not fit in a single one.
#[must_use]
pub struct PDataWriter<W: Write> {
    buffer: Vec<u8>,
    stream: W,
    presentation_context_id: u8,
    value_type: PDataValueType,
    max_data_length: u32,
    finished: bool,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Construct a new P-Data value writer
    /// for fragments of the given kind.
    pub(crate) fn new(
        stream: W,
        presentation_context_id: u8,
        value_type: PDataValueType,
        max_pdu_length: u32,
    ) -> Self {
        let max_data_length = max_pdu_length - PDV_HEADER_SIZE;
        PDataWriter {
            stream,
            presentation_context_id,
            value_type,
            max_data_length,
            buffer: Vec::with_capacity(max_data_length as usize),
            finished: false,
        }
    }

    /// Send the header of a single P-Data PDU,
    /// containing a single fragment of the given length.
    fn send_pdata_header(&mut self, data_len: u32, is_last: bool) -> std::io::Result<()> {
        let mut message_header = 0x00;
        if let PDataValueType::Command = self.value_type {
            message_header |= 0x01;
        }
        if is_last {
            message_header |= 0x02;
        }

        let pdu_len_bytes = (data_len + 2 + 4).to_be_bytes();
        let data_len_bytes = (data_len + 2).to_be_bytes();
        let header = [
            // PDU-type + reserved byte
            0x04,
            0x00,
            // full PDU length
            pdu_len_bytes[0],
            pdu_len_bytes[1],
            pdu_len_bytes[2],
            pdu_len_bytes[3],
            // presentation data item length (data + context id + header)
            data_len_bytes[0],
            data_len_bytes[1],
            data_len_bytes[2],
            data_len_bytes[3],
            // presentation context id
            self.presentation_context_id,
            // message control header
            message_header,
        ];

        self.stream.write_all(&header)
    }

    /// Send whatever remains in the buffer
    /// as the final fragment of the stream.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.finish_impl()
    }

    fn finish_impl(&mut self) -> std::io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.dispatch_excess_data()?;
        // the last fragment is always emitted,
        // even if it carries no bytes
        self.send_pdata_header(self.buffer.len() as u32, true)?;
        self.stream.write_all(&self.buffer[..])?;
        self.buffer.clear();
        self.finished = true;
        self.stream.flush()
    }

    fn dispatch_excess_data(&mut self) -> std::io::Result<()> {
        while self.buffer.len() > self.max_data_length as usize {
            self.send_pdata_header(self.max_data_length, false)?;
            self.stream
                .write_all(&self.buffer[..self.max_data_length as usize])?;
            self.buffer.drain(..self.max_data_length as usize);
        }
        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend(buf);
        self.dispatch_excess_data()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // fragments are only dispatched when full or on finish
        Ok(())
    }
}

impl<W> Drop for PDataWriter<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish_impl();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{read_pdu, MINIMUM_PDU_SIZE};

    fn collect_pdvs(pdus: Vec<Pdu>) -> Vec<PDataValue> {
        pdus.into_iter()
            .flat_map(|pdu| match pdu {
                Pdu::PData { data } => data,
                other => panic!("expected P-DATA-TF, got {:?}", other),
            })
            .collect()
    }

    #[test]
    fn small_message_travels_in_one_pdu() {
        let pdus = fragment_message(1, vec![1; 100], Some(vec![2; 200]), MINIMUM_PDU_SIZE);
        assert_eq!(pdus.len(), 1);
        let pdvs = collect_pdvs(pdus);
        assert_eq!(pdvs.len(), 2);
        assert_eq!(pdvs[0].value_type, PDataValueType::Command);
        assert!(pdvs[0].is_last);
        assert_eq!(pdvs[1].value_type, PDataValueType::Data);
        assert!(pdvs[1].is_last);
    }

    #[test]
    fn large_data_set_is_fragmented_within_bounds() {
        let max = 16_384;
        let data_len = 50_000;
        let pdus = fragment_message(1, vec![1; 120], Some(vec![2; data_len]), max);

        // 50 000 bytes cannot fit in fewer than 4 PDUs of 16 384
        assert!(pdus.len() >= 4);

        for pdu in &pdus {
            let mut bytes = Vec::new();
            crate::pdu::write_pdu(&mut bytes, pdu).unwrap();
            // no PDU exceeds the advertised maximum plus its header
            assert!(bytes.len() as u32 <= max + crate::pdu::PDU_HEADER_SIZE);
        }

        let pdvs = collect_pdvs(pdus);
        // the payload bytes add up exactly
        let command_total: usize = pdvs
            .iter()
            .filter(|pdv| pdv.value_type == PDataValueType::Command)
            .map(|pdv| pdv.data.len())
            .sum();
        let data_total: usize = pdvs
            .iter()
            .filter(|pdv| pdv.value_type == PDataValueType::Data)
            .map(|pdv| pdv.data.len())
            .sum();
        assert_eq!(command_total, 120);
        assert_eq!(data_total, data_len);

        // exactly one last fragment per stream
        let last_commands = pdvs
            .iter()
            .filter(|pdv| pdv.value_type == PDataValueType::Command && pdv.is_last)
            .count();
        let last_data = pdvs
            .iter()
            .filter(|pdv| pdv.value_type == PDataValueType::Data && pdv.is_last)
            .count();
        assert_eq!(last_commands, 1);
        assert_eq!(last_data, 1);

        // command fragments come before data fragments
        let first_data = pdvs
            .iter()
            .position(|pdv| pdv.value_type == PDataValueType::Data)
            .unwrap();
        assert!(pdvs[..first_data]
            .iter()
            .all(|pdv| pdv.value_type == PDataValueType::Command));
    }

    #[test]
    fn assembler_recombines_fragments() {
        let command = vec![1; 5000];
        let data = vec![2; 20_000];
        let pdus = fragment_message(7, command.clone(), Some(data.clone()), MINIMUM_PDU_SIZE);

        let mut assembler = MessageAssembler::new();
        let mut parts = Vec::new();
        for pdv in collect_pdvs(pdus) {
            if let Some(part) = assembler.push(pdv).unwrap() {
                parts.push(part);
            }
        }
        assert_eq!(
            parts,
            vec![
                AssembledPart::Command {
                    context_id: 7,
                    data: command,
                },
                AssembledPart::Data {
                    context_id: 7,
                    data,
                },
            ]
        );
    }

    #[test]
    fn assembler_rejects_context_mixing() {
        let mut assembler = MessageAssembler::new();
        assembler
            .push(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: false,
                data: vec![0; 8],
            })
            .unwrap();
        let err = assembler.push(PDataValue {
            presentation_context_id: 3,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![0; 8],
        });
        assert!(matches!(err, Err(Error::ContextMismatch { expected: 1, got: 3 })));
    }

    #[test]
    fn pdata_writer_splits_at_the_maximum_length() {
        let mut buf = Vec::new();
        {
            let mut writer =
                PDataWriter::new(&mut buf, 3, PDataValueType::Data, MINIMUM_PDU_SIZE);
            writer
                .write_all(&vec![0x55; MINIMUM_PDU_SIZE as usize + 100])
                .unwrap();
            writer.finish().unwrap();
        }

        let mut cursor = &buf[..];
        let pdu_1 = read_pdu(&mut cursor, MINIMUM_PDU_SIZE, true).unwrap().unwrap();
        let pdu_2 = read_pdu(&mut cursor, MINIMUM_PDU_SIZE, true).unwrap().unwrap();
        assert_eq!(cursor.len(), 0);

        match (pdu_1, pdu_2) {
            (Pdu::PData { data: d1 }, Pdu::PData { data: d2 }) => {
                assert_eq!(d1.len(), 1);
                assert_eq!(d2.len(), 1);
                assert!(!d1[0].is_last);
                assert!(d2[0].is_last);
                assert_eq!(
                    d1[0].data.len() + d2[0].data.len(),
                    MINIMUM_PDU_SIZE as usize + 100
                );
            }
            other => panic!("expected two P-DATA-TF PDUs, got {:?}", other),
        }
    }
}
