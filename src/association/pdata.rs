//! P-Data fragmentation and reassembly.
//!
//! This module splits DIMSE messages into presentation data values (PDVs)
//! that honor the negotiated maximum PDU length,
//! and rebuilds full command and data set streams
//! from the PDVs received from the peer.
use snafu::{ensure, Backtrace, Snafu};

use crate::pdu::{PDataValue, PDataValueType, Pdu, PDV_HEADER_SIZE};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "Maximum PDU length {} leaves no room for a PDV payload",
        max_pdu_length
    ))]
    MaxPduLengthTooSmall {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Received fragment for presentation context {}, but stream in progress is for context {}",
        got,
        expected
    ))]
    PresentationContextMismatch {
        expected: u8,
        got: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("Received a {:?} fragment while a {:?} stream was in progress", got, in_progress))]
    InterleavedStreams {
        in_progress: PDataValueType,
        got: PDataValueType,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Split one DIMSE message into a sequence of P-DATA-TF PDUs.
///
/// The command set fragments always come before the data set fragments.
/// No PDV payload exceeds `max_pdu_length - 6`
/// and no PDV spans more than one PDU.
/// With `pack_pdvs`, consecutive PDVs share a PDU
/// when they fit in its remaining space;
/// otherwise every PDV is emitted in its own PDU.
pub fn fragment_message(
    presentation_context_id: u8,
    command: &[u8],
    data: Option<&[u8]>,
    max_pdu_length: u32,
    pack_pdvs: bool,
) -> Result<Vec<Pdu>> {
    // any maximum able to carry at least one payload byte is honored,
    // however small the peer chose to negotiate it
    ensure!(
        max_pdu_length > PDV_HEADER_SIZE,
        MaxPduLengthTooSmallSnafu { max_pdu_length }
    );

    let mut streams: Vec<(PDataValueType, &[u8])> = vec![(PDataValueType::Command, command)];
    if let Some(data) = data {
        streams.push((PDataValueType::Data, data));
    }

    let mut pdus: Vec<Pdu> = vec![];
    let mut current: Vec<PDataValue> = vec![];
    // remaining PDU body capacity, refilled on each flush
    let mut remaining = 0_usize;

    for (value_type, bytes) in streams {
        let mut offset = 0;
        loop {
            if !(pack_pdvs && remaining > PDV_HEADER_SIZE as usize) {
                if !current.is_empty() {
                    pdus.push(Pdu::PData {
                        data: std::mem::take(&mut current),
                    });
                }
                remaining = max_pdu_length as usize;
            }
            let capacity = remaining - PDV_HEADER_SIZE as usize;
            let take = capacity.min(bytes.len() - offset);
            let is_last = offset + take == bytes.len();
            current.push(PDataValue {
                presentation_context_id,
                value_type,
                is_last,
                data: bytes[offset..offset + take].to_vec(),
            });
            remaining -= PDV_HEADER_SIZE as usize + take;
            offset += take;
            if is_last {
                break;
            }
        }
    }
    if !current.is_empty() {
        pdus.push(Pdu::PData { data: current });
    }

    Ok(pdus)
}

/// The number of PDVs needed to carry `len` bytes
/// under the given maximum PDU length.
///
/// An empty stream still takes one PDV,
/// so that the last-fragment marker is carried.
pub fn pdv_count(len: usize, max_pdu_length: u32) -> usize {
    let max_payload = (max_pdu_length - PDV_HEADER_SIZE) as usize;
    if len == 0 {
        1
    } else {
        (len + max_payload - 1) / max_payload
    }
}

/// A fully reassembled command or data set stream
/// of one presentation context.
#[derive(Debug, Clone, PartialEq)]
pub enum ReassembledStream {
    Command {
        presentation_context_id: u8,
        data: Vec<u8>,
    },
    Data {
        presentation_context_id: u8,
        data: Vec<u8>,
    },
}

impl ReassembledStream {
    pub fn presentation_context_id(&self) -> u8 {
        match self {
            ReassembledStream::Command {
                presentation_context_id,
                ..
            }
            | ReassembledStream::Data {
                presentation_context_id,
                ..
            } => *presentation_context_id,
        }
    }
}

/// An accumulator rebuilding command and data set streams
/// from incoming presentation data values.
///
/// Fragments of one stream must arrive consecutively
/// and all belong to the same presentation context;
/// anything else is a protocol error
/// which the association layer answers with an abort.
#[derive(Debug, Default)]
pub struct MessageReassembler {
    in_progress: Option<(u8, PDataValueType)>,
    buffer: Vec<u8>,
}

impl MessageReassembler {
    pub fn new() -> Self {
        MessageReassembler::default()
    }

    /// Feed one PDV into the accumulator.
    ///
    /// Returns a completed stream once its last fragment arrives,
    /// `None` while the stream is still in progress.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<ReassembledStream>> {
        match self.in_progress {
            None => {
                self.in_progress = Some((pdv.presentation_context_id, pdv.value_type));
            }
            Some((pcid, value_type)) => {
                ensure!(
                    pcid == pdv.presentation_context_id,
                    PresentationContextMismatchSnafu {
                        expected: pcid,
                        got: pdv.presentation_context_id,
                    }
                );
                ensure!(
                    value_type == pdv.value_type,
                    InterleavedStreamsSnafu {
                        in_progress: value_type,
                        got: pdv.value_type,
                    }
                );
            }
        }

        self.buffer.extend(pdv.data);

        if !pdv.is_last {
            return Ok(None);
        }

        let data = std::mem::take(&mut self.buffer);
        // in_progress is always set at this point
        let (presentation_context_id, value_type) = self.in_progress.take().unwrap();
        Ok(Some(match value_type {
            PDataValueType::Command => ReassembledStream::Command {
                presentation_context_id,
                data,
            },
            PDataValueType::Data => ReassembledStream::Data {
                presentation_context_id,
                data,
            },
        }))
    }

    /// Whether a stream is partially accumulated.
    pub fn is_in_progress(&self) -> bool {
        self.in_progress.is_some()
    }
}
