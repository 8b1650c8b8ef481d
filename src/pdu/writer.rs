//! PDU writer module
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write chunk of {} PDU structure: {}", name, source))]
    WriteChunk {
        /// the name of the PDU structure
        name: &'static str,
        source: WriteChunkError,
    },

    #[snafu(display("Could not write field `{}`: {}", field, source))]
    WriteField {
        field: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not write {} reserved bytes: {}", bytes, source))]
    WriteReserved {
        bytes: u32,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Field `{}` contains non ISO 646 characters", field))]
    EncodeField {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("AE title `{}` is too long ({} characters, maximum is 16)", value, value.len()))]
    AeTitleTooLong { value: String, backtrace: Backtrace },

    #[snafu(display(
        "Invalid presentation context ID {} (must be an odd integer between 1 and 255)",
        id
    ))]
    InvalidPresentationContextId { id: u8, backtrace: Backtrace },

    #[snafu(display("UID `{}` is too long ({} characters, maximum is 64)", value, value.len()))]
    UidTooLong { value: String, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("Failed to build chunk: {}", source))]
    BuildChunk {
        backtrace: Backtrace,
        source: Box<Error>,
    },
    #[snafu(display("Failed to write chunk length: {}", source))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write chunk data: {}", source))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let length = data.len() as u32;
    writer
        .write_u32::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let length = data.len() as u16;
    writer
        .write_u16::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Encode a text field as ISO 646 (basic G0 set).
fn encode_text(value: &str, field: &'static str) -> Result<Vec<u8>> {
    ensure!(value.is_ascii(), EncodeFieldSnafu { field });
    Ok(value.as_bytes().to_vec())
}

/// Encode an AE title as a 16 byte field padded with spaces.
fn encode_ae_title(value: &str, field: &'static str) -> Result<Vec<u8>> {
    ensure!(
        value.len() <= 16,
        AeTitleTooLongSnafu {
            value: value.to_string()
        }
    );
    let mut bytes = encode_text(value, field)?;
    bytes.resize(16, b' ');
    Ok(bytes)
}

fn check_uid(value: &str, field: &'static str) -> Result<()> {
    ensure!(value.is_ascii(), EncodeFieldSnafu { field });
    ensure!(
        value.len() <= 64,
        UidTooLongSnafu {
            value: value.to_string()
        }
    );
    Ok(())
}

fn check_presentation_context_id(id: u8) -> Result<()> {
    ensure!(id % 2 == 1, InvalidPresentationContextIdSnafu { id });
    Ok(())
}

/// Validate the structural constraints of a PDU
/// without writing anything.
///
/// [`write_pdu`] performs this check up front,
/// so that an invalid PDU never leaves partial bytes on the wire.
pub fn check_pdu(pdu: &Pdu) -> Result<()> {
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            ..
        }) => {
            encode_ae_title(called_ae_title, "Called-AE-title")?;
            encode_ae_title(calling_ae_title, "Calling-AE-title")?;
            check_uid(application_context_name, "Application-context-name")?;
            for pc in presentation_contexts {
                check_presentation_context_id(pc.id)?;
                check_uid(&pc.abstract_syntax, "Abstract-syntax-name")?;
                for ts in &pc.transfer_syntaxes {
                    check_uid(ts, "Transfer-syntax-name")?;
                }
            }
            Ok(())
        }
        Pdu::AssociationAC(AssociationAC {
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            ..
        }) => {
            encode_ae_title(called_ae_title, "Called-AE-title")?;
            encode_ae_title(calling_ae_title, "Calling-AE-title")?;
            check_uid(application_context_name, "Application-context-name")?;
            // result items echo the proposed IDs unchanged,
            // including invalid ones being rejected per context
            for pc in presentation_contexts {
                check_uid(&pc.transfer_syntax, "Transfer-syntax-name")?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    check_pdu(pdu)?;
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // A-ASSOCIATE-RQ PDU Structure

            // 1 - PDU-type - 01H
            writer
                .write_u8(0x01)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // 7-8 - Protocol-version (bit 0 set for version 1)
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;

                // 9-10 - Reserved
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // 11-26 - Called-AE-title, 16 ISO 646 characters space padded
                let ae_title_bytes = encode_ae_title(called_ae_title, "Called-AE-title")?;
                writer.write_all(&ae_title_bytes).context(WriteFieldSnafu {
                    field: "Called-AE-title",
                })?;

                // 27-42 - Calling-AE-title, same encoding
                let ae_title_bytes = encode_ae_title(calling_ae_title, "Calling-AE-title")?;
                writer.write_all(&ae_title_bytes).context(WriteFieldSnafu {
                    field: "Calling-AE-title",
                })?;

                // 43-74 - Reserved
                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                write_pdu_variable_application_context_name(writer, application_context_name)?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_proposed(writer, presentation_context)?;
                }

                write_pdu_variable_user_variables(writer, user_variables)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RQ",
            })?;

            Ok(())
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // A-ASSOCIATE-AC PDU Structure

            // 1 - PDU-type - 02H
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // 7-8 - Protocol-version
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;

                // 9-10 - Reserved
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // 11-26 and 27-42 - echoes of the AE title fields of the RQ,
                // not tested by the peer on receipt
                let ae_title_bytes = encode_ae_title(called_ae_title, "Called-AE-title")?;
                writer.write_all(&ae_title_bytes).context(WriteFieldSnafu {
                    field: "Called-AE-title",
                })?;

                let ae_title_bytes = encode_ae_title(calling_ae_title, "Calling-AE-title")?;
                writer.write_all(&ae_title_bytes).context(WriteFieldSnafu {
                    field: "Calling-AE-title",
                })?;

                // 43-74 - Reserved
                writer
                    .write_all(&[0_u8; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                // 75-xxx - Variable items
                write_pdu_variable_application_context_name(writer, application_context_name)?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_result(writer, presentation_context)?;
                }

                write_pdu_variable_user_variables(writer, user_variables)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-AC",
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            // 1 - PDU-type - 03H
            writer
                .write_u8(0x03)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // 7 - Reserved
                writer
                    .write_u8(0x00)
                    .context(WriteReservedSnafu { bytes: 1_u32 })?;

                // 8 - Result: 1 rejected-permanent, 2 rejected-transient
                writer
                    .write_u8(match result {
                        AssociationRJResult::Permanent => 0x01,
                        AssociationRJResult::Transient => 0x02,
                    })
                    .context(WriteFieldSnafu {
                        field: "AssociationRJResult",
                    })?;

                // 9 - Source, 10 - Reason/Diag
                match source {
                    AssociationRJSource::ServiceUser(reason) => {
                        writer.write_u8(0x01).context(WriteFieldSnafu {
                            field: "AssociationRJSource",
                        })?;
                        writer
                            .write_u8(match reason {
                                AssociationRJServiceUserReason::NoReasonGiven => 0x01,
                                AssociationRJServiceUserReason::ApplicationContextNameNotSupported => {
                                    0x02
                                }
                                AssociationRJServiceUserReason::CallingAETitleNotRecognized => 0x03,
                                AssociationRJServiceUserReason::CalledAETitleNotRecognized => 0x07,
                                AssociationRJServiceUserReason::Reserved(data) => *data,
                            })
                            .context(WriteFieldSnafu {
                                field: "AssociationRJServiceUserReason",
                            })?;
                    }
                    AssociationRJSource::ServiceProviderASCE(reason) => {
                        writer.write_u8(0x02).context(WriteFieldSnafu {
                            field: "AssociationRJSource",
                        })?;
                        writer
                            .write_u8(match reason {
                                AssociationRJServiceProviderASCEReason::NoReasonGiven => 0x01,
                                AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported => {
                                    0x02
                                }
                            })
                            .context(WriteFieldSnafu {
                                field: "AssociationRJServiceProviderASCEReason",
                            })?;
                    }
                    AssociationRJSource::ServiceProviderPresentation(reason) => {
                        writer.write_u8(0x03).context(WriteFieldSnafu {
                            field: "AssociationRJSource",
                        })?;
                        writer
                            .write_u8(match reason {
                                AssociationRJServiceProviderPresentationReason::TemporaryCongestion => {
                                    0x01
                                }
                                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => {
                                    0x02
                                }
                                AssociationRJServiceProviderPresentationReason::Reserved(data) => *data,
                            })
                            .context(WriteFieldSnafu {
                                field: "AssociationRJServiceProviderPresentationReason",
                            })?;
                    }
                }

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })?;

            Ok(())
        }
        Pdu::PData { data } => {
            // 1 - PDU-type - 04H
            writer
                .write_u8(0x04)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // 7-xxx - one or more presentation-data-value items
                for presentation_data_value in data {
                    write_chunk_u32(writer, |writer| {
                        // 5 - Presentation-context-ID
                        writer
                            .write_u8(presentation_data_value.presentation_context_id)
                            .context(WriteFieldSnafu {
                                field: "Presentation-context-ID",
                            })?;

                        // 6 - Message control header:
                        // bit 0 set for a command fragment,
                        // bit 1 set for the last fragment
                        let mut message_header = 0x00;
                        if let PDataValueType::Command = presentation_data_value.value_type {
                            message_header |= 0x01;
                        }
                        if presentation_data_value.is_last {
                            message_header |= 0x02;
                        }
                        writer.write_u8(message_header).context(WriteFieldSnafu {
                            field: "Presentation-data-value control header",
                        })?;

                        // Message fragment
                        writer
                            .write_all(&presentation_data_value.data)
                            .context(WriteFieldSnafu {
                                field: "Presentation-data-value",
                            })?;

                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Presentation-data-value item",
                    })?;
                }

                Ok(())
            })
            .context(WriteChunkSnafu { name: "PData" })
        }
        Pdu::ReleaseRQ => {
            // 1 - PDU-type - 05H
            writer
                .write_u8(0x05)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer.write_all(&[0u8; 4]).context(WriteFieldSnafu {
                    field: "ReleaseRQ data",
                })
            })
            .context(WriteChunkSnafu { name: "ReleaseRQ" })?;

            Ok(())
        }
        Pdu::ReleaseRP => {
            // 1 - PDU-type - 06H
            writer
                .write_u8(0x06)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer.write_all(&[0u8; 4]).context(WriteFieldSnafu {
                    field: "ReleaseRP data",
                })
            })
            .context(WriteChunkSnafu { name: "ReleaseRP" })?;

            Ok(())
        }
        Pdu::AbortRQ { source } => {
            // 1 - PDU-type - 07H
            writer
                .write_u8(0x07)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // 7-8 - Reserved
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // 9 - Source, 10 - Reason/Diag
                // (the reason is significant for provider initiated aborts only)
                match source {
                    AbortRQSource::ServiceUser => writer.write_all(&[0x00, 0x00]),
                    AbortRQSource::Reserved => writer.write_all(&[0x01, 0x00]),
                    AbortRQSource::ServiceProvider(reason) => {
                        writer.write_u8(0x02).context(WriteFieldSnafu {
                            field: "AbortRQSource",
                        })?;
                        writer.write_u8(match reason {
                            AbortRQServiceProviderReason::ReasonNotSpecified => 0x00,
                            AbortRQServiceProviderReason::UnrecognizedPdu => 0x01,
                            AbortRQServiceProviderReason::UnexpectedPdu => 0x02,
                            AbortRQServiceProviderReason::Reserved => 0x03,
                            AbortRQServiceProviderReason::UnrecognizedPduParameter => 0x04,
                            AbortRQServiceProviderReason::UnexpectedPduParameter => 0x05,
                            AbortRQServiceProviderReason::InvalidPduParameter => 0x06,
                        })
                    }
                }
                .context(WriteFieldSnafu {
                    field: "AbortRQSource",
                })?;

                Ok(())
            })
            .context(WriteChunkSnafu { name: "AbortRQ" })?;

            Ok(())
        }
        Pdu::Unknown { pdu_type, data } => {
            // 1 - PDU-type - XXH
            writer
                .write_u8(*pdu_type)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer.write_all(data).context(WriteFieldSnafu {
                    field: "Unknown data",
                })
            })
            .context(WriteChunkSnafu { name: "Unknown" })?;

            Ok(())
        }
    }
}

fn write_pdu_variable_application_context_name(
    writer: &mut dyn Write,
    application_context_name: &str,
) -> Result<()> {
    // Application Context Item Structure
    // 1 - Item-type - 10H
    writer
        .write_u8(0x10)
        .context(WriteFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        // 5-xxx - Application-context-name, structured as a UID
        writer
            .write_all(&encode_text(
                application_context_name,
                "Application-context-name",
            )?)
            .context(WriteFieldSnafu {
                field: "Application-context-name",
            })
    })
    .context(WriteChunkSnafu {
        name: "Application Context Item",
    })?;

    Ok(())
}

fn write_pdu_variable_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
) -> Result<()> {
    // Presentation Context Item Structure (proposed)
    // 1 - Item-type - 20H
    writer
        .write_u8(0x20)
        .context(WriteFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        // 5 - Presentation-context-ID
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // 6-8 - Reserved
        writer
            .write_all(&[0x00; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        // 9-xxx - one abstract syntax sub-item
        // and one or more transfer syntax sub-items

        // Abstract Syntax Sub-Item
        // 1 - Item-type - 30H
        writer
            .write_u8(0x30)
            .context(WriteFieldSnafu { field: "Item-type" })?;

        // 2 - Reserved
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        write_chunk_u16(writer, |writer| {
            writer
                .write_all(&encode_text(
                    &presentation_context.abstract_syntax,
                    "Abstract-syntax-name",
                )?)
                .context(WriteFieldSnafu {
                    field: "Abstract-syntax-name",
                })
        })
        .context(WriteChunkSnafu {
            name: "Abstract Syntax Sub-Item",
        })?;

        for transfer_syntax in &presentation_context.transfer_syntaxes {
            // Transfer Syntax Sub-Item
            // 1 - Item-type - 40H
            writer
                .write_u8(0x40)
                .context(WriteFieldSnafu { field: "Item-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u16(writer, |writer| {
                writer
                    .write_all(&encode_text(transfer_syntax, "Transfer-syntax-name")?)
                    .context(WriteFieldSnafu {
                        field: "Transfer-syntax-name",
                    })
            })
            .context(WriteChunkSnafu {
                name: "Transfer Syntax Sub-Item",
            })?;
        }

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })?;

    Ok(())
}

fn write_pdu_variable_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
) -> Result<()> {
    // Presentation Context Item Structure (result)
    // 1 - Item-type - 21H
    writer
        .write_u8(0x21)
        .context(WriteFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        // 5 - Presentation-context-ID
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // 6 - Reserved
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        // 7 - Result/Reason
        writer
            .write_u8(match &presentation_context.reason {
                PresentationContextResultReason::Acceptance => 0,
                PresentationContextResultReason::UserRejection => 1,
                PresentationContextResultReason::NoReason => 2,
                PresentationContextResultReason::AbstractSyntaxNotSupported => 3,
                PresentationContextResultReason::TransferSyntaxesNotSupported => 4,
            })
            .context(WriteFieldSnafu {
                field: "Result/Reason",
            })?;

        // 8 - Reserved
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        // 9-xxx - exactly one transfer syntax sub-item,
        // not significant unless the context was accepted

        // 1 - Item-type - 40H
        writer
            .write_u8(0x40)
            .context(WriteFieldSnafu { field: "Item-type" })?;

        // 2 - Reserved
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        write_chunk_u16(writer, |writer| {
            writer
                .write_all(&encode_text(
                    &presentation_context.transfer_syntax,
                    "Transfer-syntax-name",
                )?)
                .context(WriteFieldSnafu {
                    field: "Transfer-syntax-name",
                })?;

            Ok(())
        })
        .context(WriteChunkSnafu {
            name: "Transfer Syntax Sub-Item",
        })?;

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })
}

fn write_pdu_variable_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    // User Information Item Structure
    // 1 - Item-type - 50H
    writer
        .write_u8(0x50)
        .context(WriteFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    // 1 - Item-type - 51H
                    writer
                        .write_u8(0x51)
                        .context(WriteFieldSnafu { field: "Item-type" })?;

                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        // 5-8 - Maximum-length-received,
                        // zero meaning no maximum stated
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Maximum-length-received",
                    })?;
                }
                UserVariableItem::ImplementationClassUID(implementation_class_uid) => {
                    // 1 - Item-type - 52H
                    writer
                        .write_u8(0x52)
                        .context(WriteFieldSnafu { field: "Item-type" })?;

                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(&encode_text(
                                implementation_class_uid,
                                "Implementation-class-uid",
                            )?)
                            .context(WriteFieldSnafu {
                                field: "Implementation-class-uid",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation-class-uid",
                    })?;
                }
                UserVariableItem::AsyncOperationsWindow(window) => {
                    // 1 - Item-type - 53H
                    writer
                        .write_u8(0x53)
                        .context(WriteFieldSnafu { field: "Item-type" })?;

                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        // 5-6 - Maximum-number-operations-invoked
                        // 7-8 - Maximum-number-operations-performed
                        writer
                            .write_u16::<BigEndian>(window.max_operations_invoked)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        writer
                            .write_u16::<BigEndian>(window.max_operations_performed)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Asynchronous-operations-window",
                    })?;
                }
                UserVariableItem::RoleSelection(role) => {
                    // 1 - Item-type - 54H
                    writer
                        .write_u8(0x54)
                        .context(WriteFieldSnafu { field: "Item-type" })?;

                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        // 5-6 - UID-length, 7-xxx - SOP-class-uid
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(&encode_text(&role.sop_class_uid, "SOP-class-uid")?)
                                .context(WriteFieldSnafu {
                                    field: "SOP-class-uid",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "SOP-class-uid",
                        })?;

                        // SCU-role and SCP-role flags
                        writer
                            .write_u8(role.scu_role as u8)
                            .context(WriteFieldSnafu { field: "SCU-role" })?;
                        writer
                            .write_u8(role.scp_role as u8)
                            .context(WriteFieldSnafu { field: "SCP-role" })
                    })
                    .context(WriteChunkSnafu {
                        name: "SCP/SCU role selection",
                    })?;
                }
                UserVariableItem::ImplementationVersionName(implementation_version_name) => {
                    // 1 - Item-type - 55H
                    writer
                        .write_u8(0x55)
                        .context(WriteFieldSnafu { field: "Item-type" })?;

                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        // 1 to 16 ISO 646 characters
                        writer
                            .write_all(&encode_text(
                                implementation_version_name,
                                "Implementation-version-name",
                            )?)
                            .context(WriteFieldSnafu {
                                field: "Implementation-version-name",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation-version-name",
                    })?;
                }
                UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
                    // 1 - Item-type - 56H
                    writer
                        .write_u8(0x56)
                        .context(WriteFieldSnafu { field: "Item-type" })?;

                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        // 5-6 - SOP-class-uid-length, 7-xxx - SOP-class-uid
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(&encode_text(sop_class_uid, "SOP-class-uid")?)
                                .context(WriteFieldSnafu {
                                    field: "SOP-class-uid",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "SOP-class-uid",
                        })?;

                        // xxx-xxx - Service-class-application-information
                        writer.write_all(data).context(WriteFieldSnafu {
                            field: "Service-class-application-information",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "SOP class extended negotiation",
                    })?;
                }
                UserVariableItem::SopClassCommonExtendedNegotiationSubItem(item) => {
                    // 1 - Item-type - 57H
                    writer
                        .write_u8(0x57)
                        .context(WriteFieldSnafu { field: "Item-type" })?;

                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(&encode_text(&item.sop_class_uid, "SOP-class-uid")?)
                                .context(WriteFieldSnafu {
                                    field: "SOP-class-uid",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "SOP-class-uid",
                        })?;

                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(&encode_text(
                                    &item.service_class_uid,
                                    "Service-class-uid",
                                )?)
                                .context(WriteFieldSnafu {
                                    field: "Service-class-uid",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "Service-class-uid",
                        })?;

                        // a sequence of length-prefixed related SOP class UIDs
                        write_chunk_u16(writer, |writer| {
                            for related in &item.related_general_sop_classes {
                                write_chunk_u16(writer, |writer| {
                                    writer
                                        .write_all(&encode_text(
                                            related,
                                            "Related-general-sop-class-uid",
                                        )?)
                                        .context(WriteFieldSnafu {
                                            field: "Related-general-sop-class-uid",
                                        })
                                })
                                .context(WriteChunkSnafu {
                                    name: "Related-general-sop-class-uid",
                                })?;
                            }
                            Ok(())
                        })
                        .context(WriteChunkSnafu {
                            name: "Related-general-sop-class-identification",
                        })?;

                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "SOP class common extended negotiation",
                    })?;
                }
                UserVariableItem::UserIdentityItem(user_identity) => {
                    // 1 - Item-type - 58H
                    writer
                        .write_u8(0x58)
                        .context(WriteFieldSnafu { field: "Item-type" })?;

                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        // 5 - User-Identity-type
                        writer
                            .write_u8(user_identity.identity_type().to_u8())
                            .context(WriteFieldSnafu {
                                field: "User-Identity-type",
                            })?;

                        // 6 - Positive-response-requested
                        writer
                            .write_u8(user_identity.positive_response_requested() as u8)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-positive-response-requested",
                            })?;

                        // 7-8 - Primary-field-length, 9-n - Primary-field
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(user_identity.primary_field())
                                .context(WriteFieldSnafu {
                                    field: "User-Identity-primary-field",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "User-Identity-primary-field",
                        })?;

                        // n+1-n+2 - Secondary-field-length, n+3-m - Secondary-field
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(user_identity.secondary_field())
                                .context(WriteFieldSnafu {
                                    field: "User-Identity-secondary-field",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "User-Identity-secondary-field",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "User identity negotiation",
                    })?;
                }
                UserVariableItem::UserIdentityResponseItem(server_response) => {
                    // 1 - Item-type - 59H
                    writer
                        .write_u8(0x59)
                        .context(WriteFieldSnafu { field: "Item-type" })?;

                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        // 5-6 - Server-response-length, 7-n - Server-response
                        write_chunk_u16(writer, |writer| {
                            writer.write_all(server_response).context(WriteFieldSnafu {
                                field: "Server-response",
                            })
                        })
                        .context(WriteChunkSnafu {
                            name: "Server-response",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "User identity negotiation response",
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    writer
                        .write_u8(*item_type)
                        .context(WriteFieldSnafu { field: "Item-type" })?;

                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        writer.write_all(data).context(WriteFieldSnafu {
                            field: "Unknown Data",
                        })
                    })
                    .context(WriteChunkSnafu { name: "Unknown" })?;
                }
            }
        }

        Ok(())
    })
    .context(WriteChunkSnafu { name: "User-data" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn can_write_chunks_with_preceding_u32_length() -> Result<()> {
        let mut bytes = vec![0u8; 0];
        write_chunk_u32(&mut bytes, |writer| {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "Field1" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0x03)
                    .context(WriteFieldSnafu { field: "Field2" })?;
                Ok(())
            })
            .context(WriteChunkSnafu { name: "Chunk2" })
        })
        .context(WriteChunkSnafu { name: "Chunk1" })?;

        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes, &[0, 0, 0, 6, 2, 0, 0, 0, 1, 3]);

        Ok(())
    }

    #[test]
    fn can_write_chunks_with_preceding_u16_length() -> Result<()> {
        let mut bytes = vec![0u8; 0];
        write_chunk_u16(&mut bytes, |writer| {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "Field1" })?;
            write_chunk_u16(writer, |writer| {
                writer
                    .write_u8(0x03)
                    .context(WriteFieldSnafu { field: "Field2" })?;
                Ok(())
            })
            .context(WriteChunkSnafu { name: "Chunk2" })
        })
        .context(WriteChunkSnafu { name: "Chunk1" })?;

        assert_eq!(bytes.len(), 6);
        assert_eq!(bytes, &[0, 4, 2, 0, 1, 3]);

        Ok(())
    }

    #[test]
    fn rejects_oversized_ae_title_without_writing() {
        let rq = AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "A-VERY-LONG-CALLING-AE-TITLE".to_string(),
            called_ae_title: "STORE-SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![],
            user_variables: vec![],
        };
        let mut bytes = vec![];
        let e = write_pdu(&mut bytes, &rq.into());
        assert_matches!(e, Err(Error::AeTitleTooLong { .. }));
        assert!(bytes.is_empty());
    }

    #[test]
    fn rejects_even_presentation_context_id() {
        let rq = AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "STORE-SCU".to_string(),
            called_ae_title: "STORE-SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![crate::pdu::PresentationContextProposed {
                id: 2,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            }],
            user_variables: vec![],
        };
        let mut bytes = vec![];
        let e = write_pdu(&mut bytes, &rq.into());
        assert_matches!(e, Err(Error::InvalidPresentationContextId { id: 2, .. }));
        assert!(bytes.is_empty());
    }
}
