//! PDU reader module
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use snafu::{ensure, Backtrace, IntoError, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};
use tracing::warn;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// a reserved byte,
/// and the PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("No PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("Could not read PDU"))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU item"))]
    ReadPduItem {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >=2)", length))]
    InvalidItemLength { length: u32 },

    #[snafu(display(
        "Invalid length {} for fixed size sub-item `{}` (expected {})",
        length,
        field,
        expected
    ))]
    InvalidSubItemLength {
        field: &'static str,
        length: u16,
        expected: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("Sub-item `{}` of length {} overruns its enclosing item", field, length))]
    SubItemOverrun {
        field: &'static str,
        length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read {} reserved bytes", bytes))]
    ReadReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Incoming pdu was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },
    #[snafu(display("PDU contained an invalid value {:?}", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },
    #[snafu(display("Multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },
    #[snafu(display("Invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },
    #[snafu(display("Invalid abort service provider"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },
    #[snafu(display("Invalid presentation context result reason"))]
    InvalidPresentationContextResultReason { backtrace: Backtrace },
    #[snafu(display("invalid transfer syntax sub-item"))]
    InvalidTransferSyntaxSubItem { backtrace: Backtrace },
    #[snafu(display("unknown presentation context sub-item"))]
    UnknownPresentationContextSubItem { backtrace: Backtrace },
    #[snafu(display("Text field `{}` contains non ISO 646 characters", field))]
    DecodeText {
        field: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },
    #[snafu(display("Missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },
    #[snafu(display("Missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Decode a text field as ISO 646 (basic G0 set),
/// trimming insignificant padding.
fn decode_text(bytes: &[u8], field: &'static str) -> Result<String> {
    ensure!(bytes.iter().all(u8::is_ascii), DecodeTextSnafu { field });
    Ok(String::from_utf8_lossy(bytes)
        .trim_matches(|c| c == ' ' || c == '\0')
        .to_string())
}

/// Read a PDU from the given source.
///
/// The `max_pdu_length` parameter is the maximum PDU length
/// announced to the peer during negotiation.
/// In `strict` mode, an incoming PDU larger than that is an error;
/// otherwise it is tolerated up to [`MAXIMUM_PDU_SIZE`]
/// with a warning.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // If we can't read 2 bytes here, there is no PDU available.
    // This read can block and wake up when the stream is closed,
    // so we distinguish having trouble even beginning to read a PDU
    // from an unexpected EOF in the middle of one.
    let mut bytes = [0; 2];
    if let Err(e) = reader.read_exact(&mut bytes) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }

    let pdu_type = bytes[0];
    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "length" })?;

    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "Incoming pdu was too large: length {}, maximum is {}",
            pdu_length, max_pdu_length
        );
    }

    let bytes = read_n(reader, pdu_length as usize).context(ReadPduSnafu)?;
    if bytes.len() != pdu_length as usize {
        return Err(ReadPduSnafu.into_error(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "PDU body shorter than declared length",
        )));
    }
    let mut cursor = Cursor::new(bytes);

    match pdu_type {
        0x01 => {
            // A-ASSOCIATE-RQ PDU Structure

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            // 7-8 - Protocol-version (bit field, bit 0 = version 1)
            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;

            // 9-10 - Reserved
            cursor
                .read_u16::<BigEndian>()
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            // 11-26 - Called-AE-title, 16 ISO 646 characters,
            // leading and trailing spaces are not significant
            let mut ae_bytes = [0; 16];
            cursor
                .read_exact(&mut ae_bytes)
                .context(ReadPduFieldSnafu {
                    field: "Called-AE-title",
                })?;
            let called_ae_title = decode_text(&ae_bytes, "Called-AE-title")?;

            // 27-42 - Calling-AE-title, same encoding
            let mut ae_bytes = [0; 16];
            cursor
                .read_exact(&mut ae_bytes)
                .context(ReadPduFieldSnafu {
                    field: "Calling-AE-title",
                })?;
            let calling_ae_title = decode_text(&ae_bytes, "Calling-AE-title")?;

            // 43-74 - Reserved
            cursor
                .seek(SeekFrom::Current(32))
                .context(ReadReservedSnafu { bytes: 32_u32 })?;

            // 75-xxx - Variable items: one application context item,
            // one or more presentation context items,
            // and one user information item
            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_variable(&mut cursor)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextProposed(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Pdu::AssociationRQ(AssociationRQ {
                protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title,
                calling_ae_title,
                presentation_contexts,
                user_variables,
            }))
        }
        0x02 => {
            // A-ASSOCIATE-AC PDU Structure

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            // 7-8 - Protocol-version
            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;

            // 9-10 - Reserved
            cursor
                .read_u16::<BigEndian>()
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            // 11-26 and 27-42 - echoes of the AE title fields of the RQ,
            // not tested on receipt but still surfaced to the caller
            let mut ae_bytes = [0; 16];
            cursor
                .read_exact(&mut ae_bytes)
                .context(ReadPduFieldSnafu {
                    field: "Called-AE-title",
                })?;
            let called_ae_title = decode_text(&ae_bytes, "Called-AE-title")?;

            let mut ae_bytes = [0; 16];
            cursor
                .read_exact(&mut ae_bytes)
                .context(ReadPduFieldSnafu {
                    field: "Calling-AE-title",
                })?;
            let calling_ae_title = decode_text(&ae_bytes, "Calling-AE-title")?;

            // 43-74 - Reserved
            cursor
                .seek(SeekFrom::Current(32))
                .context(ReadReservedSnafu { bytes: 32_u32 })?;

            // 75-xxx - Variable items
            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_variable(&mut cursor)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextResult(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Pdu::AssociationAC(AssociationAC {
                protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title,
                calling_ae_title,
                presentation_contexts,
                user_variables,
            }))
        }
        0x03 => {
            // A-ASSOCIATE-RJ PDU Structure

            // 7 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 8 - Result: 1 rejected-permanent, 2 rejected-transient
            let result = AssociationRJResult::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Result" })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            // 9 - Source, 10 - Reason/Diag.
            let source = AssociationRJSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag.",
                })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => {
            // P-DATA-TF PDU Structure

            let mut values = vec![];
            while cursor.position() < cursor.get_ref().len() as u64 {
                // 1-4 - Item-length: from the presentation context ID
                // to the end of the presentation-data-value field
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-Length",
                })?;

                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );
                let remaining = cursor.get_ref().len() as u64 - cursor.position();
                ensure!(
                    u64::from(item_length) <= remaining,
                    SubItemOverrunSnafu {
                        field: "Presentation-data-value",
                        length: item_length,
                    }
                );

                // 5 - Presentation-context-ID
                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;

                // 6 - Message control header:
                // bit 0 set means command fragment,
                // bit 1 set means last fragment
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;

                let value_type = if header & 0x01 > 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = (header & 0x02) > 0;

                let data =
                    read_n(&mut cursor, (item_length - 2) as usize).context(ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    })?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                })
            }

            Ok(Pdu::PData { data: values })
        }
        0x05 => {
            // A-RELEASE-RQ PDU Structure

            // 7-10 - Reserved
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadReservedSnafu { bytes: 4_u32 })?;

            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            // A-RELEASE-RP PDU Structure

            // 7-10 - Reserved
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadReservedSnafu { bytes: 4_u32 })?;

            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            // A-ABORT PDU Structure

            // 7-8 - Reserved
            let mut buf = [0u8; 2];
            cursor
                .read_exact(&mut buf)
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            // 9 - Source: 0 service-user, 1 reserved, 2 service-provider
            // 10 - Reason/Diag, significant for source 2 only
            let source = AbortRQSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag",
                })?,
            )
            .context(InvalidAbortSourceOrReasonSnafu)?;

            Ok(Pdu::AbortRQ { source })
        }
        _ => {
            let data = read_n(&mut cursor, pdu_length as usize)
                .context(ReadPduFieldSnafu { field: "Unknown" })?;
            Ok(Pdu::Unknown { pdu_type, data })
        }
    }
}

fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::new();
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    Ok(result)
}

/// Read `length` bytes out of the cursor,
/// failing when the enclosing item does not have that many bytes left.
fn read_n_checked(
    cursor: &mut Cursor<Vec<u8>>,
    length: usize,
    field: &'static str,
) -> Result<Vec<u8>> {
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    ensure!(
        length as u64 <= remaining,
        SubItemOverrunSnafu {
            field,
            length: length as u32,
        }
    );
    read_n(cursor, length).context(ReadPduFieldSnafu { field })
}

fn read_pdu_variable(reader: &mut Cursor<Vec<u8>>) -> Result<PduVariableItem> {
    // 1 - Item-type
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    reader
        .read_u8()
        .context(ReadReservedSnafu { bytes: 1_u32 })?;

    // 3-4 - Item-length
    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let bytes = read_n_checked(reader, item_length as usize, "Item")?;
    let mut cursor = Cursor::new(bytes);

    match item_type {
        0x10 => {
            // Application Context Item Structure
            let val = decode_text(cursor.get_ref(), "Application-context-name")?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context Item Structure (proposed)

            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            // 5 - Presentation-context-ID
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6-8 - Reserved
            cursor
                .seek(SeekFrom::Current(3))
                .context(ReadReservedSnafu { bytes: 3_u32 })?;

            // 9-xxx - one abstract syntax sub-item
            // followed by one or more transfer syntax sub-items
            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x30 => {
                        // Abstract Syntax Sub-Item
                        abstract_syntax = Some(decode_text(
                            &read_n_checked(
                                &mut cursor,
                                item_length as usize,
                                "Abstract-syntax-name",
                            )?,
                            "Abstract-syntax-name",
                        )?);
                    }
                    0x40 => {
                        // Transfer Syntax Sub-Item
                        transfer_syntaxes.push(decode_text(
                            &read_n_checked(
                                &mut cursor,
                                item_length as usize,
                                "Transfer-syntax-name",
                            )?,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context Item Structure (result)

            let mut transfer_syntax: Option<String> = None;

            // 5 - Presentation-context-ID
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 7 - Result/Reason
            let reason = PresentationContextResultReason::from(cursor.read_u8().context(
                ReadPduFieldSnafu {
                    field: "Result/Reason",
                },
            )?)
            .context(InvalidPresentationContextResultReasonSnafu)?;

            // 8 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 9-xxx - exactly one transfer syntax sub-item,
            // only significant on acceptance
            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x40 => {
                        if transfer_syntax.is_some() {
                            return MultipleTransferSyntaxesAcceptedSnafu.fail();
                        }
                        transfer_syntax = Some(decode_text(
                            &read_n_checked(
                                &mut cursor,
                                item_length as usize,
                                "Transfer-syntax-name",
                            )?,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return InvalidTransferSyntaxSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
                },
            ))
        }
        0x50 => {
            // User Information Item Structure
            let mut user_variables = vec![];

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x51 => {
                        // Maximum Length Sub-Item: 4 byte unsigned,
                        // zero means no maximum stated
                        ensure!(
                            item_length == 4,
                            InvalidSubItemLengthSnafu {
                                field: "Maximum-length-received",
                                length: item_length,
                                expected: 4_u16,
                            }
                        );
                        user_variables.push(UserVariableItem::MaxLength(
                            cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-length-received",
                            })?,
                        ));
                    }
                    0x52 => {
                        // Implementation Class UID Sub-Item
                        let implementation_class_uid = decode_text(
                            &read_n_checked(
                                &mut cursor,
                                item_length as usize,
                                "Implementation-class-uid",
                            )?,
                            "Implementation-class-uid",
                        )?;
                        user_variables.push(UserVariableItem::ImplementationClassUID(
                            implementation_class_uid,
                        ));
                    }
                    0x53 => {
                        // Asynchronous Operations Window Sub-Item:
                        // two 2 byte unsigned counts, zero means unlimited
                        ensure!(
                            item_length == 4,
                            InvalidSubItemLengthSnafu {
                                field: "Asynchronous-operations-window",
                                length: item_length,
                                expected: 4_u16,
                            }
                        );
                        let max_operations_invoked =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        let max_operations_performed =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })?;
                        user_variables.push(UserVariableItem::AsyncOperationsWindow(
                            AsyncOperationsWindow {
                                max_operations_invoked,
                                max_operations_performed,
                            },
                        ));
                    }
                    0x54 => {
                        // SCP/SCU Role Selection Sub-Item
                        let uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "UID-length",
                            })?;
                        let sop_class_uid = decode_text(
                            &read_n_checked(&mut cursor, uid_length as usize, "SOP-class-uid")?,
                            "SOP-class-uid",
                        )?;
                        let scu_role = cursor.read_u8().context(ReadPduFieldSnafu {
                            field: "SCU-role",
                        })?;
                        let scp_role = cursor.read_u8().context(ReadPduFieldSnafu {
                            field: "SCP-role",
                        })?;
                        user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
                            sop_class_uid,
                            scu_role: scu_role == 1,
                            scp_role: scp_role == 1,
                        }));
                    }
                    0x55 => {
                        // Implementation Version Name Sub-Item
                        let implementation_version_name = decode_text(
                            &read_n_checked(
                                &mut cursor,
                                item_length as usize,
                                "Implementation-version-name",
                            )?,
                            "Implementation-version-name",
                        )?;
                        user_variables.push(UserVariableItem::ImplementationVersionName(
                            implementation_version_name,
                        ));
                    }
                    0x56 => {
                        // SOP Class Extended Negotiation Sub-Item
                        let sop_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        let sop_class_uid = decode_text(
                            &read_n_checked(
                                &mut cursor,
                                sop_class_uid_length as usize,
                                "SOP-class-uid",
                            )?,
                            "SOP-class-uid",
                        )?;

                        // the remaining bytes of the sub-item carry
                        // the service class application information
                        let data_length = item_length
                            .checked_sub(2 + sop_class_uid_length)
                            .context(SubItemOverrunSnafu {
                                field: "Service-class-application-information",
                                length: u32::from(item_length),
                            })?;
                        let data = read_n_checked(
                            &mut cursor,
                            data_length as usize,
                            "Service-class-application-information",
                        )?;

                        user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                            sop_class_uid,
                            data,
                        ));
                    }
                    0x57 => {
                        // SOP Class Common Extended Negotiation Sub-Item
                        let sop_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        let sop_class_uid = decode_text(
                            &read_n_checked(
                                &mut cursor,
                                sop_class_uid_length as usize,
                                "SOP-class-uid",
                            )?,
                            "SOP-class-uid",
                        )?;
                        let service_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Service-class-uid-length",
                            })?;
                        let service_class_uid = decode_text(
                            &read_n_checked(
                                &mut cursor,
                                service_class_uid_length as usize,
                                "Service-class-uid",
                            )?,
                            "Service-class-uid",
                        )?;
                        let related_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Related-general-sop-class-identification-length",
                            })?;
                        let related_bytes = read_n_checked(
                            &mut cursor,
                            related_length as usize,
                            "Related-general-sop-class-identification",
                        )?;

                        // a sequence of length-prefixed related SOP class UIDs
                        let mut related_general_sop_classes = vec![];
                        let mut related = Cursor::new(related_bytes);
                        while related.position() < related.get_ref().len() as u64 {
                            let uid_length =
                                related.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                    field: "Related-general-sop-class-uid-length",
                                })?;
                            let uid_bytes = read_n(&mut related, uid_length as usize).context(
                                ReadPduFieldSnafu {
                                    field: "Related-general-sop-class-uid",
                                },
                            )?;
                            related_general_sop_classes
                                .push(decode_text(&uid_bytes, "Related-general-sop-class-uid")?);
                        }

                        user_variables.push(
                            UserVariableItem::SopClassCommonExtendedNegotiationSubItem(
                                SopClassCommonExtendedNegotiation {
                                    sop_class_uid,
                                    service_class_uid,
                                    related_general_sop_classes,
                                },
                            ),
                        );
                    }
                    0x58 => {
                        // User Identity Negotiation Sub-Item

                        let user_identity_type = cursor.read_u8().context(ReadPduFieldSnafu {
                            field: "User-Identity-type",
                        })?;

                        let positive_response_requested =
                            cursor.read_u8().context(ReadPduFieldSnafu {
                                field: "User-Identity-positive-response-requested",
                            })?;

                        let primary_field_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "User-Identity-primary-field-length",
                            })?;

                        let primary_field = read_n_checked(
                            &mut cursor,
                            primary_field_length as usize,
                            "User-Identity-primary-field",
                        )?;

                        // only non-zero for username and password identities
                        let secondary_field_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "User-Identity-secondary-field-length",
                            })?;

                        let secondary_field = read_n_checked(
                            &mut cursor,
                            secondary_field_length as usize,
                            "User-Identity-secondary-field",
                        )?;

                        match UserIdentityType::from(user_identity_type) {
                            Some(user_identity_type) => {
                                user_variables.push(UserVariableItem::UserIdentityItem(
                                    UserIdentity::new(
                                        positive_response_requested == 1,
                                        user_identity_type,
                                        primary_field,
                                        secondary_field,
                                    ),
                                ));
                            }
                            None => {
                                warn!("Unknown User Identity Type code {}", user_identity_type);
                            }
                        }
                    }
                    0x59 => {
                        // User Identity Negotiation Response Sub-Item
                        let server_response_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Server-response-length",
                            })?;
                        let server_response = read_n_checked(
                            &mut cursor,
                            server_response_length as usize,
                            "Server-response",
                        )?;
                        user_variables
                            .push(UserVariableItem::UserIdentityResponseItem(server_response));
                    }
                    _ => {
                        user_variables.push(UserVariableItem::Unknown(
                            item_type,
                            read_n_checked(&mut cursor, item_length as usize, "Unknown")?,
                        ));
                    }
                }
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}
