//! Command set value object and its codec.
//!
//! A command set is an ordered collection of group `0000` elements,
//! always encoded in implicit VR little endian
//! regardless of the transfer syntax
//! negotiated for the presentation context.
use std::collections::BTreeMap;
use std::io::Cursor;

use byteordered::byteorder::{LittleEndian, ReadBytesExt};
use snafu::{ensure, Backtrace, ResultExt, Snafu};

/// Affected SOP Class UID (0000,0002)
pub const AFFECTED_SOP_CLASS_UID: u16 = 0x0002;
/// Requested SOP Class UID (0000,0003)
pub const REQUESTED_SOP_CLASS_UID: u16 = 0x0003;
/// Command Field (0000,0100)
pub const COMMAND_FIELD: u16 = 0x0100;
/// Message ID (0000,0110)
pub const MESSAGE_ID: u16 = 0x0110;
/// Message ID Being Responded To (0000,0120)
pub const MESSAGE_ID_BEING_RESPONDED_TO: u16 = 0x0120;
/// Move Destination (0000,0600)
pub const MOVE_DESTINATION: u16 = 0x0600;
/// Priority (0000,0700)
pub const PRIORITY: u16 = 0x0700;
/// Command Data Set Type (0000,0800)
pub const COMMAND_DATA_SET_TYPE: u16 = 0x0800;
/// Status (0000,0900)
pub const STATUS: u16 = 0x0900;
/// Offending Element (0000,0901)
pub const OFFENDING_ELEMENT: u16 = 0x0901;
/// Error Comment (0000,0902)
pub const ERROR_COMMENT: u16 = 0x0902;
/// Error ID (0000,0903)
pub const ERROR_ID: u16 = 0x0903;
/// Affected SOP Instance UID (0000,1000)
pub const AFFECTED_SOP_INSTANCE_UID: u16 = 0x1000;
/// Requested SOP Instance UID (0000,1001)
pub const REQUESTED_SOP_INSTANCE_UID: u16 = 0x1001;
/// Event Type ID (0000,1002)
pub const EVENT_TYPE_ID: u16 = 0x1002;
/// Action Type ID (0000,1008)
pub const ACTION_TYPE_ID: u16 = 0x1008;
/// Number of Remaining Sub-operations (0000,1020)
pub const REMAINING_SUBOPERATIONS: u16 = 0x1020;
/// Number of Completed Sub-operations (0000,1021)
pub const COMPLETED_SUBOPERATIONS: u16 = 0x1021;
/// Number of Failed Sub-operations (0000,1022)
pub const FAILED_SUBOPERATIONS: u16 = 0x1022;
/// Number of Warning Sub-operations (0000,1023)
pub const WARNING_SUBOPERATIONS: u16 = 0x1023;

/// C-STORE request command field
pub const C_STORE_RQ: u16 = 0x0001;
/// C-GET request command field
pub const C_GET_RQ: u16 = 0x0010;
/// C-FIND request command field
pub const C_FIND_RQ: u16 = 0x0020;
/// C-MOVE request command field
pub const C_MOVE_RQ: u16 = 0x0021;
/// C-ECHO request command field
pub const C_ECHO_RQ: u16 = 0x0030;
/// C-CANCEL request command field
pub const C_CANCEL_RQ: u16 = 0x0FFF;
/// N-EVENT-REPORT request command field
pub const N_EVENT_REPORT_RQ: u16 = 0x0100;
/// N-GET request command field
pub const N_GET_RQ: u16 = 0x0110;
/// N-SET request command field
pub const N_SET_RQ: u16 = 0x0120;
/// N-ACTION request command field
pub const N_ACTION_RQ: u16 = 0x0130;
/// N-CREATE request command field
pub const N_CREATE_RQ: u16 = 0x0140;
/// N-DELETE request command field
pub const N_DELETE_RQ: u16 = 0x0150;
/// The bit distinguishing a response from its request
pub const RSP_BIT: u16 = 0x8000;

/// Command data set type stating that no data set follows the command
pub const NO_DATA_SET: u16 = 0x0101;
/// Command data set type stating that a data set follows the command
pub const DATA_SET_PRESENT: u16 = 0x0102;

/// The verification SOP class, the abstract syntax of C-ECHO
pub const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("failed to read command set field `{}`", field))]
    ReadField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("unexpected element group {:#06x} in command set", group))]
    UnexpectedGroup { group: u16, backtrace: Backtrace },

    #[snafu(display(
        "element (0000,{:04x}) length {} overruns the command set",
        element,
        length
    ))]
    ElementOverrun {
        element: u16,
        length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "element (0000,{:04x}) has length {}, expected 2",
        element,
        length
    ))]
    InvalidUintLength {
        element: u16,
        length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("element (0000,{:04x}) value is not valid text", element))]
    DecodeText { element: u16, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The value of one command set element.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum CommandValue {
    /// an unsigned 16-bit integer (US)
    Uint(u16),
    /// a text value (UI, AE or LO), stored without padding
    Str(String),
    /// a value of an unrecognized element, kept as raw bytes
    Bytes(Vec<u8>),
}

fn is_uint_element(element: u16) -> bool {
    matches!(
        element,
        COMMAND_FIELD
            | MESSAGE_ID
            | MESSAGE_ID_BEING_RESPONDED_TO
            | PRIORITY
            | COMMAND_DATA_SET_TYPE
            | STATUS
            | ERROR_ID
            | EVENT_TYPE_ID
            | ACTION_TYPE_ID
            | REMAINING_SUBOPERATIONS
            | COMPLETED_SUBOPERATIONS
            | FAILED_SUBOPERATIONS
            | WARNING_SUBOPERATIONS
    )
}

fn is_text_element(element: u16) -> bool {
    matches!(
        element,
        AFFECTED_SOP_CLASS_UID
            | REQUESTED_SOP_CLASS_UID
            | MOVE_DESTINATION
            | ERROR_COMMENT
            | AFFECTED_SOP_INSTANCE_UID
            | REQUESTED_SOP_INSTANCE_UID
    )
}

/// The padding byte bringing a text value to even length:
/// UIDs are padded with NUL, other text with a space.
fn pad_byte(element: u16) -> u8 {
    match element {
        AFFECTED_SOP_CLASS_UID | REQUESTED_SOP_CLASS_UID | AFFECTED_SOP_INSTANCE_UID
        | REQUESTED_SOP_INSTANCE_UID => b'\0',
        _ => b' ',
    }
}

/// A DIMSE command set:
/// an ordered map of group `0000` elements.
///
/// Typed accessors expose the standard fields;
/// elements this implementation does not recognize
/// are preserved as raw bytes and round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandSet {
    elements: BTreeMap<u16, CommandValue>,
}

impl CommandSet {
    /// Create an empty command set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieve the value of an element, if present.
    pub fn get(&self, element: u16) -> Option<&CommandValue> {
        self.elements.get(&element)
    }

    /// Insert or replace an unsigned integer element.
    pub fn put_uint(&mut self, element: u16, value: u16) {
        self.elements.insert(element, CommandValue::Uint(value));
    }

    /// Insert or replace a text element.
    pub fn put_str(&mut self, element: u16, value: impl Into<String>) {
        self.elements
            .insert(element, CommandValue::Str(value.into()));
    }

    /// Retrieve an element as an unsigned integer.
    pub fn uint(&self, element: u16) -> Option<u16> {
        match self.elements.get(&element) {
            Some(CommandValue::Uint(v)) => Some(*v),
            _ => None,
        }
    }

    /// Retrieve an element as text.
    pub fn text(&self, element: u16) -> Option<&str> {
        match self.elements.get(&element) {
            Some(CommandValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    /// The command field (0000,0100).
    pub fn command_field(&self) -> Option<u16> {
        self.uint(COMMAND_FIELD)
    }

    /// The message ID (0000,0110).
    pub fn message_id(&self) -> Option<u16> {
        self.uint(MESSAGE_ID)
    }

    /// The message ID being responded to (0000,0120).
    pub fn message_id_being_responded_to(&self) -> Option<u16> {
        self.uint(MESSAGE_ID_BEING_RESPONDED_TO)
    }

    /// The status (0000,0900) of a response.
    pub fn status(&self) -> Option<u16> {
        self.uint(STATUS)
    }

    /// The priority (0000,0700) of a request.
    pub fn priority(&self) -> Option<u16> {
        self.uint(PRIORITY)
    }

    /// The affected SOP class UID (0000,0002).
    pub fn affected_sop_class_uid(&self) -> Option<&str> {
        self.text(AFFECTED_SOP_CLASS_UID)
    }

    /// The affected SOP instance UID (0000,1000).
    pub fn affected_sop_instance_uid(&self) -> Option<&str> {
        self.text(AFFECTED_SOP_INSTANCE_UID)
    }

    /// The requested SOP class UID (0000,0003).
    pub fn requested_sop_class_uid(&self) -> Option<&str> {
        self.text(REQUESTED_SOP_CLASS_UID)
    }

    /// The requested SOP instance UID (0000,1001).
    pub fn requested_sop_instance_uid(&self) -> Option<&str> {
        self.text(REQUESTED_SOP_INSTANCE_UID)
    }

    /// The move destination AE title (0000,0600).
    pub fn move_destination(&self) -> Option<&str> {
        self.text(MOVE_DESTINATION)
    }

    /// The error comment (0000,0902).
    pub fn error_comment(&self) -> Option<&str> {
        self.text(ERROR_COMMENT)
    }

    /// The error ID (0000,0903).
    pub fn error_id(&self) -> Option<u16> {
        self.uint(ERROR_ID)
    }

    /// The event type ID (0000,1002).
    pub fn event_type_id(&self) -> Option<u16> {
        self.uint(EVENT_TYPE_ID)
    }

    /// The action type ID (0000,1008).
    pub fn action_type_id(&self) -> Option<u16> {
        self.uint(ACTION_TYPE_ID)
    }

    /// The number of remaining sub-operations (0000,1020).
    pub fn remaining_suboperations(&self) -> Option<u16> {
        self.uint(REMAINING_SUBOPERATIONS)
    }

    /// Whether this command set is a response.
    pub fn is_response(&self) -> bool {
        self.command_field()
            .map(|f| f & RSP_BIT != 0)
            .unwrap_or(false)
    }

    /// Whether a data set follows this command set.
    ///
    /// The data set type element holds the magic value `0x0101`
    /// when no data set is present;
    /// every other value announces one.
    pub fn has_data_set(&self) -> bool {
        match self.uint(COMMAND_DATA_SET_TYPE) {
            Some(value) => value != NO_DATA_SET,
            None => false,
        }
    }

    /// Create a C-ECHO request.
    pub fn echo_rq(message_id: u16) -> Self {
        let mut cmd = CommandSet::new();
        cmd.put_str(AFFECTED_SOP_CLASS_UID, VERIFICATION_SOP_CLASS);
        cmd.put_uint(COMMAND_FIELD, C_ECHO_RQ);
        cmd.put_uint(MESSAGE_ID, message_id);
        cmd.put_uint(COMMAND_DATA_SET_TYPE, NO_DATA_SET);
        cmd
    }

    /// Create a C-ECHO response.
    pub fn echo_rsp(message_id: u16, status: u16) -> Self {
        let mut cmd = CommandSet::new();
        cmd.put_str(AFFECTED_SOP_CLASS_UID, VERIFICATION_SOP_CLASS);
        cmd.put_uint(COMMAND_FIELD, C_ECHO_RQ | RSP_BIT);
        cmd.put_uint(MESSAGE_ID_BEING_RESPONDED_TO, message_id);
        cmd.put_uint(COMMAND_DATA_SET_TYPE, NO_DATA_SET);
        cmd.put_uint(STATUS, status);
        cmd
    }

    /// Create a C-STORE request.
    /// The data set carrying the composite object follows the command.
    pub fn store_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        priority: u16,
    ) -> Self {
        let mut cmd = CommandSet::new();
        cmd.put_str(AFFECTED_SOP_CLASS_UID, sop_class_uid);
        cmd.put_uint(COMMAND_FIELD, C_STORE_RQ);
        cmd.put_uint(MESSAGE_ID, message_id);
        cmd.put_uint(PRIORITY, priority);
        cmd.put_uint(COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT);
        cmd.put_str(AFFECTED_SOP_INSTANCE_UID, sop_instance_uid);
        cmd
    }

    /// Create a C-STORE response.
    pub fn store_rsp(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        status: u16,
    ) -> Self {
        let mut cmd = CommandSet::new();
        cmd.put_str(AFFECTED_SOP_CLASS_UID, sop_class_uid);
        cmd.put_uint(COMMAND_FIELD, C_STORE_RQ | RSP_BIT);
        cmd.put_uint(MESSAGE_ID_BEING_RESPONDED_TO, message_id);
        cmd.put_uint(COMMAND_DATA_SET_TYPE, NO_DATA_SET);
        cmd.put_uint(STATUS, status);
        cmd.put_str(AFFECTED_SOP_INSTANCE_UID, sop_instance_uid);
        cmd
    }

    /// Create a C-FIND request.
    /// The data set carrying the query keys follows the command.
    pub fn find_rq(message_id: u16, sop_class_uid: &str, priority: u16) -> Self {
        let mut cmd = CommandSet::new();
        cmd.put_str(AFFECTED_SOP_CLASS_UID, sop_class_uid);
        cmd.put_uint(COMMAND_FIELD, C_FIND_RQ);
        cmd.put_uint(MESSAGE_ID, message_id);
        cmd.put_uint(PRIORITY, priority);
        cmd.put_uint(COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT);
        cmd
    }

    /// Create a C-FIND response.
    /// A pending status announces an identifier data set,
    /// any other status closes the operation without one.
    pub fn find_rsp(message_id: u16, sop_class_uid: &str, status: u16) -> Self {
        let mut cmd = CommandSet::new();
        cmd.put_str(AFFECTED_SOP_CLASS_UID, sop_class_uid);
        cmd.put_uint(COMMAND_FIELD, C_FIND_RQ | RSP_BIT);
        cmd.put_uint(MESSAGE_ID_BEING_RESPONDED_TO, message_id);
        let data_set_type = if super::is_pending(status) {
            DATA_SET_PRESENT
        } else {
            NO_DATA_SET
        };
        cmd.put_uint(COMMAND_DATA_SET_TYPE, data_set_type);
        cmd.put_uint(STATUS, status);
        cmd
    }

    /// Create a C-CANCEL request referencing a previous message.
    pub fn cancel_rq(message_id: u16) -> Self {
        let mut cmd = CommandSet::new();
        cmd.put_uint(COMMAND_FIELD, C_CANCEL_RQ);
        cmd.put_uint(MESSAGE_ID_BEING_RESPONDED_TO, message_id);
        cmd.put_uint(COMMAND_DATA_SET_TYPE, NO_DATA_SET);
        cmd
    }

    /// Encode the command set in implicit VR little endian,
    /// with the command group length element first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        for (element, value) in &self.elements {
            // the group length is recomputed, never echoed
            if *element == 0x0000 {
                continue;
            }
            match value {
                CommandValue::Uint(v) => {
                    push_element_header(&mut body, *element, 2);
                    body.extend_from_slice(&v.to_le_bytes());
                }
                CommandValue::Str(s) => {
                    let mut bytes = s.as_bytes().to_vec();
                    if bytes.len() % 2 != 0 {
                        bytes.push(pad_byte(*element));
                    }
                    push_element_header(&mut body, *element, bytes.len() as u32);
                    body.extend_from_slice(&bytes);
                }
                CommandValue::Bytes(bytes) => {
                    push_element_header(&mut body, *element, bytes.len() as u32);
                    body.extend_from_slice(bytes);
                }
            }
        }

        let mut out = Vec::with_capacity(body.len() + 12);
        push_element_header(&mut out, 0x0000, 4);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Decode a command set from implicit VR little endian bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let mut elements = BTreeMap::new();
        while (cursor.position() as usize) < bytes.len() {
            let group = cursor
                .read_u16::<LittleEndian>()
                .context(ReadFieldSnafu { field: "Group" })?;
            ensure!(group == 0x0000, UnexpectedGroupSnafu { group });
            let element = cursor
                .read_u16::<LittleEndian>()
                .context(ReadFieldSnafu { field: "Element" })?;
            let length = cursor
                .read_u32::<LittleEndian>()
                .context(ReadFieldSnafu { field: "Length" })?;
            let remaining = bytes.len() - cursor.position() as usize;
            ensure!(
                length as usize <= remaining,
                ElementOverrunSnafu { element, length }
            );
            let start = cursor.position() as usize;
            let value = &bytes[start..start + length as usize];
            cursor.set_position((start + length as usize) as u64);

            // the group length is implied by the payload
            if element == 0x0000 {
                continue;
            }

            if is_uint_element(element) {
                ensure!(length == 2, InvalidUintLengthSnafu { element, length });
                elements.insert(
                    element,
                    CommandValue::Uint(u16::from_le_bytes([value[0], value[1]])),
                );
            } else if is_text_element(element) {
                ensure!(value.is_ascii(), DecodeTextSnafu { element });
                let text = String::from_utf8_lossy(value)
                    .trim_end_matches(|c| c == '\0' || c == ' ')
                    .to_string();
                elements.insert(element, CommandValue::Str(text));
            } else {
                elements.insert(element, CommandValue::Bytes(value.to_vec()));
            }
        }
        Ok(CommandSet { elements })
    }
}

fn push_element_header(buf: &mut Vec<u8>, element: u16, length: u32) {
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&element.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn echo_rq_encodes_with_group_length_first() {
        let cmd = CommandSet::echo_rq(1);
        let bytes = cmd.to_bytes();

        // (0000,0000) UL 4, little endian
        assert_eq!(&bytes[0..8], &[0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00]);
        let group_length = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(group_length as usize, bytes.len() - 12);
    }

    #[test]
    fn echo_round_trip() {
        let cmd = CommandSet::echo_rq(7);
        let decoded = CommandSet::from_bytes(&cmd.to_bytes()).unwrap();
        assert_eq!(decoded, cmd);
        assert_eq!(decoded.command_field(), Some(C_ECHO_RQ));
        assert_eq!(decoded.message_id(), Some(7));
        assert_eq!(decoded.affected_sop_class_uid(), Some(VERIFICATION_SOP_CLASS));
        assert!(!decoded.has_data_set());
        assert!(!decoded.is_response());
    }

    #[test]
    fn store_rq_announces_a_data_set() {
        let cmd = CommandSet::store_rq(
            3,
            "1.2.840.10008.5.1.4.1.1.7",
            "2.25.111222333",
            0,
        );
        assert!(cmd.has_data_set());
        let decoded = CommandSet::from_bytes(&cmd.to_bytes()).unwrap();
        assert_eq!(
            decoded.affected_sop_instance_uid(),
            Some("2.25.111222333")
        );
        assert!(decoded.has_data_set());
    }

    #[test]
    fn response_sets_the_response_bit() {
        let rsp = CommandSet::echo_rsp(7, crate::dimse::STATUS_SUCCESS);
        assert!(rsp.is_response());
        assert_eq!(rsp.message_id_being_responded_to(), Some(7));
        assert_eq!(rsp.status(), Some(0x0000));
    }

    #[test]
    fn odd_length_uid_is_padded_with_nul() {
        let mut cmd = CommandSet::new();
        cmd.put_str(AFFECTED_SOP_CLASS_UID, "1.2.3");
        cmd.put_uint(COMMAND_FIELD, C_ECHO_RQ);
        let bytes = cmd.to_bytes();
        // every element value has even length
        let decoded = CommandSet::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.affected_sop_class_uid(), Some("1.2.3"));
    }

    #[test]
    fn unknown_elements_are_preserved() {
        let mut cmd = CommandSet::echo_rq(1);
        cmd.elements
            .insert(0x5151, CommandValue::Bytes(vec![1, 2, 3, 4]));
        let decoded = CommandSet::from_bytes(&cmd.to_bytes()).unwrap();
        assert_eq!(
            decoded.get(0x5151),
            Some(&CommandValue::Bytes(vec![1, 2, 3, 4]))
        );
    }

    #[test]
    fn overrunning_element_is_rejected() {
        let mut bytes = CommandSet::echo_rq(1).to_bytes();
        // truncate the last element mid-value
        bytes.truncate(bytes.len() - 1);
        let res = CommandSet::from_bytes(&bytes);
        assert_matches!(res, Err(Error::ElementOverrun { .. }));
    }

    #[test]
    fn wrong_group_is_rejected() {
        let bytes = [0x08, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00];
        let res = CommandSet::from_bytes(&bytes);
        assert_matches!(res, Err(Error::UnexpectedGroup { group: 0x0008, .. }));
    }

    #[test]
    fn find_rsp_data_set_follows_pending_status() {
        let pending = CommandSet::find_rsp(5, "1.2.840.10008.5.1.4.1.2.1.1", 0xFF00);
        assert!(pending.has_data_set());
        let done = CommandSet::find_rsp(5, "1.2.840.10008.5.1.4.1.2.1.1", 0x0000);
        assert!(!done.has_data_set());
    }
}
