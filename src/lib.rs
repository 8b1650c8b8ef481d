//! This crate contains the types and methods needed to communicate
//! with DICOM nodes through the upper layer protocol.
//!
//! It provides the building blocks for concrete service class users (SCUs)
//! and service class providers (SCPs):
//! PDU encoding and decoding,
//! association negotiation and lifecycle management,
//! and DIMSE message exchange on top of an established association.
//!
//! - The [`address`] module
//!   provides an abstraction for working with compound addresses
//!   referring to application entities in a network.
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_,
//!   which are passed around as part of the DICOM network communication support.
//! - The [`association`] module
//!   comprises abstractions for establishing and negotiating associations
//!   between application entities,
//!   via the upper layer protocol by TCP.
//! - The [`dimse`] module
//!   builds message exchange and service dispatch
//!   on top of an established association.

pub mod address;
pub mod association;
pub mod dimse;
pub mod pdu;

/// The implementation class UID advertised by this crate
/// during association negotiation.
///
/// Automatically generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.304236741890926166828380817971552818523";

/// The implementation version name advertised by this crate
/// during association negotiation.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "RS-ULP 0.1";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use association::client::{ClientAssociation, ClientAssociationOptions, ConnectOutcome};
pub use association::server::{AcceptOutcome, ServerAssociation, ServerAssociationOptions};
pub use dimse::{CommandSet, Dispatcher, DimseMessage, Requestor, ServiceRegistry};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
