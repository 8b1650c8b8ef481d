use dicom_ulp::pdu::reader::read_pdu;
use dicom_ulp::pdu::writer::write_pdu;
use dicom_ulp::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ, AssociationRJResult,
    AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ, AsyncOperationsWindow,
    PDataValue, PDataValueType, Pdu, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, RoleSelection, SopClassCommonExtendedNegotiation,
    UserIdentity, UserIdentityType, UserVariableItem, DEFAULT_MAX_PDU,
};
use matches::matches;
use std::io::Cursor;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[test]
fn can_read_write_associate_rq() -> Result<()> {
    let association_rq = AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "calling ae".to_string(),
        called_ae_title: "called ae".to_string(),
        application_context_name: "application context name".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "abstract 1".to_string(),
                transfer_syntaxes: vec!["transfer 1".to_string(), "transfer 2".to_string()],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "abstract 2".to_string(),
                transfer_syntaxes: vec!["transfer 3".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(23),
            UserVariableItem::ImplementationClassUID("class uid".to_string()),
            UserVariableItem::ImplementationVersionName("version name".to_string()),
            UserVariableItem::AsyncOperationsWindow(AsyncOperationsWindow {
                max_operations_invoked: 4,
                max_operations_performed: 1,
            }),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "abstract 1".to_string(),
                scu_role: true,
                scp_role: false,
            }),
            UserVariableItem::SopClassExtendedNegotiationSubItem(
                "abstract 1".to_string(),
                vec![1, 1, 0, 1, 1, 0, 1],
            ),
            UserVariableItem::SopClassCommonExtendedNegotiationSubItem(
                SopClassCommonExtendedNegotiation {
                    sop_class_uid: "abstract 2".to_string(),
                    service_class_uid: "service class".to_string(),
                    related_general_sop_classes: vec![
                        "related 1".to_string(),
                        "related 2".to_string(),
                    ],
                },
            ),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                true,
                UserIdentityType::UsernamePassword,
                b"MyUsername".to_vec(),
                b"MyPassword".to_vec(),
            )),
        ],
    };

    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &association_rq.clone().into())?;

    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)?;

    if let Pdu::AssociationRQ(rq) = result {
        assert_eq!(rq.protocol_version, 1);
        assert_eq!(rq.calling_ae_title, "calling ae");
        assert_eq!(rq.called_ae_title, "called ae");
        assert_eq!(rq.application_context_name, "application context name");
        assert_eq!(rq.presentation_contexts, association_rq.presentation_contexts);
        assert_eq!(rq.user_variables.len(), 8);
        assert!(matches!(
            rq.user_variables[0],
            UserVariableItem::MaxLength(l) if l == 23
        ));
        assert!(matches!(
            &rq.user_variables[3],
            UserVariableItem::AsyncOperationsWindow(w)
            if w.max_operations_invoked == 4 && w.max_operations_performed == 1
        ));
        assert!(matches!(
            &rq.user_variables[4],
            UserVariableItem::RoleSelection(r)
            if r.sop_class_uid == "abstract 1" && r.scu_role && !r.scp_role
        ));
        assert!(matches!(
            &rq.user_variables[5],
            UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data)
            if sop_class_uid == "abstract 1" && data.as_slice() == [1, 1, 0, 1, 1, 0, 1]
        ));
        assert!(matches!(
            &rq.user_variables[6],
            UserVariableItem::SopClassCommonExtendedNegotiationSubItem(item)
            if item.sop_class_uid == "abstract 2"
                && item.service_class_uid == "service class"
                && item.related_general_sop_classes
                    == ["related 1".to_string(), "related 2".to_string()]
        ));
        assert!(matches!(
            &rq.user_variables[7],
            UserVariableItem::UserIdentityItem(identity)
            if identity.positive_response_requested()
                && identity.identity_type() == UserIdentityType::UsernamePassword
                && identity.primary_field() == b"MyUsername"
                && identity.secondary_field() == b"MyPassword"
        ));
    } else {
        panic!("invalid pdu type");
    }

    Ok(())
}

#[test]
fn can_read_write_associate_ac() -> Result<()> {
    let association_ac = AssociationAC {
        protocol_version: 1,
        calling_ae_title: "calling ae".to_string(),
        called_ae_title: "called ae".to_string(),
        application_context_name: "application context name".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "transfer 1".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("class uid".to_string()),
            UserVariableItem::UserIdentityResponseItem(b"server token".to_vec()),
        ],
    };

    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &Pdu::AssociationAC(association_ac.clone()))?;

    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)?;

    if let Pdu::AssociationAC(ac) = result {
        assert_eq!(ac.protocol_version, 1);
        assert_eq!(ac.presentation_contexts, association_ac.presentation_contexts);
        assert!(matches!(
            &ac.user_variables[2],
            UserVariableItem::UserIdentityResponseItem(response)
            if response.as_slice() == b"server token"
        ));
    } else {
        panic!("invalid pdu type");
    }

    Ok(())
}

#[test]
fn can_read_write_associate_rj() -> Result<()> {
    let association_rj = AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        ),
    };

    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &Pdu::AssociationRJ(association_rj.clone()))?;

    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)?;
    assert_eq!(result, Pdu::AssociationRJ(association_rj));

    Ok(())
}

#[test]
fn can_read_write_pdata() -> Result<()> {
    let pdata = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x10; 76],
            },
            PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0x2A; 1024],
            },
        ],
    };

    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &pdata)?;

    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)?;
    assert_eq!(result, pdata);

    Ok(())
}

#[test]
fn can_read_write_release_and_abort() -> Result<()> {
    for pdu in [
        Pdu::ReleaseRQ,
        Pdu::ReleaseRP,
        Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        },
        Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            ),
        },
    ] {
        let mut bytes = vec![0u8; 0];
        write_pdu(&mut bytes, &pdu)?;
        let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)?;
        assert_eq!(result, pdu);
    }

    Ok(())
}
