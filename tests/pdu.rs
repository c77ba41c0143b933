//! PDU encoding and decoding through the public interface.

use std::io::Cursor;

use dicom_net::pdu::{
    AssociationAC, AssociationRQ, Pdu, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, RoleSelection, UserIdentity, UserIdentityType,
    UserVariableItem, DEFAULT_MAX_PDU,
};
use dicom_net::{read_pdu, write_pdu};
use matches::matches;

#[test]
fn can_read_write_associate_rq() -> Result<(), Box<dyn std::error::Error>> {
    let association_rq = AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "QR-SCU".to_string(),
        called_ae_title: "ARCHIVE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.5.1.4.1.2.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.4".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(65536),
            UserVariableItem::ImplementationClassUID("1.2.345.6.7890.1.234".to_string()),
            UserVariableItem::ImplementationVersionName("dicom-net 0.1.0".to_string()),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.4".to_string(),
                scu_role: true,
                scp_role: true,
            }),
            UserVariableItem::SopClassExtendedNegotiationSubItem(
                "1.2.840.10008.5.1.4.1.2.1.1".to_string(),
                vec![1, 1, 0, 1, 1, 0, 1],
            ),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                false,
                UserIdentityType::UsernamePassword,
                b"MyUsername".to_vec(),
                b"MyPassword".to_vec(),
            )),
        ],
    };

    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &association_rq.clone().into())?;

    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)?.unwrap();

    if let Pdu::AssociationRQ(decoded) = result {
        assert_eq!(decoded.protocol_version, 1);
        assert_eq!(decoded.calling_ae_title, "QR-SCU");
        assert_eq!(decoded.called_ae_title, "ARCHIVE");
        assert_eq!(decoded.presentation_contexts, association_rq.presentation_contexts);
        assert_eq!(decoded.user_variables.len(), 6);
        assert!(matches!(
            &decoded.user_variables[0],
            UserVariableItem::MaxLength(l) if *l == 65536
        ));
        assert!(matches!(&decoded.user_variables[3],
            UserVariableItem::RoleSelection(rs)
            if rs.sop_class_uid == "1.2.840.10008.5.1.4.1.1.4" && rs.scu_role && rs.scp_role
        ));
        assert!(matches!(&decoded.user_variables[5],
            UserVariableItem::UserIdentityItem(user_identity)
            if !user_identity.positive_response_requested() &&
            user_identity.identity_type() == UserIdentityType::UsernamePassword &&
            user_identity.primary_field() == b"MyUsername" &&
            user_identity.secondary_field() == b"MyPassword"
        ));
    } else {
        panic!("invalid pdu type");
    }

    Ok(())
}

#[test]
fn can_read_write_associate_ac_with_identity_response() -> Result<(), Box<dyn std::error::Error>> {
    let association_ac = AssociationAC {
        protocol_version: 1,
        called_ae_title: "ARCHIVE".to_string(),
        calling_ae_title: "QR-SCU".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextResult {
            id: 1,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::UserIdentityResponse(b"ticket".to_vec()),
        ],
    };

    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &association_ac.clone().into())?;
    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)?.unwrap();

    assert_eq!(result, Pdu::AssociationAC(association_ac));
    Ok(())
}

#[test]
fn reading_from_a_closed_stream_yields_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let result = read_pdu(&mut Cursor::new(&[]), DEFAULT_MAX_PDU, true)?;
    assert_eq!(result, None);
    Ok(())
}
