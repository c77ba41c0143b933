use super::reader::read_pdu;
use super::writer::write_pdu;
use super::*;
use std::io::Cursor;

fn roundtrip(pdu: Pdu) {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).expect("encoding should succeed");
    let decoded = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)
        .expect("decoding should succeed")
        .expect("a full PDU should be available");
    assert_eq!(decoded, pdu);
}

#[test]
fn roundtrip_association_rq() {
    roundtrip(Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "MAIN-STORAGE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::ImplementationClassUID("1.2.345.6.7890.1.234".to_string()),
            UserVariableItem::ImplementationVersionName("dicom-net 0.1.0".to_string()),
        ],
    }));
}

#[test]
fn roundtrip_association_rq_with_full_user_information() {
    roundtrip(Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "GET-SCU".to_string(),
        called_ae_title: "ARCHIVE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.5.1.4.1.2.2.3".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(32768),
            UserVariableItem::ImplementationClassUID("1.2.345.6.7890.1.234".to_string()),
            UserVariableItem::ImplementationVersionName("dicom-net 0.1.0".to_string()),
            UserVariableItem::AsyncOperationsWindow(3, 1),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
                scu_role: true,
                scp_role: true,
            }),
            UserVariableItem::SopClassExtendedNegotiationSubItem(
                "1.2.840.10008.5.1.4.1.2.2.3".to_string(),
                vec![1, 0, 1, 0, 1],
            ),
            UserVariableItem::SopClassCommonExtendedNegotiation(SopClassCommonExtendedNegotiation {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.88.22".to_string(),
                service_class_uid: "1.2.840.10008.4.2".to_string(),
                related_general_sop_classes: vec!["1.2.840.10008.5.1.4.1.1.88.11".to_string()],
            }),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                true,
                UserIdentityType::UsernamePassword,
                b"qr-user".to_vec(),
                b"qr-pass".to_vec(),
            )),
            UserVariableItem::Unknown(0x7F, vec![0xCA, 0xFE]),
        ],
    }));
}

#[test]
fn roundtrip_association_ac() {
    roundtrip(Pdu::AssociationAC(AssociationAC {
        protocol_version: 1,
        called_ae_title: "MAIN-STORAGE".to_string(),
        calling_ae_title: "STORE-SCU".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::ImplementationClassUID("1.2.345.6.7890.1.234".to_string()),
            UserVariableItem::UserIdentityResponse(b"granted".to_vec()),
        ],
    }));
}

#[test]
fn roundtrip_association_rj() {
    roundtrip(Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven),
    }));
    roundtrip(Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Transient,
        source: AssociationRJSource::ServiceProviderPresentation(
            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
        ),
    }));
    roundtrip(Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceProviderAcse(
            AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
        ),
    }));
}

#[test]
fn roundtrip_p_data() {
    roundtrip(Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x08, 0x00, 0x00, 0x00],
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: (0..64).collect(),
            },
        ],
    });
}

#[test]
fn roundtrip_release_and_abort() {
    roundtrip(Pdu::ReleaseRQ);
    roundtrip(Pdu::ReleaseRP);
    roundtrip(Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    });
    roundtrip(Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::InvalidPduParameter),
    });
}

#[test]
fn unrecognized_pdu_type_is_preserved() {
    let mut bytes = Vec::new();
    write_pdu(
        &mut bytes,
        &Pdu::Unknown {
            pdu_type: 0x09,
            data: vec![0, 1, 2, 3],
        },
    )
    .unwrap();

    let decoded = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)
        .unwrap()
        .unwrap();
    assert_eq!(
        decoded,
        Pdu::Unknown {
            pdu_type: 0x09,
            data: vec![0, 1, 2, 3],
        }
    );
}

#[test]
fn no_pdu_on_clean_end_of_stream() {
    let decoded = read_pdu(&mut Cursor::new(&[]), DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(decoded, None);
}

#[test]
fn strict_mode_rejects_oversized_pdu() {
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; MINIMUM_PDU_SIZE as usize * 2],
        }],
    };
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();

    let err = read_pdu(&mut Cursor::new(&bytes), MINIMUM_PDU_SIZE, true);
    assert!(matches!(
        err,
        Err(super::reader::Error::PduTooLarge { .. })
    ));

    // the same PDU is accepted in non-strict mode
    let decoded = read_pdu(&mut Cursor::new(&bytes), MINIMUM_PDU_SIZE, false)
        .unwrap()
        .unwrap();
    assert_eq!(decoded, pdu);
}

#[test]
fn odd_length_uids_are_padded_on_the_wire() {
    // "1.2.840.10008.1.1" has 17 characters,
    // so the abstract syntax sub-item must be padded to 18 bytes
    let pdu = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "A".to_string(),
        called_ae_title: "B".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![],
    });
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();

    let needle = b"1.2.840.10008.1.1\0";
    assert!(bytes.windows(needle.len()).any(|w| w == needle));

    // and decoding trims the padding back off
    let decoded = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)
        .unwrap()
        .unwrap();
    assert_eq!(decoded, pdu);
}
