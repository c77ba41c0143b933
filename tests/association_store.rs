//! Storage service with fragmentation:
//! a C-STORE whose data set exceeds the acceptor's maximum PDU length
//! must be split over multiple P-DATA-TF PDUs,
//! each within bounds,
//! with the payload bytes adding up exactly.

use std::net::SocketAddr;

use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_net::association::server::ServerAssociationOptions;
use dicom_net::association::client::ClientAssociationOptions;
use dicom_net::dimse::commands::CommandSet;
use dicom_net::pdu::{PDataValue, PDataValueType, Pdu};
use dicom_object::InMemDicomObject;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

const MAX_PDU_LENGTH: u32 = 16_384;
const PDV_HEADER: usize = 6;
const PAYLOAD_LEN: usize = 50_000;

fn sample_instance() -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, CT_IMAGE_STORAGE),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, "1.2.3.4.5.6.7"),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        dicom_value!(Str, "Doe^John"),
    ));
    obj.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OB,
        PrimitiveValue::from(vec![0x5A_u8; PAYLOAD_LEN]),
    ));
    obj
}

fn spawn_storage_scp() -> Result<(std::thread::JoinHandle<Result<()>>, SocketAddr)> {
    let listener = std::net::TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let scp = ServerAssociationOptions::new()
        .ae_title("STORE-SCP")
        .max_pdu_length(MAX_PDU_LENGTH)
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .with_transfer_syntax(IMPLICIT_VR_LE);

    let handle = std::thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        // drive the exchange at the PDU level
        // to observe the fragmentation directly
        let mut command_bytes: Vec<u8> = Vec::new();
        let mut data_bytes: Vec<u8> = Vec::new();
        let mut data_pdus = 0_usize;
        let mut data_last_fragments = 0_usize;
        let mut command_done = false;
        let mut data_done = false;

        while !(command_done && data_done) {
            match association.receive()? {
                Pdu::PData { data } => {
                    for pdv in data {
                        assert_eq!(pdv.presentation_context_id, 1);
                        assert!(pdv.data.len() <= MAX_PDU_LENGTH as usize - PDV_HEADER);
                        match pdv.value_type {
                            PDataValueType::Command => {
                                command_bytes.extend(&pdv.data);
                                command_done |= pdv.is_last;
                            }
                            PDataValueType::Data => {
                                data_pdus += 1;
                                data_bytes.extend(&pdv.data);
                                if pdv.is_last {
                                    data_last_fragments += 1;
                                    data_done = true;
                                }
                            }
                        }
                    }
                }
                other => panic!("unexpected PDU while receiving: {:?}", other),
            }
        }

        // 50 000 bytes cannot travel in fewer than 4 fragments of 16 384
        assert!(data_pdus >= 4, "expected >= 4 data fragments, got {}", data_pdus);
        assert_eq!(data_last_fragments, 1);
        assert!(data_bytes.len() >= PAYLOAD_LEN);

        let command = CommandSet::read(&command_bytes)?;
        assert_eq!(command.affected_sop_class_uid().as_deref(), Some(CT_IMAGE_STORAGE));
        assert!(command.has_data_set()?);
        let message_id = command.message_id()?;

        // the reassembled data set decodes to the original instance
        let dataset = dicom_net::dimse::read_dataset(&data_bytes, IMPLICIT_VR_LE)?;
        assert!(dataset.get(tags::PIXEL_DATA).is_some());
        let patient_name = dataset
            .get(tags::PATIENT_NAME)
            .expect("patient name present")
            .to_str()?;
        assert_eq!(patient_name.trim(), "Doe^John");

        // answer with success
        let rsp = CommandSet::c_store_rsp(message_id, CT_IMAGE_STORAGE, "1.2.3.4.5.6.7", 0x0000);
        association.send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: rsp.write()?,
            }],
        })?;

        // handle the release
        match association.receive() {
            Ok(Pdu::ReleaseRQ) => {
                association.send(&Pdu::ReleaseRP)?;
            }
            other => panic!("expected release, got {:?}", other),
        }

        Ok(())
    });
    Ok((handle, addr))
}

#[test]
fn c_store_fragments_within_the_peer_maximum() -> Result<()> {
    let (scp, addr) = spawn_storage_scp()?;

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("STORE-SCU")
        .with_presentation_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .establish(addr)?;

    // the effective send limit is the one advertised by the acceptor
    assert_eq!(association.peer_max_pdu_length(), MAX_PDU_LENGTH);

    let status = association.send_c_store(&sample_instance(), None)?;
    assert_eq!(status, 0x0000);

    association.release()?;

    scp.join().expect("SCP thread panicked")?;
    Ok(())
}

#[test]
fn c_store_without_matching_context_fails_locally() -> Result<()> {
    let (scp, addr) = spawn_storage_scp_for_mismatch()?;

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("STORE-SCU")
        .with_presentation_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .establish(addr)?;

    // an instance of a SOP class with no accepted context
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.4"),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, "1.2.3.4"),
    ));

    let err = association.send_c_store(&obj, None);
    assert!(matches!(
        err,
        Err(dicom_net::dimse::service::Error::NoAcceptableContext { .. })
    ));

    // no message went out; the association is still usable
    association.release()?;

    scp.join().expect("SCP thread panicked")?;
    Ok(())
}

fn spawn_storage_scp_for_mismatch() -> Result<(std::thread::JoinHandle<Result<()>>, SocketAddr)> {
    let listener = std::net::TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let scp = ServerAssociationOptions::new()
        .ae_title("STORE-SCP")
        .with_abstract_syntax(CT_IMAGE_STORAGE);

    let handle = std::thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;
        match association.receive() {
            Ok(Pdu::ReleaseRQ) => {
                association.send(&Pdu::ReleaseRP)?;
            }
            other => panic!("expected release, got {:?}", other),
        }
        Ok(())
    });
    Ok((handle, addr))
}
