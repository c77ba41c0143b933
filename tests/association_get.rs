//! Retrieve and normalized services end to end:
//! C-GET with C-STORE sub-operations on the same association
//! (negotiated through SCP/SCU role selection),
//! and an N-GET attribute read.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_net::association::client::ClientAssociationOptions;
use dicom_net::association::server::ServerAssociationOptions;
use dicom_net::dimse::service::RetrieveDatasets;
use dicom_net::ServiceHandlers;
use dicom_object::InMemDicomObject;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static PATIENT_ROOT_QR_GET: &str = "1.2.840.10008.5.1.4.1.2.1.3";
static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
static PRINTER_SOP_CLASS: &str = "1.2.840.10008.5.1.1.16";
static PRINTER_SOP_INSTANCE: &str = "1.2.840.10008.5.1.1.17";

fn ct_instance(instance_uid: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, CT_IMAGE_STORAGE),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, instance_uid),
    ));
    obj
}

fn retrieve_identifier() -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        dicom_value!(Str, "STUDY"),
    ));
    obj.put(DataElement::new(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, "1.2.3.4"),
    ));
    obj
}

#[test]
fn c_get_delivers_instances_through_sub_operations() -> Result<()> {
    let listener = std::net::TcpListener::bind("localhost:0")?;
    let addr: SocketAddr = listener.local_addr()?;

    let scp = ServerAssociationOptions::new()
        .ae_title("GET-SCP")
        .with_abstract_syntax(PATIENT_ROOT_QR_GET)
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .with_transfer_syntax(IMPLICIT_VR_LE)
        .with_role_selection(CT_IMAGE_STORAGE, true, true);

    let server = std::thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;
        association.set_handlers(ServiceHandlers::new().on_c_get(
            |_request| -> RetrieveDatasets {
                Box::new(
                    [ct_instance("1.2.3.4.1"), ct_instance("1.2.3.4.2")].into_iter(),
                )
            },
        ));
        association.serve()?;
        Ok(())
    });

    let stored = Arc::new(AtomicUsize::new(0));
    let stored_in_handler = Arc::clone(&stored);

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("GET-SCU")
        .with_presentation_context(PATIENT_ROOT_QR_GET, vec![IMPLICIT_VR_LE])
        .with_presentation_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .with_role_selection(CT_IMAGE_STORAGE, true, true)
        .establish(addr)?;

    association.set_handlers(ServiceHandlers::new().on_c_store(move |request| {
        assert_eq!(request.sop_class_uid, CT_IMAGE_STORAGE);
        assert!(request.dataset().is_ok());
        stored_in_handler.fetch_add(1, Ordering::SeqCst);
        0x0000
    }));

    let responses: Vec<_> = association
        .send_c_get(&retrieve_identifier(), PATIENT_ROOT_QR_GET)?
        .collect::<std::result::Result<_, _>>()?;

    // both instances were delivered through inbound C-STORE requests
    assert_eq!(stored.load(Ordering::SeqCst), 2);
    // and the final response reports completion
    let (final_status, final_identifier) = responses.last().expect("final response");
    assert_eq!(*final_status, 0x0000);
    assert!(final_identifier.is_none());

    association.release()?;
    server.join().expect("SCP thread panicked")?;
    Ok(())
}

#[test]
fn n_get_reads_attributes() -> Result<()> {
    let listener = std::net::TcpListener::bind("localhost:0")?;
    let addr: SocketAddr = listener.local_addr()?;

    let scp = ServerAssociationOptions::new()
        .ae_title("PRINT-SCP")
        .with_abstract_syntax(PRINTER_SOP_CLASS)
        .with_transfer_syntax(IMPLICIT_VR_LE);

    let server = std::thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;
        association.set_handlers(ServiceHandlers::new().on_n_get(|request| {
            assert_eq!(
                request.command.requested_sop_instance_uid().as_deref(),
                Some(PRINTER_SOP_INSTANCE)
            );
            let mut attributes = InMemDicomObject::new_empty();
            attributes.put(DataElement::new(
                tags::PRINTER_STATUS,
                VR::CS,
                dicom_value!(Str, "NORMAL"),
            ));
            (0x0000, Some(attributes))
        }));
        association.serve()?;
        Ok(())
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("PRINT-SCU")
        .with_presentation_context(PRINTER_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(addr)?;

    let (status, attributes) = association.send_n_get(
        PRINTER_SOP_CLASS,
        PRINTER_SOP_INSTANCE,
        &[tags::PRINTER_STATUS],
    )?;
    assert_eq!(status, 0x0000);
    let attributes = attributes.expect("attribute list present");
    assert_eq!(
        attributes
            .get(tags::PRINTER_STATUS)
            .unwrap()
            .to_str()?
            .trim(),
        "NORMAL"
    );

    association.release()?;
    server.join().expect("SCP thread panicked")?;
    Ok(())
}
