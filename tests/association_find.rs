//! Query service end to end:
//! multi-response C-FIND delivery and in-band cancellation.

use std::net::SocketAddr;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_net::association::client::ClientAssociationOptions;
use dicom_net::dimse::service::QueryResponses;
use dicom_net::{ApplicationEntity, ServiceHandlers};
use dicom_object::InMemDicomObject;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static PATIENT_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";

fn match_identifier(name: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        dicom_value!(Str, "PATIENT"),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        dicom_value!(Str, name),
    ));
    obj
}

fn query_identifier() -> InMemDicomObject {
    match_identifier("*")
}

fn spawn_find_scp(
    handler_factory: impl Fn() -> ServiceHandlers + Send + Sync + 'static,
) -> Result<(dicom_net::ServerHandle, SocketAddr)> {
    let ae = ApplicationEntity::new("FIND-SCP")
        .with_supported_abstract_syntax(PATIENT_ROOT_QR_FIND)
        .with_supported_transfer_syntax(IMPLICIT_VR_LE);
    let server = ae.serve("localhost:0", handler_factory)?;
    let addr = server.local_addr();
    Ok((server, addr))
}

#[test]
fn c_find_yields_every_pending_response() -> Result<()> {
    let (server, addr) = spawn_find_scp(|| {
        ServiceHandlers::new().on_c_find(|_request| -> QueryResponses {
            Box::new(
                [
                    (0xFF00, Some(match_identifier("Doe^John"))),
                    (0xFF00, Some(match_identifier("Doe^Jane"))),
                ]
                .into_iter(),
            )
        })
    })?;

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("FIND-SCU")
        .with_presentation_context(PATIENT_ROOT_QR_FIND, vec![IMPLICIT_VR_LE])
        .establish(addr)?;

    let responses: Vec<_> = association
        .send_c_find(&query_identifier(), PATIENT_ROOT_QR_FIND)?
        .collect::<std::result::Result<_, _>>()?;

    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0].0, 0xFF00);
    assert_eq!(responses[1].0, 0xFF00);
    assert_eq!(responses[2].0, 0x0000);

    let first = responses[0].1.as_ref().expect("pending match has an identifier");
    assert_eq!(
        first.get(tags::PATIENT_NAME).unwrap().to_str()?.trim(),
        "Doe^John"
    );
    let second = responses[1].1.as_ref().expect("pending match has an identifier");
    assert_eq!(
        second.get(tags::PATIENT_NAME).unwrap().to_str()?.trim(),
        "Doe^Jane"
    );
    // the final response carries no identifier
    assert!(responses[2].1.is_none());

    // the association survives the whole exchange
    assert!(association.is_established());
    association.release()?;

    server.shutdown();
    Ok(())
}

#[test]
fn c_cancel_ends_a_pending_find() -> Result<()> {
    // a provider with no end of matches:
    // only cancellation can terminate the operation
    let (server, addr) = spawn_find_scp(|| {
        ServiceHandlers::new().on_c_find(|_request| -> QueryResponses {
            Box::new((0..).map(|i| (0xFF00, Some(match_identifier(&format!("Match^{}", i))))))
        })
    })?;

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("FIND-SCU")
        .with_presentation_context(PATIENT_ROOT_QR_FIND, vec![IMPLICIT_VR_LE])
        .establish(addr)?;

    let mut responses = association.send_c_find(&query_identifier(), PATIENT_ROOT_QR_FIND)?;

    // take one pending response, then ask for cancellation
    let first = responses.next().expect("first response")?;
    assert_eq!(first.0, 0xFF00);
    responses.cancel()?;

    // already emitted pending responses may still arrive,
    // but the sequence must end with the cancel confirmation
    let mut last_status = first.0;
    for response in responses {
        let (status, _identifier) = response?;
        last_status = status;
    }
    assert_eq!(last_status, 0xFE00);

    association.release()?;
    server.shutdown();
    Ok(())
}
