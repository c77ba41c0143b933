//! Verification service end to end:
//! association negotiation, C-ECHO exchange, orderly release,
//! rejection of unacceptable proposals
//! and the handling of malformed PDUs.

use std::io::Write;
use std::net::SocketAddr;

use dicom_net::association::client::ClientAssociationOptions;
use dicom_net::association::Error;
use dicom_net::pdu::{
    read_pdu, AbortRQServiceProviderReason, AbortRQSource, Pdu, DEFAULT_MAX_PDU,
};
use dicom_net::{ApplicationEntity, ServiceHandlers};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

fn spawn_echo_scp() -> Result<(dicom_net::ServerHandle, SocketAddr)> {
    let ae = ApplicationEntity::new(SCP_AE_TITLE)
        .with_supported_abstract_syntax(VERIFICATION_SOP_CLASS);
    let server = ae.serve("localhost:0", ServiceHandlers::new)?;
    let addr = server.local_addr();
    Ok((server, addr))
}

#[test]
fn c_echo_success_and_release() -> Result<()> {
    let (server, addr) = spawn_echo_scp()?;

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(addr)?;

    assert_eq!(association.peer_ae_title(), SCP_AE_TITLE);
    let contexts = association.presentation_contexts();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].id, 1);
    assert_eq!(contexts[0].transfer_syntax, IMPLICIT_VR_LE);

    // the chosen transfer syntax is taken from the proposed list
    assert_eq!(contexts[0].abstract_syntax, VERIFICATION_SOP_CLASS);

    let status = association.send_c_echo()?;
    assert_eq!(status, 0x0000);

    association.release()?;
    // releasing again is a no-op
    association.release()?;

    server.shutdown();
    Ok(())
}

#[test]
fn association_rejected_when_nothing_matches() -> Result<()> {
    let (server, addr) = spawn_echo_scp()?;

    let result = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .with_presentation_context("1.2.840.10008.1.99", vec![IMPLICIT_VR_LE])
        .establish(addr);

    match result {
        Err(Error::Rejected { association_rj }) => {
            assert_eq!(association_rj.result.code(), 1);
            assert_eq!(association_rj.source.codes(), (1, 1));
        }
        other => panic!("expected rejection, got {:?}", other.map(|_| ())),
    }

    server.shutdown();
    Ok(())
}

#[test]
fn malformed_pdu_triggers_provider_abort() -> Result<()> {
    let (server, addr) = spawn_echo_scp()?;

    // negotiate by hand so that arbitrary bytes can follow
    let mut socket = std::net::TcpStream::connect(addr)?;
    let rq = Pdu::AssociationRQ(dicom_net::pdu::AssociationRQ {
        protocol_version: 1,
        calling_ae_title: SCU_AE_TITLE.to_string(),
        called_ae_title: SCP_AE_TITLE.to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![dicom_net::pdu::PresentationContextProposed {
            id: 1,
            abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
            transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
        }],
        user_variables: vec![dicom_net::pdu::UserVariableItem::MaxLength(DEFAULT_MAX_PDU)],
    });
    let mut buffer = Vec::new();
    dicom_net::write_pdu(&mut buffer, &rq)?;
    socket.write_all(&buffer)?;

    let response = read_pdu(&mut socket, DEFAULT_MAX_PDU, true)?.expect("expected a response");
    assert!(matches!(response, Pdu::AssociationAC { .. }));

    // a PDU of unrecognized type 09H
    socket.write_all(&[0x09, 0x00, 0x00, 0x00, 0x00, 0x04, 0, 0, 0, 0])?;

    // the provider answers with A-ABORT and closes the connection
    let response = read_pdu(&mut socket, DEFAULT_MAX_PDU, true)?.expect("expected a response");
    assert_eq!(
        response,
        Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPdu
            ),
        }
    );
    let eof = read_pdu(&mut socket, DEFAULT_MAX_PDU, true)?;
    assert_eq!(eof, None);

    server.shutdown();
    Ok(())
}

#[test]
fn user_abort_reaches_the_peer() -> Result<()> {
    let (server, addr) = spawn_echo_scp()?;

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)?;

    association.abort()?;
    assert!(association.is_closed());

    server.shutdown();
    Ok(())
}
