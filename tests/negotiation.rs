use std::net::TcpListener;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_dul::pdu::{
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource,
    PresentationContextResultReason,
};
use dicom_dul::service::{
    Error, ServiceProviderHandler, ServiceProviderOptions, ServiceUserOptions,
};
use dicom_object::InMemDicomObject;
use matches::matches;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

#[derive(Clone)]
struct AnyHandler;

impl ServiceProviderHandler for AnyHandler {}

/// A server with no overlapping abstract syntax rejects
/// the association outright.
#[test]
fn association_is_rejected_without_common_syntaxes() -> Result<()> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;

    let scp = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let outcome = ServiceProviderOptions::new()
            .ae_title("ECHO-SCP")
            .with_abstract_syntax(VERIFICATION_SOP_CLASS)
            .serve(stream, AnyHandler);
        assert!(matches!(outcome, Err(Error::Rejected { .. })));
    });

    let outcome = ServiceUserOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("ECHO-SCP")
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .connect(addr);

    match outcome {
        Err(Error::Rejected { result, source }) => {
            assert_eq!(result, AssociationRJResult::Permanent);
            assert_eq!(
                source,
                AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported
                )
            );
        }
        other => panic!("expected rejection, got {:?}", other.err()),
    }

    scp.join().unwrap();
    Ok(())
}

/// A context refused over its transfer syntax stays unusable:
/// the subsequent store fails locally, without wire traffic.
#[test]
fn transfer_syntax_mismatch_yields_no_matching_context() -> Result<()> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;

    let scp = std::thread::spawn(move || -> Result<()> {
        let (stream, _) = listener.accept()?;
        // this server only speaks explicit VR little endian
        ServiceProviderOptions::new()
            .ae_title("PICKY-SCP")
            .with_abstract_syntax(VERIFICATION_SOP_CLASS)
            .with_abstract_syntax(CT_IMAGE_STORAGE)
            .with_transfer_syntax(EXPLICIT_VR_LE)
            .serve(stream, AnyHandler)?;
        Ok(())
    });

    let mut scu = ServiceUserOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("PICKY-SCP")
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE])
        .with_presentation_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .connect(addr)?;

    let storage_context = scu
        .presentation_contexts()
        .iter()
        .find(|pc| pc.abstract_syntax == CT_IMAGE_STORAGE)
        .expect("storage context is recorded")
        .clone();
    assert_eq!(
        storage_context.result,
        PresentationContextResultReason::TransferSyntaxesNotSupported
    );

    let mut object = InMemDicomObject::new_empty();
    object.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(CT_IMAGE_STORAGE),
    ));
    object.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from("1.2.3.4"),
    ));

    let outcome = scu.c_store(&object);
    assert!(matches!(
        outcome,
        Err(Error::NoMatchingContext { ref abstract_syntax, .. })
            if abstract_syntax == CT_IMAGE_STORAGE
    ));

    // the verification context is still usable
    scu.c_echo()?;
    scu.release()?;
    scp.join().unwrap()?;
    Ok(())
}
