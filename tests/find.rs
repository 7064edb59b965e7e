use std::net::TcpListener;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_dul::context::PresentationContext;
use dicom_dul::service::{
    QueryRetrieveLevel, ServiceProviderHandler, ServiceProviderOptions, ServiceUserOptions,
};
use dicom_object::InMemDicomObject;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

fn study_result(study_instance_uid: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        PrimitiveValue::from("STUDY"),
    ));
    obj.put(DataElement::new(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(study_instance_uid),
    ));
    obj
}

#[derive(Clone)]
struct ThreeStudies;

impl ServiceProviderHandler for ThreeStudies {
    fn c_find(
        &mut self,
        _context: &PresentationContext,
        query: &InMemDicomObject,
    ) -> Vec<InMemDicomObject> {
        // the query carries the level the client asked for
        assert_eq!(
            query
                .get(tags::QUERY_RETRIEVE_LEVEL)
                .unwrap()
                .to_str()
                .unwrap()
                .trim(),
            "STUDY"
        );
        vec![
            study_result("1.2.3.1"),
            study_result("1.2.3.2"),
            study_result("1.2.3.3"),
        ]
    }
}

/// Three pending responses stream through the lazy iterator,
/// and the final success response terminates it cleanly.
#[test]
fn find_streams_pending_matches() -> Result<()> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;

    let scp = std::thread::spawn(move || -> Result<()> {
        let (stream, _) = listener.accept()?;
        ServiceProviderOptions::new()
            .ae_title("FIND-SCP")
            .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
            .serve(stream, ThreeStudies)?;
        Ok(())
    });

    let mut scu = ServiceUserOptions::new()
        .calling_ae_title("FIND-SCU")
        .called_ae_title("FIND-SCP")
        .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
        .connect(addr)?;

    let mut query = InMemDicomObject::new_empty();
    query.put(DataElement::new(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from("1.2.3"),
    ));

    let mut uids = Vec::new();
    for result in scu.c_find(QueryRetrieveLevel::Study, query)? {
        let obj = result?;
        uids.push(
            obj.get(tags::STUDY_INSTANCE_UID)
                .expect("result has a study instance UID")
                .to_str()?
                .trim_matches(|c: char| c == ' ' || c == '\0')
                .to_string(),
        );
    }
    assert_eq!(uids, vec!["1.2.3.1", "1.2.3.2", "1.2.3.3"]);

    scu.release()?;
    scp.join().unwrap()?;
    Ok(())
}

/// An empty result set yields no items.
#[test]
fn find_with_no_matches_terminates() -> Result<()> {
    #[derive(Clone)]
    struct NoMatches;
    impl ServiceProviderHandler for NoMatches {}

    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;

    let scp = std::thread::spawn(move || -> Result<()> {
        let (stream, _) = listener.accept()?;
        ServiceProviderOptions::new()
            .ae_title("FIND-SCP")
            .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
            .serve(stream, NoMatches)?;
        Ok(())
    });

    let mut scu = ServiceUserOptions::new()
        .called_ae_title("FIND-SCP")
        .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
        .connect(addr)?;

    let count = scu
        .c_find(QueryRetrieveLevel::Study, InMemDicomObject::new_empty())?
        .count();
    assert_eq!(count, 0);

    scu.release()?;
    scp.join().unwrap()?;
    Ok(())
}
