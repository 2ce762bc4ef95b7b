// Datatype descriptor parsing.
use shmflow_core::{Datatype, ShmError};

#[test]
fn parses_type_subtype_and_params() {
    let dt = Datatype::parse("application/x-raw,fun=yes").expect("parse");
    assert_eq!(dt.media_type(), "application");
    assert_eq!(dt.subtype(), "x-raw");
    assert_eq!(dt.params(), &[("fun".to_string(), "yes".to_string())]);
    assert_eq!(dt.param("fun"), Some("yes"));
    assert_eq!(dt.param("missing"), None);
    assert_eq!(dt.raw(), "application/x-raw,fun=yes");
}

#[test]
fn parses_without_params() {
    let dt = Datatype::parse("audio/x-wav").expect("parse");
    assert_eq!(dt.media_type(), "audio");
    assert_eq!(dt.subtype(), "x-wav");
    assert!(dt.params().is_empty());
}

#[test]
fn tolerates_whitespace_between_parts() {
    let dt = Datatype::parse("video/x-raw, format=BGR, height=480").expect("parse");
    assert_eq!(dt.media_type(), "video");
    assert_eq!(dt.subtype(), "x-raw");
    assert_eq!(dt.param("format"), Some("BGR"));
    assert_eq!(dt.param("height"), Some("480"));
}

#[test]
fn keeps_parameter_order() {
    let dt = Datatype::parse("a/b,x=1,y=2,z=3").expect("parse");
    let keys: Vec<&str> = dt.params().iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["x", "y", "z"]);
}

#[test]
fn value_may_contain_extra_equals() {
    let dt = Datatype::parse("application/x-custom,expr=a=b").expect("parse");
    assert_eq!(dt.param("expr"), Some("a=b"));
}

#[test]
fn rejects_malformed_descriptors() {
    for bad in ["", "   ", "noslash", "/x-raw", "application/", "a/b,loose"] {
        let result = Datatype::parse(bad);
        assert!(
            matches!(result, Err(ShmError::InvalidDatatype { .. })),
            "'{bad}' should not parse"
        );
    }
}

#[test]
fn display_round_trips_the_raw_form() {
    let dt = Datatype::parse("application/x-raw,fun=yes").expect("parse");
    assert_eq!(dt.to_string(), "application/x-raw,fun=yes");
}
