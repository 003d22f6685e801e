use std::path::PathBuf;

use courselink_adapters::{load_detail_fixture, parse_course_detail_html};

fn fixture_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/course-detail")
}

#[test]
fn saved_detail_pages_parse_into_expected_fields() {
    let mut checked = 0;
    for entry in std::fs::read_dir(fixture_root()).expect("fixture dir") {
        let bundle = entry.expect("entry").path().join("bundle.json");
        if !bundle.exists() {
            continue;
        }
        let fixture = load_detail_fixture(&bundle).expect("load fixture");
        let parsed = parse_course_detail_html(&fixture.page_html).expect("parse");
        assert_eq!(parsed, fixture.expected, "fixture {}", fixture.fixture_id);
        checked += 1;
    }
    assert!(checked >= 2);
}

#[test]
fn fixture_bundles_point_at_catalog_preview_pages() {
    let fixture = load_detail_fixture(fixture_root().join("calculus-i/bundle.json")).expect("load fixture");
    assert!(fixture.captured_from_url.contains("preview_course"));
    assert!(fixture.page_html.contains("course_preview_title"));
}
