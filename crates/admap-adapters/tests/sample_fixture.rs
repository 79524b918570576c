use std::path::PathBuf;

use admap_adapters::{FixtureProviderClient, ProviderClient, ProviderFixture};
use admap_core::ProviderCode;

fn sample_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/ghn_sample.json")
}

#[test]
fn sample_fixture_parses_numeric_and_text_codes() {
    let fixture = ProviderFixture::load(sample_path()).unwrap();
    assert_eq!(fixture.provider_code, "ghn");
    assert_eq!(fixture.provinces.len(), 3);
    assert_eq!(fixture.provinces[0].code.as_str(), "202");
    assert_eq!(fixture.wards["1484"][0].code.as_str(), "1A0101");
}

#[tokio::test]
async fn client_walks_the_sample_tree() {
    let client = FixtureProviderClient::from_path(sample_path()).unwrap();
    assert_eq!(client.provider_code(), "ghn");

    let mut wards = 0;
    for province in client.fetch_provinces().await.unwrap() {
        for district in client.fetch_districts(&province.provider_code).await.unwrap() {
            assert_eq!(district.parent_provider_code.as_ref(), Some(&province.provider_code));
            wards += client.fetch_wards(&district.provider_code).await.unwrap().len();
        }
    }
    assert_eq!(wards, 8);
    assert!(client
        .fetch_districts(&ProviderCode::new("999"))
        .await
        .unwrap()
        .is_empty());
}

#[test]
fn missing_fixture_reports_the_path() {
    let err = ProviderFixture::load("does/not/exist.json").unwrap_err();
    assert!(format!("{err:#}").contains("does/not/exist.json"));
}
