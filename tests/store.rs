use camino::Utf8PathBuf;

use govdata_ingest::config::{Config, ConfigLoader};
use govdata_ingest::domain::FamilyName;
use govdata_ingest::store::Store;

#[test]
fn family_store_is_created_on_open() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let config = ConfigLoader::resolve_config(Config {
        data_root: Some(root.join("raw").to_string()),
        store_root: Some(root.join("db").to_string()),
        ..Config::default()
    })
    .unwrap();
    let store = Store::from_config(&config);
    let echo = config.family(&FamilyName::new("echo")).unwrap();

    assert_eq!(store.family_store_path(echo), root.join("db/echo.duckdb"));
    assert!(store.list_tables(echo).unwrap().is_empty());
    assert!(!store.family_store_path(echo).exists());

    let conn = store.open_family(echo).unwrap();
    conn.execute_batch("CREATE TABLE frs_facilities (registry_id VARCHAR)")
        .unwrap();
    drop(conn);

    let tables = store.list_tables(echo).unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].name, "frs_facilities");
    assert_eq!(tables[0].rows, 0);
}

#[test]
fn ensure_roots_creates_both_directories() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = Store::new_with_paths(root.join("a/raw"), root.join("b/db"));
    store.ensure_roots().unwrap();
    assert!(store.data_root().is_dir());
    assert!(store.store_root().is_dir());
}
