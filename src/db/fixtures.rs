//! Shared test fixtures.

use chrono::Utc;
use tempfile::NamedTempFile;

use super::*;

/// Open a store on a fresh temp file. Keep the file alive for the test.
pub fn temp_store() -> (NamedTempFile, Store) {
    let tmp = NamedTempFile::new().unwrap();
    let store = Store::new(tmp.path()).unwrap();
    (tmp, store)
}

pub fn linux_client(store: &Store, hostname: &str) -> ClientMachine {
    store
        .add_client(
            &NewClient {
                hostname: hostname.to_string(),
                ip_address: "10.0.0.1".to_string(),
                os_type: OsType::Linux,
                os_version: "6.1".to_string(),
            },
            Utc::now(),
        )
        .unwrap()
}

pub fn package(store: &Store, name: &str, os: OsCompatibility) -> Package {
    store
        .add_package(
            &NewPackage {
                name: name.to_string(),
                version: "1.0.0".to_string(),
                description: String::new(),
                os_compatibility: os,
                size: 1024,
                checksum: "ab".repeat(32),
                artifact_ref: format!("artifacts/{}.deb", name),
            },
            Utc::now(),
        )
        .unwrap()
}

