mod support;

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use segviz::{DeliveryClient, DeliveryError, Tumor, VolumeMetrics, WirePayload};

fn payload() -> WirePayload {
    WirePayload {
        patient: [("id".to_string(), serde_json::json!("P-0042"))]
            .into_iter()
            .collect(),
        analysis: VolumeMetrics {
            liver_volume_ml: 1532.18,
            tumor_count: 1,
            tumors: vec![Tumor {
                id: 1,
                volume_ml: 3.5,
            }],
            total_tumor_volume_ml: 3.5,
        },
    }
}

fn client() -> DeliveryClient {
    DeliveryClient::new(Duration::from_secs(2), Duration::ZERO)
}

#[test]
fn frames_arrive_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let liver = dir.path().join("case_liver.obj");
    let tumor = dir.path().join("case_tumor.obj");
    fs::write(&liver, b"v 0 0 0\n").unwrap();
    fs::write(&tumor, b"v 1 1 1\nv 2 2 2\n").unwrap();
    let assets: Vec<(u16, PathBuf)> = vec![(8, liver), (9, tumor)];

    let (port, received) = support::receiver();
    assert!(client().deliver(&format!("127.0.0.1:{port}"), &assets, &payload()));

    let stream = support::decode(&received.join().unwrap());
    assert_eq!(stream.payload["patient"]["id"], "P-0042");
    assert_eq!(stream.payload["analysis"]["tumors"][0]["volume_ml"], 3.5);
    assert_eq!(
        stream.meshes,
        vec![
            (8, b"v 0 0 0\n".to_vec()),
            (9, b"v 1 1 1\nv 2 2 2\n".to_vec())
        ]
    );
}

#[test]
fn no_meshes_sends_zero_count() {
    let (port, received) = support::receiver();
    assert!(client().deliver(&format!("127.0.0.1:{port}"), &[], &payload()));

    let bytes = received.join().unwrap();
    assert_eq!(&bytes[bytes.len() - 4..], &[0, 0, 0, 0]);
    assert!(support::decode(&bytes).meshes.is_empty());
}

#[test]
fn nothing_listening_is_unreachable() {
    let endpoint = format!("127.0.0.1:{}", support::closed_port());

    assert!(!client().deliver(&endpoint, &[], &payload()));
    let err = client().try_deliver(&endpoint, &[], &payload()).unwrap_err();
    assert!(matches!(err, DeliveryError::Unreachable { .. }), "{err}");
}

#[test]
fn unreadable_mesh_fails_after_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let assets = vec![(8u16, dir.path().join("never_written.obj"))];
    let (port, received) = support::receiver();

    let err = client()
        .try_deliver(&format!("127.0.0.1:{port}"), &assets, &payload())
        .unwrap_err();
    assert!(matches!(err, DeliveryError::MeshRead { .. }), "{err}");
    // The receiver still sees the payload frame before the connection drops.
    assert!(!received.join().unwrap().is_empty());
}
