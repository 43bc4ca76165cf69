//! Streaming tests against the vivid virtual camera.
//!
//! Requires the `integration` feature and a loaded vivid module
//! (`modprobe vivid`), with read access to its /dev/video node.

#![cfg(feature = "integration")]

use fundus_hw::{CameraDevice, CameraError, ControlKey, ControlValue, Controls, Rect, Resolution};
use fundus_hw::V4l2Camera;
use std::fs;
use std::path::Path;

/// First /dev/video node whose sysfs name says vivid.
fn find_vivid() -> Option<String> {
    let video4linux = Path::new("/sys/class/video4linux");
    (0..10).find_map(|index| {
        let name = fs::read_to_string(video4linux.join(format!("video{index}")).join("name")).ok()?;
        name.to_lowercase()
            .contains("vivid")
            .then(|| format!("/dev/video{index}"))
    })
}

fn open_vivid() -> V4l2Camera {
    let path = find_vivid().expect("vivid virtual camera not available (modprobe vivid)");
    let mut camera = V4l2Camera::open(&path).expect("failed to open vivid device");
    camera
        .configure(Resolution::new(640, 480))
        .expect("failed to configure vivid");
    camera
}

#[test]
fn test_frames_come_from_one_live_stream() {
    let mut camera = open_vivid();
    camera.start().unwrap();

    let sequences: Vec<u32> = (0..5)
        .map(|_| camera.capture_frame().unwrap().sequence)
        .collect();
    // A stream reopened per frame would restart its sequence counter.
    assert!(
        sequences.windows(2).all(|w| w[1] > w[0]),
        "sequence numbers not increasing: {sequences:?}"
    );

    // The crop applies to the running stream without a restart.
    camera
        .set_controls(&Controls::from([(
            ControlKey::ScalerCrop,
            ControlValue::Rect(Rect::new(160, 120, 320, 240)),
        )]))
        .unwrap();
    let cropped = camera.capture_frame().unwrap();
    assert_eq!((cropped.width, cropped.height), (640, 480));
    assert!(cropped.sequence > sequences[4]);

    camera.stop().unwrap();
    assert!(matches!(
        camera.capture_frame(),
        Err(CameraError::NotStreaming)
    ));

    camera.start().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("still.jpg");
    camera.capture_to_file(&path).unwrap();
    let saved = image::open(&path).unwrap();
    assert_eq!((saved.width(), saved.height()), (640, 480));
    camera.stop().unwrap();
}
