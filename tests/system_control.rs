//! Input validation and lifecycle behavior through the public API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use nalgebra::Vector3;

use common::*;
use orb_vslam::bow::Vocabulary;
use orb_vslam::feature::Image;
use orb_vslam::{Error, SlamSystem, TrackingState};

fn vocabulary() -> Arc<Vocabulary> {
    Arc::new(Vocabulary::synthetic(6, 3, 123))
}

fn stationary_system() -> SlamSystem {
    let world = Arc::new(SyntheticWorld::grid(-1.1, 1.1, 0.1));
    let extractor = SyntheticExtractor::new(world, |_| pose_at(Vector3::zeros()));
    SlamSystem::new(stereo_config(), vocabulary(), Box::new(extractor)).unwrap()
}

#[test]
fn test_empty_image_rejected_without_side_effects() {
    let mut system = stationary_system();
    let image = gray_image();
    system.feed_stereo_frame(&image, &image, 0.0, None).unwrap();
    let keyframes_before = system.shared_context().map.read().num_keyframes();
    let landmarks_before = system.shared_context().map.read().num_landmarks();

    let empty = Image::new(0, 0, Vec::new());
    match system.feed_stereo_frame(&empty, &image, 0.1, None) {
        Err(Error::InputInvalid(_)) => {}
        other => panic!("expected InputInvalid, got {:?}", other.map(|o| o.state)),
    }

    // State preserved: database untouched, tracking still running.
    let map = system.shared_context().map.read();
    assert_eq!(map.num_keyframes(), keyframes_before);
    assert_eq!(map.num_landmarks(), landmarks_before);
    drop(map);
    assert_eq!(system.tracking_state(), TrackingState::Tracking);
}

#[test]
fn test_size_mismatch_rejected() {
    let mut system = stationary_system();
    let image = gray_image();
    let wrong = Image::new(100, 100, vec![128; 100 * 100]);
    assert!(matches!(
        system.feed_stereo_frame(&wrong, &image, 0.0, None),
        Err(Error::InputInvalid(_))
    ));
}

#[test]
fn test_reset_clears_everything() {
    let mut system = stationary_system();
    let image = gray_image();
    for i in 0..20 {
        system
            .feed_stereo_frame(&image, &image, i as f64 / 30.0, None)
            .unwrap();
    }
    assert!(system.shared_context().map.read().num_keyframes() > 0);

    let done = system.request_reset();
    done.recv_timeout(Duration::from_millis(1000))
        .expect("reset did not complete in time");

    let map = system.shared_context().map.read();
    assert_eq!(map.num_keyframes(), 0);
    assert_eq!(map.num_landmarks(), 0);
    drop(map);
    assert_eq!(system.tracking_state(), TrackingState::Initializing);

    // The engine bootstraps again after the reset.
    let outcome = system
        .feed_stereo_frame(&image, &image, 10.0, None)
        .unwrap();
    assert_eq!(outcome.state, TrackingState::Tracking);
}

#[test]
fn test_pause_and_resume() {
    let mut system = stationary_system();
    let image = gray_image();
    for i in 0..5 {
        system
            .feed_stereo_frame(&image, &image, i as f64 / 30.0, None)
            .unwrap();
    }

    let paused = system.request_pause();
    paused
        .recv_timeout(Duration::from_secs(2))
        .expect("stages did not pause");
    assert!(system.shared_context().mapping_lifecycle.is_paused());

    system.resume();
    // Tracking keeps working across the pause/resume cycle.
    let outcome = system
        .feed_stereo_frame(&image, &image, 1.0, None)
        .unwrap();
    assert_eq!(outcome.state, TrackingState::Tracking);
}

#[test]
fn test_terminate_completes() {
    let mut system = stationary_system();
    let image = gray_image();
    system.feed_stereo_frame(&image, &image, 0.0, None).unwrap();

    let done = system.request_terminate();
    done.recv_timeout(Duration::from_secs(5))
        .expect("terminate did not complete");
}

#[test]
fn test_setup_mismatch_rejected() {
    let mut system = stationary_system();
    let image = gray_image();
    assert!(matches!(
        system.feed_monocular_frame(&image, 0.0, None),
        Err(Error::InputInvalid(_))
    ));
}
