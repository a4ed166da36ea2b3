use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use nalgebra::{UnitQuaternion, Vector2, Vector3};
use rand::prelude::*;
use tracing::info;

use rust_vslam_mapper::geometry::{CameraModel, SE3};
use rust_vslam_mapper::map::{Descriptor, Feature, Frame, KeyPoint, Point};
use rust_vslam_mapper::{MapConfig, MappingSystem};

/// Frames in the synthetic sequence.
const NUM_FRAMES: usize = 60;

/// Forward motion per frame (meters).
const STEP: f64 = 0.05;

struct Landmark {
    position: Vector3<f64>,
    descriptor: Descriptor,
}

/// Ground plane one meter below the camera path, plus a wall ahead.
fn synthetic_world(rng: &mut StdRng) -> Vec<Landmark> {
    let mut landmarks = Vec::new();
    let descriptor = |rng: &mut StdRng| {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        Descriptor(bytes)
    };
    for _ in 0..400 {
        let position = Vector3::new(rng.gen_range(-3.0..6.0), 1.0, rng.gen_range(2.0..10.0));
        landmarks.push(Landmark {
            position,
            descriptor: descriptor(rng),
        });
    }
    for _ in 0..150 {
        let position = Vector3::new(rng.gen_range(-3.0..6.0), rng.gen_range(-1.5..1.0), 10.0);
        landmarks.push(Landmark {
            position,
            descriptor: descriptor(rng),
        });
    }
    landmarks
}

/// Render the keypoints a camera at `pose` would detect. Returns the
/// keypoints and, for each, the landmark it came from.
fn render(camera: &CameraModel, pose: &SE3, world: &[Landmark], rng: &mut StdRng) -> (Vec<KeyPoint>, Vec<usize>) {
    let t_cw = pose.inverse();
    let mut keypoints = Vec::new();
    let mut sources = Vec::new();
    for (i, landmark) in world.iter().enumerate() {
        let Some(uv) = camera.project(&t_cw.transform_point(&landmark.position)) else {
            continue;
        };
        if !camera.is_in_image(&uv, 4.0) {
            continue;
        }
        let noise = Vector2::new(rng.gen_range(-0.3..0.3), rng.gen_range(-0.3..0.3));
        keypoints.push(KeyPoint::new(uv + noise, rng.gen_range(0.1..1.0), landmark.descriptor));
        sources.push(i);
    }
    (keypoints, sources)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rust_vslam_mapper=info".parse()?),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            MapConfig::load(&path)?
        }
        None => MapConfig::default(),
    };

    let camera = Arc::new(CameraModel::new(450.0, 450.0, 320.0, 240.0, 640, 480));
    let mut rng = StdRng::seed_from_u64(7);
    let world = synthetic_world(&mut rng);

    let mut system = MappingSystem::new(config)?;
    system.start()?;

    let pose_at = |i: usize| SE3::new(UnitQuaternion::identity(), Vector3::new(i as f64 * STEP, 0.0, 0.0));

    // Bootstrap: two keyframes whose features are tied to known points.
    let mut bootstrap: Vec<Option<Arc<Point>>> = (0..world.len()).map(|_| None).collect();
    for i in [0usize, 6] {
        let pose = pose_at(i);
        let (keypoints, sources) = render(&camera, &pose, &world, &mut rng);
        let frame = Arc::new(Frame::new(i as u64 * 33_000_000, camera.clone(), pose, keypoints));
        {
            let mut state = system.lock();
            for (k, &src) in sources.iter().enumerate() {
                let point = bootstrap[src].get_or_insert_with(|| {
                    Arc::new(Point::converged(world[src].position, world[src].descriptor))
                });
                if frame.add_feature(Feature::new(frame.keypoints()[k].pt, Some(k), point.clone())) {
                    state.add_point(point.clone());
                }
            }
        }
        system.add_keyframe(&frame, true);
    }

    let started = Instant::now();
    let mut keyframes = 2;
    for i in 7..NUM_FRAMES {
        let pose = pose_at(i);
        let (keypoints, _) = render(&camera, &pose, &world, &mut rng);
        let frame = Arc::new(Frame::new(i as u64 * 33_000_000, camera.clone(), pose, keypoints));

        let visible = frame.keypoints().len();
        if !system.is_backlogged() && system.need_keyframe(&frame, visible) {
            system.add_keyframe(&frame, true);
            keyframes += 1;
        } else {
            system.add_frame(frame);
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    while system.queue_len() > 0 && started.elapsed() < Duration::from_secs(30) {
        std::thread::sleep(Duration::from_millis(20));
    }
    system.stop();

    info!(
        "Processed {} frames ({} keyframes inserted) in {:.2}s",
        NUM_FRAMES,
        keyframes,
        started.elapsed().as_secs_f64()
    );
    println!("{}", serde_json::to_string_pretty(&system.stats())?);
    Ok(())
}
