//! Map persistence.
//!
//! A map is one JSON document with top-level keys `cameras`, `orb_params`,
//! `keyframes` and `landmarks`. Loading runs in four passes: register
//! keyframes, register landmarks, rebuild the essential graph (spanning tree
//! + loop edges), rebuild the keyframe↔landmark associations. Invariant
//! violations surface as [`Error::MapCorruption`].

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::{Matrix4, Vector3};
use serde_json::{json, Map as JsonMap, Value};

use crate::bow::Vocabulary;
use crate::camera::Camera;
use crate::error::{Error, Result};
use crate::feature::{Descriptor, Features, KeyPoint, OrbParams};
use crate::geometry::SE3;

use super::database::MapDatabase;
use super::frame::Frame;
use super::keyframe::Keyframe;
use super::landmark::Landmark;
use super::types::{KeyframeId, LandmarkId};

/// Serialize the whole map.
pub fn to_json(db: &MapDatabase) -> Value {
    let mut cameras = JsonMap::new();
    let mut orb_params = Value::Null;
    let mut keyframes = JsonMap::new();
    let mut landmarks = JsonMap::new();

    for kf_id in db.keyframe_ids() {
        let kf = db.keyframe(kf_id).expect("listed id");
        if !cameras.contains_key(&kf.camera.name) {
            cameras.insert(
                kf.camera.name.clone(),
                serde_json::to_value(kf.camera.as_ref()).expect("camera serializes"),
            );
        }
        if orb_params.is_null() {
            orb_params = serde_json::to_value(kf.orb_params.as_ref()).expect("orb params serialize");
        }
        keyframes.insert(kf_id.0.to_string(), keyframe_to_json(kf));
    }

    for lm_id in db.landmark_ids() {
        let lm = db.landmark(lm_id).expect("listed id");
        landmarks.insert(lm_id.0.to_string(), landmark_to_json(lm));
    }

    json!({
        "cameras": Value::Object(cameras),
        "orb_params": orb_params,
        "keyframes": Value::Object(keyframes),
        "landmarks": Value::Object(landmarks),
    })
}

fn keyframe_to_json(kf: &Keyframe) -> Value {
    let pose: Vec<f64> = {
        let m = kf.pose_cw().to_matrix();
        // Row-major 16 values.
        (0..4)
            .flat_map(|r| (0..4).map(move |c| (r, c)))
            .map(|(r, c)| m[(r, c)])
            .collect()
    };
    let keypts: Vec<Value> = kf
        .keypoints
        .iter()
        .map(|kp| {
            json!({
                "x": kp.x,
                "y": kp.y,
                "octave": kp.octave,
                "angle": kp.angle,
                "size": kp.size,
                "response": kp.response,
            })
        })
        .collect();
    let descs: Vec<Value> = kf
        .descriptors
        .iter()
        .map(|d| Value::Array(d.0.iter().map(|&b| json!(b)).collect()))
        .collect();
    let x_rights: Vec<Value> = kf
        .stereo_x_right
        .iter()
        .map(|x| x.map(|v| json!(v)).unwrap_or(json!(-1.0)))
        .collect();
    let depths: Vec<Value> = kf
        .depths
        .iter()
        .map(|d| d.map(|v| json!(v)).unwrap_or(json!(-1.0)))
        .collect();
    let lm_ids: Vec<Value> = kf
        .landmarks
        .iter()
        .map(|lm| lm.map(|id| json!(id.0 as i64)).unwrap_or(json!(-1)))
        .collect();
    let mut loop_edges: Vec<u64> = kf.loop_edges.iter().map(|id| id.0).collect();
    loop_edges.sort_unstable();
    // Covisibility edges are redundant with the associations (they are
    // recomputed on load) but are carried for external consumers.
    let mut covisibilities: Vec<(u64, u32)> = kf
        .connections()
        .iter()
        .map(|(id, &w)| (id.0, w))
        .collect();
    covisibilities.sort_unstable();
    let covisibilities: Vec<Value> =
        covisibilities.into_iter().map(|(id, w)| json!([id, w])).collect();

    json!({
        "src_frm_id": kf.src_frame_id,
        "ts": kf.timestamp,
        "cam": kf.camera.name,
        "pose_cw": pose,
        "n_keypts": kf.keypoints.len(),
        "keypts": keypts,
        "descs": descs,
        "x_rights": x_rights,
        "depths": depths,
        "span_parent": kf.parent.map(|p| p.0 as i64).unwrap_or(-1),
        "loop_edges": loop_edges,
        "covisibilities": covisibilities,
        "lm_ids": lm_ids,
    })
}

fn landmark_to_json(lm: &Landmark) -> Value {
    let obs: JsonMap<String, Value> = lm
        .observations
        .iter()
        .map(|(kf, &idx)| (kf.0.to_string(), json!(idx)))
        .collect();
    json!({
        "pos_w": [lm.position.x, lm.position.y, lm.position.z],
        "ref_keyfrm": lm.ref_keyframe.0,
        "1st_keyfrm": lm.first_keyframe.0,
        "n_vis": lm.num_observable,
        "n_fnd": lm.num_observed,
        "obs": Value::Object(obs),
    })
}

/// Load a map. The vocabulary recomputes BoW vectors for the loaded
/// keyframes so the inverted index can be rebuilt by the caller.
pub fn from_json(doc: &Value, vocabulary: &Vocabulary) -> Result<MapDatabase> {
    let cameras = parse_cameras(doc)?;
    let orb_params: Arc<OrbParams> = Arc::new(
        serde_json::from_value(
            doc.get("orb_params")
                .cloned()
                .ok_or_else(|| corrupt("missing orb_params"))?,
        )
        .map_err(|e| corrupt(&format!("bad orb_params: {e}")))?,
    );

    let keyframes_obj = doc
        .get("keyframes")
        .and_then(Value::as_object)
        .ok_or_else(|| corrupt("missing keyframes object"))?;
    let landmarks_obj = doc
        .get("landmarks")
        .and_then(Value::as_object)
        .ok_or_else(|| corrupt("missing landmarks object"))?;

    let mut db = MapDatabase::new();

    // Pass 1: register keyframes (ascending id so the origin is the lowest).
    let mut kf_ids: Vec<u64> = keyframes_obj
        .keys()
        .map(|k| k.parse::<u64>().map_err(|_| corrupt("non-numeric keyframe id")))
        .collect::<Result<_>>()?;
    kf_ids.sort_unstable();
    for id in &kf_ids {
        let entry = &keyframes_obj[&id.to_string()];
        let kf = register_keyframe(KeyframeId(*id), entry, &cameras, &orb_params, vocabulary)?;
        db.add_keyframe(kf);
    }

    // Pass 2: register landmarks.
    let mut lm_ids: Vec<u64> = landmarks_obj
        .keys()
        .map(|k| k.parse::<u64>().map_err(|_| corrupt("non-numeric landmark id")))
        .collect::<Result<_>>()?;
    lm_ids.sort_unstable();
    for id in &lm_ids {
        let entry = &landmarks_obj[&id.to_string()];
        db.add_landmark(register_landmark(LandmarkId(*id), entry)?);
    }

    // Pass 3: essential graph.
    for id in &kf_ids {
        let entry = &keyframes_obj[&id.to_string()];
        let parent = entry
            .get("span_parent")
            .and_then(Value::as_i64)
            .ok_or_else(|| corrupt("keyframe missing span_parent"))?;
        if parent >= 0 {
            let parent_id = KeyframeId(parent as u64);
            if db.keyframe(parent_id).is_none() {
                return Err(corrupt(&format!("KF{id} has unknown parent {parent}")));
            }
            db.set_spanning_tree_parent(KeyframeId(*id), parent_id);
        }
        if let Some(edges) = entry.get("loop_edges").and_then(Value::as_array) {
            for edge in edges {
                let partner = edge.as_u64().ok_or_else(|| corrupt("bad loop edge"))?;
                if db.keyframe(KeyframeId(partner)).is_none() {
                    return Err(corrupt(&format!("KF{id} has unknown loop edge {partner}")));
                }
                if let Some(kf) = db.keyframe_mut(KeyframeId(*id)) {
                    kf.add_loop_edge(KeyframeId(partner));
                }
            }
        }
    }

    // Pass 4: associations, then derived state.
    for id in &kf_ids {
        let entry = &keyframes_obj[&id.to_string()];
        let lm_refs = entry
            .get("lm_ids")
            .and_then(Value::as_array)
            .ok_or_else(|| corrupt("keyframe missing lm_ids"))?;
        for (keypoint_idx, lm_ref) in lm_refs.iter().enumerate() {
            let lm = lm_ref.as_i64().ok_or_else(|| corrupt("bad lm id"))?;
            if lm < 0 {
                continue;
            }
            let lm_id = LandmarkId(lm as u64);
            if !db.associate(KeyframeId(*id), keypoint_idx, lm_id) {
                return Err(corrupt(&format!(
                    "KF{id} keypoint {keypoint_idx} references unknown LM{lm}"
                )));
            }
        }
    }

    validate_invariants(&db, landmarks_obj)?;

    for id in &kf_ids {
        db.update_connections(KeyframeId(*id));
    }
    for id in &lm_ids {
        db.update_landmark_geometry(LandmarkId(*id));
    }

    Ok(db)
}

fn parse_cameras(doc: &Value) -> Result<HashMap<String, Arc<Camera>>> {
    let obj = doc
        .get("cameras")
        .and_then(Value::as_object)
        .ok_or_else(|| corrupt("missing cameras object"))?;
    let mut out = HashMap::new();
    for (name, value) in obj {
        let camera: Camera = serde_json::from_value(value.clone())
            .map_err(|e| corrupt(&format!("bad camera {name}: {e}")))?;
        out.insert(name.clone(), Arc::new(camera));
    }
    Ok(out)
}

fn register_keyframe(
    id: KeyframeId,
    entry: &Value,
    cameras: &HashMap<String, Arc<Camera>>,
    orb_params: &Arc<OrbParams>,
    vocabulary: &Vocabulary,
) -> Result<Keyframe> {
    let cam_name = entry
        .get("cam")
        .and_then(Value::as_str)
        .ok_or_else(|| corrupt("keyframe missing camera name"))?;
    let camera = cameras
        .get(cam_name)
        .ok_or_else(|| corrupt(&format!("{id} references unknown camera {cam_name}")))?;

    let pose_values = entry
        .get("pose_cw")
        .and_then(Value::as_array)
        .ok_or_else(|| corrupt("keyframe missing pose"))?;
    if pose_values.len() != 16 {
        return Err(corrupt(&format!("{id} pose has {} values", pose_values.len())));
    }
    let mut m = Matrix4::zeros();
    for (i, v) in pose_values.iter().enumerate() {
        m[(i / 4, i % 4)] = v.as_f64().ok_or_else(|| corrupt("non-numeric pose entry"))?;
    }
    let pose_cw = SE3::from_matrix(&m)
        .ok_or_else(|| corrupt(&format!("{id} pose is not a rigid transform")))?;

    let keypts = entry
        .get("keypts")
        .and_then(Value::as_array)
        .ok_or_else(|| corrupt("keyframe missing keypoints"))?;
    let descs = entry
        .get("descs")
        .and_then(Value::as_array)
        .ok_or_else(|| corrupt("keyframe missing descriptors"))?;
    if keypts.len() != descs.len() {
        return Err(corrupt(&format!("{id} keypoint/descriptor count mismatch")));
    }

    let mut features = Features::default();
    for kp in keypts {
        features.keypoints.push(KeyPoint {
            x: field_f64(kp, "x")?,
            y: field_f64(kp, "y")?,
            octave: field_f64(kp, "octave")? as u32,
            angle: field_f64(kp, "angle")?,
            size: field_f64(kp, "size")?,
            response: field_f64(kp, "response")?,
        });
    }
    for desc in descs {
        let bytes = desc.as_array().ok_or_else(|| corrupt("bad descriptor"))?;
        if bytes.len() != 32 {
            return Err(corrupt("descriptor must have 32 bytes"));
        }
        let mut d = Descriptor::ZERO;
        for (i, b) in bytes.iter().enumerate() {
            d.0[i] = b.as_u64().ok_or_else(|| corrupt("bad descriptor byte"))? as u8;
        }
        features.descriptors.push(d);
    }

    let src_frame_id = entry.get("src_frm_id").and_then(Value::as_u64).unwrap_or(0);
    let timestamp = entry.get("ts").and_then(Value::as_f64).unwrap_or(0.0);

    let mut frame = Frame::new(
        src_frame_id,
        timestamp,
        Arc::clone(camera),
        Arc::clone(orb_params),
        features,
    );
    frame.set_pose(pose_cw);
    frame.set_stereo_data(
        optional_f64_list(entry, "x_rights", frame.num_keypoints())?,
        optional_f64_list(entry, "depths", frame.num_keypoints())?,
    );
    frame.compute_bow(vocabulary);

    Ok(Keyframe::from_frame(id, &frame))
}

fn register_landmark(id: LandmarkId, entry: &Value) -> Result<Landmark> {
    let pos = entry
        .get("pos_w")
        .and_then(Value::as_array)
        .ok_or_else(|| corrupt("landmark missing position"))?;
    if pos.len() != 3 {
        return Err(corrupt("landmark position must have 3 values"));
    }
    let position = Vector3::new(
        pos[0].as_f64().ok_or_else(|| corrupt("bad position"))?,
        pos[1].as_f64().ok_or_else(|| corrupt("bad position"))?,
        pos[2].as_f64().ok_or_else(|| corrupt("bad position"))?,
    );
    let ref_kf = entry
        .get("ref_keyfrm")
        .and_then(Value::as_u64)
        .ok_or_else(|| corrupt("landmark missing ref keyframe"))?;
    let first_kf = entry.get("1st_keyfrm").and_then(Value::as_u64).unwrap_or(ref_kf);

    let mut lm = Landmark::new(id, position, Descriptor::ZERO, KeyframeId(ref_kf));
    lm.first_keyframe = KeyframeId(first_kf);
    lm.num_observable = entry.get("n_vis").and_then(Value::as_u64).unwrap_or(1) as u32;
    lm.num_observed = entry.get("n_fnd").and_then(Value::as_u64).unwrap_or(1) as u32;
    Ok(lm)
}

/// Check the structural invariants a loaded document must satisfy.
fn validate_invariants(db: &MapDatabase, landmarks_obj: &JsonMap<String, Value>) -> Result<()> {
    // The declared observation maps must agree with the rebuilt
    // associations.
    for (lm_key, entry) in landmarks_obj {
        let lm_id = LandmarkId(lm_key.parse::<u64>().expect("validated earlier"));
        let lm = db
            .landmark(lm_id)
            .ok_or_else(|| corrupt(&format!("landmark {lm_key} disappeared during load")))?;
        if let Some(obs) = entry.get("obs").and_then(Value::as_object) {
            for (kf_key, idx) in obs {
                let kf_id = KeyframeId(
                    kf_key
                        .parse::<u64>()
                        .map_err(|_| corrupt("non-numeric keyframe id in observations"))?,
                );
                let idx = idx.as_u64().ok_or_else(|| corrupt("bad observation index"))? as usize;
                if lm.keypoint_index_in(kf_id) != Some(idx) {
                    return Err(corrupt(&format!(
                        "{lm_id} declares observation ({kf_id}, {idx}) absent from keyframe associations"
                    )));
                }
            }
        }
        // Reference keyframe must exist.
        if db.keyframe(lm.ref_keyframe).is_none() {
            return Err(corrupt(&format!("{lm_id} references missing {}", lm.ref_keyframe)));
        }
    }

    // The spanning tree must be a single tree rooted at the origin.
    let origin = db.origin_keyframe();
    for kf in db.keyframes() {
        let mut cursor = kf.id;
        let mut steps = 0usize;
        loop {
            let node = db
                .keyframe(cursor)
                .ok_or_else(|| corrupt("spanning tree references missing keyframe"))?;
            match node.parent {
                None => {
                    if Some(cursor) != origin {
                        return Err(corrupt(&format!(
                            "{} is a second spanning-tree root",
                            cursor
                        )));
                    }
                    break;
                }
                Some(parent) => {
                    cursor = parent;
                    steps += 1;
                    if steps > db.num_keyframes() {
                        return Err(corrupt("spanning tree contains a cycle"));
                    }
                }
            }
        }
    }
    Ok(())
}

fn field_f64(value: &Value, key: &str) -> Result<f64> {
    value
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| corrupt(&format!("missing numeric field {key}")))
}

fn optional_f64_list(entry: &Value, key: &str, n: usize) -> Result<Vec<Option<f64>>> {
    match entry.get(key).and_then(Value::as_array) {
        None => Ok(vec![None; n]),
        Some(values) => {
            if values.len() != n {
                return Err(corrupt(&format!("{key} length mismatch")));
            }
            values
                .iter()
                .map(|v| {
                    let v = v.as_f64().ok_or_else(|| corrupt(&format!("bad {key} entry")))?;
                    Ok(if v < 0.0 { None } else { Some(v) })
                })
                .collect()
        }
    }
}

fn corrupt(msg: &str) -> Error {
    Error::MapCorruption(msg.to_string())
}
