//! Global bundle adjustment.
//!
//! The same engine as local BA over every non-bad keyframe and landmark,
//! with only the origin keyframe held fixed. Cancellable through the abort
//! flag; used by the loop closer as an asynchronous refinement after
//! pose-graph optimization.

use crate::map::{KeyframeId, MapDatabase};

use super::local_ba::{collect_ba, solve_ba, BaProblem, BaResult};

/// PHASE 1: collect every keyframe as variable (the origin stays fixed
/// inside the shared collector).
pub fn collect_global_ba(map: &MapDatabase) -> Option<BaProblem> {
    let all: Vec<KeyframeId> = map.keyframe_ids();
    if all.len() < 2 {
        return None;
    }
    collect_ba(map, &all)
}

/// PHASE 2: solve, polling `should_abort` at every outer iteration.
pub fn solve_global_ba(problem: &BaProblem, should_abort: &dyn Fn() -> bool) -> Option<BaResult> {
    solve_ba(problem, should_abort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::database::test_support::{insert_keyframe, insert_landmark};
    use nalgebra::Vector3;

    #[test]
    fn test_collect_global_includes_all_keyframes() {
        let mut map = MapDatabase::new();
        let kf1 = insert_keyframe(&mut map, 20);
        let kf2 = insert_keyframe(&mut map, 20);
        let kf3 = insert_keyframe(&mut map, 20);
        for i in 0..10 {
            insert_landmark(
                &mut map,
                Vector3::new(0.1 * i as f64, 0.0, 3.0),
                &[(kf1, i), (kf2, i), (kf3, i)],
            );
        }
        let problem = collect_global_ba(&map).unwrap();
        assert_eq!(problem.keyframes.len(), 3);
        assert_eq!(problem.landmarks.len(), 10);
        // Exactly the origin is fixed.
        let fixed: Vec<_> = problem.keyframes.iter().filter(|kf| kf.fixed).collect();
        assert_eq!(fixed.len(), 1);
        assert_eq!(fixed[0].id, map.origin_keyframe().unwrap());
    }

    #[test]
    fn test_collect_global_needs_two_keyframes() {
        let mut map = MapDatabase::new();
        let kf1 = insert_keyframe(&mut map, 20);
        insert_landmark(&mut map, Vector3::new(0.0, 0.0, 3.0), &[(kf1, 0)]);
        assert!(collect_global_ba(&map).is_none());
    }
}
