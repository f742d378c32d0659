//! Translation of candidate selections into primitive simulator moves.
use super::RolloutError;
use crate::envs::{Candidate, Simulator, VIEWS_PER_LEVEL};
use crate::results::PathPoint;

/// A primitive simulator action.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Primitive {
    Left,
    Right,
    Up,
    Down,
    /// Move to the navigable location with this index.
    Forward(usize),
}

impl Primitive {
    /// Arguments of [`Simulator::make_action`]: `(index, heading, elevation)`.
    pub const fn arguments(self) -> (usize, f64, f64) {
        match self {
            Self::Left => (0, -1.0, 0.0),
            Self::Right => (0, 1.0, 0.0),
            Self::Up => (0, 0.0, 1.0),
            Self::Down => (0, 0.0, -1.0),
            Self::Forward(index) => (index, 0.0, 0.0),
        }
    }
}

fn take<S: Simulator + ?Sized>(sim: &mut S, slot: usize, primitive: Primitive) -> PathPoint {
    let (index, heading, elevation) = primitive.arguments();
    sim.make_action(slot, index, heading, elevation);
    let state = sim.state(slot);
    PathPoint {
        viewpoint: state.viewpoint,
        heading: state.heading,
        elevation: state.elevation,
    }
}

/// Move a simulator slot to a candidate viewpoint.
///
/// Looks up or down to the candidate's elevation level, turns right until facing its view
/// index, then moves forward.
///
/// # Returns
/// The state after every primitive move, in order.
pub fn move_to_candidate<S: Simulator + ?Sized>(
    sim: &mut S,
    slot: usize,
    candidate: &Candidate,
) -> Result<Vec<PathPoint>, RolloutError> {
    let mut visited = Vec::new();
    let target_level = candidate.point_id / VIEWS_PER_LEVEL;
    let mut level = sim.state(slot).view_index / VIEWS_PER_LEVEL;
    while level < target_level {
        visited.push(take(sim, slot, Primitive::Up));
        level += 1;
    }
    while level > target_level {
        visited.push(take(sim, slot, Primitive::Down));
        level -= 1;
    }

    let mut turns = 0;
    while sim.state(slot).view_index != candidate.point_id {
        if turns == VIEWS_PER_LEVEL {
            return Err(RolloutError::TurnLimit {
                slot,
                point_id: candidate.point_id,
            });
        }
        visited.push(take(sim, slot, Primitive::Right));
        turns += 1;
    }

    let state = sim.state(slot);
    let reachable = state.navigable_locations.get(candidate.location_index);
    if reachable != Some(&candidate.viewpoint_id) {
        return Err(RolloutError::StateDivergence {
            slot,
            expected: candidate.viewpoint_id.clone(),
            actual: reachable.cloned().unwrap_or_default(),
        });
    }
    let arrived = take(sim, slot, Primitive::Forward(candidate.location_index));
    if arrived.viewpoint != candidate.viewpoint_id {
        return Err(RolloutError::StateDivergence {
            slot,
            expected: candidate.viewpoint_id.clone(),
            actual: arrived.viewpoint,
        });
    }
    visited.push(arrived);
    Ok(visited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envs::{ToyConfig, ToyWorld};

    #[test]
    fn every_candidate_is_reachable() {
        let mut world = ToyWorld::new(ToyConfig::default());
        let obs = world.observations();
        for candidate in &obs[0].candidate {
            let start = world.state(0);
            let visited = move_to_candidate(&mut world, 0, candidate).unwrap();
            assert_eq!(visited.last().unwrap().viewpoint, candidate.viewpoint_id);
            world.new_episode(0, &start.scan, &start.viewpoint, start.heading, start.elevation);
        }
    }

    #[test]
    fn unreachable_view_index_hits_turn_limit() {
        let mut world = ToyWorld::new(ToyConfig::default());
        let mut candidate = world.observations()[0].candidate[0].clone();
        // Outside the panorama, so no number of turns faces it
        candidate.point_id = 40;
        let result = move_to_candidate(&mut world, 0, &candidate);
        assert!(matches!(result, Err(RolloutError::TurnLimit { slot: 0, .. })));
    }

    #[test]
    fn mismatched_location_is_divergence() {
        let mut world = ToyWorld::new(ToyConfig::default());
        let mut candidate = world.observations()[0].candidate[0].clone();
        candidate.viewpoint_id = "elsewhere".into();
        let result = move_to_candidate(&mut world, 0, &candidate);
        assert!(matches!(result, Err(RolloutError::StateDivergence { .. })));
    }
}
