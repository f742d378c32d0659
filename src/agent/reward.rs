//! Reward shaping and returns.

/// Reward for stopping within the success radius.
pub const SUCCESS_REWARD: f64 = 2.0;
/// Reward for stopping outside the success radius.
pub const FAILURE_REWARD: f64 = -2.0;

/// Shaped reward of one step of an agent that had not yet ended.
///
/// Stopping earns [`SUCCESS_REWARD`] when `distance < success_radius` and
/// [`FAILURE_REWARD`] otherwise. A move earns the sign of the progress towards the goal.
///
/// Returns `None` for a move that leaves the distance to the goal unchanged.
pub fn step_reward(stopped: bool, last_distance: f64, distance: f64, success_radius: f64) -> Option<f64> {
    if stopped {
        return Some(if distance < success_radius {
            SUCCESS_REWARD
        } else {
            FAILURE_REWARD
        });
    }
    let progress = last_distance - distance;
    if progress > 0.0 {
        Some(1.0)
    } else if progress < 0.0 {
        Some(-1.0)
    } else {
        None
    }
}

/// Discounted returns of every step, bootstrapped from the value of the final state.
///
/// # Args
/// * `rewards` - Per-step rewards. `rewards[t][i]` is the reward of agent `i` at step `t`.
/// * `bootstrap` - Value estimate of each agent's state after the last step;
///     zero for agents that ended.
/// * `gamma` - Discount factor.
pub fn discounted_returns(rewards: &[Vec<f64>], bootstrap: &[f64], gamma: f64) -> Vec<Vec<f64>> {
    let mut running = bootstrap.to_vec();
    let mut returns = vec![Vec::new(); rewards.len()];
    for (t, step_rewards) in rewards.iter().enumerate().rev() {
        for (acc, reward) in running.iter_mut().zip(step_rewards) {
            *acc = *acc * gamma + reward;
        }
        returns[t] = running.clone();
    }
    returns
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(true, 5.0, 2.0, Some(SUCCESS_REWARD))]
    #[case(true, 5.0, 3.0, Some(FAILURE_REWARD))]
    #[case(false, 5.0, 2.5, Some(1.0))]
    #[case(false, 2.5, 5.0, Some(-1.0))]
    #[case(false, 2.5, 2.5, None)]
    fn shaped_rewards(
        #[case] stopped: bool,
        #[case] last: f64,
        #[case] distance: f64,
        #[case] expected: Option<f64>,
    ) {
        assert_eq!(step_reward(stopped, last, distance, 3.0), expected);
    }

    #[test]
    fn stop_ignores_progress() {
        assert_eq!(step_reward(true, 1.0, 1.0, 3.0), Some(SUCCESS_REWARD));
    }

    #[test]
    fn returns_are_discounted_from_bootstrap() {
        let rewards = vec![vec![1.0, 0.0], vec![2.0, 0.0]];
        let returns = discounted_returns(&rewards, &[10.0, 0.0], 0.5);
        assert_eq!(returns[1], vec![7.0, 0.0]);
        assert_eq!(returns[0], vec![4.5, 0.0]);
    }
}
