//! Fire-time computation for scheduled and periodic messages.
//!
//! A message may combine a one-shot delay, a cron expression and a bounded
//! repeat. The delay applies once, before anything else. After that the cron
//! drives the schedule; between two cron fires, up to `repeat` extra
//! occurrences are spaced `repeat_period_ms` apart, as long as each one lands
//! before the next cron fire. Every cron fire resets the repeat counter.
//! Without a cron, the repeat alone yields `repeat` occurrences.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use super::{MessageError, MessageState, ScheduleParams};

pub fn parse_cron(expr: &str) -> Result<Schedule, MessageError> {
    Schedule::from_str(expr).map_err(|e| MessageError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// First cron fire strictly after `now` (epoch ms), in UTC.
pub fn next_cron_fire(schedule: &Schedule, now: i64) -> Option<i64> {
    let from: DateTime<Utc> = DateTime::from_timestamp_millis(now)?;
    schedule.after(&from).next().map(|at| at.timestamp_millis())
}

fn next_repeat(params: &ScheduleParams, state: &mut MessageState, now: i64) -> Option<i64> {
    if params.repeat == 0 || state.scheduled_repeat_count >= params.repeat {
        return None;
    }
    state.scheduled_repeat_count += 1;
    Some(now.saturating_add(params.repeat_period_ms as i64))
}

/// Next fire time after `now`, or `None` once the schedule is exhausted.
///
/// Advances the schedule progress recorded in `state`.
pub fn next_occurrence(
    params: &ScheduleParams,
    state: &mut MessageState,
    now: i64,
) -> Result<Option<i64>, MessageError> {
    if let Some(delay) = params.delay_ms.filter(|d| *d > 0) {
        if !state.scheduled_delay_applied {
            state.scheduled_delay_applied = true;
            return Ok(Some(now.saturating_add(delay as i64)));
        }
    }

    let Some(expr) = &params.cron else {
        return Ok(next_repeat(params, state, now));
    };

    let cron_at = next_cron_fire(&parse_cron(expr)?, now);
    if state.scheduled_cron_fired {
        let mut candidate = state.clone();
        if let Some(repeat_at) = next_repeat(params, &mut candidate, now) {
            if cron_at.map_or(true, |c| repeat_at < c) {
                *state = candidate;
                return Ok(Some(repeat_at));
            }
        }
    }

    state.scheduled_cron_fired = true;
    state.scheduled_repeat_count = 0;
    Ok(cron_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-01T00:00:00Z
    const T0: i64 = 1_704_067_200_000;
    const TEN_MINUTES: i64 = 600_000;

    fn params() -> ScheduleParams {
        ScheduleParams::default()
    }

    #[test]
    fn test_delay_applies_once() {
        let params = ScheduleParams {
            delay_ms: Some(5_000),
            ..params()
        };
        let mut state = MessageState::default();

        assert_eq!(next_occurrence(&params, &mut state, T0).unwrap(), Some(T0 + 5_000));
        assert!(state.scheduled_delay_applied);
        assert_eq!(next_occurrence(&params, &mut state, T0 + 5_000).unwrap(), None);
    }

    #[test]
    fn test_repeat_only_is_bounded() {
        let params = ScheduleParams {
            repeat: 3,
            repeat_period_ms: 1_000,
            ..params()
        };
        let mut state = MessageState::default();

        let mut fires = Vec::new();
        let mut now = T0;
        while let Some(at) = next_occurrence(&params, &mut state, now).unwrap() {
            fires.push(at);
            now = at;
        }
        assert_eq!(fires, vec![T0 + 1_000, T0 + 2_000, T0 + 3_000]);
    }

    #[test]
    fn test_cron_only() {
        let params = ScheduleParams {
            cron: Some("0 */10 * * * *".to_string()),
            ..params()
        };
        let mut state = MessageState::default();

        assert_eq!(
            next_occurrence(&params, &mut state, T0).unwrap(),
            Some(T0 + TEN_MINUTES)
        );
        assert!(state.scheduled_cron_fired);
        assert_eq!(
            next_occurrence(&params, &mut state, T0 + TEN_MINUTES).unwrap(),
            Some(T0 + 2 * TEN_MINUTES)
        );
    }

    #[test]
    fn test_cron_with_repeat_bursts_between_fires() {
        let params = ScheduleParams {
            cron: Some("0 */10 * * * *".to_string()),
            repeat: 2,
            repeat_period_ms: 60_000,
            ..params()
        };
        let mut state = MessageState::default();

        // The first occurrence always waits for the cron.
        let first = next_occurrence(&params, &mut state, T0).unwrap();
        assert_eq!(first, Some(T0 + TEN_MINUTES));

        // Then two repeats, then the next cron fire resets the counter.
        let base = T0 + TEN_MINUTES;
        assert_eq!(next_occurrence(&params, &mut state, base).unwrap(), Some(base + 60_000));
        assert_eq!(
            next_occurrence(&params, &mut state, base + 60_000).unwrap(),
            Some(base + 120_000)
        );
        assert_eq!(state.scheduled_repeat_count, 2);
        assert_eq!(
            next_occurrence(&params, &mut state, base + 120_000).unwrap(),
            Some(T0 + 2 * TEN_MINUTES)
        );
        assert_eq!(state.scheduled_repeat_count, 0);
    }

    #[test]
    fn test_repeat_never_overtakes_cron() {
        // A period longer than the cron interval never gets a turn.
        let params = ScheduleParams {
            cron: Some("0 */10 * * * *".to_string()),
            repeat: 5,
            repeat_period_ms: 2 * TEN_MINUTES as u64,
            ..params()
        };
        let mut state = MessageState::default();

        let mut now = T0;
        for i in 1..=3 {
            let at = next_occurrence(&params, &mut state, now).unwrap().unwrap();
            assert_eq!(at, T0 + i * TEN_MINUTES);
            assert_eq!(state.scheduled_repeat_count, 0);
            now = at;
        }
    }

    #[test]
    fn test_delay_then_cron() {
        let params = ScheduleParams {
            delay_ms: Some(1_000),
            cron: Some("0 */10 * * * *".to_string()),
            ..params()
        };
        let mut state = MessageState::default();

        assert_eq!(next_occurrence(&params, &mut state, T0).unwrap(), Some(T0 + 1_000));
        assert_eq!(
            next_occurrence(&params, &mut state, T0 + 1_000).unwrap(),
            Some(T0 + TEN_MINUTES)
        );
    }

    #[test]
    fn test_invalid_cron() {
        assert!(parse_cron("every tuesday").is_err());
        assert!(parse_cron("0 0 12 * * *").is_ok());
    }
}
