//! Timer: wait a fixed delay, or until a date read from the variables.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use pipewright_sla::{WorkType, parse_duration, skip_non_working_days};
use pipewright_types::{BlockKind, DEFAULT_SOCKET, ErrorKind, HumanStatus, UpdateAction};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::common::unexpected_action;
use super::{Block, Progress};
use crate::context::BlockCtx;
use crate::registry::BlockModel;
use crate::{EngineError, Result};

/// Hour of day (UTC) a date-driven timer fires at.
const DATE_TIMER_HOUR: u32 = 5;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimerParams {
    /// Fixed delay such as `"1d2h"`; wins over `date_path`.
    pub duration: String,
    /// Variable holding a `dd.mm.yyyy` date.
    pub date_path: String,
    /// Number of `coef`-day hops after the date, as `"<n>d"`.
    pub delay: String,
    pub coef: i64,
    /// Non-zero moves the date off non-working days in steps of this many days.
    #[serde(rename = "workDay", alias = "work_day")]
    pub work_day: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerState {
    pub duration_ms: i64,
    pub started: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub expired: bool,
}

impl TimerState {
    pub fn duration(&self) -> Duration {
        Duration::milliseconds(self.duration_ms)
    }

    pub fn fires_at(&self) -> Option<DateTime<Utc>> {
        self.started_at.map(|t| t + self.duration())
    }
}

/// Work out how long the timer waits when entered at `now`.
pub fn timer_duration(params: &TimerParams, ctx: &BlockCtx<'_>) -> Result<Duration> {
    if !params.duration.trim().is_empty() {
        let duration =
            parse_duration(&params.duration).map_err(|e| EngineError::block(e.to_string()))?;
        if duration <= Duration::zero() {
            return Err(EngineError::block("delay time is not set for the timer"));
        }
        return Ok(duration);
    }

    let min = Duration::milliseconds(1);
    let Some(date) = ctx
        .vars
        .get(&params.date_path)
        .and_then(Value::as_str)
        .and_then(|raw| raw.split_whitespace().next())
        .and_then(|day| NaiveDate::parse_from_str(day, "%d.%m.%Y").ok())
        .and_then(|d| d.and_hms_opt(DATE_TIMER_HOUR, 0, 0))
    else {
        return Ok(min);
    };
    let mut target = Utc.from_utc_datetime(&date);

    let calendar = ctx.services.sla.calendar();
    let weekends = WorkType::EightFive.weekends();
    let use_calendar = params.work_day != 0;
    if use_calendar {
        target = skip_non_working_days(target, &calendar, weekends, params.work_day);
    }

    let hops: i64 = match params.delay.trim() {
        "" => 0,
        raw => raw
            .trim_end_matches('d')
            .parse()
            .map_err(|_| EngineError::block(format!("wrong format of delay days: {raw}")))?,
    };
    for _ in 0..hops.max(0) {
        target += Duration::days(params.coef);
        if use_calendar {
            target = skip_non_working_days(target, &calendar, weekends, params.coef);
        }
    }

    let year = Duration::days(365);
    Ok((target - ctx.now).clamp(min, year))
}

pub struct Timer;

impl Block for Timer {
    const KIND: BlockKind = BlockKind::Timer;

    type Params = TimerParams;
    type State = TimerState;

    fn validate(params: &TimerParams) -> std::result::Result<(), String> {
        if !params.duration.trim().is_empty() {
            parse_duration(&params.duration).map_err(|e| e.to_string())?;
        } else if params.date_path.is_empty() {
            return Err("timer needs a duration or a date_path".into());
        }
        Ok(())
    }

    fn create_state(params: &TimerParams, ctx: &mut BlockCtx<'_>) -> Result<TimerState> {
        let duration = timer_duration(params, ctx)?;
        Ok(TimerState {
            duration_ms: duration.num_milliseconds(),
            ..TimerState::default()
        })
    }

    fn update(_params: &TimerParams, state: &mut TimerState, ctx: &mut BlockCtx<'_>) -> Result<Progress> {
        match ctx.action() {
            Some(UpdateAction::Reload) => {}
            None | Some(UpdateAction::FinishTimer) if state.expired => {
                return Err(EngineError::block("timer has already expired"));
            }
            None if !state.started => {
                state.started = true;
                state.started_at = Some(ctx.now);
                ctx.event("timer_started", json!({"duration_ms": state.duration_ms}));
            }
            None => {}
            Some(UpdateAction::FinishTimer) => {
                if !ctx.by_login().is_empty() {
                    return Err(EngineError::rejected(
                        ErrorKind::Validation,
                        "finish_timer is issued by the scheduler",
                    ));
                }
                state.expired = true;
            }
            other => return Err(unexpected_action(other, "timer")),
        }
        if state.expired {
            return Ok(Progress::finished(DEFAULT_SOCKET).human(HumanStatus::Done));
        }
        Ok(Progress::idle().human(HumanStatus::Execution))
    }

    fn outputs(_state: &TimerState) -> Map<String, Value> {
        Map::new()
    }

    fn apply_outputs(_state: &mut TimerState, _outputs: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    fn deadlines(
        _params: &TimerParams,
        state: &TimerState,
        _ctx: &BlockCtx<'_>,
    ) -> Vec<(UpdateAction, DateTime<Utc>)> {
        match state.fires_at() {
            Some(at) if !state.expired => vec![(UpdateAction::FinishTimer, at)],
            _ => Vec::new(),
        }
    }

    fn model() -> BlockModel {
        BlockModel::new(BlockKind::Timer, "Timer")
            .params(json!({"delay": "0d", "date_path": "", "coef": 0, "workDay": 0, "duration": "0h"}))
            .sockets(&[DEFAULT_SOCKET])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::testing::Harness;
    use pipewright_types::{BlockDefinition, StepStatus, UpdateDescriptor};

    fn harness(params: Value) -> Harness {
        Harness::new("timer_0", BlockDefinition::new(BlockKind::Timer).with_params(params))
    }

    #[test]
    fn test_fixed_delay_schedules_wake() {
        let mut h = harness(json!({"duration": "1d2h"}));
        let out = h.enter::<Timer>().unwrap();
        assert_eq!(out.progress.status, StepStatus::Idle);
        assert_eq!(
            out.deadlines,
            vec![(UpdateAction::FinishTimer, h.now + Duration::hours(26))]
        );

        let out = h.act::<Timer>(UpdateDescriptor::system(UpdateAction::FinishTimer)).unwrap();
        assert_eq!(out.progress.sockets, vec![DEFAULT_SOCKET]);
        assert!(out.deadlines.is_empty());

        let err = h
            .act::<Timer>(UpdateDescriptor::system(UpdateAction::FinishTimer))
            .unwrap_err();
        assert!(matches!(err, EngineError::BlockFailed(_)));
    }

    #[test]
    fn test_reload_is_a_no_op() {
        let mut h = harness(json!({"duration": "2h"}));
        h.enter::<Timer>().unwrap();
        let before = h.state::<Timer>();
        let out = h.act::<Timer>(UpdateDescriptor::system(UpdateAction::Reload)).unwrap();
        assert_eq!(out.progress.status, StepStatus::Idle);
        assert_eq!(h.state::<Timer>(), before);
    }

    #[test]
    fn test_users_cannot_expire_timer() {
        let mut h = harness(json!({"duration": "2h"}));
        h.enter::<Timer>().unwrap();
        let err = h
            .act::<Timer>(UpdateDescriptor::new(UpdateAction::FinishTimer, "u1", Value::Null))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_date_path_skips_weekend() {
        // Harness clock is Monday 2024-05-06 09:00 UTC. Saturday 11th rolls
        // to Monday 13th 05:00.
        let mut h = harness(json!({"date_path": "form_0.due", "workDay": 1}));
        h.vars.set_value("form_0.due", json!("11.05.2024 12:00"));
        h.enter::<Timer>().unwrap();
        let state = h.state::<Timer>();
        let expected = Utc.with_ymd_and_hms(2024, 5, 13, 5, 0, 0).unwrap() - h.now;
        assert_eq!(state.duration(), expected);
    }

    #[test]
    fn test_missing_or_past_date_fires_at_once() {
        let mut h = harness(json!({"date_path": "form_0.due"}));
        h.enter::<Timer>().unwrap();
        assert_eq!(h.state::<Timer>().duration_ms, 1);

        let mut h = harness(json!({"date_path": "form_0.due"}));
        h.vars.set_value("form_0.due", json!("01.01.2020"));
        h.enter::<Timer>().unwrap();
        assert_eq!(h.state::<Timer>().duration_ms, 1);
    }

    #[test]
    fn test_far_date_is_capped_at_a_year() {
        let mut h = harness(json!({"date_path": "form_0.due"}));
        h.vars.set_value("form_0.due", json!("01.01.2030"));
        h.enter::<Timer>().unwrap();
        assert_eq!(h.state::<Timer>().duration(), Duration::days(365));
    }
}
