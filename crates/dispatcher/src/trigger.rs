use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use taskhub_domain::entities::Trigger;
use taskhub_errors::{HubError, HubResult};

/// 触发器时间计算
///
/// 全部计算基于UTC。返回值为相对`after`的下一次触发时间：
/// - Cron/Interval 严格晚于 `after`
/// - Once 在未触发前始终返回其时间点，即使已过期（迟到触发一次，不丢弃）
pub struct TriggerEngine;

impl TriggerEngine {
    pub fn validate(trigger: &Trigger) -> HubResult<()> {
        match trigger {
            Trigger::Cron { expr, .. } => {
                Self::parse_cron(expr)?;
                Ok(())
            }
            Trigger::Interval { every_seconds, .. } => {
                if *every_seconds <= 0 {
                    return Err(HubError::invalid_trigger(
                        format!("interval:{every_seconds}"),
                        "间隔必须为正数",
                    ));
                }
                Ok(())
            }
            Trigger::Once { .. } => Ok(()),
        }
    }

    pub fn next_fire(
        trigger: &Trigger,
        after: DateTime<Utc>,
        last_fired: Option<DateTime<Utc>>,
    ) -> HubResult<Option<DateTime<Utc>>> {
        match trigger {
            Trigger::Cron {
                expr,
                start_at,
                end_at,
            } => {
                let schedule = Self::parse_cron(expr)?;
                // 起始时间本身允许作为触发点，向前退一秒再取strictly-after
                let floor = match start_at {
                    Some(start) if *start > after => *start - Duration::seconds(1),
                    _ => after,
                };
                let candidate = schedule.after(&floor).next();
                Ok(Self::apply_end(candidate, *end_at))
            }
            Trigger::Interval {
                every_seconds,
                start_at,
                end_at,
            } => {
                if *every_seconds <= 0 {
                    return Err(HubError::invalid_trigger(
                        format!("interval:{every_seconds}"),
                        "间隔必须为正数",
                    ));
                }
                let every = Duration::seconds(*every_seconds);
                let candidate = match start_at {
                    // 锚定起始时间：触发点恒为 start + k*every
                    Some(start) => {
                        if after < *start {
                            *start
                        } else {
                            let elapsed = (after - *start).num_seconds();
                            let k = elapsed / every_seconds + 1;
                            *start + Duration::seconds(k * every_seconds)
                        }
                    }
                    None => match last_fired {
                        Some(last) => last + every,
                        None => after + every,
                    },
                };
                Ok(Self::apply_end(Some(candidate), *end_at))
            }
            Trigger::Once { at } => {
                // 触发过即永久失效，重启后依水位判断
                if last_fired.map(|last| last >= *at).unwrap_or(false) {
                    Ok(None)
                } else {
                    Ok(Some(*at))
                }
            }
        }
    }

    /// 多触发器取最早的下一次触发时间
    pub fn next_fire_of(
        triggers: &[Trigger],
        after: DateTime<Utc>,
        last_fired: Option<DateTime<Utc>>,
    ) -> HubResult<Option<DateTime<Utc>>> {
        let mut earliest: Option<DateTime<Utc>> = None;
        for trigger in triggers {
            if let Some(candidate) = Self::next_fire(trigger, after, last_fired)? {
                earliest = Some(match earliest {
                    Some(current) if current <= candidate => current,
                    _ => candidate,
                });
            }
        }
        Ok(earliest)
    }

    /// 节奏的人读描述，状态接口展示用
    pub fn describe(trigger: &Trigger) -> String {
        match trigger {
            Trigger::Cron { expr, .. } => match Self::parse_cron(expr) {
                Ok(schedule) => {
                    let upcoming: Vec<DateTime<Utc>> =
                        schedule.after(&Utc::now()).take(2).collect();
                    if upcoming.len() == 2 {
                        let seconds = (upcoming[1] - upcoming[0]).num_seconds();
                        format!("CRON {expr} ({})", Self::frequency_text(seconds))
                    } else {
                        format!("CRON {expr}")
                    }
                }
                Err(_) => format!("CRON {expr} (无效)"),
            },
            Trigger::Interval { every_seconds, .. } => Self::frequency_text(*every_seconds),
            Trigger::Once { at } => format!("一次性: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        }
    }

    fn frequency_text(seconds: i64) -> String {
        match seconds {
            s if s < 60 => format!("每{s}秒"),
            s if s < 3600 => format!("每{}分钟", s / 60),
            s if s < 86400 => format!("每{}小时", s / 3600),
            s => format!("每{}天", s / 86400),
        }
    }

    /// 兼容5字段表达式，自动补秒位
    fn parse_cron(expr: &str) -> HubResult<Schedule> {
        let normalized = if expr.split_whitespace().count() == 5 {
            format!("0 {expr}")
        } else {
            expr.to_string()
        };
        Schedule::from_str(&normalized)
            .map_err(|e| HubError::invalid_trigger(expr, e.to_string()))
    }

    fn apply_end(
        candidate: Option<DateTime<Utc>>,
        end_at: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match (candidate, end_at) {
            (Some(time), Some(end)) if time > end => None,
            (candidate, _) => candidate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_cron_daily_at_two() {
        let trigger = Trigger::Cron {
            expr: "0 0 2 * * *".to_string(),
            start_at: None,
            end_at: None,
        };
        // 01:00时计算，当天02:00触发
        let next = TriggerEngine::next_fire(&trigger, utc(2026, 1, 10, 1, 0, 0), None)
            .unwrap()
            .unwrap();
        assert_eq!(next, utc(2026, 1, 10, 2, 0, 0));

        // 02:00刚过，次日02:00
        let next = TriggerEngine::next_fire(&trigger, utc(2026, 1, 10, 2, 0, 0), None)
            .unwrap()
            .unwrap();
        assert_eq!(next, utc(2026, 1, 11, 2, 0, 0));
    }

    #[test]
    fn test_cron_five_field_expression() {
        let trigger = Trigger::Cron {
            expr: "30 4 * * *".to_string(),
            start_at: None,
            end_at: None,
        };
        let next = TriggerEngine::next_fire(&trigger, utc(2026, 1, 10, 0, 0, 0), None)
            .unwrap()
            .unwrap();
        assert_eq!(next, utc(2026, 1, 10, 4, 30, 0));
    }

    #[test]
    fn test_cron_future_start_date() {
        let trigger = Trigger::Cron {
            expr: "0 0 2 * * *".to_string(),
            start_at: Some(utc(2026, 6, 1, 0, 0, 0)),
            end_at: None,
        };
        let next = TriggerEngine::next_fire(&trigger, utc(2026, 1, 10, 1, 0, 0), None)
            .unwrap()
            .unwrap();
        assert_eq!(next, utc(2026, 6, 1, 2, 0, 0));
    }

    #[test]
    fn test_cron_start_date_itself_can_fire() {
        let trigger = Trigger::Cron {
            expr: "0 0 2 * * *".to_string(),
            start_at: Some(utc(2026, 6, 1, 2, 0, 0)),
            end_at: None,
        };
        let next = TriggerEngine::next_fire(&trigger, utc(2026, 1, 1, 0, 0, 0), None)
            .unwrap()
            .unwrap();
        assert_eq!(next, utc(2026, 6, 1, 2, 0, 0));
    }

    #[test]
    fn test_cron_end_date_expires() {
        let trigger = Trigger::Cron {
            expr: "0 0 2 * * *".to_string(),
            start_at: None,
            end_at: Some(utc(2026, 1, 10, 0, 0, 0)),
        };
        let next = TriggerEngine::next_fire(&trigger, utc(2026, 1, 10, 1, 0, 0), None).unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn test_interval_aligned_to_start() {
        let trigger = Trigger::Interval {
            every_seconds: 3600,
            start_at: Some(utc(2026, 1, 1, 0, 30, 0)),
            end_at: None,
        };
        // 对齐到 start + k*every，而不是 after + every
        let next = TriggerEngine::next_fire(&trigger, utc(2026, 1, 1, 5, 0, 0), None)
            .unwrap()
            .unwrap();
        assert_eq!(next, utc(2026, 1, 1, 5, 30, 0));
    }

    #[test]
    fn test_interval_without_start_follows_last_fire() {
        let trigger = Trigger::Interval {
            every_seconds: 600,
            start_at: None,
            end_at: None,
        };
        let last = utc(2026, 1, 1, 8, 0, 0);
        let next = TriggerEngine::next_fire(&trigger, last, Some(last))
            .unwrap()
            .unwrap();
        assert_eq!(next, utc(2026, 1, 1, 8, 10, 0));
    }

    #[test]
    fn test_interval_rejects_non_positive() {
        let trigger = Trigger::Interval {
            every_seconds: 0,
            start_at: None,
            end_at: None,
        };
        assert!(TriggerEngine::validate(&trigger).is_err());
        assert!(TriggerEngine::next_fire(&trigger, Utc::now(), None).is_err());
    }

    #[test]
    fn test_once_fires_late_but_only_once() {
        let at = utc(2026, 1, 1, 12, 0, 0);
        let trigger = Trigger::Once { at };

        // 未触发过：即使已过期也返回时间点
        let next = TriggerEngine::next_fire(&trigger, utc(2026, 1, 2, 0, 0, 0), None)
            .unwrap()
            .unwrap();
        assert_eq!(next, at);

        // 水位之后永久失效，重启重算也不再触发
        let next =
            TriggerEngine::next_fire(&trigger, utc(2026, 1, 2, 0, 0, 0), Some(at)).unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn test_next_fire_of_picks_earliest() {
        let triggers = vec![
            Trigger::Once {
                at: utc(2026, 1, 1, 6, 0, 0),
            },
            Trigger::Cron {
                expr: "0 0 2 * * *".to_string(),
                start_at: None,
                end_at: None,
            },
        ];
        let next = TriggerEngine::next_fire_of(&triggers, utc(2026, 1, 1, 0, 0, 0), None)
            .unwrap()
            .unwrap();
        assert_eq!(next, utc(2026, 1, 1, 2, 0, 0));
    }

    #[test]
    fn test_invalid_cron_is_error_not_panic() {
        let trigger = Trigger::Cron {
            expr: "not a cron".to_string(),
            start_at: None,
            end_at: None,
        };
        let err = TriggerEngine::validate(&trigger).unwrap_err();
        assert!(matches!(err, HubError::InvalidTrigger { .. }));
    }

    #[test]
    fn test_describe_interval() {
        let trigger = Trigger::Interval {
            every_seconds: 1800,
            start_at: None,
            end_at: None,
        };
        assert_eq!(TriggerEngine::describe(&trigger), "每30分钟");
    }
}
