use crate::config::StatusTarget;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A heartbeat value due to be written to a status register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatWrite {
    pub host: String,
    pub register: u16,
    pub value: u16,
}

#[derive(Debug)]
struct TargetState {
    next_value: u16,
    interval: Duration,
    last_sent: Option<Instant>,
}

/// Per-target heartbeat schedules.
///
/// One state per distinct `(host, register)` pair, created lazily the first
/// time the pair is observed. Each target fires independently of the others
/// and of the tag-relay tick: a write is due once its own interval has
/// elapsed since its last send, and the first observation fires immediately
/// with 0 so the sequence written downstream is 0,1,0,1,…
pub struct HeartbeatSchedule {
    targets: Vec<StatusTarget>,
    states: HashMap<(String, u16), TargetState>,
}

impl HeartbeatSchedule {
    pub fn new(targets: Vec<StatusTarget>) -> Self {
        Self {
            targets,
            states: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Collect the writes due at `now`, toggling each fired target's value.
    pub fn due(&mut self, now: Instant) -> Vec<HeartbeatWrite> {
        let mut writes = Vec::new();

        for target in &self.targets {
            let key = (target.host.clone(), target.register);
            let state = self.states.entry(key).or_insert_with(|| TargetState {
                next_value: 0,
                interval: Duration::from_secs_f64(target.interval_secs),
                last_sent: None,
            });

            let due = match state.last_sent {
                None => true,
                Some(last) => now.duration_since(last) >= state.interval,
            };
            if !due {
                continue;
            }

            writes.push(HeartbeatWrite {
                host: target.host.clone(),
                register: target.register,
                value: state.next_value,
            });
            state.next_value ^= 1;
            state.last_sent = Some(now);
        }

        writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str, register: u16, interval_secs: f64) -> StatusTarget {
        StatusTarget {
            host: host.to_string(),
            register,
            interval_secs,
        }
    }

    #[test]
    fn test_first_observation_fires_immediately_with_zero() {
        let mut schedule = HeartbeatSchedule::new(vec![target("plc", 100, 1.0)]);
        let writes = schedule.due(Instant::now());

        assert_eq!(
            writes,
            vec![HeartbeatWrite {
                host: "plc".to_string(),
                register: 100,
                value: 0,
            }]
        );
    }

    #[test]
    fn test_values_alternate_strictly() {
        let mut schedule = HeartbeatSchedule::new(vec![target("plc", 100, 1.0)]);
        let start = Instant::now();

        let mut seen = Vec::new();
        for tick in 0..4u32 {
            let writes = schedule.due(start + Duration::from_secs(tick as u64));
            assert_eq!(writes.len(), 1);
            seen.push(writes[0].value);
        }

        assert_eq!(seen, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_not_due_before_interval() {
        let mut schedule = HeartbeatSchedule::new(vec![target("plc", 100, 1.0)]);
        let start = Instant::now();

        assert_eq!(schedule.due(start).len(), 1);
        assert!(schedule.due(start + Duration::from_millis(400)).is_empty());
        assert!(schedule.due(start + Duration::from_millis(900)).is_empty());
        assert_eq!(schedule.due(start + Duration::from_millis(1000)).len(), 1);
    }

    #[test]
    fn test_targets_schedule_independently() {
        let mut schedule = HeartbeatSchedule::new(vec![
            target("plc-a", 100, 1.0),
            target("plc-b", 200, 3.0),
        ]);
        let start = Instant::now();

        // Both fire on first observation.
        assert_eq!(schedule.due(start).len(), 2);

        // One second later only the fast target is due again.
        let writes = schedule.due(start + Duration::from_secs(1));
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].register, 100);

        // At three seconds both are due.
        let writes = schedule.due(start + Duration::from_secs(3));
        assert_eq!(writes.len(), 2);
    }

    #[test]
    fn test_state_created_lazily_per_pair() {
        let mut schedule = HeartbeatSchedule::new(vec![
            target("plc", 100, 1.0),
            target("plc", 100, 1.0), // duplicate pair shares one state
        ]);
        assert!(schedule.states.is_empty());

        let writes = schedule.due(Instant::now());
        assert_eq!(writes.len(), 1);
        assert_eq!(schedule.states.len(), 1);
    }
}
