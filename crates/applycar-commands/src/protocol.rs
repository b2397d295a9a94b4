//! Apply/CAR handshake state machine.
//!
//! A posted command moves through `WaitPreset` (directive written, client id
//! not yet known) and `WaitStart` (client id known, waiting for the CAR record
//! to acknowledge it) back to `Idle`. Every transition is a pure function of
//! the current state and one event; side effects are returned as a
//! [`Resolution`] for the caller to carry out.
//!
//! A command is only considered acknowledged once the CAR client id has caught
//! up with the command's own id, so a stale CAR state left over from a
//! previous command is never mistaken for the outcome of the new one. At that
//! point BUSY means the actuation was accepted and ERROR means it failed.

use std::fmt;

use crate::error::CommandError;
use crate::point::CarState;

/// Progress of the command in flight, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolState<S> {
    /// No command in flight
    Idle,
    /// Directive written; waiting for the Apply record to report the new client id
    WaitPreset {
        car_state: Option<S>,
        car_clid: Option<i32>,
    },
    /// Client id known; waiting for the CAR record to acknowledge it
    WaitStart {
        clid: i32,
        car_state: Option<S>,
        car_clid: Option<i32>,
    },
}

/// What has to happen to the command's monitor after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Complete successfully
    Succeed,
    /// Fail with the Apply record's error message, read off the notification thread
    FailWithApplyMessage,
    /// Fail with the CAR record's error message, read off the notification thread
    FailWithCarMessage,
    /// Fail with the given error
    Fail(CommandError),
}

/// Result of feeding one event to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step<S> {
    pub next: ProtocolState<S>,
    pub resolution: Option<Resolution>,
}

impl<S> Step<S> {
    fn stay(next: ProtocolState<S>) -> Self {
        Self {
            next,
            resolution: None,
        }
    }

    fn resolve(resolution: Resolution) -> Self {
        Self {
            next: ProtocolState::Idle,
            resolution: Some(resolution),
        }
    }
}

impl<S: CarState> ProtocolState<S> {
    /// State right after the start directive is written.
    pub fn preset(car_state: Option<S>) -> Self {
        ProtocolState::WaitPreset {
            car_state,
            car_clid: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, ProtocolState::Idle)
    }

    /// Short variant name.
    pub fn type_name(&self) -> &'static str {
        match self {
            ProtocolState::Idle => "Idle",
            ProtocolState::WaitPreset { .. } => "WaitPreset",
            ProtocolState::WaitStart { .. } => "WaitStart",
        }
    }

    /// Record the CAR state read right after posting.
    ///
    /// A state already delivered by notification is more recent and is kept.
    pub fn with_baseline(self, baseline: Option<S>) -> Step<S> {
        match self {
            ProtocolState::WaitPreset {
                car_state: None,
                car_clid,
            } => Step::stay(ProtocolState::WaitPreset {
                car_state: baseline,
                car_clid,
            }),
            other => Step::stay(other),
        }
    }

    /// The Apply record reported a new value. `apply` names the record for
    /// error reporting.
    pub fn on_apply_value(self, value: i32, apply: &str) -> Step<S> {
        match self {
            ProtocolState::Idle => Step::stay(self),
            ProtocolState::WaitPreset {
                car_state,
                car_clid,
            } => {
                if value <= 0 {
                    return Step::resolve(Resolution::FailWithApplyMessage);
                }
                // The CAR record may already have reported this id
                if car_clid == Some(value)
                    && let Some(state) = &car_state
                {
                    if state.is_error() {
                        return Step::resolve(Resolution::FailWithCarMessage);
                    }
                    if state.is_busy() {
                        return Step::resolve(Resolution::Succeed);
                    }
                }
                Step::stay(ProtocolState::WaitStart {
                    clid: value,
                    car_state,
                    car_clid,
                })
            }
            ProtocolState::WaitStart {
                clid,
                car_state,
                car_clid,
            } => {
                if value >= clid {
                    Step::stay(ProtocolState::WaitStart {
                        clid: value,
                        car_state,
                        car_clid,
                    })
                } else {
                    Step::resolve(Resolution::Fail(CommandError::Superseded {
                        apply: apply.to_string(),
                    }))
                }
            }
        }
    }

    /// The CAR record reported a new state.
    pub fn on_car_state(self, state: S) -> Step<S> {
        match self {
            ProtocolState::Idle => Step::stay(self),
            ProtocolState::WaitPreset { car_clid, .. } => Step::stay(ProtocolState::WaitPreset {
                car_state: Some(state),
                car_clid,
            }),
            ProtocolState::WaitStart { clid, car_clid, .. } => {
                Self::check_acknowledged(clid, Some(state), car_clid)
            }
        }
    }

    /// The CAR record reported a new acknowledged client id.
    pub fn on_car_clid(self, car_clid: i32) -> Step<S> {
        match self {
            ProtocolState::Idle => Step::stay(self),
            ProtocolState::WaitPreset { car_state, .. } => Step::stay(ProtocolState::WaitPreset {
                car_state,
                car_clid: Some(car_clid),
            }),
            ProtocolState::WaitStart {
                clid, car_state, ..
            } => Self::check_acknowledged(clid, car_state, Some(car_clid)),
        }
    }

    /// The command timer expired.
    pub fn on_timeout(self) -> Step<S> {
        match self {
            ProtocolState::Idle => Step::stay(self),
            ProtocolState::WaitPreset { .. } | ProtocolState::WaitStart { .. } => {
                Step::resolve(Resolution::Fail(CommandError::Timeout))
            }
        }
    }

    fn check_acknowledged(clid: i32, car_state: Option<S>, car_clid: Option<i32>) -> Step<S> {
        if let (Some(state), Some(acked)) = (&car_state, car_clid)
            && acked >= clid
        {
            if state.is_error() {
                return Step::resolve(Resolution::FailWithCarMessage);
            }
            if state.is_busy() {
                return Step::resolve(Resolution::Succeed);
            }
        }
        Step::stay(ProtocolState::WaitStart {
            clid,
            car_state,
            car_clid,
        })
    }
}

impl<S: fmt::Debug> fmt::Display for ProtocolState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolState::Idle => write!(f, "Idle"),
            ProtocolState::WaitPreset {
                car_state,
                car_clid,
            } => write!(
                f,
                "WaitPreset(carState = {:?}, carClid = {:?})",
                car_state, car_clid
            ),
            ProtocolState::WaitStart {
                clid,
                car_state,
                car_clid,
            } => write!(
                f,
                "WaitStart(clid = {}, carState = {:?}, carClid = {:?})",
                clid, car_state, car_clid
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::CarValue;

    const APPLY: &str = "tc1:apply";

    fn wait_start(
        clid: i32,
        car_state: Option<CarValue>,
        car_clid: Option<i32>,
    ) -> ProtocolState<CarValue> {
        ProtocolState::WaitStart {
            clid,
            car_state,
            car_clid,
        }
    }

    #[test]
    fn test_idle_ignores_everything() {
        let idle = ProtocolState::<CarValue>::Idle;
        assert_eq!(idle.clone().on_apply_value(3, APPLY), Step::stay(ProtocolState::Idle));
        assert_eq!(idle.clone().on_car_state(CarValue::Busy), Step::stay(ProtocolState::Idle));
        assert_eq!(idle.clone().on_car_clid(3), Step::stay(ProtocolState::Idle));
        assert_eq!(idle.on_timeout(), Step::stay(ProtocolState::Idle));
    }

    #[test]
    fn test_baseline_only_fills_unknown_state() {
        let step = ProtocolState::preset(None).with_baseline(Some(CarValue::Idle));
        assert_eq!(step.next, ProtocolState::preset(Some(CarValue::Idle)));
        assert_eq!(step.resolution, None);

        let notified = ProtocolState::preset(Some(CarValue::Busy));
        assert_eq!(
            notified.clone().with_baseline(Some(CarValue::Idle)).next,
            notified
        );

        let started = wait_start(5, None, None);
        assert_eq!(started.clone().with_baseline(Some(CarValue::Idle)).next, started);
    }

    #[test]
    fn test_preset_rejected_by_apply() {
        let preset = ProtocolState::preset(Some(CarValue::Idle));
        assert_eq!(
            preset.clone().on_apply_value(0, APPLY),
            Step::resolve(Resolution::FailWithApplyMessage)
        );
        assert_eq!(
            preset.on_apply_value(-1, APPLY),
            Step::resolve(Resolution::FailWithApplyMessage)
        );
    }

    #[test]
    fn test_preset_to_wait_start_with_unknown_car_clid() {
        let preset = ProtocolState::preset(Some(CarValue::Idle));
        let step = preset.on_apply_value(5, APPLY);
        assert_eq!(step.next, wait_start(5, Some(CarValue::Idle), None));
        assert_eq!(step.resolution, None);
    }

    #[test]
    fn test_preset_resolves_when_car_already_caught_up() {
        let preset = ProtocolState::preset(None)
            .on_car_clid(7)
            .next
            .on_car_state(CarValue::Busy)
            .next;
        assert_eq!(
            preset.on_apply_value(7, APPLY),
            Step::resolve(Resolution::Succeed)
        );

        let preset = ProtocolState::preset(Some(CarValue::Error)).on_car_clid(7).next;
        assert_eq!(
            preset.on_apply_value(7, APPLY),
            Step::resolve(Resolution::FailWithCarMessage)
        );
    }

    #[test]
    fn test_preset_waits_when_car_clid_differs() {
        let preset = ProtocolState::preset(Some(CarValue::Busy)).on_car_clid(6).next;
        let step = preset.on_apply_value(7, APPLY);
        assert_eq!(step.next, wait_start(7, Some(CarValue::Busy), Some(6)));
    }

    #[test]
    fn test_preset_idle_car_at_same_clid_keeps_waiting() {
        let preset = ProtocolState::preset(Some(CarValue::Idle)).on_car_clid(7).next;
        let step = preset.on_apply_value(7, APPLY);
        assert_eq!(step.next, wait_start(7, Some(CarValue::Idle), Some(7)));
    }

    #[test]
    fn test_preset_records_car_updates() {
        let step = ProtocolState::preset(None).on_car_state(CarValue::Paused);
        assert_eq!(step.next, ProtocolState::WaitPreset {
            car_state: Some(CarValue::Paused),
            car_clid: None
        });
        let step = step.next.on_car_clid(4);
        assert_eq!(step.next, ProtocolState::WaitPreset {
            car_state: Some(CarValue::Paused),
            car_clid: Some(4)
        });
        assert_eq!(step.resolution, None);
    }

    #[test]
    fn test_wait_start_accepts_same_or_higher_apply_value() {
        let state = wait_start(5, None, None);
        assert_eq!(state.clone().on_apply_value(5, APPLY).next, wait_start(5, None, None));
        assert_eq!(state.on_apply_value(8, APPLY).next, wait_start(8, None, None));
    }

    #[test]
    fn test_wait_start_superseded() {
        let step = wait_start(5, None, None).on_apply_value(4, APPLY);
        assert_eq!(
            step,
            Step::resolve(Resolution::Fail(CommandError::Superseded {
                apply: APPLY.to_string()
            }))
        );
    }

    #[test]
    fn test_wait_start_ignores_stale_car_clid() {
        let step = wait_start(5, Some(CarValue::Busy), None).on_car_clid(4);
        assert_eq!(step.next, wait_start(5, Some(CarValue::Busy), Some(4)));
        assert_eq!(step.resolution, None);

        let step = wait_start(5, None, Some(4)).on_car_state(CarValue::Error);
        assert_eq!(step.resolution, None);
    }

    #[test]
    fn test_wait_start_resolves_on_matching_clid() {
        let step = wait_start(5, Some(CarValue::Busy), None).on_car_clid(5);
        assert_eq!(step, Step::resolve(Resolution::Succeed));

        let step = wait_start(5, None, Some(6)).on_car_state(CarValue::Busy);
        assert_eq!(step, Step::resolve(Resolution::Succeed));

        let step = wait_start(5, None, Some(5)).on_car_state(CarValue::Error);
        assert_eq!(step, Step::resolve(Resolution::FailWithCarMessage));
    }

    #[test]
    fn test_wait_start_idle_car_keeps_waiting() {
        let step = wait_start(5, Some(CarValue::Idle), None).on_car_clid(5);
        assert_eq!(step.next, wait_start(5, Some(CarValue::Idle), Some(5)));
        assert_eq!(step.resolution, None);
    }

    #[test]
    fn test_timeout_from_any_active_state() {
        let expected = Step::resolve(Resolution::Fail(CommandError::Timeout));
        assert_eq!(ProtocolState::<CarValue>::preset(None).on_timeout(), expected);
        assert_eq!(wait_start(1, None, None).on_timeout(), expected);
    }

    #[test]
    fn test_signature() {
        assert_eq!(ProtocolState::<CarValue>::Idle.to_string(), "Idle");
        assert_eq!(
            wait_start(5, Some(CarValue::Busy), None).to_string(),
            "WaitStart(clid = 5, carState = Some(Busy), carClid = None)"
        );
        assert_eq!(
            ProtocolState::preset(Some(CarValue::Idle)).to_string(),
            "WaitPreset(carState = Some(Idle), carClid = None)"
        );
    }
}
