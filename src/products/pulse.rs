use serde::Serialize;

use crate::behavior::{ClusterInfo, PersonBehavior, SessionContext, SpawnContext};
use crate::effects::Target;
use crate::error::InvariantViolation;
use crate::person::PersonState;
use crate::randomization::RandomStream;

pub const PULSE_URL: &str = "https://pulse.example.com/";
const DEFAULT_RADIUS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseIntent {
    Visit,
}

#[derive(Debug, Clone, Serialize)]
pub enum PulseCommand {
    /// Raise the target's need by `delta`.
    Nudge { delta: f64 },
}

#[derive(Debug, Clone, Serialize)]
pub enum PulseCondition {
    NeedBelow(f64),
}

/// Minimal model: every session is one `$pageview`. A visit by someone with
/// high need occasionally nudges a low-need neighbour.
#[derive(Debug, Default)]
pub struct PulsePerson {
    pub visits: u32,
}

impl PersonBehavior for PulsePerson {
    type Intent = PulseIntent;
    type Command = PulseCommand;
    type Condition = PulseCondition;
    type Shared = ();

    const NAME: &'static str = "pulse";

    fn cluster_radius(_random: &mut RandomStream, max_radius: Option<usize>) -> usize {
        max_radius.map_or(DEFAULT_RADIUS, |cap| cap.min(DEFAULT_RADIUS))
    }

    fn new_shared(_info: &ClusterInfo, _random: &mut RandomStream) -> Self::Shared {}

    fn spawn(_person: &mut PersonState, _ctx: &mut SpawnContext<'_, ()>) -> Self {
        PulsePerson::default()
    }

    fn determine_session_intent(
        &mut self,
        _person: &PersonState,
        _ctx: &mut SessionContext<'_, Self>,
    ) -> Result<Option<PulseIntent>, InvariantViolation> {
        Ok(Some(PulseIntent::Visit))
    }

    fn simulate_session(
        &mut self,
        intent: PulseIntent,
        person: &mut PersonState,
        ctx: &mut SessionContext<'_, Self>,
    ) -> Result<(), InvariantViolation> {
        match intent {
            PulseIntent::Visit => {
                ctx.client(person).capture_pageview(PULSE_URL, None);
                let dwell = ctx.random.uniform_range(5.0, 60.0);
                person.advance_timer(dwell);
                let drift = ctx.random.uniform_range(-0.05, 0.05);
                person.adjust_need(drift);
                self.visits += 1;
                if person.need() > 0.3 && ctx.random.chance(0.1) {
                    ctx.schedule(
                        person.simulation_time(),
                        Target::RandomNeighbor,
                        Some(PulseCondition::NeedBelow(0.2)),
                        PulseCommand::Nudge { delta: 0.05 },
                    );
                }
            }
        }
        Ok(())
    }

    fn satisfies(&self, condition: &PulseCondition, person: &PersonState, _shared: &()) -> bool {
        match condition {
            PulseCondition::NeedBelow(threshold) => person.need() < *threshold,
        }
    }

    fn apply_command(
        &mut self,
        command: &PulseCommand,
        person: &mut PersonState,
        _ctx: &mut SessionContext<'_, Self>,
    ) -> Result<(), InvariantViolation> {
        match command {
            PulseCommand::Nudge { delta } => person.adjust_need(*delta),
        }
        Ok(())
    }
}
