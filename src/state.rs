//! Chain state threaded through every transition of a chain.

use ndarray::Array1;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{McmcError, Result};

/// Names of the fields of a [`ChainState`] that a transition may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateVariable {
    Pos,
    Mom,
    Dir,
}

impl StateVariable {
    pub fn name(&self) -> &'static str {
        match self {
            StateVariable::Pos => "pos",
            StateVariable::Mom => "mom",
            StateVariable::Dir => "dir",
        }
    }
}

impl fmt::Display for StateVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Position, momentum and integration direction of one chain.
///
/// Transitions take a state by value and hand back a new one, so a state is
/// never shared between two chains.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainState {
    /// Position in the target space.
    pub pos: Array1<f64>,
    /// Momentum, absent until sampled from its conditional distribution.
    pub mom: Option<Array1<f64>>,
    /// Integration direction, `1` (forward) or `-1` (backward).
    pub dir: i8,
}

impl ChainState {
    /// Creates a state at `pos` without momentum, integrating forward.
    pub fn new(pos: Array1<f64>) -> Self {
        Self {
            pos,
            mom: None,
            dir: 1,
        }
    }

    /// Sets the momentum.
    pub fn with_mom(mut self, mom: Array1<f64>) -> Self {
        self.mom = Some(mom);
        self
    }

    pub fn has(&self, variable: StateVariable) -> bool {
        match variable {
            StateVariable::Pos | StateVariable::Dir => true,
            StateVariable::Mom => self.mom.is_some(),
        }
    }

    /// Returns the momentum of a state already validated to carry one.
    ///
    /// # Panics
    ///
    /// Panics if the momentum is absent. The samplers check every
    /// transition's [`StateVariable`]s before the first iteration, so
    /// transitions that declare [`StateVariable::Mom`] may rely on it.
    pub fn mom(&self) -> &Array1<f64> {
        self.mom
            .as_ref()
            .expect("Expecting momentum to be present after state validation")
    }

    /// Integration direction as a float sign.
    pub fn dir_sign(&self) -> f64 {
        if self.dir < 0 {
            -1.0
        } else {
            1.0
        }
    }
}

/// A single value in the dictionary form of an initial state.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Array(Array1<f64>),
    Dir(i8),
}

impl From<Array1<f64>> for StateValue {
    fn from(value: Array1<f64>) -> Self {
        StateValue::Array(value)
    }
}

impl From<Vec<f64>> for StateValue {
    fn from(value: Vec<f64>) -> Self {
        StateValue::Array(Array1::from(value))
    }
}

impl From<i8> for StateValue {
    fn from(value: i8) -> Self {
        StateValue::Dir(value)
    }
}

/// Initial state of a chain as supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum InitState {
    /// Only a position; momentum is left absent.
    Position(Array1<f64>),
    /// Named fields `pos` (required), `mom` and `dir`.
    Fields(BTreeMap<String, StateValue>),
    /// A complete state, e.g. the `final_state` of an earlier run.
    State(ChainState),
}

impl From<Vec<f64>> for InitState {
    fn from(pos: Vec<f64>) -> Self {
        InitState::Position(Array1::from(pos))
    }
}

impl From<Array1<f64>> for InitState {
    fn from(pos: Array1<f64>) -> Self {
        InitState::Position(pos)
    }
}

impl From<ChainState> for InitState {
    fn from(state: ChainState) -> Self {
        InitState::State(state)
    }
}

impl From<BTreeMap<String, StateValue>> for InitState {
    fn from(fields: BTreeMap<String, StateValue>) -> Self {
        InitState::Fields(fields)
    }
}

impl TryFrom<InitState> for ChainState {
    type Error = McmcError;

    fn try_from(init: InitState) -> Result<Self> {
        match init {
            InitState::Position(pos) => Ok(ChainState::new(pos)),
            InitState::State(state) => validate_shape(state),
            InitState::Fields(mut fields) => {
                let pos = match fields.remove("pos") {
                    Some(StateValue::Array(pos)) => pos,
                    Some(StateValue::Dir(_)) => {
                        return Err(McmcError::InvalidInitState(
                            "`pos` must be an array".to_string(),
                        ))
                    }
                    None => {
                        return Err(McmcError::InvalidInitState(
                            "no `pos` entry given".to_string(),
                        ))
                    }
                };
                let mom = match fields.remove("mom") {
                    Some(StateValue::Array(mom)) => Some(mom),
                    Some(StateValue::Dir(_)) => {
                        return Err(McmcError::InvalidInitState(
                            "`mom` must be an array".to_string(),
                        ))
                    }
                    None => None,
                };
                let dir = match fields.remove("dir") {
                    Some(StateValue::Dir(dir)) => dir,
                    Some(StateValue::Array(_)) => {
                        return Err(McmcError::InvalidInitState(
                            "`dir` must be 1 or -1".to_string(),
                        ))
                    }
                    None => 1,
                };
                if let Some(unknown) = fields.keys().next() {
                    return Err(McmcError::InvalidInitState(format!(
                        "unknown state variable `{unknown}`"
                    )));
                }
                validate_shape(ChainState { pos, mom, dir })
            }
        }
    }
}

fn validate_shape(state: ChainState) -> Result<ChainState> {
    if state.dir != 1 && state.dir != -1 {
        return Err(McmcError::InvalidInitState(format!(
            "`dir` must be 1 or -1, got {}",
            state.dir
        )));
    }
    if let Some(mom) = &state.mom {
        if mom.len() != state.pos.len() {
            return Err(McmcError::InvalidInitState(format!(
                "`mom` has length {} but `pos` has length {}",
                mom.len(),
                state.pos.len()
            )));
        }
    }
    Ok(state)
}
