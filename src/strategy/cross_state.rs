use std::fmt;

/// Position of the close relative to the moving average
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaState {
    Above,
    Below,
    Equal,
}

impl MaState {
    /// Strict comparison; only an exact tie is `Equal`
    pub fn classify(close: f64, ma: f64) -> Self {
        if close > ma {
            MaState::Above
        } else if close < ma {
            MaState::Below
        } else {
            MaState::Equal
        }
    }
}

impl fmt::Display for MaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaState::Above => write!(f, "above"),
            MaState::Below => write!(f, "below"),
            MaState::Equal => write!(f, "equal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    CrossUp,
    CrossDown,
}

impl Signal {
    pub fn is_up(self) -> bool {
        self == Signal::CrossUp
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::CrossUp => write!(f, "cross up"),
            Signal::CrossDown => write!(f, "cross down"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Moved(MaState),
    Rejected { from: MaState, signal: Signal },
}

/// CrossUp leads from Below or Equal to Above, CrossDown from Above or
/// Equal to Below. Anything else is rejected.
pub fn transition(state: MaState, signal: Signal) -> Transition {
    match (state, signal) {
        (MaState::Below | MaState::Equal, Signal::CrossUp) => Transition::Moved(MaState::Above),
        (MaState::Above | MaState::Equal, Signal::CrossDown) => Transition::Moved(MaState::Below),
        (from, signal) => Transition::Rejected { from, signal },
    }
}

/// Direction of the moving average between the previous and latest bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaTrend {
    Up,
    Down,
}

impl MaTrend {
    /// A flat average counts as `Down`
    pub fn between(previous_ma: f64, current_ma: f64) -> Self {
        if previous_ma < current_ma {
            MaTrend::Up
        } else {
            MaTrend::Down
        }
    }
}

impl fmt::Display for MaTrend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaTrend::Up => write!(f, "UP"),
            MaTrend::Down => write!(f, "DOWN"),
        }
    }
}
