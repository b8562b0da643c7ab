//! Tracking state machine.
//!
//! The transitions form a fixed table; [`TrackingState::next`] is the only
//! way the tracker moves between states.

use std::fmt;

/// State of the tracking thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingState {
    /// Construction in progress.
    SystemNotReady,
    /// No frame processed since construction or the last reset.
    NoImagesYet,
    /// Frames arrive but no map exists yet.
    NotInitialized,
    /// Tracking successfully.
    Ok,
    /// Completely lost, need relocalization.
    Lost,
}

impl Default for TrackingState {
    fn default() -> Self {
        Self::NoImagesYet
    }
}

/// What happened while processing a frame, as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingEvent {
    ConstructionComplete,
    FirstFrame,
    InitializationSucceeded,
    InitializationFailed,
    TrackingSucceeded,
    TrackingFailed,
    RelocalizationSucceeded,
    RelocalizationFailed,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TrackingState,
    pub event: TrackingEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no transition from {:?} on {:?}", self.from, self.event)
    }
}

impl std::error::Error for InvalidTransition {}

impl TrackingState {
    pub fn next(self, event: TrackingEvent) -> Result<TrackingState, InvalidTransition> {
        use TrackingEvent as E;
        use TrackingState as S;

        match (self, event) {
            (_, E::Reset) => Ok(S::NoImagesYet),
            (S::SystemNotReady, E::ConstructionComplete) => Ok(S::NoImagesYet),
            (S::NoImagesYet, E::FirstFrame) => Ok(S::NotInitialized),
            (S::NotInitialized, E::InitializationSucceeded) => Ok(S::Ok),
            (S::NotInitialized, E::InitializationFailed) => Ok(S::NotInitialized),
            (S::Ok, E::TrackingSucceeded) => Ok(S::Ok),
            (S::Ok, E::TrackingFailed) => Ok(S::Lost),
            (S::Lost, E::RelocalizationSucceeded) => Ok(S::Ok),
            (S::Lost, E::RelocalizationFailed) => Ok(S::Lost),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }
}

/// Whether the map is being extended or only used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingMode {
    /// Tracking and mapping.
    #[default]
    Slam,
    /// Tracking against a frozen map.
    Localization,
    /// Localization that lost the map and keeps going on temporary points
    /// until relocalization succeeds.
    VisualOdometry,
}

impl TrackingMode {
    /// True in both localization variants.
    pub fn only_tracking(self) -> bool {
        !matches!(self, TrackingMode::Slam)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TrackingEvent as E;
    use TrackingState as S;

    #[test]
    fn test_table_edges() {
        let edges = [
            (S::SystemNotReady, E::ConstructionComplete, S::NoImagesYet),
            (S::NoImagesYet, E::FirstFrame, S::NotInitialized),
            (S::NotInitialized, E::InitializationSucceeded, S::Ok),
            (S::NotInitialized, E::InitializationFailed, S::NotInitialized),
            (S::Ok, E::TrackingSucceeded, S::Ok),
            (S::Ok, E::TrackingFailed, S::Lost),
            (S::Lost, E::RelocalizationSucceeded, S::Ok),
            (S::Lost, E::RelocalizationFailed, S::Lost),
        ];
        for (from, event, to) in edges {
            assert_eq!(from.next(event), Ok(to), "{:?} on {:?}", from, event);
        }
    }

    #[test]
    fn test_reset_from_any_state() {
        for s in [S::SystemNotReady, S::NoImagesYet, S::NotInitialized, S::Ok, S::Lost] {
            assert_eq!(s.next(E::Reset), Ok(S::NoImagesYet));
        }
    }

    #[test]
    fn test_rejects_non_edges() {
        let non_edges = [
            (S::NoImagesYet, E::TrackingSucceeded),
            (S::NotInitialized, E::TrackingFailed),
            (S::Ok, E::RelocalizationSucceeded),
            (S::Lost, E::TrackingSucceeded),
            (S::Lost, E::InitializationSucceeded),
            (S::Ok, E::FirstFrame),
            (S::SystemNotReady, E::FirstFrame),
        ];
        for (from, event) in non_edges {
            let err = from.next(event).unwrap_err();
            assert_eq!(err, InvalidTransition { from, event });
        }
    }

    #[test]
    fn test_default_state_and_mode() {
        assert_eq!(TrackingState::default(), S::NoImagesYet);
        assert!(!TrackingMode::default().only_tracking());
        assert!(TrackingMode::VisualOdometry.only_tracking());
    }
}
