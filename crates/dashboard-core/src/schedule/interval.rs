//! Refresh interval policies.
//!
//! A scheduler asks its policy for the next interval after every fetch, so an
//! interval can follow the data (a game about to start polls faster than one
//! that ended last night).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::clock::to_chrono;
use crate::config::IntervalDefaults;

/// Decides how long to wait before the next refresh.
pub trait IntervalPolicy<T>: Send + Sync {
    /// `latest` is the most recent successful refresh output, if any.
    fn next_interval(&self, latest: Option<&T>, now: DateTime<Utc>) -> Duration;
}

/// The same interval every time.
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval(pub Duration);

impl<T> IntervalPolicy<T> for FixedInterval {
    fn next_interval(&self, _latest: Option<&T>, _now: DateTime<Utc>) -> Duration {
        self.0
    }
}

/// Game lifecycle as reported by the league feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameState {
    #[serde(rename = "FUT")]
    Scheduled,
    #[serde(rename = "PRE")]
    Pregame,
    #[serde(rename = "LIVE")]
    Live,
    #[serde(rename = "CRIT")]
    Critical,
    #[serde(rename = "FINAL")]
    Final,
    #[serde(rename = "OFF")]
    Off,
    #[serde(other)]
    Unknown,
}

/// The parts of a game that drive its refresh cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSnapshot {
    #[serde(rename = "gameState")]
    pub state: GameState,
    #[serde(rename = "startTimeUTC", default)]
    pub start_time: Option<DateTime<Utc>>,
}

/// Game-state driven cadence.
#[derive(Debug, Clone)]
pub struct GameIntervals {
    pub pre_game: Duration,
    pub pre_game_close: Duration,
    pub in_game: Duration,
    pub post_game: Duration,
    /// How long before the start the close cadence kicks in.
    pub pre_game_window: Duration,
}

impl Default for GameIntervals {
    fn default() -> Self {
        Self {
            pre_game: IntervalDefaults::PRE_GAME,
            pre_game_close: IntervalDefaults::PRE_GAME_CLOSE,
            in_game: IntervalDefaults::IN_GAME,
            post_game: IntervalDefaults::POST_GAME,
            pre_game_window: IntervalDefaults::PRE_GAME_WINDOW,
        }
    }
}

impl GameIntervals {
    pub fn interval_for(&self, game: Option<&GameSnapshot>, now: DateTime<Utc>) -> Duration {
        let Some(game) = game else {
            debug!("No game scheduled");
            return self.post_game;
        };
        let Some(start) = game.start_time else {
            debug!("Game has no start time");
            return self.post_game;
        };

        match game.state {
            GameState::Scheduled if now >= start - to_chrono(self.pre_game_window) => {
                self.pre_game_close
            }
            GameState::Scheduled => self.pre_game,
            GameState::Pregame => self.pre_game_close,
            GameState::Live | GameState::Critical => self.in_game,
            GameState::Final | GameState::Off | GameState::Unknown => self.post_game,
        }
    }
}

impl IntervalPolicy<GameSnapshot> for GameIntervals {
    fn next_interval(&self, latest: Option<&GameSnapshot>, now: DateTime<Utc>) -> Duration {
        self.interval_for(latest, now)
    }
}
