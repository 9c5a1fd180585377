use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EnergyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnergyError {
    #[error("no lives left")]
    Empty { next_life_in_secs: Option<u64> },
}

/// Stored lives counter. The persisted `lives` value is only exact as of
/// `updated_at`; callers always go through [`Energy::current`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Energy {
    pub lives: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyView {
    pub lives: u32,
    pub max_lives: u32,
    pub next_life_in_secs: Option<u64>,
}

impl Energy {
    pub fn full(cfg: &EnergyConfig, now: DateTime<Utc>) -> Self {
        Self {
            lives: cfg.max_lives,
            updated_at: now,
        }
    }

    /// Apply regeneration up to `now` and return the resulting view.
    pub fn current(&mut self, cfg: &EnergyConfig, now: DateTime<Utc>) -> EnergyView {
        let regen = cfg.regen_seconds.max(1) as i64;

        if self.lives >= cfg.max_lives {
            self.lives = cfg.max_lives;
            self.updated_at = now;
        } else {
            let elapsed = (now - self.updated_at).num_seconds().max(0);
            let gained = elapsed / regen;
            if gained > 0 {
                let lives = (self.lives as i64 + gained).min(cfg.max_lives as i64) as u32;
                self.lives = lives;
                self.updated_at = if lives >= cfg.max_lives {
                    now
                } else {
                    self.updated_at + Duration::seconds(gained * regen)
                };
            }
        }

        let next_life_in_secs = (self.lives < cfg.max_lives).then(|| {
            let elapsed = (now - self.updated_at).num_seconds().max(0);
            (regen - elapsed).max(0) as u64
        });

        EnergyView {
            lives: self.lives,
            max_lives: cfg.max_lives,
            next_life_in_secs,
        }
    }

    pub fn try_consume(&mut self, cfg: &EnergyConfig, now: DateTime<Utc>) -> Result<EnergyView, EnergyError> {
        let view = self.current(cfg, now);
        if view.lives == 0 {
            return Err(EnergyError::Empty {
                next_life_in_secs: view.next_life_in_secs,
            });
        }
        if self.lives >= cfg.max_lives {
            self.updated_at = now;
        }
        self.lives -= 1;
        Ok(self.current(cfg, now))
    }

    pub fn refund(&mut self, cfg: &EnergyConfig, now: DateTime<Utc>) -> EnergyView {
        self.current(cfg, now);
        self.lives = (self.lives + 1).min(cfg.max_lives);
        self.current(cfg, now)
    }

    pub fn set(&mut self, lives: u32, cfg: &EnergyConfig, now: DateTime<Utc>) -> EnergyView {
        self.lives = lives.min(cfg.max_lives);
        self.updated_at = now;
        self.current(cfg, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EnergyConfig {
        EnergyConfig {
            max_lives: 3,
            regen_seconds: 60,
        }
    }

    #[test]
    fn consumes_and_regenerates_over_time() {
        let t0 = Utc::now();
        let mut energy = Energy::full(&cfg(), t0);

        let view = energy.try_consume(&cfg(), t0).unwrap();
        assert_eq!(view.lives, 2);
        assert_eq!(view.next_life_in_secs, Some(60));

        let view = energy.current(&cfg(), t0 + Duration::seconds(45));
        assert_eq!(view.lives, 2);
        assert_eq!(view.next_life_in_secs, Some(15));

        let view = energy.current(&cfg(), t0 + Duration::seconds(61));
        assert_eq!(view.lives, 3);
        assert_eq!(view.next_life_in_secs, None);
    }

    #[test]
    fn partial_progress_carries_over() {
        let t0 = Utc::now();
        let mut energy = Energy { lives: 0, updated_at: t0 };

        let view = energy.current(&cfg(), t0 + Duration::seconds(90));
        assert_eq!(view.lives, 1);
        assert_eq!(view.next_life_in_secs, Some(30));
    }

    #[test]
    fn empty_energy_is_rejected() {
        let t0 = Utc::now();
        let mut energy = Energy { lives: 0, updated_at: t0 };
        let err = energy.try_consume(&cfg(), t0 + Duration::seconds(10)).unwrap_err();
        assert_eq!(err, EnergyError::Empty { next_life_in_secs: Some(50) });
    }

    #[test]
    fn refund_and_set_are_capped() {
        let t0 = Utc::now();
        let mut energy = Energy::full(&cfg(), t0);
        assert_eq!(energy.refund(&cfg(), t0).lives, 3);
        assert_eq!(energy.set(10, &cfg(), t0).lives, 3);
        assert_eq!(energy.set(0, &cfg(), t0).lives, 0);
    }
}
