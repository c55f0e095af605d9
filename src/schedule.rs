//! Time-window scheduling for background transcoding
//!
//! Lets users restrict transcoding to specific hours (e.g. overnight).

use chrono::{Local, Timelike};
use serde::{Deserialize, Serialize};

/// Schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Enable scheduling (if false, run 24/7)
    #[serde(default)]
    pub enabled: bool,

    /// Start hour (0-23)
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,

    /// End hour (0-23, exclusive)
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,
}

fn default_start_hour() -> u32 {
    22
} // 10 PM
fn default_end_hour() -> u32 {
    6
} // 6 AM

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_hour: default_start_hour(),
            end_hour: default_end_hour(),
        }
    }
}

impl ScheduleConfig {
    /// Check if transcoding should be running right now
    pub fn should_run(&self) -> bool {
        self.allows_hour(Local::now().hour())
    }

    /// Check a specific hour against the `[start, end)` window.
    /// When `start > end` the window wraps midnight.
    pub fn allows_hour(&self, hour: u32) -> bool {
        if !self.enabled {
            return true;
        }

        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    /// Format the schedule for display
    pub fn format_schedule(&self) -> String {
        if !self.enabled {
            return "24/7 (no schedule)".to_string();
        }
        format!("{:02}:00 to {:02}:00", self.start_hour, self.end_hour)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_schedule_always_runs() {
        let config = ScheduleConfig::default();
        for hour in 0..24 {
            assert!(config.allows_hour(hour));
        }
    }

    #[test]
    fn test_daytime_window() {
        let config = ScheduleConfig {
            enabled: true,
            start_hour: 8,
            end_hour: 17,
        };
        assert!(!config.allows_hour(7));
        assert!(config.allows_hour(8));
        assert!(config.allows_hour(16));
        assert!(!config.allows_hour(17));
        assert!(!config.allows_hour(23));
    }

    #[test]
    fn test_overnight_window_wraps_midnight() {
        let config = ScheduleConfig {
            enabled: true,
            start_hour: 22,
            end_hour: 6,
        };
        assert!(config.allows_hour(22));
        assert!(config.allows_hour(23));
        assert!(config.allows_hour(0));
        assert!(config.allows_hour(5));
        assert!(!config.allows_hour(6));
        assert!(!config.allows_hour(12));
        assert!(!config.allows_hour(21));
    }

    #[test]
    fn test_schedule_format() {
        let config = ScheduleConfig {
            enabled: true,
            start_hour: 22,
            end_hour: 6,
        };
        assert_eq!(config.format_schedule(), "22:00 to 06:00");
    }
}
