//! Mesh score engine (C7): a daily aggregate computed from a rolling window
//! of decoded RF lines.

use chrono::NaiveDate;
use meshrank_protocol::MeshScoreDay;

use super::clamp01;

pub struct DayInputs {
    pub day: NaiveDate,
    pub unique_messages: u64,
    pub total_repeats: u64,
    pub repeaters_active_24h: u32,
    pub repeaters_total: u32,
    pub rooms: u32,
    pub chats: u32,
    pub companions: u32,
}

pub fn compute_day(inputs: &DayInputs) -> MeshScoreDay {
    let avg_repeats = if inputs.unique_messages > 0 {
        inputs.total_repeats as f64 / inputs.unique_messages as f64
    } else {
        0.0
    };
    let message_score = clamp01(inputs.unique_messages as f64 / 200.0);
    let repeat_score = clamp01(avg_repeats / 5.0);
    let active_ratio = if inputs.repeaters_total > 0 {
        inputs.repeaters_active_24h as f64 / inputs.repeaters_total as f64
    } else {
        0.0
    };
    let node_score = clamp01(
        (inputs.repeaters_total + inputs.rooms + inputs.chats + inputs.companions) as f64 / 200.0,
    );

    let score =
        (100.0 * (0.35 * active_ratio + 0.30 * message_score + 0.20 * repeat_score + 0.15 * node_score))
            .round();

    MeshScoreDay {
        day: inputs.day,
        score,
        active_repeaters: inputs.repeaters_active_24h,
        active_observers: 0,
        messages: inputs.unique_messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_day_scores_zero() {
        let day = compute_day(&DayInputs {
            day: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            unique_messages: 0,
            total_repeats: 0,
            repeaters_active_24h: 0,
            repeaters_total: 0,
            rooms: 0,
            chats: 0,
            companions: 0,
        });
        assert_eq!(day.score, 0.0);
    }

    #[test]
    fn fully_active_saturated_day_scores_100() {
        let day = compute_day(&DayInputs {
            day: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            unique_messages: 200,
            total_repeats: 1000,
            repeaters_active_24h: 10,
            repeaters_total: 10,
            rooms: 100,
            chats: 50,
            companions: 40,
        });
        assert_eq!(day.score, 100.0);
    }
}
