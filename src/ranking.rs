use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankMode {
    /// Ties share a rank and the next score gets the following rank: 1,2,2,3.
    #[default]
    Dense,
    /// Competition ranking, gaps after ties: 1,2,2,4.
    Standard,
}

impl RankMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RankMode::Dense => "dense",
            RankMode::Standard => "standard",
        }
    }
}

fn sort_key(v: f64) -> f64 {
    if v.is_nan() {
        f64::NEG_INFINITY
    } else {
        v
    }
}

/// Rank `items` by descending score. The returned vector is aligned with the
/// input: `ranks[i]` is the rank of `items[i]`. Equal scores always share a
/// rank, whatever their input order.
pub fn rank_by<T, F>(items: &[T], mode: RankMode, score_of: F) -> Vec<u32>
where
    F: Fn(&T) -> f64,
{
    let scores: Vec<f64> = items.iter().map(|it| sort_key(score_of(it))).collect();
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut ranks = vec![0_u32; items.len()];
    let mut previous: Option<f64> = None;
    let mut current = 0_u32;
    for (position, &idx) in order.iter().enumerate() {
        let score = scores[idx];
        if previous != Some(score) {
            current = match mode {
                RankMode::Dense => current + 1,
                RankMode::Standard => position as u32 + 1,
            };
            previous = Some(score);
        }
        ranks[idx] = current;
    }
    ranks
}

/// English ordinal: 1st, 2nd, 3rd, 4th, 11th, 12th, 13th, 21st, 112th.
pub fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}
