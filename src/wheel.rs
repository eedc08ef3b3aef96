//! Lucky wheel: weighted prize table and the pick.

use rand::Rng;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrizeKind {
    /// `value` toman credited to the wallet.
    Balance,
    /// A personal single-use code worth `value` percent.
    Discount,
    Nothing,
}

impl PrizeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PrizeKind::Balance => "balance",
            PrizeKind::Discount => "discount",
            PrizeKind::Nothing => "nothing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WheelPrize {
    pub kind: PrizeKind,
    #[serde(default)]
    pub value: i64,
    pub weight: u32,
    pub label: String,
}

impl WheelPrize {
    pub fn nothing() -> Self {
        Self {
            kind: PrizeKind::Nothing,
            value: 0,
            weight: 1,
            label: "پوچ".to_string(),
        }
    }
}

pub fn default_prizes() -> Vec<WheelPrize> {
    let prize = |kind, value, weight, label: &str| WheelPrize {
        kind,
        value,
        weight,
        label: label.to_string(),
    };
    vec![
        prize(PrizeKind::Balance, 5_000, 20, "۵,۰۰۰ تومان اعتبار"),
        prize(PrizeKind::Balance, 10_000, 15, "۱۰,۰۰۰ تومان اعتبار"),
        prize(PrizeKind::Balance, 25_000, 8, "۲۵,۰۰۰ تومان اعتبار"),
        prize(PrizeKind::Balance, 50_000, 3, "۵۰,۰۰۰ تومان اعتبار"),
        prize(PrizeKind::Discount, 10, 12, "کد تخفیف ۱۰٪"),
        prize(PrizeKind::Discount, 20, 6, "کد تخفیف ۲۰٪"),
        prize(PrizeKind::Nothing, 0, 13, "پوچ"),
    ]
}

/// Maps `roll` in `0..total_weight` onto the prize table.
fn prize_at(prizes: &[WheelPrize], mut roll: u64) -> Option<&WheelPrize> {
    for prize in prizes {
        let weight = u64::from(prize.weight);
        if roll < weight {
            return Some(prize);
        }
        roll -= weight;
    }
    None
}

/// `None` when no prize carries weight.
pub fn spin<'a, R: Rng + ?Sized>(prizes: &'a [WheelPrize], rng: &mut R) -> Option<&'a WheelPrize> {
    let total: u64 = prizes.iter().map(|prize| u64::from(prize.weight)).sum();
    if total == 0 {
        return None;
    }
    prize_at(prizes, rng.random_range(0..total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolls_map_onto_cumulative_weights() {
        let prizes = default_prizes();
        assert_eq!(prize_at(&prizes, 0).unwrap().value, 5_000);
        assert_eq!(prize_at(&prizes, 19).unwrap().value, 5_000);
        assert_eq!(prize_at(&prizes, 20).unwrap().value, 10_000);
        assert_eq!(prize_at(&prizes, 76).unwrap().kind, PrizeKind::Nothing);
        assert!(prize_at(&prizes, 77).is_none());
    }

    #[test]
    fn zero_weights_never_win() {
        let mut prizes = default_prizes();
        for prize in &mut prizes {
            prize.weight = 0;
        }
        assert!(spin(&prizes, &mut rand::rng()).is_none());

        prizes[5].weight = 3;
        for _ in 0..50 {
            let won = spin(&prizes, &mut rand::rng()).unwrap();
            assert_eq!((won.kind, won.value), (PrizeKind::Discount, 20));
        }
    }
}
